//! Message loop that owns the [`SessionController`].
//!
//! One task processes user actions, collaborator completions, identity
//! changes and history pushes strictly in arrival order, so controller state
//! never needs a lock. Collaborator calls run in spawned tasks and report back
//! through the completion queue. Drawing-surface exports run on the blocking
//! pool; the capture reply waits for them without holding up the loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::domain::{CoachReport, Identity, SessionRecord, SketchArtifact, TargetArtifact};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    controller::{
        ChatTicket, CoachTicket, ControllerView, Effect, ExitDecision, Generation, Notice,
        SessionController, Submission,
    },
    error::SessionError,
    history::SubscriptionId,
    Collaborators, HistoryStore, ScoringClient,
};

const ACTION_QUEUE_DEPTH: usize = 64;
const NOTICE_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    StartSession,
    AdvanceStep,
    RetreatStep,
    RecordNotes(String),
    RecordSketch(SketchArtifact),
    CaptureSketch,
    SubmitSession,
    RequestExit,
    ConfirmExit,
    CancelExit,
    FinishFeedback,
    RequestCoachReport,
    SendChatMessage(String),
    ClearChat,
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::AdvanceStep => "advance_step",
            Self::RetreatStep => "retreat_step",
            Self::RecordNotes(_) => "record_notes",
            Self::RecordSketch(_) => "record_sketch",
            Self::CaptureSketch => "capture_sketch",
            Self::SubmitSession => "submit_session",
            Self::RequestExit => "request_exit",
            Self::ConfirmExit => "confirm_exit",
            Self::CancelExit => "cancel_exit",
            Self::FinishFeedback => "finish_feedback",
            Self::RequestCoachReport => "request_coach_report",
            Self::SendChatMessage(_) => "send_chat_message",
            Self::ClearChat => "clear_chat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied,
    ExitConfirmationRequired,
    Exited,
    SketchUnavailable,
}

type Reply = oneshot::Sender<Result<ActionOutcome, SessionError>>;

enum Envelope {
    Action {
        action: Action,
        reply: Reply,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum Completion {
    Target {
        generation: Generation,
        result: Result<TargetArtifact, SessionError>,
    },
    Submission {
        generation: Generation,
        result: Result<SessionRecord, SessionError>,
    },
    Coach {
        ticket: CoachTicket,
        result: Result<CoachReport, SessionError>,
    },
    Chat {
        ticket: ChatTicket,
        result: Result<String, SessionError>,
    },
    SketchExported {
        generation: Generation,
        sketch: Option<SketchArtifact>,
        reply: Reply,
    },
    Snapshot {
        subscription: SubscriptionId,
        records: Vec<SessionRecord>,
    },
    FeedFailed {
        subscription: SubscriptionId,
        error: SessionError,
    },
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    actions: mpsc::Sender<Envelope>,
    view: watch::Receiver<ControllerView>,
    notices: broadcast::Sender<Notice>,
}

impl ControllerHandle {
    /// Applies `action` and returns once the controller has taken the
    /// resulting transition. Collaborator calls it starts settle later and
    /// show up through [`Self::watch_view`] and [`Self::subscribe_notices`].
    pub async fn dispatch(&self, action: Action) -> Result<ActionOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.actions
            .send(Envelope::Action { action, reply })
            .await
            .map_err(|_| SessionError::ControllerStopped)?;
        rx.await.map_err(|_| SessionError::ControllerStopped)?
    }

    pub async fn start_session(&self) -> Result<(), SessionError> {
        self.dispatch(Action::StartSession).await.map(|_| ())
    }

    pub async fn advance_step(&self) -> Result<(), SessionError> {
        self.dispatch(Action::AdvanceStep).await.map(|_| ())
    }

    pub async fn retreat_step(&self) -> Result<(), SessionError> {
        self.dispatch(Action::RetreatStep).await.map(|_| ())
    }

    pub async fn record_notes(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.dispatch(Action::RecordNotes(text.into()))
            .await
            .map(|_| ())
    }

    pub async fn record_sketch(&self, sketch: SketchArtifact) -> Result<(), SessionError> {
        self.dispatch(Action::RecordSketch(sketch)).await.map(|_| ())
    }

    /// Returns false when the drawing surface had nothing to export.
    pub async fn capture_sketch(&self) -> Result<bool, SessionError> {
        self.dispatch(Action::CaptureSketch)
            .await
            .map(|outcome| outcome != ActionOutcome::SketchUnavailable)
    }

    pub async fn submit_session(&self) -> Result<(), SessionError> {
        self.dispatch(Action::SubmitSession).await.map(|_| ())
    }

    pub async fn request_exit(&self) -> Result<ExitDecision, SessionError> {
        match self.dispatch(Action::RequestExit).await? {
            ActionOutcome::Exited => Ok(ExitDecision::Exited),
            _ => Ok(ExitDecision::ConfirmationRequired),
        }
    }

    pub async fn confirm_exit(&self) -> Result<(), SessionError> {
        self.dispatch(Action::ConfirmExit).await.map(|_| ())
    }

    pub async fn cancel_exit(&self) -> Result<(), SessionError> {
        self.dispatch(Action::CancelExit).await.map(|_| ())
    }

    pub async fn finish_feedback(&self) -> Result<(), SessionError> {
        self.dispatch(Action::FinishFeedback).await.map(|_| ())
    }

    pub async fn request_coach_report(&self) -> Result<(), SessionError> {
        self.dispatch(Action::RequestCoachReport).await.map(|_| ())
    }

    pub async fn send_chat_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.dispatch(Action::SendChatMessage(text.into()))
            .await
            .map(|_| ())
    }

    pub async fn clear_chat(&self) -> Result<(), SessionError> {
        self.dispatch(Action::ClearChat).await.map(|_| ())
    }

    pub fn view(&self) -> ControllerView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ControllerView> {
        self.view.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Stops the loop and tears down the history subscription.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.actions.send(Envelope::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct ControllerRuntime {
    controller: SessionController,
    collaborators: Collaborators,
    identity: watch::Receiver<Option<Identity>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    view_tx: watch::Sender<ControllerView>,
    notices: broadcast::Sender<Notice>,
    feed: Option<(SubscriptionId, JoinHandle<()>)>,
}

impl ControllerRuntime {
    pub fn spawn(
        controller: SessionController,
        collaborators: Collaborators,
        identity: watch::Receiver<Option<Identity>>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (actions_tx, actions_rx) = mpsc::channel(ACTION_QUEUE_DEPTH);
        let (view_tx, view_rx) = watch::channel(controller.view());
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let runtime = Self {
            controller,
            collaborators,
            identity,
            completions_tx,
            completions_rx,
            view_tx,
            notices: notices.clone(),
            feed: None,
        };
        let task = tokio::spawn(runtime.run(actions_rx));

        (
            ControllerHandle {
                actions: actions_tx,
                view: view_rx,
                notices,
            },
            task,
        )
    }

    async fn run(mut self, mut actions: mpsc::Receiver<Envelope>) {
        let initial = self.identity.borrow_and_update().clone();
        self.apply_identity(initial);
        self.publish();

        let mut identity_open = true;
        let mut shutdown_ack = None;
        loop {
            tokio::select! {
                biased;
                // identity changes win over anything queued behind them
                changed = self.identity.changed(), if identity_open => {
                    match changed {
                        Ok(()) => {
                            let identity = self.identity.borrow_and_update().clone();
                            self.apply_identity(identity);
                            self.publish();
                        }
                        Err(_) => identity_open = false,
                    }
                }
                envelope = actions.recv() => match envelope {
                    Some(Envelope::Action { action: Action::CaptureSketch, reply }) => {
                        self.begin_capture(reply);
                    }
                    Some(Envelope::Action { action, reply }) => {
                        let outcome = self.handle_action(action);
                        // callers observe the new view as soon as their reply lands
                        self.publish();
                        let _ = reply.send(outcome);
                    }
                    Some(Envelope::Shutdown { done }) => {
                        shutdown_ack = Some(done);
                        break;
                    }
                    None => break,
                },
                Some(completion) = self.completions_rx.recv() => {
                    let deferred = self.handle_completion(completion);
                    self.publish();
                    if let Some((reply, outcome)) = deferred {
                        let _ = reply.send(outcome);
                    }
                }
            }
        }

        self.close_feed();
        info!("session controller stopped");
        if let Some(done) = shutdown_ack {
            let _ = done.send(());
        }
    }

    fn handle_action(&mut self, action: Action) -> Result<ActionOutcome, SessionError> {
        let name = action.name();
        let applied = |result: Result<(), SessionError>| result.map(|()| ActionOutcome::Applied);
        let result = match action {
            Action::StartSession => applied(
                self.controller
                    .start_session()
                    .map(|effects| self.execute_all(effects)),
            ),
            Action::AdvanceStep => applied(self.controller.advance_step()),
            Action::RetreatStep => applied(self.controller.retreat_step()),
            Action::RecordNotes(text) => applied(self.controller.record_notes(text)),
            Action::RecordSketch(sketch) => applied(self.controller.record_sketch(sketch)),
            // routed through `begin_capture` by the loop
            Action::CaptureSketch => Err(SessionError::InvalidTransition {
                operation: "capture a sketch",
                phase: self.controller.phase(),
            }),
            Action::SubmitSession => applied(
                self.controller
                    .submit_session()
                    .map(|effects| self.execute_all(effects)),
            ),
            Action::RequestExit => self.controller.request_exit().map(|decision| match decision {
                ExitDecision::Exited => ActionOutcome::Exited,
                ExitDecision::ConfirmationRequired => ActionOutcome::ExitConfirmationRequired,
            }),
            Action::ConfirmExit => self
                .controller
                .confirm_exit()
                .map(|()| ActionOutcome::Exited),
            Action::CancelExit => {
                self.controller.cancel_exit();
                Ok(ActionOutcome::Applied)
            }
            Action::FinishFeedback => applied(self.controller.finish_feedback()),
            Action::RequestCoachReport => applied(
                self.controller
                    .request_coach_report()
                    .map(|effects| self.execute_all(effects)),
            ),
            Action::SendChatMessage(text) => applied(
                self.controller
                    .send_chat_message(&text)
                    .map(|effects| self.execute_all(effects)),
            ),
            Action::ClearChat => {
                self.controller.clear_chat();
                Ok(ActionOutcome::Applied)
            }
        };

        match &result {
            Ok(outcome) => debug!(
                action = name,
                phase = %self.controller.phase(),
                ?outcome,
                "action applied"
            ),
            Err(err) => debug!(
                action = name,
                phase = %self.controller.phase(),
                "action rejected: {err}"
            ),
        }
        result
    }

    /// Pulls the drawing surface's export on the blocking pool. The reply is
    /// sent once the export has been applied.
    fn begin_capture(&mut self, reply: Reply) {
        let generation = match self.controller.begin_sketch_capture() {
            Ok(generation) => generation,
            Err(err) => {
                debug!(action = "capture_sketch", "action rejected: {err}");
                let _ = reply.send(Err(err));
                return;
            }
        };

        let sketches = Arc::clone(&self.collaborators.sketches);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let export = tokio::task::spawn_blocking(move || sketches.export_sketch());
            let sketch = match export.await {
                Ok(sketch) => sketch,
                Err(err) => {
                    warn!("sketch export task failed: {err}");
                    None
                }
            };
            let _ = tx.send(Completion::SketchExported {
                generation,
                sketch,
                reply,
            });
        });
    }

    fn handle_completion(
        &mut self,
        completion: Completion,
    ) -> Option<(Reply, Result<ActionOutcome, SessionError>)> {
        match completion {
            Completion::Target { generation, result } => {
                if let Err(err) = &result {
                    warn!(generation = generation.value(), "target acquisition failed: {err}");
                }
                self.controller.on_target_acquired(generation, result);
            }
            Completion::Submission { generation, result } => {
                match &result {
                    Ok(record) => info!(
                        generation = generation.value(),
                        record_id = %record.id,
                        score = record.score.value(),
                        "session scored and saved"
                    ),
                    Err(err) => warn!(generation = generation.value(), "submission failed: {err}"),
                }
                self.controller.on_submission_settled(generation, result);
            }
            Completion::Coach { ticket, result } => {
                if let Err(err) = &result {
                    warn!("coaching report failed: {err}");
                }
                self.controller.on_coach_settled(ticket, result);
            }
            Completion::Chat { ticket, result } => {
                if let Err(err) = &result {
                    warn!("coach chat failed: {err}");
                }
                self.controller.on_chat_settled(ticket, result);
            }
            Completion::SketchExported {
                generation,
                sketch,
                reply,
            } => {
                let outcome = self
                    .controller
                    .on_sketch_exported(generation, sketch)
                    .map(|captured| {
                        if captured {
                            ActionOutcome::Applied
                        } else {
                            ActionOutcome::SketchUnavailable
                        }
                    });
                debug!(action = "capture_sketch", ?outcome, "sketch export applied");
                return Some((reply, outcome));
            }
            Completion::Snapshot {
                subscription,
                records,
            } => {
                debug!(
                    subscription = subscription.0,
                    records = records.len(),
                    "history snapshot received"
                );
                self.controller.on_history_snapshot(subscription, records);
            }
            Completion::FeedFailed {
                subscription,
                error,
            } => {
                warn!(subscription = subscription.0, "history feed failed: {error}");
                self.controller.on_history_unavailable(subscription, error);
            }
        }
        None
    }

    fn apply_identity(&mut self, identity: Option<Identity>) {
        let effects = self.controller.identity_changed(identity);
        self.execute_all(effects);
    }

    fn execute_all(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::AcquireTarget { generation } => {
                info!(generation = generation.value(), "acquiring target");
                let acquisition = Arc::clone(&self.collaborators.acquisition);
                let tx = self.completions_tx.clone();
                tokio::spawn(async move {
                    let result = acquisition
                        .acquire_target()
                        .await
                        .map_err(SessionError::acquisition);
                    let _ = tx.send(Completion::Target { generation, result });
                });
            }
            Effect::Submit {
                generation,
                identity,
                submission,
            } => {
                info!(
                    generation = generation.value(),
                    coordinate = %submission.coordinate,
                    has_sketch = submission.sketch.is_some(),
                    "submitting session for scoring"
                );
                let scoring = Arc::clone(&self.collaborators.scoring);
                let history = Arc::clone(&self.collaborators.history);
                let clock = self.controller.clock();
                let tx = self.completions_tx.clone();
                tokio::spawn(async move {
                    let result = settle_submission(
                        scoring.as_ref(),
                        history.as_ref(),
                        &identity,
                        submission,
                        clock,
                    )
                    .await;
                    let _ = tx.send(Completion::Submission { generation, result });
                });
            }
            Effect::Coach { ticket, history } => {
                info!(sessions = history.len(), "requesting coaching report");
                let coaching = Arc::clone(&self.collaborators.coaching);
                let tx = self.completions_tx.clone();
                tokio::spawn(async move {
                    let result = coaching
                        .coach(&history)
                        .await
                        .map_err(SessionError::coaching);
                    let _ = tx.send(Completion::Coach { ticket, result });
                });
            }
            Effect::Chat {
                ticket,
                seed,
                conversation,
            } => {
                info!(
                    sessions = seed.len(),
                    turns = conversation.len(),
                    "asking the coach"
                );
                let coaching = Arc::clone(&self.collaborators.coaching);
                let tx = self.completions_tx.clone();
                tokio::spawn(async move {
                    let result = coaching
                        .chat(&seed, &conversation)
                        .await
                        .map_err(SessionError::coaching);
                    let _ = tx.send(Completion::Chat { ticket, result });
                });
            }
            Effect::Subscribe {
                subscription,
                identity,
            } => self.open_feed(subscription, identity),
            Effect::Unsubscribe { subscription } => {
                if self
                    .feed
                    .as_ref()
                    .is_some_and(|(active, _)| *active == subscription)
                {
                    self.close_feed();
                }
            }
        }
    }

    fn open_feed(&mut self, subscription: SubscriptionId, identity: Identity) {
        self.close_feed();
        info!(
            subscription = subscription.0,
            user_id = %identity.user_id,
            "subscribing to history"
        );
        let store = Arc::clone(&self.collaborators.history);
        let tx = self.completions_tx.clone();
        let forwarder = tokio::spawn(async move {
            let mut feed = match store.subscribe(&identity).await {
                Ok(feed) => feed,
                Err(err) => {
                    let _ = tx.send(Completion::FeedFailed {
                        subscription,
                        error: SessionError::history(err),
                    });
                    return;
                }
            };
            while let Some(records) = feed.next_snapshot().await {
                if tx
                    .send(Completion::Snapshot {
                        subscription,
                        records,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        self.feed = Some((subscription, forwarder));
    }

    fn close_feed(&mut self) {
        if let Some((subscription, forwarder)) = self.feed.take() {
            debug!(subscription = subscription.0, "closing history feed");
            forwarder.abort();
        }
    }

    fn publish(&mut self) {
        for notice in self.controller.take_notices() {
            let _ = self.notices.send(notice);
        }
        let view = self.controller.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

/// Scores the submission, assembles the record and hands it to the store.
/// Runs to completion even if the session is abandoned meanwhile.
async fn settle_submission(
    scoring: &dyn ScoringClient,
    history: &dyn HistoryStore,
    identity: &Identity,
    submission: Submission,
    clock: fn() -> DateTime<Utc>,
) -> Result<SessionRecord, SessionError> {
    let verdict = scoring
        .score(submission.score_request())
        .await
        .map_err(SessionError::scoring)?;
    let record = submission.into_record(verdict, clock())?;
    history
        .write(identity, &record)
        .await
        .map_err(SessionError::persistence)?;
    Ok(record)
}

#[cfg(test)]
#[path = "tests/runtime_tests.rs"]
mod tests;
