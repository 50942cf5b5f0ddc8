//! Session lifecycle reducer.
//!
//! `SessionController` is a synchronous state machine. User operations and
//! asynchronous completions both mutate it, and operations that need I/O
//! return [`Effect`]s for the runtime to execute. Completions carry the
//! [`Generation`] (or ticket / subscription) they were issued under; anything
//! that no longer matches the live session is dropped without a trace in the
//! observable state.

use std::{fmt, sync::Arc};

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use shared::{
    domain::{
        ChatMessage, ChatRole, CoachReport, Coordinate, Identity, RecordId, Score,
        SessionRecord, SketchArtifact, TargetArtifact,
    },
    protocol::{ScoreRequest, ScoreResponse},
    stats::HistoryStats,
};
use tracing::debug;

use crate::{
    coordinate::{CoordinateSource, RandomCoordinates},
    error::SessionError,
    history::{HistoryProjection, SubscriptionId},
};

pub const FIRST_STEP: u8 = 1;
pub const NOTES_STEP: u8 = 2;
pub const LAST_STEP: u8 = 4;
pub const MIN_COACH_HISTORY: usize = 3;
pub const DEFAULT_COACH_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Viewing,
    Analyzing,
    Feedback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Viewing => "viewing",
            Self::Analyzing => "analyzing",
            Self::Feedback => "showing feedback",
        })
    }
}

/// Per-session token. Minted fresh by every `start_session`, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoachTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatTicket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub coordinate: Coordinate,
    pub step: u8,
    pub target: Option<TargetArtifact>,
    pub notes: String,
    pub sketch: Option<SketchArtifact>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    fn new(coordinate: Coordinate, started_at: DateTime<Utc>) -> Self {
        Self {
            coordinate,
            step: FIRST_STEP,
            target: None,
            notes: String::new(),
            sketch: None,
            started_at,
        }
    }
}

/// Everything the scoring pipeline needs, detached from the live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub coordinate: Coordinate,
    pub target: TargetArtifact,
    pub sketch: Option<SketchArtifact>,
    pub notes: String,
    pub started_at: DateTime<Utc>,
}

impl Submission {
    pub fn score_request(&self) -> ScoreRequest {
        ScoreRequest {
            target: self.target.clone(),
            sketch: self.sketch.clone(),
            notes: self.notes.clone(),
        }
    }

    pub fn into_record(
        self,
        verdict: ScoreResponse,
        completed_at: DateTime<Utc>,
    ) -> Result<SessionRecord, SessionError> {
        let score = Score::new(verdict.score).map_err(|err| {
            SessionError::ScoringFailure(format!("judge returned an invalid verdict: {err}"))
        })?;
        // records are persisted at millisecond precision
        let completed_at = completed_at.trunc_subsecs(3);
        let duration_seconds = (completed_at - self.started_at).num_seconds().max(0) as u64;

        Ok(SessionRecord {
            id: RecordId::random(),
            coordinate: self.coordinate,
            timestamp: completed_at,
            target: self.target,
            sketch: self.sketch,
            notes: self.notes,
            score,
            feedback: verdict.feedback,
            duration_seconds,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    AcquireTarget {
        generation: Generation,
    },
    Submit {
        generation: Generation,
        identity: Identity,
        submission: Submission,
    },
    Coach {
        ticket: CoachTicket,
        history: Vec<SessionRecord>,
    },
    Chat {
        ticket: ChatTicket,
        seed: Arc<[SessionRecord]>,
        conversation: Vec<ChatMessage>,
    },
    Subscribe {
        subscription: SubscriptionId,
        identity: Identity,
    },
    Unsubscribe {
        subscription: SubscriptionId,
    },
}

/// Transient, dismissible messages for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Failure(SessionError),
    AuthenticationRequired,
    ExitConfirmationRequired,
    SessionStarted { coordinate: Coordinate },
    FeedbackReady { record: RecordId, score: Score },
    SessionEnded,
    CoachReportReady,
    CoachReplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Exited,
    ConfirmationRequired,
}

/// Immutable snapshot of controller state for rendering. The target stays
/// withheld until feedback, where it is part of `result`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerView {
    pub phase: Phase,
    pub loading: bool,
    pub step: Option<u8>,
    pub coordinate: Option<Coordinate>,
    pub notes: String,
    pub sketch: Option<SketchArtifact>,
    pub exit_confirmation_pending: bool,
    pub result: Option<SessionRecord>,
    pub identity: Option<Identity>,
    pub history: Arc<[SessionRecord]>,
    pub stats: HistoryStats,
    pub coach_report: Option<CoachReport>,
    pub coach_pending: bool,
    pub can_request_coaching: bool,
    pub conversation: Vec<ChatMessage>,
    pub chat_pending: bool,
}

impl Default for ControllerView {
    fn default() -> Self {
        SessionController::new().view()
    }
}

pub struct SessionController {
    phase: Phase,
    session: Option<Session>,
    checkpoint: Option<Session>,
    active: Option<Generation>,
    acquiring: Option<Generation>,
    next_generation: u64,
    exit_pending: bool,
    result: Option<SessionRecord>,
    identity: Option<Identity>,
    history: HistoryProjection,
    next_subscription: u64,
    coach_report: Option<CoachReport>,
    coach_pending: Option<CoachTicket>,
    next_coach_ticket: u64,
    conversation: Vec<ChatMessage>,
    chat_seed: Option<Arc<[SessionRecord]>>,
    chat_pending: Option<ChatTicket>,
    next_chat_ticket: u64,
    coach_window: usize,
    coordinates: Box<dyn CoordinateSource>,
    clock: fn() -> DateTime<Utc>,
    notices: Vec<Notice>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            session: None,
            checkpoint: None,
            active: None,
            acquiring: None,
            next_generation: 0,
            exit_pending: false,
            result: None,
            identity: None,
            history: HistoryProjection::default(),
            next_subscription: 0,
            coach_report: None,
            coach_pending: None,
            next_coach_ticket: 0,
            conversation: Vec::new(),
            chat_seed: None,
            chat_pending: None,
            next_chat_ticket: 0,
            coach_window: DEFAULT_COACH_WINDOW,
            coordinates: Box::new(RandomCoordinates),
            clock: Utc::now,
            notices: Vec::new(),
        }
    }

    pub fn with_coordinates(mut self, coordinates: impl CoordinateSource + 'static) -> Self {
        self.coordinates = Box::new(coordinates);
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_coach_window(mut self, window: usize) -> Self {
        self.coach_window = window.max(1);
        self
    }

    pub fn clock(&self) -> fn() -> DateTime<Utc> {
        self.clock
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn active_generation(&self) -> Option<Generation> {
        self.active
    }

    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Idle && self.acquiring.is_some()
    }

    pub fn exit_pending(&self) -> bool {
        self.exit_pending
    }

    pub fn result(&self) -> Option<&SessionRecord> {
        self.result.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn history(&self) -> &HistoryProjection {
        &self.history
    }

    pub fn coach_report(&self) -> Option<&CoachReport> {
        self.coach_report.as_ref()
    }

    pub fn conversation(&self) -> &[ChatMessage] {
        &self.conversation
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn start_session(&mut self) -> Result<Vec<Effect>, SessionError> {
        if self.identity.is_none() {
            self.notices.push(Notice::AuthenticationRequired);
            return Err(SessionError::AuthenticationRequired);
        }
        // a start while an earlier acquisition is still outstanding supersedes it
        if self.phase != Phase::Idle {
            return Err(self.invalid("start a session"));
        }

        self.next_generation += 1;
        let generation = Generation(self.next_generation);
        let coordinate = self.coordinates.next_coordinate();

        self.session = Some(Session::new(coordinate, (self.clock)()));
        self.checkpoint = None;
        self.result = None;
        self.active = Some(generation);
        self.acquiring = Some(generation);
        self.exit_pending = false;
        self.discard_coach_report();

        Ok(vec![Effect::AcquireTarget { generation }])
    }

    pub fn advance_step(&mut self) -> Result<(), SessionError> {
        let session = self.viewing_session_mut("advance a step")?;
        session.step = (session.step + 1).min(LAST_STEP);
        Ok(())
    }

    pub fn retreat_step(&mut self) -> Result<(), SessionError> {
        let session = self.viewing_session_mut("go back a step")?;
        session.step = session.step.saturating_sub(1).max(FIRST_STEP);
        Ok(())
    }

    pub fn record_notes(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        let session = self.viewing_session_mut("record notes")?;
        if session.step != NOTES_STEP {
            return Err(SessionError::WrongStep {
                operation: "record notes",
                step: session.step,
                required: NOTES_STEP,
            });
        }
        session.notes = text.into();
        Ok(())
    }

    pub fn record_sketch(&mut self, sketch: SketchArtifact) -> Result<(), SessionError> {
        let session = self.viewing_session_mut("record a sketch")?;
        session.sketch = Some(sketch);
        Ok(())
    }

    /// Checks that a drawing-surface export may be pulled and returns the
    /// session it will belong to. The export runs outside the reducer and comes
    /// back through [`Self::on_sketch_exported`].
    pub fn begin_sketch_capture(&mut self) -> Result<Generation, SessionError> {
        self.viewing_session_mut("capture a sketch")?;
        self.active.ok_or_else(|| self.invalid("capture a sketch"))
    }

    /// A surface that has not been drawn on leaves the sketch untouched.
    pub fn on_sketch_exported(
        &mut self,
        generation: Generation,
        sketch: Option<SketchArtifact>,
    ) -> Result<bool, SessionError> {
        if !self.is_current(generation) {
            debug!(generation = generation.0, "dropping sketch export for ended session");
            return Err(SessionError::SketchDiscarded);
        }
        match sketch {
            Some(sketch) => {
                self.record_sketch(sketch)?;
                Ok(true)
            }
            None => {
                self.viewing_session_mut("capture a sketch")?;
                Ok(false)
            }
        }
    }

    pub fn submit_session(&mut self) -> Result<Vec<Effect>, SessionError> {
        let step = self.viewing_session_mut("submit")?.step;
        if step != LAST_STEP {
            return Err(SessionError::WrongStep {
                operation: "submit",
                step,
                required: LAST_STEP,
            });
        }
        let Some(generation) = self.active else {
            return Err(self.invalid("submit"));
        };
        let Some(session) = self.session.as_ref() else {
            return Err(self.invalid("submit"));
        };
        let Some(target) = session.target.clone() else {
            return Err(SessionError::TargetUnavailable);
        };
        let Some(identity) = self.identity.clone() else {
            self.notices.push(Notice::AuthenticationRequired);
            return Err(SessionError::AuthenticationRequired);
        };

        let submission = Submission {
            coordinate: session.coordinate.clone(),
            target,
            sketch: session.sketch.clone(),
            notes: session.notes.clone(),
            started_at: session.started_at,
        };
        self.checkpoint = Some(session.clone());
        self.phase = Phase::Analyzing;

        Ok(vec![Effect::Submit {
            generation,
            identity,
            submission,
        }])
    }

    pub fn request_exit(&mut self) -> Result<ExitDecision, SessionError> {
        match self.phase {
            Phase::Feedback => {
                self.end_session();
                Ok(ExitDecision::Exited)
            }
            Phase::Viewing | Phase::Analyzing => {
                self.prompt_exit();
                Ok(ExitDecision::ConfirmationRequired)
            }
            Phase::Idle if self.acquiring.is_some() => {
                self.prompt_exit();
                Ok(ExitDecision::ConfirmationRequired)
            }
            Phase::Idle => Err(self.invalid("exit")),
        }
    }

    pub fn confirm_exit(&mut self) -> Result<(), SessionError> {
        if !self.exit_pending {
            return Err(self.invalid("confirm exit"));
        }
        self.end_session();
        Ok(())
    }

    pub fn cancel_exit(&mut self) {
        self.exit_pending = false;
    }

    pub fn finish_feedback(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Feedback {
            return Err(self.invalid("finish feedback"));
        }
        self.end_session();
        Ok(())
    }

    pub fn request_coach_report(&mut self) -> Result<Vec<Effect>, SessionError> {
        if self.identity.is_none() {
            self.notices.push(Notice::AuthenticationRequired);
            return Err(SessionError::AuthenticationRequired);
        }
        let available = self.history.len();
        if available < MIN_COACH_HISTORY {
            return Err(SessionError::InsufficientHistory {
                required: MIN_COACH_HISTORY,
                available,
            });
        }

        self.next_coach_ticket += 1;
        let ticket = CoachTicket(self.next_coach_ticket);
        self.coach_pending = Some(ticket);
        Ok(vec![Effect::Coach {
            ticket,
            history: self.history.recent(self.coach_window).to_vec(),
        }])
    }

    /// Adds a user turn and asks the coach to answer it. The first message
    /// opens the conversation against the newest history window, which stays
    /// fixed until the conversation is cleared.
    pub fn send_chat_message(&mut self, text: &str) -> Result<Vec<Effect>, SessionError> {
        if self.identity.is_none() {
            self.notices.push(Notice::AuthenticationRequired);
            return Err(SessionError::AuthenticationRequired);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyChatMessage);
        }
        if self.chat_pending.is_some() {
            return Err(SessionError::ChatBusy);
        }

        let history = &self.history;
        let window = self.coach_window;
        let seed = Arc::clone(
            self.chat_seed
                .get_or_insert_with(|| Arc::from(history.recent(window))),
        );
        self.conversation
            .push(ChatMessage::new(ChatRole::User, text, (self.clock)()));
        self.next_chat_ticket += 1;
        let ticket = ChatTicket(self.next_chat_ticket);
        self.chat_pending = Some(ticket);

        Ok(vec![Effect::Chat {
            ticket,
            seed,
            conversation: self.conversation.clone(),
        }])
    }

    pub fn clear_chat(&mut self) {
        self.conversation.clear();
        self.chat_seed = None;
        self.chat_pending = None;
    }

    pub fn identity_changed(&mut self, identity: Option<Identity>) -> Vec<Effect> {
        if self.identity == identity {
            return Vec::new();
        }

        let mut effects = Vec::new();
        // teardown is unconditional and happens before anything else is applied
        if let Some(subscription) = self.history.subscription() {
            effects.push(Effect::Unsubscribe { subscription });
        }
        self.history.clear();
        self.discard_coach_report();
        self.clear_chat();

        if let Some(identity) = &identity {
            self.next_subscription += 1;
            let subscription = SubscriptionId(self.next_subscription);
            self.history.attach(subscription);
            effects.push(Effect::Subscribe {
                subscription,
                identity: identity.clone(),
            });
        }
        self.identity = identity;
        effects
    }

    pub fn on_target_acquired(
        &mut self,
        generation: Generation,
        result: Result<TargetArtifact, SessionError>,
    ) {
        if self.acquiring != Some(generation) || !self.is_current(generation) {
            debug!(generation = generation.0, "dropping stale acquisition result");
            return;
        }
        self.acquiring = None;

        match result {
            Ok(target) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.target = Some(target);
                self.phase = Phase::Viewing;
                self.notices.push(Notice::SessionStarted {
                    coordinate: session.coordinate.clone(),
                });
            }
            Err(err) => {
                self.active = None;
                self.session = None;
                self.exit_pending = false;
                self.notices.push(Notice::Failure(err));
            }
        }
    }

    pub fn on_submission_settled(
        &mut self,
        generation: Generation,
        result: Result<SessionRecord, SessionError>,
    ) {
        if !self.is_current(generation) || self.phase != Phase::Analyzing {
            debug!(generation = generation.0, "dropping stale submission result");
            return;
        }

        match result {
            Ok(record) => {
                self.checkpoint = None;
                self.phase = Phase::Feedback;
                self.exit_pending = false;
                self.notices.push(Notice::FeedbackReady {
                    record: record.id.clone(),
                    score: record.score,
                });
                self.result = Some(record);
            }
            Err(err) => {
                if let Some(checkpoint) = self.checkpoint.take() {
                    self.session = Some(checkpoint);
                }
                self.phase = Phase::Viewing;
                self.notices.push(Notice::Failure(err));
            }
        }
    }

    pub fn on_coach_settled(
        &mut self,
        ticket: CoachTicket,
        result: Result<CoachReport, SessionError>,
    ) {
        if self.coach_pending != Some(ticket) {
            debug!(ticket = ticket.0, "dropping stale coaching result");
            return;
        }
        self.coach_pending = None;

        match result {
            Ok(report) => {
                self.coach_report = Some(report);
                self.notices.push(Notice::CoachReportReady);
            }
            Err(err) => self.notices.push(Notice::Failure(err)),
        }
    }

    /// A failed reply leaves the user's turn in place so the next message
    /// resends it with the rest of the conversation.
    pub fn on_chat_settled(&mut self, ticket: ChatTicket, result: Result<String, SessionError>) {
        if self.chat_pending != Some(ticket) {
            debug!(ticket = ticket.0, "dropping stale chat reply");
            return;
        }
        self.chat_pending = None;

        match result {
            Ok(reply) => {
                self.conversation
                    .push(ChatMessage::new(ChatRole::Coach, reply, (self.clock)()));
                self.notices.push(Notice::CoachReplied);
            }
            Err(err) => self.notices.push(Notice::Failure(err)),
        }
    }

    pub fn on_history_snapshot(&mut self, subscription: SubscriptionId, records: Vec<SessionRecord>) {
        if !self.history.apply(subscription, records) {
            debug!(subscription = subscription.0, "dropping snapshot from closed feed");
        }
    }

    pub fn on_history_unavailable(&mut self, subscription: SubscriptionId, err: SessionError) {
        if self.history.subscription() == Some(subscription) {
            self.notices.push(Notice::Failure(err));
        }
    }

    pub fn view(&self) -> ControllerView {
        let session = self.session.as_ref();
        ControllerView {
            phase: self.phase,
            loading: self.is_loading(),
            step: session
                .filter(|_| self.phase == Phase::Viewing)
                .map(|s| s.step),
            coordinate: session.map(|s| s.coordinate.clone()),
            notes: session.map(|s| s.notes.clone()).unwrap_or_default(),
            sketch: session.and_then(|s| s.sketch.clone()),
            exit_confirmation_pending: self.exit_pending,
            result: self.result.clone(),
            identity: self.identity.clone(),
            history: self.history.shared(),
            stats: self.history.stats(),
            coach_report: self.coach_report.clone(),
            coach_pending: self.coach_pending.is_some(),
            can_request_coaching: self.identity.is_some()
                && self.history.len() >= MIN_COACH_HISTORY,
            conversation: self.conversation.clone(),
            chat_pending: self.chat_pending.is_some(),
        }
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.active == Some(generation)
    }

    fn viewing_session_mut(&mut self, operation: &'static str) -> Result<&mut Session, SessionError> {
        if self.phase != Phase::Viewing {
            return Err(self.invalid(operation));
        }
        let phase = self.phase;
        self.session
            .as_mut()
            .ok_or(SessionError::InvalidTransition { operation, phase })
    }

    fn prompt_exit(&mut self) {
        self.exit_pending = true;
        self.notices.push(Notice::ExitConfirmationRequired);
    }

    fn end_session(&mut self) {
        self.active = None;
        self.acquiring = None;
        self.session = None;
        self.checkpoint = None;
        self.result = None;
        self.exit_pending = false;
        self.phase = Phase::Idle;
        self.notices.push(Notice::SessionEnded);
    }

    fn discard_coach_report(&mut self) {
        self.coach_report = None;
        self.coach_pending = None;
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            operation,
            phase: self.phase,
        }
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
