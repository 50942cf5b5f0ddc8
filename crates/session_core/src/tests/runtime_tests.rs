use std::{
    sync::{mpsc as std_mpsc, Mutex},
    time::Duration,
};

use super::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ChatMessage, ChatRole, Coordinate, RecordId, Score},
    protocol::{ScoreRequest, ScoreResponse},
};
use tokio::{sync::Semaphore, time::timeout};

use crate::{
    controller::Phase, coordinate::CoordinateSource, CoachingClient, DurableHistoryStore,
    HistoryFeed, IdentityHub, SketchSource, TargetAcquisition,
};

const WAIT: Duration = Duration::from_secs(5);

struct GatedAcquisition {
    gate: Arc<Semaphore>,
}

impl GatedAcquisition {
    fn open() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }
    }

    fn closed() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Arc::clone(&gate),
            },
            gate,
        )
    }
}

#[async_trait]
impl TargetAcquisition for GatedAcquisition {
    async fn acquire_target(&self) -> Result<TargetArtifact> {
        self.gate.acquire().await?.forget();
        Ok(target())
    }
}

struct FixedJudge {
    score: i64,
}

#[async_trait]
impl ScoringClient for FixedJudge {
    async fn score(&self, _request: ScoreRequest) -> Result<ScoreResponse> {
        Ok(ScoreResponse {
            score: self.score,
            feedback: "Partial shape match.".into(),
        })
    }
}

#[async_trait]
impl CoachingClient for FixedJudge {
    async fn coach(&self, history: &[SessionRecord]) -> Result<CoachReport> {
        Ok(CoachReport {
            trend_summary: format!("{} sessions reviewed", history.len()),
            ..CoachReport::default()
        })
    }

    async fn chat(&self, seed: &[SessionRecord], conversation: &[ChatMessage]) -> Result<String> {
        Ok(format!(
            "{} sessions, {} turns",
            seed.len(),
            conversation.len()
        ))
    }
}

/// Holds every verdict until the test hands out a permit; echoes the notes
/// back so overlapping submissions can be told apart.
struct GatedJudge {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ScoringClient for GatedJudge {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreResponse> {
        self.gate.acquire().await?.forget();
        Ok(ScoreResponse {
            score: 70,
            feedback: format!("judged: {}", request.notes),
        })
    }
}

/// Export blocks the calling thread until the test releases it.
struct SlowSurface {
    started: Arc<Semaphore>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl SlowSurface {
    fn new() -> (Self, Arc<Semaphore>, std_mpsc::Sender<()>) {
        let started = Arc::new(Semaphore::new(0));
        let (release, waiting) = std_mpsc::channel();
        let surface = Self {
            started: Arc::clone(&started),
            release: Mutex::new(waiting),
        };
        (surface, started, release)
    }
}

impl SketchSource for SlowSurface {
    fn export_sketch(&self) -> Option<SketchArtifact> {
        self.started.add_permits(1);
        self.release.lock().ok()?.recv().ok()?;
        Some(SketchArtifact {
            mime_type: "image/png".into(),
            image_b64: "c2tldGNo".into(),
        })
    }
}

/// Accepts subscriptions but refuses every write.
struct ReadOnlyStore;

#[async_trait]
impl HistoryStore for ReadOnlyStore {
    async fn write(&self, _identity: &Identity, _record: &SessionRecord) -> Result<()> {
        Err(anyhow!("database is read-only"))
    }

    async fn subscribe(&self, _identity: &Identity) -> Result<HistoryFeed> {
        let (tx, rx) = mpsc::channel(1);
        tx.send(Vec::new()).await?;
        Ok(HistoryFeed::from_receiver(rx))
    }
}

struct FixedCoordinates;

impl CoordinateSource for FixedCoordinates {
    fn next_coordinate(&mut self) -> Coordinate {
        Coordinate::new("1234-5678")
    }
}

fn target() -> TargetArtifact {
    TargetArtifact {
        mime_type: "image/jpeg".into(),
        image_b64: "dGFyZ2V0".into(),
        display_handle: "https://picsum.test/seed/1/800/600".into(),
    }
}

fn past_record(n: i64) -> SessionRecord {
    SessionRecord {
        id: RecordId::random(),
        coordinate: Coordinate::new("9999-9999"),
        timestamp: DateTime::from_timestamp(1_600_000_000 + n, 0).expect("timestamp"),
        target: target(),
        sketch: None,
        notes: String::new(),
        score: Score::new(50 + n).expect("score"),
        feedback: String::new(),
        duration_seconds: 120,
    }
}

fn alice() -> Identity {
    Identity::new("alice")
}

fn spawn(collaborators: Collaborators, hub: &IdentityHub) -> (ControllerHandle, JoinHandle<()>) {
    let controller = SessionController::new().with_coordinates(FixedCoordinates);
    ControllerRuntime::spawn(controller, collaborators, hub.subscribe())
}

async fn wait_for(
    handle: &ControllerHandle,
    what: &str,
    predicate: impl FnMut(&ControllerView) -> bool,
) -> ControllerView {
    let mut views = handle.watch_view();
    let view = timeout(WAIT, views.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("controller running");
    view.clone()
}

async fn wait_for_notice(
    notices: &mut broadcast::Receiver<Notice>,
    mut predicate: impl FnMut(&Notice) -> bool,
) -> Notice {
    timeout(WAIT, async {
        loop {
            let notice = notices.recv().await.expect("notice stream");
            if predicate(&notice) {
                return notice;
            }
        }
    })
    .await
    .expect("timed out waiting for notice")
}

async fn reach_last_step(handle: &ControllerHandle) {
    reach_last_step_noting(handle, "red, round, warm").await;
}

async fn reach_last_step_noting(handle: &ControllerHandle, notes: &str) {
    handle.advance_step().await.expect("step 2");
    handle.record_notes(notes).await.expect("notes");
    handle.advance_step().await.expect("step 3");
    handle.advance_step().await.expect("step 4");
}

#[tokio::test]
async fn session_is_scored_saved_and_pushed_into_history() {
    let store = DurableHistoryStore::initialize("sqlite::memory:")
        .await
        .expect("store");
    let hub = IdentityHub::signed_in(alice());
    let judge = Arc::new(FixedJudge { score: 62 });
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_scoring(judge.clone())
        .with_coaching(judge)
        .with_history(store.clone());
    let (handle, _task) = spawn(collaborators, &hub);
    let mut notices = handle.subscribe_notices();

    handle.start_session().await.expect("start");
    let view = wait_for(&handle, "viewing", |v| v.phase == Phase::Viewing).await;
    assert_eq!(view.coordinate, Some(Coordinate::new("1234-5678")));
    assert_eq!(view.step, Some(1));

    reach_last_step(&handle).await;
    handle.submit_session().await.expect("submit");

    let view = wait_for(&handle, "feedback", |v| v.phase == Phase::Feedback).await;
    let result = view.result.expect("result");
    assert_eq!(result.score.value(), 62);
    assert_eq!(result.feedback, "Partial shape match.");
    assert_eq!(result.notes, "red, round, warm");
    assert!(result.sketch.is_none());
    assert!(matches!(
        wait_for_notice(&mut notices, |n| matches!(n, Notice::FeedbackReady { .. })).await,
        Notice::FeedbackReady { score, .. } if score.value() == 62
    ));

    let view = wait_for(&handle, "history push", |v| v.history.len() == 1).await;
    assert_eq!(view.history[0].id, result.id);
    assert_eq!(view.stats.average_score, 62);

    handle.finish_feedback().await.expect("done");
    let view = wait_for(&handle, "idle", |v| v.phase == Phase::Idle).await;
    assert!(view.result.is_none());
    assert_eq!(view.history.len(), 1);

    let stored = store
        .storage()
        .list_session_records(&alice().user_id)
        .await
        .expect("list");
    assert_eq!(stored, vec![result]);
}

#[tokio::test]
async fn target_arriving_after_exit_is_discarded() {
    let hub = IdentityHub::signed_in(alice());
    let (acquisition, gate) = GatedAcquisition::closed();
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(acquisition))
        .with_history(Arc::new(ReadOnlyStore));
    let (handle, _task) = spawn(collaborators, &hub);
    let mut notices = handle.subscribe_notices();

    handle.start_session().await.expect("start");
    assert!(handle.view().loading);
    assert_eq!(
        handle.request_exit().await,
        Ok(ExitDecision::ConfirmationRequired)
    );
    handle.confirm_exit().await.expect("confirm");

    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let view = handle.view();
    assert_eq!(view.phase, Phase::Idle);
    assert!(!view.loading);
    assert!(view.coordinate.is_none());
    while let Ok(notice) = notices.try_recv() {
        assert!(
            !matches!(notice, Notice::SessionStarted { .. }),
            "stale target started a session"
        );
    }
}

#[tokio::test]
async fn failed_save_returns_to_the_last_step() {
    let hub = IdentityHub::signed_in(alice());
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_scoring(Arc::new(FixedJudge { score: 80 }))
        .with_history(Arc::new(ReadOnlyStore));
    let (handle, _task) = spawn(collaborators, &hub);
    let mut notices = handle.subscribe_notices();

    handle.start_session().await.expect("start");
    wait_for(&handle, "viewing", |v| v.phase == Phase::Viewing).await;
    reach_last_step(&handle).await;
    handle.submit_session().await.expect("submit");

    let notice = wait_for_notice(&mut notices, |n| matches!(n, Notice::Failure(_))).await;
    let Notice::Failure(SessionError::PersistenceFailure(message)) = notice else {
        panic!("unexpected notice {notice:?}");
    };
    assert!(message.contains("read-only"), "unexpected message {message}");

    let view = wait_for(&handle, "viewing again", |v| v.phase == Phase::Viewing).await;
    assert_eq!(view.step, Some(4));
    assert_eq!(view.notes, "red, round, warm");
    assert!(view.history.is_empty());
}

#[tokio::test]
async fn missing_scoring_service_surfaces_a_scoring_failure() {
    let hub = IdentityHub::signed_in(alice());
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_history(Arc::new(ReadOnlyStore));
    let (handle, _task) = spawn(collaborators, &hub);
    let mut notices = handle.subscribe_notices();

    handle.start_session().await.expect("start");
    wait_for(&handle, "viewing", |v| v.phase == Phase::Viewing).await;
    reach_last_step(&handle).await;
    handle.submit_session().await.expect("submit");

    let notice = wait_for_notice(&mut notices, |n| matches!(n, Notice::Failure(_))).await;
    assert!(matches!(
        notice,
        Notice::Failure(SessionError::ScoringFailure(_))
    ));
}

#[tokio::test]
async fn signing_out_clears_history_but_keeps_the_session() {
    let store = DurableHistoryStore::initialize("sqlite::memory:")
        .await
        .expect("store");
    for n in 1..=3 {
        store.write(&alice(), &past_record(n)).await.expect("seed");
    }
    let hub = IdentityHub::signed_in(alice());
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_history(store);
    let (handle, _task) = spawn(collaborators, &hub);

    wait_for(&handle, "history", |v| v.history.len() == 3).await;
    handle.start_session().await.expect("start");
    wait_for(&handle, "viewing", |v| v.phase == Phase::Viewing).await;

    hub.sign_out();
    let view = wait_for(&handle, "signed out", |v| v.identity.is_none()).await;
    assert!(view.history.is_empty());
    assert!(!view.can_request_coaching);
    assert_eq!(view.phase, Phase::Viewing);

    handle.advance_step().await.expect("step 2");
    handle.advance_step().await.expect("step 3");
    handle.advance_step().await.expect("step 4");
    assert_eq!(
        handle.submit_session().await,
        Err(SessionError::AuthenticationRequired)
    );

    hub.sign_in(alice());
    wait_for(&handle, "history restored", |v| v.history.len() == 3).await;
}

#[tokio::test]
async fn coaching_report_reaches_the_view() {
    let store = DurableHistoryStore::initialize("sqlite::memory:")
        .await
        .expect("store");
    for n in 1..=4 {
        store.write(&alice(), &past_record(n)).await.expect("seed");
    }
    let hub = IdentityHub::signed_in(alice());
    let collaborators = Collaborators::default()
        .with_coaching(Arc::new(FixedJudge { score: 0 }))
        .with_history(store);
    let (handle, _task) = spawn(collaborators, &hub);

    wait_for(&handle, "coaching available", |v| v.can_request_coaching).await;
    handle.request_coach_report().await.expect("coach");
    let view = wait_for(&handle, "report", |v| v.coach_report.is_some()).await;
    assert_eq!(
        view.coach_report.map(|r| r.trend_summary),
        Some("4 sessions reviewed".to_string())
    );
}

#[tokio::test]
async fn abandoned_submission_settling_late_leaves_the_next_session_alone() {
    let store = DurableHistoryStore::initialize("sqlite::memory:")
        .await
        .expect("store");
    let hub = IdentityHub::signed_in(alice());
    let gate = Arc::new(Semaphore::new(0));
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_scoring(Arc::new(GatedJudge {
            gate: Arc::clone(&gate),
        }))
        .with_history(store);
    let (handle, _task) = spawn(collaborators, &hub);
    let mut notices = handle.subscribe_notices();

    handle.start_session().await.expect("start first");
    wait_for(&handle, "first viewing", |v| v.phase == Phase::Viewing).await;
    reach_last_step_noting(&handle, "first").await;
    handle.submit_session().await.expect("submit first");
    assert_eq!(
        handle.request_exit().await,
        Ok(ExitDecision::ConfirmationRequired)
    );
    handle.confirm_exit().await.expect("abandon first");

    handle.start_session().await.expect("start second");
    wait_for(&handle, "second viewing", |v| v.phase == Phase::Viewing).await;
    reach_last_step_noting(&handle, "second").await;
    handle.submit_session().await.expect("submit second");
    assert_eq!(handle.view().phase, Phase::Analyzing);

    // semaphore waiters are served in order, so this releases the first verdict
    gate.add_permits(1);
    wait_for(&handle, "abandoned record saved", |v| v.history.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let view = handle.view();
    assert_eq!(view.phase, Phase::Analyzing);
    assert!(view.result.is_none());
    while let Ok(notice) = notices.try_recv() {
        assert!(
            !matches!(notice, Notice::FeedbackReady { .. } | Notice::Failure(_)),
            "abandoned submission reached the live session: {notice:?}"
        );
    }

    gate.add_permits(1);
    let view = wait_for(&handle, "second feedback", |v| v.phase == Phase::Feedback).await;
    let result = view.result.expect("result");
    assert_eq!(result.notes, "second");
    assert_eq!(result.feedback, "judged: second");
    wait_for(&handle, "both records saved", |v| v.history.len() == 2).await;
}

#[tokio::test]
async fn coach_chat_keeps_its_seed_and_ends_with_the_identity() {
    let store = DurableHistoryStore::initialize("sqlite::memory:")
        .await
        .expect("store");
    for n in 1..=2 {
        store.write(&alice(), &past_record(n)).await.expect("seed");
    }
    let hub = IdentityHub::signed_in(alice());
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_coaching(Arc::new(FixedJudge { score: 0 }))
        .with_history(store.clone());
    let (handle, _task) = spawn(collaborators, &hub);
    let mut notices = handle.subscribe_notices();

    wait_for(&handle, "history", |v| v.history.len() == 2).await;
    handle
        .send_chat_message("  how am I doing?  ")
        .await
        .expect("first question");
    let view = wait_for(&handle, "first reply", |v| v.conversation.len() == 2).await;
    assert!(!view.chat_pending);
    assert_eq!(view.conversation[0].role, ChatRole::User);
    assert_eq!(view.conversation[0].text, "how am I doing?");
    assert_eq!(view.conversation[1].role, ChatRole::Coach);
    assert_eq!(view.conversation[1].text, "2 sessions, 1 turns");
    assert_eq!(
        wait_for_notice(&mut notices, |n| *n == Notice::CoachReplied).await,
        Notice::CoachReplied
    );

    store.write(&alice(), &past_record(3)).await.expect("third");
    wait_for(&handle, "third record", |v| v.history.len() == 3).await;
    handle.send_chat_message("and now?").await.expect("follow-up");
    let view = wait_for(&handle, "second reply", |v| v.conversation.len() == 4).await;
    assert_eq!(view.conversation[3].text, "2 sessions, 3 turns");

    assert_eq!(
        handle.send_chat_message("   ").await,
        Err(SessionError::EmptyChatMessage)
    );

    hub.sign_out();
    let view = wait_for(&handle, "signed out", |v| v.identity.is_none()).await;
    assert!(view.conversation.is_empty());
    assert_eq!(
        handle.send_chat_message("still there?").await,
        Err(SessionError::AuthenticationRequired)
    );
}

#[tokio::test]
async fn slow_sketch_export_does_not_hold_up_other_actions() {
    let hub = IdentityHub::signed_in(alice());
    let (surface, started, release) = SlowSurface::new();
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_history(Arc::new(ReadOnlyStore))
        .with_sketches(Arc::new(surface));
    let (handle, _task) = spawn(collaborators, &hub);

    handle.start_session().await.expect("start");
    wait_for(&handle, "viewing", |v| v.phase == Phase::Viewing).await;

    let capture = tokio::spawn({
        let handle = handle.clone();
        async move { handle.capture_sketch().await }
    });
    timeout(WAIT, started.acquire())
        .await
        .expect("export started")
        .expect("semaphore open")
        .forget();
    timeout(WAIT, handle.advance_step())
        .await
        .expect("loop stays responsive during export")
        .expect("step 2");
    assert!(handle.view().sketch.is_none());

    release.send(()).expect("release export");
    let captured = timeout(WAIT, capture)
        .await
        .expect("capture settles")
        .expect("no panic");
    assert_eq!(captured, Ok(true));
    let view = handle.view();
    assert_eq!(view.step, Some(2));
    assert_eq!(view.sketch.map(|s| s.mime_type), Some("image/png".to_string()));
}

#[tokio::test]
async fn sketch_export_for_an_ended_session_is_dropped() {
    let hub = IdentityHub::signed_in(alice());
    let (surface, started, release) = SlowSurface::new();
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_history(Arc::new(ReadOnlyStore))
        .with_sketches(Arc::new(surface));
    let (handle, _task) = spawn(collaborators, &hub);

    handle.start_session().await.expect("start");
    wait_for(&handle, "viewing", |v| v.phase == Phase::Viewing).await;
    let capture = tokio::spawn({
        let handle = handle.clone();
        async move { handle.capture_sketch().await }
    });
    timeout(WAIT, started.acquire())
        .await
        .expect("export started")
        .expect("semaphore open")
        .forget();
    handle.request_exit().await.expect("exit");
    handle.confirm_exit().await.expect("confirm");

    release.send(()).expect("release export");
    let captured = timeout(WAIT, capture)
        .await
        .expect("capture settles")
        .expect("no panic");
    assert_eq!(captured, Err(SessionError::SketchDiscarded));
    assert!(handle.view().sketch.is_none());
}

#[tokio::test]
async fn unauthenticated_start_asks_for_sign_in() {
    let hub = IdentityHub::new();
    let (handle, _task) = spawn(Collaborators::default(), &hub);
    let mut notices = handle.subscribe_notices();

    assert_eq!(
        handle.start_session().await,
        Err(SessionError::AuthenticationRequired)
    );
    assert_eq!(
        wait_for_notice(&mut notices, |_| true).await,
        Notice::AuthenticationRequired
    );
    assert_eq!(handle.view().phase, Phase::Idle);
}

#[tokio::test]
async fn capture_reports_a_blank_surface() {
    let hub = IdentityHub::signed_in(alice());
    let collaborators = Collaborators::default()
        .with_acquisition(Arc::new(GatedAcquisition::open()))
        .with_history(Arc::new(ReadOnlyStore));
    let (handle, _task) = spawn(collaborators, &hub);

    handle.start_session().await.expect("start");
    wait_for(&handle, "viewing", |v| v.phase == Phase::Viewing).await;
    assert_eq!(
        handle.dispatch(Action::CaptureSketch).await,
        Ok(ActionOutcome::SketchUnavailable)
    );
}

#[tokio::test]
async fn shutdown_stops_the_loop() {
    let hub = IdentityHub::signed_in(alice());
    let (handle, task) = spawn(Collaborators::default(), &hub);

    handle.shutdown().await;
    timeout(WAIT, task)
        .await
        .expect("loop exits")
        .expect("no panic");
    assert_eq!(
        handle.start_session().await,
        Err(SessionError::ControllerStopped)
    );
}
