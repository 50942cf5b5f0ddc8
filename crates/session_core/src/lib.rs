use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ChatMessage, CoachReport, Identity, SessionRecord, SketchArtifact, TargetArtifact},
    protocol::{ScoreRequest, ScoreResponse},
};
use tokio::{sync::mpsc, task::JoinHandle};

pub mod controller;
pub mod coordinate;
mod durable_history_store;
pub mod error;
pub mod history;
pub mod http;
pub mod identity;
pub mod runtime;

pub use controller::{
    ControllerView, Effect, ExitDecision, Generation, Notice, Phase, SessionController,
    Submission,
};
pub use durable_history_store::DurableHistoryStore;
pub use error::SessionError;
pub use identity::IdentityHub;
pub use runtime::{Action, ActionOutcome, ControllerHandle, ControllerRuntime};

#[async_trait]
pub trait TargetAcquisition: Send + Sync {
    /// Each call yields a fresh random target.
    async fn acquire_target(&self) -> Result<TargetArtifact>;
}

#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreResponse>;
}

#[async_trait]
pub trait CoachingClient: Send + Sync {
    async fn coach(&self, history: &[SessionRecord]) -> Result<CoachReport>;
    /// Answers the last user turn of `conversation`. `seed` is the history the
    /// conversation was opened against and stays fixed for its lifetime.
    async fn chat(&self, seed: &[SessionRecord], conversation: &[ChatMessage]) -> Result<String>;
}

/// Append-only per-user record store with a push-based live feed.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn write(&self, identity: &Identity, record: &SessionRecord) -> Result<()>;
    /// Opens a feed that delivers the full ordered history on every change,
    /// starting with the current snapshot. Dropping the feed unsubscribes.
    async fn subscribe(&self, identity: &Identity) -> Result<HistoryFeed>;
}

/// Pull access to the drawing surface's latest raster export. Exports may touch
/// the filesystem, so the runtime calls this off its message loop.
pub trait SketchSource: Send + Sync {
    fn export_sketch(&self) -> Option<SketchArtifact>;
}

pub struct HistoryFeed {
    snapshots: mpsc::Receiver<Vec<SessionRecord>>,
    producer: Option<JoinHandle<()>>,
}

impl HistoryFeed {
    pub fn new(snapshots: mpsc::Receiver<Vec<SessionRecord>>, producer: JoinHandle<()>) -> Self {
        Self {
            snapshots,
            producer: Some(producer),
        }
    }

    pub fn from_receiver(snapshots: mpsc::Receiver<Vec<SessionRecord>>) -> Self {
        Self {
            snapshots,
            producer: None,
        }
    }

    pub async fn next_snapshot(&mut self) -> Option<Vec<SessionRecord>> {
        self.snapshots.recv().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for HistoryFeed {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

pub struct MissingTargetAcquisition;

#[async_trait]
impl TargetAcquisition for MissingTargetAcquisition {
    async fn acquire_target(&self) -> Result<TargetArtifact> {
        Err(anyhow!("target acquisition service is not configured"))
    }
}

pub struct MissingScoringClient;

#[async_trait]
impl ScoringClient for MissingScoringClient {
    async fn score(&self, _request: ScoreRequest) -> Result<ScoreResponse> {
        Err(anyhow!("scoring service is not configured"))
    }
}

pub struct MissingCoachingClient;

#[async_trait]
impl CoachingClient for MissingCoachingClient {
    async fn coach(&self, _history: &[SessionRecord]) -> Result<CoachReport> {
        Err(anyhow!("coaching service is not configured"))
    }

    async fn chat(&self, _seed: &[SessionRecord], _conversation: &[ChatMessage]) -> Result<String> {
        Err(anyhow!("coaching service is not configured"))
    }
}

pub struct MissingHistoryStore;

#[async_trait]
impl HistoryStore for MissingHistoryStore {
    async fn write(&self, identity: &Identity, record: &SessionRecord) -> Result<()> {
        Err(anyhow!(
            "history store unavailable; record {} for user {} was not saved",
            record.id,
            identity.user_id
        ))
    }

    async fn subscribe(&self, identity: &Identity) -> Result<HistoryFeed> {
        Err(anyhow!(
            "history store unavailable for user {}",
            identity.user_id
        ))
    }
}

/// Drawing surface that has never produced a stroke.
pub struct BlankSketchSource;

impl SketchSource for BlankSketchSource {
    fn export_sketch(&self) -> Option<SketchArtifact> {
        None
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub acquisition: Arc<dyn TargetAcquisition>,
    pub scoring: Arc<dyn ScoringClient>,
    pub coaching: Arc<dyn CoachingClient>,
    pub history: Arc<dyn HistoryStore>,
    pub sketches: Arc<dyn SketchSource>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            acquisition: Arc::new(MissingTargetAcquisition),
            scoring: Arc::new(MissingScoringClient),
            coaching: Arc::new(MissingCoachingClient),
            history: Arc::new(MissingHistoryStore),
            sketches: Arc::new(BlankSketchSource),
        }
    }
}

impl Collaborators {
    pub fn with_acquisition(mut self, acquisition: Arc<dyn TargetAcquisition>) -> Self {
        self.acquisition = acquisition;
        self
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringClient>) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_coaching(mut self, coaching: Arc<dyn CoachingClient>) -> Self {
        self.coaching = coaching;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn with_sketches(mut self, sketches: Arc<dyn SketchSource>) -> Self {
        self.sketches = sketches;
        self
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
