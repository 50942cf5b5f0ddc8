use serde::{Deserialize, Serialize};

use crate::domain::{ChatMessage, ChatRole, SessionRecord, SketchArtifact, TargetArtifact};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub target: TargetArtifact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketch: Option<SketchArtifact>,
    pub notes: String,
}

/// Raw judge verdict. `score` is range-checked by the caller before it
/// becomes a [`crate::domain::Score`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub score: i64,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachRequest {
    pub sessions: Vec<CoachSample>,
}

/// Trimmed view of a record sent for coaching; image payloads stay local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachSample {
    pub coordinate: String,
    pub timestamp: i64,
    pub notes: String,
    pub score: i64,
    pub feedback: String,
    pub had_sketch: bool,
}

impl From<&SessionRecord> for CoachSample {
    fn from(record: &SessionRecord) -> Self {
        Self {
            coordinate: record.coordinate.to_string(),
            timestamp: record.timestamp.timestamp_millis(),
            notes: record.notes.clone(),
            score: i64::from(record.score),
            feedback: record.feedback.clone(),
            had_sketch: record.sketch.is_some(),
        }
    }
}

impl CoachRequest {
    pub fn from_records(records: &[SessionRecord]) -> Self {
        Self {
            sessions: records.iter().map(CoachSample::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

impl From<&ChatMessage> for ChatTurn {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            text: message.text.clone(),
        }
    }
}

/// A coaching conversation sent in full on every turn, seeded with the
/// sessions it was opened against. The last turn is the user's question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub sessions: Vec<CoachSample>,
    pub turns: Vec<ChatTurn>,
}

impl ChatRequest {
    pub fn new(seed: &[SessionRecord], conversation: &[ChatMessage]) -> Self {
        Self {
            sessions: seed.iter().map(CoachSample::from).collect(),
            turns: conversation.iter().map(ChatTurn::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}
