use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! string_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_newtype!(UserId);
string_newtype!(RecordId);
string_newtype!(Coordinate);
string_newtype!(MessageId);

impl RecordId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// An authenticated user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// The withheld reference image a session is judged against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetArtifact {
    pub mime_type: String,
    pub image_b64: String,
    pub display_handle: String,
}

/// Raster export of the user's drawing surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SketchArtifact {
    pub mime_type: String,
    pub image_b64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("score {0} is outside 0..=100")]
pub struct ScoreOutOfRange(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Score(u8);

impl Score {
    pub const MAX: u8 = 100;

    pub fn new(value: i64) -> Result<Self, ScoreOutOfRange> {
        if (0..=i64::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(ScoreOutOfRange(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Score {
    type Error = ScoreOutOfRange;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Score> for i64 {
    fn from(value: Score) -> Self {
        i64::from(value.0)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted result of one completed session. Never mutated after the store
/// acknowledges the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: RecordId,
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
    pub target: TargetArtifact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketch: Option<SketchArtifact>,
    pub notes: String,
    pub score: Score,
    pub feedback: String,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoachReport {
    pub trend_summary: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub training_tips: Vec<String>,
    #[serde(default)]
    pub future_steps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Coach,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "you",
            Self::Coach => "coach",
        })
    }
}

/// One turn of a coaching conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::random(),
            role,
            text: text.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
