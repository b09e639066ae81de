use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, ScribeError};

/// Opaque, collision-resistant artifact identifier (21-char nanoid).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Received,
    Processing,
    Completed,
    Failed,
    Purged,
}

impl ArtifactState {
    pub fn can_transition_to(self, next: ArtifactState) -> bool {
        use ArtifactState::*;
        matches!(
            (self, next),
            (Received, Processing)
                | (Received, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Purged)
                | (Failed, Purged)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ArtifactState::Completed | ArtifactState::Failed)
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Purged => write!(f, "purged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.starts_with("image/") {
            Some(Self::Image)
        } else if mime.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

/// Caller-supplied description of an upload, before any byte is read.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub filename: Option<String>,
    pub declared_type: Option<String>,
    pub declared_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadArtifact {
    pub id: ArtifactId,
    pub original_filename: Option<String>,
    pub mime_type: String,
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub sha256: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub state: ArtifactState,
}

impl UploadArtifact {
    pub fn transition(&mut self, next: ArtifactState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ScribeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}
