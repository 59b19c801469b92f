use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::transcript::TranscriptionResult;

/// Opaque, unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state of a job.
///
/// `Queued -> Processing -> {Completed, Failed, Cancelled}`; a queued job may also go straight
/// to a terminal state. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (Self::Queued, Self::Processing) => true,
            (Self::Queued | Self::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work owned by one backend adapter.
///
/// Jobs live in the [`crate::job_registry::JobRegistry`]; adapters report into it and never
/// hold authoritative state themselves.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub backend: BackendKind,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fraction of work done, `0.0..=1.0`.
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TranscriptionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub(crate) fn queued(backend: BackendKind, file_name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            backend,
            state: JobState::Queued,
            submitted_at: now,
            updated_at: now,
            progress: 0.0,
            file_name,
            result: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move to `next`, stamping `updated_at`. Returns `false` (and changes nothing) when the
    /// transition is not legal.
    pub(crate) fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = now;
        if next == JobState::Completed {
            self.progress = 1.0;
        }
        true
    }
}
