//! What a stage action hands back to the pipeline.

use crate::environment::EnvFragment;
use crate::errors::DevboxError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The action succeeded; the marker gets written.
    Ok,
    /// Stage was skipped because its marker exists.
    Skip,
    /// Stage observed cancellation and stopped.
    Cancel,
    /// The action failed; the pipeline stops here.
    Fail,
}

impl StageStatus {
    /// Lowercase label used in reports and events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Skip => "skip",
            Self::Cancel => "cancel",
            Self::Fail => "fail",
        }
    }

    /// True if the pipeline moves on to the next stage.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Skip)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// How the action ended.
    pub status: StageStatus,

    /// Appended to the descriptor before the marker is written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvFragment>,

    /// Failure message or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageOutput {
    fn with_status(status: StageStatus, error: Option<String>) -> Self {
        Self {
            status,
            env: None,
            error,
        }
    }

    /// Success without environment entries.
    #[must_use]
    pub fn ok() -> Self {
        Self::with_status(StageStatus::Ok, None)
    }

    /// Success that appends `fragment` to the descriptor.
    #[must_use]
    pub fn ok_with_env(fragment: EnvFragment) -> Self {
        Self {
            env: Some(fragment),
            ..Self::ok()
        }
    }

    /// Failure with a message.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self::with_status(StageStatus::Fail, Some(error.into()))
    }

    /// Stopped on cancellation.
    #[must_use]
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::with_status(StageStatus::Cancel, Some(reason.into()))
    }

    /// True only for [`StageStatus::Ok`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Ok
    }
}

impl From<DevboxError> for StageOutput {
    fn from(err: DevboxError) -> Self {
        match err {
            DevboxError::StageFailed { message, .. } => Self::fail(message),
            DevboxError::Cancelled(reason) => Self::cancel(reason),
            other => Self::fail(other.to_string()),
        }
    }
}
