use habot_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the polling coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Not running.
    Stopped,
    /// Starting the election engine.
    Starting,
    /// Running and waiting for leadership.
    Standby,
    /// Leader with a live poll task.
    Active,
    /// Tearing down the poll task and upstream session.
    Draining,
}

impl CoordinatorState {
    /// Returns stable state value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Standby => "standby",
            Self::Active => "active",
            Self::Draining => "draining",
        }
    }
}

/// What the leader does with an update that keeps failing to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingFailurePolicy {
    /// Log the update and checkpoint past it.
    #[default]
    Skip,
    /// Relinquish leadership so another instance retries it.
    Resign,
    /// Stop polling on this instance until the next leadership term.
    Halt,
}

impl ProcessingFailurePolicy {
    /// Returns stable policy value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Resign => "resign",
            Self::Halt => "halt",
        }
    }

    /// Parses a policy from its stable value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "resign" => Ok(Self::Resign),
            "halt" => Ok(Self::Halt),
            other => Err(AppError::Validation(format!(
                "unknown processing failure policy '{other}'"
            ))),
        }
    }
}
