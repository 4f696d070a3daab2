use habot_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work delivered by the upstream message source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    update_id: i64,
    payload: Value,
}

impl Update {
    /// Creates one update. Identifiers are strictly positive.
    pub fn new(update_id: i64, payload: Value) -> AppResult<Self> {
        if update_id <= 0 {
            return Err(AppError::Validation(format!(
                "update_id must be greater than zero, got {update_id}"
            )));
        }

        Ok(Self { update_id, payload })
    }

    /// Returns the strictly increasing upstream identifier.
    #[must_use]
    pub fn update_id(&self) -> i64 {
        self.update_id
    }

    /// Returns the opaque upstream payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the chat the update originates from, when the payload carries a message.
    #[must_use]
    pub fn chat_id(&self) -> Option<i64> {
        self.payload
            .get("message")
            .and_then(|message| message.get("chat"))
            .and_then(|chat| chat.get("id"))
            .and_then(Value::as_i64)
    }
}

/// Durable marker of the last fully processed update id.
///
/// The value never moves backwards: `advance` ignores ids at or below the
/// current position.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Checkpoint(i64);

impl Checkpoint {
    /// Creates a checkpoint from a persisted value.
    pub fn new(value: i64) -> AppResult<Self> {
        if value < 0 {
            return Err(AppError::Validation(format!(
                "checkpoint must not be negative, got {value}"
            )));
        }

        Ok(Self(value))
    }

    /// Returns the last processed update id, `0` when nothing was processed yet.
    #[must_use]
    pub fn value(self) -> i64 {
        self.0
    }

    /// Returns whether the update lies strictly after this checkpoint.
    #[must_use]
    pub fn is_pending(self, update_id: i64) -> bool {
        update_id > self.0
    }

    /// Moves the checkpoint forward to `update_id`. Returns false when the id
    /// is not ahead of the current position.
    pub fn advance(&mut self, update_id: i64) -> bool {
        if !self.is_pending(update_id) {
            return false;
        }

        self.0 = update_id;
        true
    }
}
