use std::time::Duration;

use async_trait::async_trait;
use habot_core::AppResult;
use habot_domain::Update;

/// Factory for upstream long-polling sessions.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Opens one session owned by the active poll loop.
    async fn open_session(&self) -> AppResult<Box<dyn UpdateSession>>;
}

/// One open upstream session.
#[async_trait]
pub trait UpdateSession: Send + Sync {
    /// Fetches up to `limit` updates with ids strictly greater than `after_id`,
    /// in ascending id order. An empty result is not an error.
    async fn fetch_updates(
        &self,
        after_id: i64,
        limit: u32,
        timeout: Duration,
    ) -> AppResult<Vec<Update>>;

    /// Releases the session.
    async fn close(&self) -> AppResult<()>;
}

/// Fire-and-forget reply channel towards the upstream service.
#[async_trait]
pub trait ReplySender: Send + Sync {
    /// Sends one text reply. Failures are retried internally, then logged and swallowed.
    async fn send_reply(&self, target: i64, text: &str);
}

/// Processing hook implemented by the embedding application.
///
/// May be invoked more than once for the same update id after a failover.
#[async_trait]
pub trait UpdateProcessor: Send + Sync {
    /// Processes one update.
    async fn process(&self, update: &Update) -> AppResult<()>;
}
