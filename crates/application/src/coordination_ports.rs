use std::time::Duration;

use async_trait::async_trait;
use habot_core::AppResult;

/// Handle to one lease-bound election key held by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationLease {
    /// Election key bound to the lease.
    pub key: String,
    /// Value written into the key; used for compare-and-renew and fencing.
    pub token: String,
    /// Identity of the instance holding the lease.
    pub holder_id: String,
}

impl CoordinationLease {
    /// Builds the token stored under an election key for one holder.
    #[must_use]
    pub fn token_for(holder_id: &str, nonce: &str) -> String {
        format!("{holder_id}:{nonce}")
    }

    /// Extracts the holder identity from a stored token.
    #[must_use]
    pub fn holder_of(token: &str) -> &str {
        token.split_once(':').map_or(token, |(holder, _)| holder)
    }
}

/// Boundary over the distributed lock and watch backend.
///
/// Implementations must make `try_acquire_lease`, `renew_lease`,
/// `release_lease` and `write_checkpoint` atomic with respect to every other
/// client of the same backend.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Atomically creates `key` bound to a fresh lease when the key is absent.
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> AppResult<Option<CoordinationLease>>;

    /// Renews one lease and returns false when the key expired or changed owner.
    async fn renew_lease(&self, lease: &CoordinationLease, ttl: Duration) -> AppResult<bool>;

    /// Deletes the key when it is still bound to the lease token.
    async fn release_lease(&self, lease: &CoordinationLease) -> AppResult<()>;

    /// Waits until `key` is absent, returning early once `max_wait` elapsed.
    async fn wait_for_release(&self, key: &str, max_wait: Duration) -> AppResult<()>;

    /// Returns the token currently stored under `key`.
    async fn current_holder(&self, key: &str) -> AppResult<Option<String>>;

    /// Reads the checkpoint stored under `key`.
    async fn read_checkpoint(&self, key: &str) -> AppResult<Option<i64>>;

    /// Writes the checkpoint only while `lease` still owns its key.
    ///
    /// Returns false when the write was fenced out.
    async fn write_checkpoint(
        &self,
        lease: &CoordinationLease,
        key: &str,
        value: i64,
    ) -> AppResult<bool>;
}
