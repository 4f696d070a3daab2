//! In-process coordination backend with fault injection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use habot_application::{CoordinationBackend, CoordinationLease};
use habot_core::{AppError, AppResult};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct LeaseEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct BackendState {
    leases: HashMap<String, LeaseEntry>,
    checkpoints: HashMap<String, i64>,
    isolated_holders: HashSet<String>,
    latency: Duration,
    holder_latency: HashMap<String, Duration>,
}

impl BackendState {
    fn live_lease(&mut self, key: &str) -> Option<&LeaseEntry> {
        if self
            .leases
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            self.leases.remove(key);
        }

        self.leases.get(key)
    }

    fn holds(&mut self, lease: &CoordinationLease) -> bool {
        self.live_lease(lease.key.as_str())
            .is_some_and(|entry| entry.token == lease.token)
    }

    fn ensure_reachable(&self, holder_id: &str) -> AppResult<()> {
        if self.isolated_holders.contains(holder_id) {
            return Err(AppError::Unavailable(format!(
                "coordination backend unreachable from '{holder_id}'"
            )));
        }

        Ok(())
    }
}

/// Coordination backend kept in process memory.
///
/// Shared by several election engines it behaves like one linearizable store.
/// Partitions and latency can be injected per holder to exercise failover.
///
/// Partitions only cover lease-bound calls. `current_holder` and
/// `read_checkpoint` carry no holder identity, so they keep answering while a
/// holder is isolated; only latency applies to them.
#[derive(Default)]
pub struct InMemoryCoordinationBackend {
    state: Mutex<BackendState>,
    released: Notify,
    nonce: AtomicU64,
}

impl InMemoryCoordinationBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every lease-bound call from `holder_id` fail as unreachable.
    pub async fn isolate(&self, holder_id: &str) {
        self.state
            .lock()
            .await
            .isolated_holders
            .insert(holder_id.to_owned());
    }

    /// Reverts [`Self::isolate`].
    pub async fn heal(&self, holder_id: &str) {
        self.state.lock().await.isolated_holders.remove(holder_id);
    }

    /// Delays every call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    /// Delays calls made on behalf of `holder_id` by `latency`, on top of any
    /// global latency. A zero `latency` clears the override.
    ///
    /// Unlike [`Self::isolate`] the calls succeed once the delay has passed,
    /// which models a process that freezes and later resumes.
    pub async fn set_holder_latency(&self, holder_id: &str, latency: Duration) {
        let mut state = self.state.lock().await;
        if latency.is_zero() {
            state.holder_latency.remove(holder_id);
        } else {
            state.holder_latency.insert(holder_id.to_owned(), latency);
        }
    }

    /// Deletes `key` regardless of its owner, as if its lease had expired.
    pub async fn expire(&self, key: &str) {
        if self.state.lock().await.leases.remove(key).is_some() {
            self.released.notify_waiters();
        }
    }

    /// Returns the stored checkpoint without latency or partitions applied.
    pub async fn checkpoint(&self, key: &str) -> Option<i64> {
        self.state.lock().await.checkpoints.get(key).copied()
    }

    async fn delay(&self, holder_id: Option<&str>) {
        let latency = {
            let state = self.state.lock().await;
            let holder_latency = holder_id
                .and_then(|holder_id| state.holder_latency.get(holder_id).copied())
                .unwrap_or_default();
            state.latency.saturating_add(holder_latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryCoordinationBackend {
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> AppResult<Option<CoordinationLease>> {
        self.delay(Some(holder_id)).await;
        let mut state = self.state.lock().await;
        state.ensure_reachable(holder_id)?;

        if state.live_lease(key).is_some() {
            return Ok(None);
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst).to_string();
        let token = CoordinationLease::token_for(holder_id, nonce.as_str());
        state.leases.insert(
            key.to_owned(),
            LeaseEntry {
                token: token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(Some(CoordinationLease {
            key: key.to_owned(),
            token,
            holder_id: holder_id.to_owned(),
        }))
    }

    async fn renew_lease(&self, lease: &CoordinationLease, ttl: Duration) -> AppResult<bool> {
        self.delay(Some(lease.holder_id.as_str())).await;
        let mut state = self.state.lock().await;
        state.ensure_reachable(lease.holder_id.as_str())?;

        if !state.holds(lease) {
            return Ok(false);
        }

        state.leases.insert(
            lease.key.clone(),
            LeaseEntry {
                token: lease.token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, lease: &CoordinationLease) -> AppResult<()> {
        self.delay(Some(lease.holder_id.as_str())).await;
        let mut state = self.state.lock().await;
        state.ensure_reachable(lease.holder_id.as_str())?;

        if state.holds(lease) {
            state.leases.remove(lease.key.as_str());
            self.released.notify_waiters();
        }

        Ok(())
    }

    async fn wait_for_release(&self, key: &str, max_wait: Duration) -> AppResult<()> {
        let deadline = Instant::now() + max_wait;

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                match state.live_lease(key) {
                    None => return Ok(()),
                    Some(entry) => entry.expires_at.min(deadline),
                }
            };

            if Instant::now() >= deadline {
                return Ok(());
            }

            tokio::select! {
                () = released => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn current_holder(&self, key: &str) -> AppResult<Option<String>> {
        self.delay(None).await;
        Ok(self
            .state
            .lock()
            .await
            .live_lease(key)
            .map(|entry| entry.token.clone()))
    }

    async fn read_checkpoint(&self, key: &str) -> AppResult<Option<i64>> {
        self.delay(None).await;
        Ok(self.state.lock().await.checkpoints.get(key).copied())
    }

    async fn write_checkpoint(
        &self,
        lease: &CoordinationLease,
        key: &str,
        value: i64,
    ) -> AppResult<bool> {
        self.delay(Some(lease.holder_id.as_str())).await;
        let mut state = self.state.lock().await;
        state.ensure_reachable(lease.holder_id.as_str())?;

        if !state.holds(lease) {
            return Ok(false);
        }

        state.checkpoints.insert(key.to_owned(), value);
        Ok(true)
    }
}
