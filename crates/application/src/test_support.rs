//! Shared fakes for application unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use habot_core::{AppError, AppResult};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ElectionConfig;
use crate::coordination_ports::{CoordinationBackend, CoordinationLease};

pub(crate) fn test_election_config() -> ElectionConfig {
    let config = ElectionConfig::new("bot_test", Vec::new())
        .and_then(|config| config.with_lease_ttl(Duration::from_secs(3)))
        .and_then(|config| config.with_campaign_retry_interval(Duration::from_secs(1)))
        .and_then(|config| config.with_backend_call_timeout(Duration::from_millis(500)))
        .map(|config| config.with_max_rejoin_jitter(Duration::from_millis(100)));
    assert!(config.is_ok());
    config.unwrap_or_else(|_| unreachable!())
}

#[derive(Default)]
pub(crate) struct FakeCoordinationBackend {
    keys: Mutex<HashMap<String, (String, Instant)>>,
    pub(crate) checkpoints: Mutex<HashMap<String, i64>>,
    /// Every accepted checkpoint write, in call order.
    pub(crate) checkpoint_writes: Mutex<Vec<i64>>,
    pub(crate) renewals_fail: AtomicBool,
    /// Holders whose calls never complete.
    hung_holders: Mutex<HashSet<String>>,
    nonce: AtomicU64,
}

impl FakeCoordinationBackend {
    async fn live_token(&self, key: &str) -> Option<String> {
        let mut keys = self.keys.lock().await;
        if keys
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= Instant::now())
        {
            keys.remove(key);
        }

        keys.get(key).map(|(token, _)| token.clone())
    }

    pub(crate) async fn revoke(&self, key: &str) {
        self.keys.lock().await.remove(key);
    }

    /// Makes every later call from `holder_id` hang instead of failing.
    pub(crate) async fn hang(&self, holder_id: &str) {
        self.hung_holders.lock().await.insert(holder_id.to_owned());
    }

    async fn stall_if_hung(&self, holder_id: &str) {
        if self.hung_holders.lock().await.contains(holder_id) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl CoordinationBackend for FakeCoordinationBackend {
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> AppResult<Option<CoordinationLease>> {
        self.stall_if_hung(holder_id).await;
        if self.live_token(key).await.is_some() {
            return Ok(None);
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst).to_string();
        let token = CoordinationLease::token_for(holder_id, nonce.as_str());
        self.keys
            .lock()
            .await
            .insert(key.to_owned(), (token.clone(), Instant::now() + ttl));

        Ok(Some(CoordinationLease {
            key: key.to_owned(),
            token,
            holder_id: holder_id.to_owned(),
        }))
    }

    async fn renew_lease(&self, lease: &CoordinationLease, ttl: Duration) -> AppResult<bool> {
        self.stall_if_hung(lease.holder_id.as_str()).await;
        if self.renewals_fail.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("simulated partition".to_owned()));
        }

        if self.live_token(lease.key.as_str()).await.as_deref() != Some(lease.token.as_str()) {
            return Ok(false);
        }

        self.keys.lock().await.insert(
            lease.key.clone(),
            (lease.token.clone(), Instant::now() + ttl),
        );
        Ok(true)
    }

    async fn release_lease(&self, lease: &CoordinationLease) -> AppResult<()> {
        self.stall_if_hung(lease.holder_id.as_str()).await;
        if self.live_token(lease.key.as_str()).await.as_deref() == Some(lease.token.as_str()) {
            self.keys.lock().await.remove(lease.key.as_str());
        }
        Ok(())
    }

    async fn wait_for_release(&self, key: &str, max_wait: Duration) -> AppResult<()> {
        let deadline = Instant::now() + max_wait;
        while self.live_token(key).await.is_some() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    async fn current_holder(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.live_token(key).await)
    }

    async fn read_checkpoint(&self, key: &str) -> AppResult<Option<i64>> {
        Ok(self.checkpoints.lock().await.get(key).copied())
    }

    async fn write_checkpoint(
        &self,
        lease: &CoordinationLease,
        key: &str,
        value: i64,
    ) -> AppResult<bool> {
        self.stall_if_hung(lease.holder_id.as_str()).await;
        if self.live_token(lease.key.as_str()).await.as_deref() != Some(lease.token.as_str()) {
            return Ok(false);
        }

        self.checkpoints.lock().await.insert(key.to_owned(), value);
        self.checkpoint_writes.lock().await.push(value);
        Ok(true)
    }
}
