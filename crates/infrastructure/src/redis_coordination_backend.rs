//! Redis-backed coordination backend for leader election and checkpoints.

use std::time::Duration;

use async_trait::async_trait;
use habot_application::{CoordinationBackend, CoordinationLease};
use habot_core::{AppError, AppResult};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::time::Instant;
use tracing::debug;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const RENEW_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

const WRITE_CHECKPOINT_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[2], ARGV[2])
  return 1
else
  return 0
end
"#;

const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Redis implementation of the coordination backend.
///
/// Endpoints are tried in order on every call; the first reachable one serves
/// the request.
#[derive(Clone)]
pub struct RedisCoordinationBackend {
    clients: Vec<redis::Client>,
}

impl RedisCoordinationBackend {
    /// Creates one adapter from already configured clients.
    pub fn new(clients: Vec<redis::Client>) -> AppResult<Self> {
        if clients.is_empty() {
            return Err(AppError::Validation(
                "redis coordination backend requires at least one endpoint".to_owned(),
            ));
        }

        Ok(Self { clients })
    }

    /// Parses every endpoint URL without connecting.
    pub fn from_urls(urls: &[String]) -> AppResult<Self> {
        let clients = urls
            .iter()
            .map(|url| {
                redis::Client::open(url.as_str()).map_err(|error| {
                    AppError::Validation(format!("invalid redis endpoint '{url}': {error}"))
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Self::new(clients)
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        let mut last_error = None;

        for (endpoint, client) in self.clients.iter().enumerate() {
            match client.get_multiplexed_async_connection().await {
                Ok(connection) => return Ok(connection),
                Err(error) => {
                    debug!(
                        endpoint,
                        error = %error,
                        "redis endpoint unreachable, trying next"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(AppError::Unavailable(match last_error {
            Some(error) => format!("failed to connect to redis: {error}"),
            None => "no redis endpoint configured".to_owned(),
        }))
    }
}

fn ttl_millis(ttl: Duration) -> AppResult<u64> {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Err(AppError::Validation(
            "coordination lease ttl must be at least 1ms".to_owned(),
        ));
    }

    Ok(millis)
}

#[async_trait]
impl CoordinationBackend for RedisCoordinationBackend {
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> AppResult<Option<CoordinationLease>> {
        if key.trim().is_empty() {
            return Err(AppError::Validation(
                "coordination lease key must not be empty".to_owned(),
            ));
        }

        if holder_id.trim().is_empty() {
            return Err(AppError::Validation(
                "coordination lease holder_id must not be empty".to_owned(),
            ));
        }

        let ttl_ms = ttl_millis(ttl)?;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let token = CoordinationLease::token_for(holder_id, nonce.as_str());
        let mut connection = self.connection().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to acquire election lease: {error}"))
            })?;

        if acquired.is_none() {
            return Ok(None);
        }

        Ok(Some(CoordinationLease {
            key: key.to_owned(),
            token,
            holder_id: holder_id.to_owned(),
        }))
    }

    async fn renew_lease(&self, lease: &CoordinationLease, ttl: Duration) -> AppResult<bool> {
        let ttl_ms = ttl_millis(ttl)?;
        let mut connection = self.connection().await?;

        let renewed = Script::new(RENEW_LEASE_SCRIPT)
            .key(lease.key.as_str())
            .arg(lease.token.as_str())
            .arg(ttl_ms)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to renew election lease: {error}"))
            })?;

        Ok(renewed > 0)
    }

    async fn release_lease(&self, lease: &CoordinationLease) -> AppResult<()> {
        let mut connection = self.connection().await?;

        Script::new(RELEASE_LEASE_SCRIPT)
            .key(lease.key.as_str())
            .arg(lease.token.as_str())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to release election lease: {error}"))
            })?;

        Ok(())
    }

    async fn wait_for_release(&self, key: &str, max_wait: Duration) -> AppResult<()> {
        let deadline = Instant::now() + max_wait;
        let mut connection = self.connection().await?;

        loop {
            let exists: bool = connection.exists(key).await.map_err(|error| {
                AppError::Internal(format!("failed to watch election key: {error}"))
            })?;

            let now = Instant::now();
            if !exists || now >= deadline {
                return Ok(());
            }

            tokio::time::sleep(RELEASE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn current_holder(&self, key: &str) -> AppResult<Option<String>> {
        let mut connection = self.connection().await?;

        connection.get(key).await.map_err(|error| {
            AppError::Internal(format!("failed to read election key: {error}"))
        })
    }

    async fn read_checkpoint(&self, key: &str) -> AppResult<Option<i64>> {
        let mut connection = self.connection().await?;

        connection
            .get(key)
            .await
            .map_err(|error| AppError::Internal(format!("failed to read checkpoint: {error}")))
    }

    async fn write_checkpoint(
        &self,
        lease: &CoordinationLease,
        key: &str,
        value: i64,
    ) -> AppResult<bool> {
        let mut connection = self.connection().await?;

        let written = Script::new(WRITE_CHECKPOINT_SCRIPT)
            .key(lease.key.as_str())
            .key(key)
            .arg(lease.token.as_str())
            .arg(value)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| AppError::Internal(format!("failed to write checkpoint: {error}")))?;

        Ok(written > 0)
    }
}
