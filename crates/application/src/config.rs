use std::time::Duration;

use habot_core::{AppError, AppResult, NonEmptyString};
use habot_domain::ProcessingFailurePolicy;

/// Immutable election configuration shared by every instance of one service.
///
/// All instances that must exclude each other have to use the same
/// `service_name`; it scopes the election and checkpoint keys.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    service_name: NonEmptyString,
    endpoints: Vec<String>,
    lease_ttl: Duration,
    campaign_retry_interval: Duration,
    checkpoint_namespace: Option<NonEmptyString>,
    keepalive_failure_budget: u32,
    max_rejoin_jitter: Duration,
    backend_call_timeout: Duration,
}

impl ElectionConfig {
    /// Creates a configuration with default timings.
    pub fn new(service_name: impl Into<String>, endpoints: Vec<String>) -> AppResult<Self> {
        let service_name = NonEmptyString::new(service_name).map_err(|_| {
            AppError::Validation("election service_name must not be empty".to_owned())
        })?;

        let endpoints: Vec<String> = endpoints
            .into_iter()
            .map(|endpoint| endpoint.trim().to_owned())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();

        Ok(Self {
            service_name,
            endpoints,
            lease_ttl: Duration::from_secs(10),
            campaign_retry_interval: Duration::from_secs(2),
            checkpoint_namespace: None,
            keepalive_failure_budget: 2,
            max_rejoin_jitter: Duration::from_millis(500),
            backend_call_timeout: Duration::from_secs(3),
        })
    }

    /// Sets the lease time-to-live. Must be at least 3ms so the keepalive
    /// interval stays positive.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> AppResult<Self> {
        if lease_ttl < Duration::from_millis(3) {
            return Err(AppError::Validation(
                "election lease_ttl must be at least 3ms".to_owned(),
            ));
        }

        self.lease_ttl = lease_ttl;
        Ok(self)
    }

    /// Sets the upper bound of one watch-for-deletion wait between campaigns.
    pub fn with_campaign_retry_interval(mut self, interval: Duration) -> AppResult<Self> {
        if interval.is_zero() {
            return Err(AppError::Validation(
                "election campaign_retry_interval must be greater than zero".to_owned(),
            ));
        }

        self.campaign_retry_interval = interval;
        Ok(self)
    }

    /// Overrides the namespace of the checkpoint key.
    pub fn with_checkpoint_namespace(mut self, namespace: impl Into<String>) -> AppResult<Self> {
        self.checkpoint_namespace = Some(NonEmptyString::new(namespace).map_err(|_| {
            AppError::Validation("checkpoint namespace must not be empty".to_owned())
        })?);
        Ok(self)
    }

    /// Sets how many consecutive keepalive errors are tolerated before demotion.
    #[must_use]
    pub fn with_keepalive_failure_budget(mut self, budget: u32) -> Self {
        self.keepalive_failure_budget = budget;
        self
    }

    /// Sets the maximum random delay before re-campaigning after demotion.
    #[must_use]
    pub fn with_max_rejoin_jitter(mut self, jitter: Duration) -> Self {
        self.max_rejoin_jitter = jitter;
        self
    }

    /// Sets the timeout applied to every coordination backend call.
    pub fn with_backend_call_timeout(mut self, timeout: Duration) -> AppResult<Self> {
        if timeout.is_zero() {
            return Err(AppError::Validation(
                "election backend_call_timeout must be greater than zero".to_owned(),
            ));
        }

        self.backend_call_timeout = timeout;
        Ok(self)
    }

    /// Returns the logical service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.service_name.as_str()
    }

    /// Returns configured coordination backend endpoints.
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Returns the lease time-to-live.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Returns the keepalive interval, one third of the lease TTL.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        self.lease_ttl / 3
    }

    /// Returns the campaign retry interval.
    #[must_use]
    pub fn campaign_retry_interval(&self) -> Duration {
        self.campaign_retry_interval
    }

    /// Returns the tolerated number of consecutive keepalive errors.
    #[must_use]
    pub fn keepalive_failure_budget(&self) -> u32 {
        self.keepalive_failure_budget
    }

    /// Returns the maximum re-campaign jitter.
    #[must_use]
    pub fn max_rejoin_jitter(&self) -> Duration {
        self.max_rejoin_jitter
    }

    /// Returns the per-call backend timeout.
    #[must_use]
    pub fn backend_call_timeout(&self) -> Duration {
        self.backend_call_timeout
    }

    /// Returns the well-known election key, `<service-name>/election`.
    #[must_use]
    pub fn election_key(&self) -> String {
        format!("{}/election", self.service_name.as_str())
    }

    /// Returns the checkpoint key, `<namespace>/offset`.
    #[must_use]
    pub fn checkpoint_key(&self) -> String {
        let namespace = self
            .checkpoint_namespace
            .as_ref()
            .unwrap_or(&self.service_name);
        format!("{}/offset", namespace.as_str())
    }
}

/// Poll loop configuration.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Maximum number of updates requested per fetch.
    pub limit: u32,
    /// Long-polling timeout passed to the upstream fetch.
    pub timeout: Duration,
    /// Fixed delay after a failed fetch or processing failure.
    pub retry_backoff: Duration,
    /// Consecutive failures tolerated for one update before the failure policy applies.
    pub max_processing_attempts: u32,
    /// Policy applied once `max_processing_attempts` is exhausted.
    pub failure_policy: ProcessingFailurePolicy,
    /// How long draining waits for the poll task before aborting it.
    pub drain_grace: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(5),
            max_processing_attempts: 3,
            failure_policy: ProcessingFailurePolicy::Skip,
            drain_grace: Duration::from_secs(5),
        }
    }
}

impl PollingConfig {
    /// Validates configured bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.limit == 0 {
            return Err(AppError::Validation(
                "polling limit must be greater than zero".to_owned(),
            ));
        }

        if self.max_processing_attempts == 0 {
            return Err(AppError::Validation(
                "max_processing_attempts must be greater than zero".to_owned(),
            ));
        }

        if self.retry_backoff.is_zero() {
            return Err(AppError::Validation(
                "polling retry_backoff must be greater than zero".to_owned(),
            ));
        }

        if self.drain_grace.is_zero() {
            return Err(AppError::Validation(
                "polling drain_grace must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ElectionConfig, PollingConfig};

    #[test]
    fn election_config_derives_keys_from_service_name() {
        let config = ElectionConfig::new("bot_test", vec!["redis://localhost".to_owned()]);
        assert!(config.is_ok());
        let config = config.unwrap_or_else(|_| unreachable!());

        assert_eq!(config.election_key(), "bot_test/election");
        assert_eq!(config.checkpoint_key(), "bot_test/offset");

        let config = config.with_checkpoint_namespace("shared");
        assert!(config.is_ok());
        let config = config.unwrap_or_else(|_| unreachable!());
        assert_eq!(config.checkpoint_key(), "shared/offset");
    }

    #[test]
    fn election_config_rejects_blank_service_name() {
        assert!(ElectionConfig::new("  ", Vec::new()).is_err());
    }

    #[test]
    fn keepalive_interval_is_a_third_of_ttl() {
        let config = ElectionConfig::new("svc", Vec::new())
            .and_then(|config| config.with_lease_ttl(Duration::from_secs(9)));
        assert_eq!(
            config.map(|config| config.keepalive_interval()).ok(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn endpoints_are_trimmed_and_blank_entries_dropped() {
        let config = ElectionConfig::new(
            "svc",
            vec![" redis://a ".to_owned(), String::new(), "redis://b".to_owned()],
        );
        assert_eq!(
            config.map(|config| config.endpoints().to_vec()).ok(),
            Some(vec!["redis://a".to_owned(), "redis://b".to_owned()])
        );
    }

    #[test]
    fn polling_config_rejects_zero_limit() {
        let config = PollingConfig {
            limit: 0,
            ..PollingConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(PollingConfig::default().validate().is_ok());
    }

    #[test]
    fn polling_config_rejects_zero_drain_grace() {
        let config = PollingConfig {
            drain_grace: Duration::ZERO,
            ..PollingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(habot_core::AppError::Validation(message)) if message.contains("drain_grace")
        ));
    }
}
