use std::env;
use std::str::FromStr;
use std::time::Duration;

use habot_application::{ElectionConfig, PollingConfig};
use habot_core::{AppError, AppResult, InstanceId};
use habot_domain::ProcessingFailurePolicy;
use habot_infrastructure::TelegramBotApiConfig;

/// Process configuration loaded from the environment.
#[derive(Debug, Clone)]
pub(crate) struct WorkerConfig {
    pub(crate) instance_id: InstanceId,
    pub(crate) election: ElectionConfig,
    pub(crate) polling: PollingConfig,
    pub(crate) telegram: TelegramBotApiConfig,
}

impl WorkerConfig {
    pub(crate) fn load() -> AppResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let vars = EnvVars { lookup: &lookup };

        let service_name = vars.required("HABOT_SERVICE_NAME")?;
        let endpoints = vars
            .optional("HABOT_COORDINATION_URLS")
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_owned())
            .split(',')
            .map(str::to_owned)
            .collect();
        let lease_ttl_seconds = vars.parse("HABOT_LEASE_TTL_SECONDS", 10_u64)?;
        let campaign_retry_ms = vars.parse("HABOT_CAMPAIGN_RETRY_MS", 2_000_u64)?;

        let mut election = ElectionConfig::new(service_name, endpoints)?
            .with_lease_ttl(Duration::from_secs(lease_ttl_seconds))?
            .with_campaign_retry_interval(Duration::from_millis(campaign_retry_ms))?;
        if election.endpoints().is_empty() {
            return Err(AppError::Validation(
                "HABOT_COORDINATION_URLS must list at least one endpoint".to_owned(),
            ));
        }
        if let Some(namespace) = vars.optional("HABOT_CHECKPOINT_NAMESPACE") {
            election = election.with_checkpoint_namespace(namespace)?;
        }

        let instance_id = match vars.optional("HABOT_INSTANCE_ID") {
            Some(value) => InstanceId::from_value(value)?,
            None => InstanceId::generate(),
        };

        let failure_policy = match vars.optional("HABOT_FAILURE_POLICY") {
            Some(value) => ProcessingFailurePolicy::parse(value.as_str())?,
            None => ProcessingFailurePolicy::default(),
        };
        let polling = PollingConfig {
            limit: vars.parse("HABOT_POLLING_LIMIT", 100_u32)?,
            timeout: Duration::from_secs(vars.parse("HABOT_POLLING_TIMEOUT_SECONDS", 30_u64)?),
            retry_backoff: Duration::from_millis(vars.parse("HABOT_FETCH_BACKOFF_MS", 5_000_u64)?),
            max_processing_attempts: vars.parse("HABOT_MAX_PROCESSING_ATTEMPTS", 3_u32)?,
            failure_policy,
            ..PollingConfig::default()
        };
        polling.validate()?;

        let allowed_updates = vars
            .optional("HABOT_ALLOWED_UPDATES")
            .unwrap_or_else(|| "message".to_owned())
            .split(',')
            .map(|kind| kind.trim().to_owned())
            .filter(|kind| !kind.is_empty())
            .collect();
        let telegram = TelegramBotApiConfig {
            base_url: vars
                .optional("TELEGRAM_API_BASE_URL")
                .unwrap_or_else(|| "https://api.telegram.org".to_owned()),
            bot_token: vars.required("TELEGRAM_BOT_TOKEN")?,
            allowed_updates,
            max_reply_attempts: 3,
            reply_backoff: Duration::from_millis(500),
        };

        Ok(Self {
            instance_id,
            election,
            polling,
            telegram,
        })
    }
}

struct EnvVars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvVars<'_> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &str) -> AppResult<String> {
        self.optional(name)
            .ok_or_else(|| AppError::Validation(format!("{name} is required")))
    }

    fn parse<T>(&self, name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            Some(value) => value.parse::<T>().map_err(|error| {
                AppError::Validation(format!("invalid {name} value '{value}': {error}"))
            }),
            None => Ok(default),
        }
    }
}
