//! Leader-gated Telegram long-polling worker.

#![forbid(unsafe_code)]

mod acknowledge_processor;
mod worker_config;

use std::sync::Arc;
use std::time::Duration;

use habot_application::{LeaderElection, PollingCoordinator};
use habot_core::{AppError, AppResult};
use habot_infrastructure::{RedisCoordinationBackend, TelegramBotApi};
use tracing::info;
use tracing_subscriber::EnvFilter;

use acknowledge_processor::AcknowledgeProcessor;
use worker_config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let backend = Arc::new(RedisCoordinationBackend::from_urls(
        config.election.endpoints(),
    )?);
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;
    let telegram = Arc::new(TelegramBotApi::new(http_client, config.telegram.clone())?);
    let processor = Arc::new(AcknowledgeProcessor::new(telegram.clone()));

    let (election, events) = LeaderElection::new(
        backend,
        config.election.clone(),
        config.instance_id.clone(),
    );
    let coordinator =
        PollingCoordinator::new(election, events, telegram, processor, config.polling.clone())?;

    info!(
        instance_id = %config.instance_id,
        service_name = config.election.service_name(),
        endpoints = config.election.endpoints().len(),
        lease_ttl_seconds = config.election.lease_ttl().as_secs(),
        failure_policy = config.polling.failure_policy.as_str(),
        "habot-worker started"
    );

    coordinator.start().await?;
    let signal = wait_for_shutdown_signal().await;

    info!(instance_id = %config.instance_id, "shutting down");
    coordinator.stop().await;
    signal
}

async fn wait_for_shutdown_signal() -> AppResult<()> {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.map_err(|error| {
            AppError::Internal(format!("failed to listen for ctrl-c: {error}"))
        })
    };

    #[cfg(unix)]
    let terminate = async {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).map_err(
                |error| AppError::Internal(format!("failed to listen for SIGTERM: {error}")),
            )?;
        terminate.recv().await;
        Ok::<(), AppError>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<AppResult<()>>();

    tokio::select! {
        result = ctrl_c => {
            info!("received ctrl-c");
            result
        }
        result = terminate => {
            info!("received SIGTERM");
            result
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
