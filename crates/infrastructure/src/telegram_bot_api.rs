//! Telegram Bot API adapter: long-polling update source and reply sender.

use std::time::Duration;

use async_trait::async_trait;
use habot_application::{ReplySender, UpdateSession, UpdateSource};
use habot_core::{AppError, AppResult};
use habot_domain::Update;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Extra time granted to an HTTP request on top of the long-polling timeout.
const SESSION_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Telegram Bot API client settings.
#[derive(Debug, Clone)]
pub struct TelegramBotApiConfig {
    /// API root, `https://api.telegram.org` in production.
    pub base_url: String,
    /// Bot token issued by BotFather.
    pub bot_token: String,
    /// Update kinds requested from `getUpdates`.
    pub allowed_updates: Vec<String>,
    /// Attempts per `sendMessage` call, at least one.
    pub max_reply_attempts: u8,
    /// Linear backoff step between reply attempts.
    pub reply_backoff: Duration,
}

/// Telegram Bot API adapter.
pub struct TelegramBotApi {
    http_client: reqwest::Client,
    methods_url: String,
    allowed_updates: Vec<String>,
    max_reply_attempts: u8,
    reply_backoff: Duration,
}

impl TelegramBotApi {
    /// Creates one adapter. Replies use `http_client`; every polling session
    /// builds its own client.
    pub fn new(http_client: reqwest::Client, config: TelegramBotApiConfig) -> AppResult<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(AppError::Validation(
                "telegram bot token must not be empty".to_owned(),
            ));
        }

        let base_url = config.base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(AppError::Validation(
                "telegram api base url must not be empty".to_owned(),
            ));
        }

        Ok(Self {
            http_client,
            methods_url: format!("{base_url}/bot{}", config.bot_token.trim()),
            allowed_updates: config.allowed_updates,
            max_reply_attempts: config.max_reply_attempts.max(1),
            reply_backoff: config.reply_backoff,
        })
    }

    async fn send_with_retry(&self, request: &SendMessageRequest<'_>) -> AppResult<()> {
        let url = format!("{}/sendMessage", self.methods_url);
        let mut attempt = 0_u8;
        let mut last_error: Option<String> = None;

        while attempt < self.max_reply_attempts {
            attempt = attempt.saturating_add(1);
            let response = self.http_client.post(url.as_str()).json(request).send().await;

            match response {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response)
                    if response.status().is_server_error()
                        || response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS =>
                {
                    last_error = Some(format!("transient HTTP status {}", response.status()));
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<response body unavailable>".to_owned());
                    return Err(AppError::Validation(format!(
                        "sendMessage rejected with status {status}: {body}"
                    )));
                }
                Err(error) => {
                    last_error = Some(format!("transport error: {}", error.without_url()));
                }
            }

            if attempt < self.max_reply_attempts {
                tokio::time::sleep(self.reply_backoff.saturating_mul(u32::from(attempt))).await;
            }
        }

        Err(AppError::Unavailable(last_error.unwrap_or_else(|| {
            "sendMessage exhausted retries".to_owned()
        })))
    }
}

#[async_trait]
impl UpdateSource for TelegramBotApi {
    async fn open_session(&self) -> AppResult<Box<dyn UpdateSession>> {
        Ok(Box::new(TelegramPollingSession {
            client: Mutex::new(Some(reqwest::Client::new())),
            get_updates_url: format!("{}/getUpdates", self.methods_url),
            allowed_updates: self.allowed_updates.clone(),
        }))
    }
}

#[async_trait]
impl ReplySender for TelegramBotApi {
    async fn send_reply(&self, target: i64, text: &str) {
        let request = SendMessageRequest {
            chat_id: target,
            text,
        };

        match self.send_with_retry(&request).await {
            Ok(()) => debug!(chat_id = target, "reply sent"),
            Err(error) => warn!(chat_id = target, error = %error, "failed to send reply"),
        }
    }
}

/// One `getUpdates` session with its own connection pool.
struct TelegramPollingSession {
    client: Mutex<Option<reqwest::Client>>,
    get_updates_url: String,
    allowed_updates: Vec<String>,
}

#[async_trait]
impl UpdateSession for TelegramPollingSession {
    async fn fetch_updates(
        &self,
        after_id: i64,
        limit: u32,
        timeout: Duration,
    ) -> AppResult<Vec<Update>> {
        let Some(client) = self.client.lock().await.clone() else {
            return Err(AppError::Unavailable(
                "telegram polling session is closed".to_owned(),
            ));
        };

        let request = GetUpdatesRequest {
            offset: after_id.saturating_add(1),
            limit,
            timeout: timeout.as_secs(),
            allowed_updates: &self.allowed_updates,
        };

        let response = client
            .post(self.get_updates_url.as_str())
            .timeout(timeout + SESSION_TIMEOUT_MARGIN)
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("getUpdates failed: {}", error.without_url()))
            })?;

        let status = response.status();
        let body: ApiResponse<Vec<Value>> = response.json().await.map_err(|error| {
            AppError::Unavailable(format!(
                "getUpdates returned an unreadable body with status {status}: {}",
                error.without_url()
            ))
        })?;

        decode_updates(body)
    }

    async fn close(&self) -> AppResult<()> {
        self.client.lock().await.take();
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest<'a> {
    offset: i64,
    limit: u32,
    timeout: u64,
    allowed_updates: &'a [String],
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Converts a `getUpdates` response into ascending updates, dropping entries
/// without a usable `update_id`.
fn decode_updates(response: ApiResponse<Vec<Value>>) -> AppResult<Vec<Update>> {
    if !response.ok {
        return Err(AppError::Unavailable(format!(
            "getUpdates rejected: {}",
            response
                .description
                .unwrap_or_else(|| "no description".to_owned())
        )));
    }

    let mut updates = Vec::new();
    for payload in response.result.unwrap_or_default() {
        let Some(update_id) = payload.get("update_id").and_then(Value::as_i64) else {
            warn!("dropping telegram update without update_id");
            continue;
        };

        match Update::new(update_id, payload) {
            Ok(update) => updates.push(update),
            Err(error) => warn!(update_id, error = %error, "dropping invalid telegram update"),
        }
    }

    updates.sort_by_key(Update::update_id);
    Ok(updates)
}
