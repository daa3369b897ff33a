//! Telegram Bot API transport
//!
//! Connect is `getMe`, the connection is held open by long-polling
//! `getUpdates`, and alerts go out with `sendMessage` to a single chat.

use crate::config::{AlertsConfig, AppConfig, Secret};
use crate::error::{FlashError, Result, TransportError};
use crate::supervisor::AlertTransport;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Extra time allowed on top of the long-poll timeout before the request is abandoned
const POLL_GRACE: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> std::result::Result<T, TransportError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(TransportError::Decode("response missing result".into())),
            (false, _) => Err(TransportError::Api {
                code: self.error_code.unwrap_or_default(),
                description: self.description.unwrap_or_else(|| "unknown error".into()),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

pub struct TelegramTransport {
    client: Client,
    /// `{api_url}/bot{token}`; never logged
    bot_url: Secret,
    chat_id: String,
    poll_timeout: Duration,
    /// Next update id to request; acknowledges everything before it
    offset: AtomicI64,
}

impl TelegramTransport {
    pub fn new(api_url: &str, token: &Secret, chat_id: impl Into<String>, poll_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            bot_url: Secret::new(format!(
                "{}/bot{}",
                api_url.trim_end_matches('/'),
                token.expose()
            )),
            chat_id: chat_id.into(),
            poll_timeout,
            offset: AtomicI64::new(0),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let token = config
            .telegram_bot_token
            .as_ref()
            .filter(|token| !token.is_empty())
            .ok_or(FlashError::MissingCredential("TELEGRAM_BOT_TOKEN"))?;
        let chat_id = config
            .telegram_chat_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(FlashError::MissingCredential("TELEGRAM_CHAT_ID"))?;
        let AlertsConfig {
            api_url,
            poll_timeout_secs,
            ..
        } = &config.alerts;

        Ok(Self::new(
            api_url,
            token,
            chat_id,
            Duration::from_secs(*poll_timeout_secs),
        ))
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.bot_url.expose(), method)
    }

    async fn get_updates(&self, timeout_secs: u64) -> std::result::Result<Vec<Update>, TransportError> {
        let offset = self.offset.load(Ordering::SeqCst);
        let response: ApiResponse<Vec<Update>> = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", timeout_secs.to_string()),
                ("allowed_updates", "[]".to_string()),
            ])
            .timeout(Duration::from_secs(timeout_secs) + POLL_GRACE)
            .send()
            .await
            .map_err(strip_url)?
            .json()
            .await
            .map_err(strip_url)?;
        let updates = response.into_result()?;

        if let Some(last) = updates.iter().map(|u| u.update_id).max() {
            self.offset.fetch_max(last + 1, Ordering::SeqCst);
        }
        Ok(updates)
    }
}

#[async_trait]
impl AlertTransport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> std::result::Result<(), TransportError> {
        let response: ApiResponse<BotUser> = self
            .client
            .get(self.method_url("getMe"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(strip_url)?
            .json()
            .await
            .map_err(strip_url)?;
        let bot = response.into_result()?;
        info!(
            "Telegram bot connected: @{} ({})",
            bot.username.as_deref().unwrap_or("unknown"),
            bot.id
        );
        Ok(())
    }

    async fn poll(&self) -> std::result::Result<(), TransportError> {
        let updates = self.get_updates(self.poll_timeout.as_secs()).await?;
        if !updates.is_empty() {
            debug!("Telegram: acknowledged {} updates", updates.len());
        }
        Ok(())
    }

    async fn send_text(&self, text: &str) -> std::result::Result<(), TransportError> {
        let response: ApiResponse<serde_json::Value> = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(strip_url)?
            .json()
            .await
            .map_err(strip_url)?;
        response.into_result()?;
        debug!("Telegram message delivered to chat {}", self.chat_id);
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), TransportError> {
        // Confirm consumed updates so the next session does not replay them
        if self.offset.load(Ordering::SeqCst) > 0 {
            self.get_updates(0).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("chat_id", &self.chat_id)
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

/// reqwest errors embed the request URL, which carries the bot token
fn strip_url(err: reqwest::Error) -> TransportError {
    err.without_url().into()
}
