use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Button, Notifier, SentMessage};
use crate::config::Config;
use crate::error::{ReminderSyncError, Result};

/// Telegram Bot API transport.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

impl TelegramNotifier {
    pub fn new(base_url: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(ReminderSyncError::Config(
                "notifier.bot_token is required".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReminderSyncError::Http(e.to_string()))?;
        Ok(Self {
            client,
            api_url: format!(
                "{}/bot{}",
                base_url.trim().trim_end_matches('/'),
                bot_token.trim()
            ),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let token = config.notifier.bot_token.as_deref().ok_or_else(|| {
            ReminderSyncError::Config("notifier.bot_token is required".to_string())
        })?;
        Self::new(&config.notifier_base_url(), token, config.notifier_timeout())
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/{method}", self.api_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ReminderSyncError::Http(format!("telegram {method} transport failure: {e}")))?;
        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| ReminderSyncError::Http(format!("telegram {method} http {status}: {e}")))?;
        if !body.ok {
            return Err(ReminderSyncError::Http(format!(
                "telegram {method} failed: {}",
                body.description.unwrap_or_else(|| status.to_string())
            )));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: &str, text: &str, buttons: &[Button]) -> Result<SentMessage> {
        let mut payload = json!({ "chat_id": chat_id, "text": text });
        if !buttons.is_empty() {
            let rows: Vec<Value> = buttons
                .iter()
                .map(|button| {
                    json!([{ "text": button.text, "callback_data": button.callback_data }])
                })
                .collect();
            payload["reply_markup"] = json!({ "inline_keyboard": rows });
        }
        let result = self.call("sendMessage", payload).await?;
        let message_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ReminderSyncError::Serialization(
                    "telegram sendMessage returned no message_id".to_string(),
                )
            })?;
        Ok(SentMessage { message_id })
    }

    async fn edit(&self, chat_id: &str, message_id: i64, text: &str) -> Result<()> {
        self.call(
            "editMessageText",
            json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    fn notifier(server: &MockServer) -> TelegramNotifier {
        TelegramNotifier::new(&server.base_url(), "123:abc", Duration::from_secs(5))
            .expect("notifier")
    }

    #[tokio::test]
    async fn send_posts_inline_keyboard_and_returns_message_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/bot123:abc/sendMessage")
                    .body_includes(r#""chat_id":"42""#)
                    .body_includes(r#""callback_data":"stop_constant""#);
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 901}}));
            })
            .await;

        let sent = notifier(&server)
            .send(
                "42",
                "hello",
                &[Button {
                    text: "Stop".to_string(),
                    callback_data: "stop_constant".to_string(),
                }],
            )
            .await
            .expect("send");
        assert_eq!(sent.message_id, 901);
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn api_errors_are_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/bot123:abc/editMessageText");
                then.status(400).json_body(
                    json!({"ok": false, "description": "Bad Request: message is not modified"}),
                );
            })
            .await;

        let err = notifier(&server)
            .edit("42", 901, "same")
            .await
            .expect_err("edit fails");
        assert!(err.to_string().contains("message is not modified"));
    }
}
