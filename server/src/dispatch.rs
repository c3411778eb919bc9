//! Outbound Instagram messages through the Graph API Send endpoint.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};

pub const MAX_MESSAGE_CHARS: usize = 1000;
const CHUNK_PAUSE: Duration = Duration::from_millis(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome of one send. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_payload: Option<Value>,
}

impl SendResult {
    fn sent() -> Self {
        Self {
            success: true,
            error: None,
            error_payload: None,
        }
    }

    fn failed(error: impl Into<String>, error_payload: Option<Value>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_payload,
        }
    }
}

/// Splits `text` into chunks of at most `max_chars` characters.
///
/// Each cut lands on the last paragraph break, line break, sentence end or space
/// in the window, in that order of preference, provided it sits past 30% of the
/// window. Otherwise the window is cut hard.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    let min_cut = max_chars * 3 / 10;
    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > max_chars {
        let window_end = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..window_end];

        let cut = ["\n\n", "\n", ". ", " "]
            .iter()
            .find_map(|sep| {
                let pos = window.rfind(sep)?;
                (window[..pos].chars().count() > min_cut).then_some(pos + sep.len())
            })
            .unwrap_or(window_end);

        chunks.push(remaining[..cut].trim_end().to_string());
        remaining = remaining[cut..].trim_start();
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    client: reqwest::Client,
    graph_root: String,
}

impl MessageDispatcher {
    /// `graph_root` is the versioned Graph API base, e.g. `https://graph.facebook.com/v24.0`.
    pub fn new(graph_root: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            graph_root: graph_root.into().trim_end_matches('/').to_string(),
        })
    }

    /// Sends `text` to `recipient`, split into chunks when it is too long.
    ///
    /// Chunks go out in order; the first failing chunk ends the send.
    pub async fn send(&self, access_token: &str, recipient: &str, text: &str) -> SendResult {
        if access_token.trim().is_empty() || recipient.trim().is_empty() || text.trim().is_empty() {
            return SendResult::failed("Missing accessToken, recipientId or text", None);
        }

        let chunks = split_message(text, MAX_MESSAGE_CHARS);
        for (i, chunk) in chunks.iter().enumerate() {
            let result = self.send_chunk(access_token, recipient, chunk).await;
            if !result.success {
                return result;
            }
            if i + 1 < chunks.len() {
                tokio::time::sleep(CHUNK_PAUSE).await;
            }
        }
        if chunks.len() > 1 {
            tracing::info!(recipient, parts = chunks.len(), "message sent in parts");
        }
        SendResult::sent()
    }

    async fn send_chunk(&self, access_token: &str, recipient: &str, text: &str) -> SendResult {
        let body = json!({
            "recipient": { "id": recipient },
            "message": { "text": text },
            "messaging_type": "RESPONSE",
        });

        let response = match self
            .client
            .post(format!("{}/me/messages", self.graph_root))
            .query(&[("access_token", access_token)])
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(recipient, error = %err, "graph send request failed");
                return SendResult::failed(err.to_string(), None);
            }
        };

        let status = response.status();
        let data = response
            .json::<Value>()
            .await
            .unwrap_or_else(|_| json!({}));
        let error_payload = data.get("error").filter(|e| !e.is_null()).cloned();

        if !status.is_success() {
            tracing::error!(recipient, status = status.as_u16(), body = %data, "graph api error");
            let message = error_payload
                .as_ref()
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
            return SendResult::failed(message, error_payload);
        }
        if let Some(payload) = error_payload {
            tracing::error!(recipient, error = %payload, "graph api error payload");
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("graph api error")
                .to_string();
            return SendResult::failed(message, Some(payload));
        }
        SendResult::sent()
    }
}
