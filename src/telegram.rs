use crate::config::BotConfig;
use crate::error::{RelayError, Result};
use crate::types::MediaKind;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

pub const REACTION_OK: &str = "👍";
pub const REACTION_FAIL: &str = "👎";

const FILE_PATH_ENCODE: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

/// One attachment handed to a grouped send. `bytes` is populated in
/// direct-upload mode, otherwise the platform fetches `url` itself.
#[derive(Debug, Clone)]
pub struct MediaPart {
    pub kind: MediaKind,
    pub url: String,
    pub filename: String,
    pub bytes: Option<Bytes>,
}

/// Stateless wrapper over the bot HTTP API. Every call runs under the
/// configured request timeout and maps failures onto the relay taxonomy:
/// transport problems stay `Transport`, anything the platform answered with
/// becomes `Api { code, description }`.
#[derive(Debug, Clone)]
pub struct BotClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl BotClient {
    pub fn new(cfg: &BotConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value> {
        let resp = self
            .http
            .post(self.method_url(method))
            .json(&payload)
            .send()
            .await?;

        let status = resp.status().as_u16() as i64;
        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return Err(RelayError::api(status, "malformed response body")),
        };
        api_result(status, body)
    }

    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        limit: i64,
        timeout_seconds: u64,
    ) -> Result<Vec<Value>> {
        let mut payload = json!({
            "limit": limit,
            "timeout": timeout_seconds,
            "allowed_updates": ["message", "edited_message", "callback_query"],
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }
        let result = self.call("getUpdates", payload).await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    /// Resolve a file id to a fully-qualified download URL.
    pub async fn get_file_url(&self, file_id: &str) -> Result<String> {
        let result = self.call("getFile", json!({"file_id": file_id})).await?;
        let file_path = result
            .get("file_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::validation("getFile result missing file_path"))?;
        let encoded = utf8_percent_encode(file_path, FILE_PATH_ENCODE);
        Ok(format!(
            "{}/file/bot{}/{}",
            self.api_base, self.token, encoded
        ))
    }

    pub async fn download(&self, url: &str) -> Result<Bytes> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(RelayError::api(
                resp.status().as_u16() as i64,
                "file download failed",
            ));
        }
        Ok(resp.bytes().await?)
    }

    /// Send a text message, returning the platform message id. `html` turns
    /// on the restricted-HTML formatting mode.
    pub async fn send_text(&self, chat_id: i64, text: &str, html: bool) -> Result<i64> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if html {
            payload["parse_mode"] = json!("HTML");
        }
        let result = self.call("sendMessage", payload).await?;
        message_id_of(&result)
    }

    /// Send one group of media items in a single call, with `caption` on the
    /// first item. Returns every platform message id the fan-out produced.
    pub async fn send_media_group(
        &self,
        chat_id: i64,
        parts: &[MediaPart],
        caption: Option<&str>,
        html: bool,
    ) -> Result<Vec<i64>> {
        if parts.is_empty() {
            return Ok(Vec::new());
        }

        let direct = parts.iter().any(|p| p.bytes.is_some());
        let mut media = Vec::with_capacity(parts.len());
        for (idx, part) in parts.iter().enumerate() {
            let mut entry = json!({
                "type": part.kind.as_input_type(),
                "media": if direct {
                    format!("attach://file{idx}")
                } else {
                    part.url.clone()
                },
            });
            if idx == 0 {
                if let Some(caption) = caption {
                    entry["caption"] = json!(caption);
                    if html {
                        entry["parse_mode"] = json!("HTML");
                    }
                }
            }
            media.push(entry);
        }

        let result = if direct {
            let mut form = reqwest::multipart::Form::new()
                .text("chat_id", chat_id.to_string())
                .text("media", Value::Array(media.clone()).to_string());
            for (idx, part) in parts.iter().enumerate() {
                let bytes = match part.bytes.as_ref() {
                    Some(bytes) => bytes.clone(),
                    None => self.download(&part.url).await?,
                };
                form = form.part(
                    format!("file{idx}"),
                    reqwest::multipart::Part::bytes(bytes.to_vec())
                        .file_name(part.filename.clone()),
                );
            }
            let resp = self
                .http
                .post(self.method_url("sendMediaGroup"))
                .multipart(form)
                .send()
                .await?;
            let status = resp.status().as_u16() as i64;
            let body: Value = match resp.json().await {
                Ok(v) => v,
                Err(_) => return Err(RelayError::api(status, "malformed response body")),
            };
            api_result(status, body)?
        } else {
            self.call(
                "sendMediaGroup",
                json!({"chat_id": chat_id, "media": media}),
            )
            .await?
        };

        let ids = result
            .as_array()
            .map(|msgs| {
                msgs.iter()
                    .filter_map(|m| m.get("message_id").and_then(|v| v.as_i64()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            return Err(RelayError::validation(
                "sendMediaGroup result carried no message ids",
            ));
        }
        Ok(ids)
    }

    /// Best effort: reaction failures are logged, never propagated.
    pub async fn set_reaction(&self, chat_id: i64, message_id: i64, emoji: &str) -> bool {
        let payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reaction": [{"type": "emoji", "emoji": emoji}],
        });
        match self.call("setMessageReaction", payload).await {
            Ok(_) => true,
            Err(err) => {
                warn!("setMessageReaction on {chat_id}/{message_id} failed: {err}");
                false
            }
        }
    }

    pub async fn webhook_info(&self) -> Result<Value> {
        self.call("getWebhookInfo", json!({})).await
    }

    pub async fn set_webhook(&self, url: &str) -> Result<()> {
        self.call("setWebhook", json!({"url": url})).await?;
        Ok(())
    }

    pub async fn delete_webhook(&self) -> Result<()> {
        self.call("deleteWebhook", json!({})).await?;
        Ok(())
    }
}

fn api_result(status: i64, body: Value) -> Result<Value> {
    if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
        let code = body
            .get("error_code")
            .and_then(|v| v.as_i64())
            .unwrap_or(status);
        let description = body
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("request failed")
            .to_string();
        return Err(RelayError::Api { code, description });
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

fn message_id_of(result: &Value) -> Result<i64> {
    result
        .get("message_id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| RelayError::validation("send result missing message_id"))
}
