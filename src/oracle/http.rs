//! OpenAI-compatible chat-completions oracle.
//!
//! Served identically by a local llama.cpp server and by hosted LLM APIs.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{build_prompt, system_prompt, Oracle, RawOracleOutput};
use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::models::SecurityEvent;
use crate::validator::OracleMode;

const TARGET_ORACLE: &str = "oracle";

/// Longest error-body excerpt kept in an OracleError
const MAX_ERROR_BODY: usize = 200;

pub struct HttpOracle {
    client: Client,
    url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    mode: OracleMode,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

impl HttpOracle {
    pub fn new(
        cfg: &OracleConfig,
        mode: OracleMode,
        api_key: Option<String>,
    ) -> Result<Self, OracleError> {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| OracleError::Unavailable(format!("http client: {}", err)))?;

        Ok(Self {
            client,
            url: completions_url(&cfg.endpoint),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            mode,
            api_key,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn classify(&self, event: &SecurityEvent) -> Result<RawOracleOutput, OracleError> {
        let prompt = build_prompt(event, self.mode);
        let payload = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|err| self.transport_error(err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body: ChatResponse = response.json().await.map_err(|err| {
            if err.is_timeout() {
                OracleError::Timeout(self.timeout)
            } else {
                OracleError::Refused(format!("unreadable response: {}", err))
            }
        })?;

        let message = body
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| OracleError::Refused("response has no choices".to_string()))?;

        if let Some(refusal) = message.refusal.filter(|r| !r.trim().is_empty()) {
            return Err(OracleError::Refused(refusal));
        }

        let content = message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| OracleError::Refused("empty completion".to_string()))?;

        debug!(
            target: TARGET_ORACLE,
            event_id = %event.event_id,
            bytes = content.len(),
            "Oracle responded"
        );
        Ok(content)
    }
}

impl HttpOracle {
    fn transport_error(&self, err: reqwest::Error) -> OracleError {
        if err.is_timeout() {
            OracleError::Timeout(self.timeout)
        } else {
            OracleError::Unavailable(err.to_string())
        }
    }
}

fn completions_url(endpoint: &str) -> String {
    let base = endpoint.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

fn status_error(status: StatusCode, body: &str) -> OracleError {
    let excerpt = crate::utils::truncate_str(body.trim(), MAX_ERROR_BODY);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            OracleError::Unavailable(format!("authentication failed ({})", status))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            OracleError::Unavailable(format!("rate limited ({})", status))
        }
        status if status.is_server_error() => {
            OracleError::Unavailable(format!("{}: {}", status, excerpt))
        }
        status => OracleError::Refused(format!("{}: {}", status, excerpt)),
    }
}
