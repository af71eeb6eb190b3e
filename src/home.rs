//! Home Assistant conversation API client.

use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::tools::{HomeAutomation, ToolError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HomeAssistantClient {
    http: reqwest::blocking::Client,
    base_url: String,
    token: String,
    cyrillic: Regex,
}

impl HomeAssistantClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ToolError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        let cyrillic = Regex::new("[а-яА-Я]").map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            cyrillic,
        })
    }

    /// Conversation language for a command: Bulgarian when it contains Cyrillic.
    pub fn language_for(&self, command: &str) -> &'static str {
        if self.cyrillic.is_match(command) {
            "bg"
        } else {
            "en"
        }
    }
}

impl HomeAutomation for HomeAssistantClient {
    fn execute_home_command(&self, command: &str) -> Result<String, ToolError> {
        info!(command, "home assistant command");
        let endpoint = format!("{}/api/conversation/process", self.base_url);
        let body = json!({ "text": command, "language": self.language_for(command) });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .map_err(|e| {
                error!(error = %e, "home assistant request failed");
                ToolError::Failed(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Failed(format!("HTTP {}", status.as_u16())));
        }
        let payload: Value = response
            .json()
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        debug!(response = %payload, "home assistant response body");

        let speech = speech_from_response(&payload);
        info!(speech = %speech, "home assistant response");
        Ok(speech)
    }
}

/// Spoken summary of a conversation response. Newer servers wrap the body in
/// a `response` object; older ones return it bare.
pub fn speech_from_response(payload: &Value) -> String {
    let body = payload.get("response").unwrap_or(payload);

    if let Some(speech) = body
        .pointer("/speech/plain/speech")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        return speech.to_string();
    }

    if body.get("response_type").and_then(Value::as_str) == Some("error") {
        let code = body
            .pointer("/data/code")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return format!("Home Assistant Error: {code}");
    }

    let failed: Vec<&str> = body
        .pointer("/data/failed")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    item.get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown device")
                })
                .collect()
        })
        .unwrap_or_default();
    if !failed.is_empty() {
        return format!("Could not control: {}", failed.join(", "));
    }

    "Command processed.".to_string()
}
