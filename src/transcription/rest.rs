//! Synchronous REST recognition: `POST {base}/voice/asr`.
//!
//! Used directly for provider-hosted audio URLs and as the one-shot fallback
//! when a streaming attempt fails.

use crate::transcription::error::AsrError;
use crate::transcription::recognizer::RecognitionResult;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Path of the REST recognizer, relative to the API base.
pub const REST_PATH: &str = "/voice/asr";

/// Longest provider body excerpt carried in an error message.
const ERROR_SNIPPET_LIMIT: usize = 256;

/// Audio reference sent to the REST endpoint: exactly one of `url` or `data`.
#[derive(Debug, Clone, Serialize)]
pub struct RestAudio {
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Base64-encoded audio bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Serialize)]
struct RestRequest<'a> {
    model: &'a str,
    audio: &'a RestAudio,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RestResponse {
    reqid: String,
    data: RestData,
    error: Option<ProviderError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RestData {
    audio_info: RestAudioInfo,
    result: RestResult,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RestAudioInfo {
    duration: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RestResult {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderError {
    code: Option<Value>,
    message: String,
}

/// Submit one recognition request and decode the provider's answer.
pub async fn recognize(
    client: &reqwest::Client,
    base_url: &str,
    model: &str,
    token: &str,
    audio: &RestAudio,
) -> Result<RecognitionResult, AsrError> {
    let endpoint = format!("{}{}", base_url.trim_end_matches('/'), REST_PATH);
    debug!(endpoint = %endpoint, format = %audio.format, by_url = audio.url.is_some(), "Calling REST ASR");

    let response = client
        .post(&endpoint)
        .header(AUTHORIZATION, format!("Bearer {}", token.trim()))
        .header(CONTENT_TYPE, "application/json")
        .json(&RestRequest { model, audio })
        .send()
        .await?;

    let status = response.status();
    let body = response.bytes().await?;

    if !status.is_success() {
        return Err(api_error(status.as_u16(), status.canonical_reason(), &body));
    }

    let raw: Value = serde_json::from_slice(&body).map_err(AsrError::Decode)?;
    let envelope: RestResponse = serde_json::from_value(raw.clone()).map_err(AsrError::Decode)?;

    if let Some(error) = envelope.error {
        let message = error.message.trim();
        if !message.is_empty() {
            return Err(AsrError::Upstream(message.to_string()));
        }
    }

    Ok(RecognitionResult {
        req_id: envelope.reqid,
        text: envelope.data.result.text.trim().to_string(),
        duration_ms: envelope.data.audio_info.duration,
        raw,
    })
}

/// Build the error for a non-2xx answer.
///
/// Prefers the provider's `{error: {code, message}}` envelope; otherwise
/// carries a bounded excerpt of the body, or the status text when it is empty.
fn api_error(status: u16, reason: Option<&str>, body: &[u8]) -> AsrError {
    let envelope = serde_json::from_slice::<RestResponse>(body)
        .ok()
        .and_then(|response| response.error);

    if let Some(error) = envelope {
        let code = match error.code {
            Some(Value::String(code)) => code.trim().to_string(),
            Some(Value::Number(code)) => code.to_string(),
            _ => String::new(),
        };
        let message = error.message.trim();
        let message = match (code.is_empty(), message.is_empty()) {
            (false, false) => Some(format!("{}: {}", code, message)),
            (true, false) => Some(message.to_string()),
            (false, true) => Some(code),
            (true, true) => None,
        };
        if let Some(message) = message {
            return AsrError::Api { status, message };
        }
    }

    let text = String::from_utf8_lossy(body);
    let mut snippet = text.trim();
    if snippet.is_empty() {
        snippet = reason.unwrap_or("unknown status");
    }
    AsrError::Api {
        status,
        message: truncate_on_char_boundary(snippet, ERROR_SNIPPET_LIMIT).to_string(),
    }
}

fn truncate_on_char_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
