//! # Speech Recognition Endpoint
//!
//! `POST /api/v1/audio/asr`: one-shot recognition of a complete clip.
//!
//! ## Request Body:
//! ```json
//! {
//!   "token": "optional provider token",
//!   "audio": { "format": "wav", "data": "<base64>" },
//!   "timeout_ms": 30000
//! }
//! ```
//! `audio.url` may replace `audio.data` for provider-fetchable audio.
//!
//! ## Response Body:
//! `{ "reqid": "...", "text": "...", "duration_ms": 1000, "raw": {...} }`

use crate::error::{AppError, AppResult};
use crate::handlers::resolve_token;
use crate::state::AppState;
use crate::transcription::AudioInput;
use actix_web::{web, HttpRequest, HttpResponse};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub audio: AudioPayload,
    /// Overall budget for this request; the configured default applies when absent or zero.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AudioPayload {
    pub format: Option<String>,
    pub url: Option<String>,
    /// Base64-encoded audio bytes.
    pub data: Option<String>,
}

impl AudioPayload {
    fn into_input(self) -> AppResult<AudioInput> {
        let data = match self.data.as_deref().map(str::trim) {
            Some(encoded) if !encoded.is_empty() => STANDARD
                .decode(encoded)
                .map_err(|e| AppError::BadRequest(format!("audio.data is not valid base64: {}", e)))?,
            _ => Vec::new(),
        };
        Ok(AudioInput {
            format: self.format.unwrap_or_default(),
            url: self.url,
            data,
        })
    }
}

/// Recognize one clip, streaming first and falling back to REST.
pub async fn recognize(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<RecognizeRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let token = resolve_token(&req, body.token.as_deref(), &state.config);
    let input = body.audio.into_input()?;

    let budget = match body.timeout_ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => state.config.asr.request_timeout(),
    };

    let started = std::time::Instant::now();
    let result = tokio::time::timeout(budget, state.asr.recognize(&token, input))
        .await
        .map_err(|_| AppError::GatewayTimeout(format!("asr request exceeded {}ms", budget.as_millis())))??;

    info!(
        "Recognized {} chars ({}ms of audio) in {}ms",
        result.text.chars().count(),
        result.duration_ms,
        started.elapsed().as_millis()
    );
    Ok(HttpResponse::Ok().json(result))
}
