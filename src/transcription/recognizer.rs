//! # Recognition Orchestrator
//!
//! The façade the rest of the gateway talks to. One [`AsrClient`] is shared by
//! every request; each recognition gets its own upstream session.
//!
//! ## Recognition Paths:
//! - **Remote URL**: straight to REST, the provider fetches the audio itself
//! - **Inline bytes**: PCM is extracted and streamed in 100ms frames over a
//!   fresh upstream session; any streaming failure is retried once over REST
//!   with the same bytes, base64-encoded
//!
//! Invalid input (bad container, empty PCM, missing token) is returned as-is.
//! Resending the same bytes over another path cannot fix it.
//!
//! ## Waiting for the Result:
//! The wait for a final transcript scales with the audio length:
//! `max(base, duration * 1.5 + 30s)`, capped. If the deadline passes after
//! some text has arrived, that text is the answer (soft timeout); with no text
//! at all it is a hard timeout and the fallback kicks in.
//!
//! ## Cancellation:
//! Dropping a `recognize` future drops its session, which closes the upstream
//! socket. Callers bound the whole call with `tokio::time::timeout`.

use crate::audio::{extract_pcm, PcmBuffer};
use crate::config::AsrConfig;
use crate::transcription::error::AsrError;
use crate::transcription::rest::{self, RestAudio};
use crate::transcription::upstream::{StreamParams, UpstreamEndpoint, UpstreamSession, STREAM_PATH};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Frame size used when the audio format yields nothing sensible.
pub const DEFAULT_FRAME_BYTES: usize = 3200;

const WAIT_HEADROOM: Duration = Duration::from_secs(30);

/// Audio submitted for one-shot recognition.
#[derive(Debug, Clone, Default)]
pub struct AudioInput {
    /// Declared container; empty means WAV.
    pub format: String,
    /// Provider-fetchable location. Takes precedence over `data`.
    pub url: Option<String>,
    pub data: Vec<u8>,
}

/// Final outcome of one recognition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    #[serde(rename = "reqid")]
    pub req_id: String,
    pub text: String,
    pub duration_ms: u64,
    /// Provider response (REST) or an equivalent envelope rebuilt from the stream.
    pub raw: Value,
}

/// Lifetime counters, exposed by the health endpoint.
#[derive(Debug, Default)]
pub struct RecognitionStats {
    recognitions: AtomicU64,
    stream_failures: AtomicU64,
    rest_fallbacks: AtomicU64,
    fallback_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub recognitions: u64,
    pub stream_failures: u64,
    pub rest_fallbacks: u64,
    pub fallback_failures: u64,
}

impl RecognitionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            recognitions: self.recognitions.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            rest_fallbacks: self.rest_fallbacks.load(Ordering::Relaxed),
            fallback_failures: self.fallback_failures.load(Ordering::Relaxed),
        }
    }
}

/// Shared entry point for every recognition.
pub struct AsrClient {
    http: reqwest::Client,
    settings: AsrConfig,
    stats: RecognitionStats,
}

impl AsrClient {
    pub fn new(settings: AsrConfig) -> Result<Self, AsrError> {
        let http = reqwest::Client::builder().timeout(settings.http_timeout()).build()?;
        Ok(Self {
            http,
            settings,
            stats: RecognitionStats::default(),
        })
    }

    pub fn settings(&self) -> &AsrConfig {
        &self.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Recognize a complete utterance.
    ///
    /// ## Returns:
    /// - **Ok**: transcript from the stream, or from REST after a streaming failure
    /// - **Err(FallbackFailed)**: both paths failed
    /// - **Err(input error)**: the request itself is unusable
    pub async fn recognize(&self, token: &str, input: AudioInput) -> Result<RecognitionResult, AsrError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AsrError::MissingToken);
        }
        self.stats.recognitions.fetch_add(1, Ordering::Relaxed);

        let format = match input.format.trim() {
            "" => "wav".to_string(),
            declared => declared.to_string(),
        };

        if let Some(url) = input.url.as_deref().map(str::trim).filter(|url| !url.is_empty()) {
            let audio = RestAudio {
                format,
                url: Some(url.to_string()),
                data: None,
            };
            return self.recognize_rest(token, &audio).await;
        }

        if input.data.is_empty() {
            return Err(AsrError::EmptyAudio);
        }

        let stream_err = match self.recognize_streaming(token, &format, &input.data).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_input_error() => return Err(err),
            Err(err) => err,
        };

        self.stats.stream_failures.fetch_add(1, Ordering::Relaxed);
        self.stats.rest_fallbacks.fetch_add(1, Ordering::Relaxed);
        warn!(error = %stream_err, "ASR websocket failed, falling back to REST");

        let audio = RestAudio {
            format,
            url: None,
            data: Some(STANDARD.encode(&input.data)),
        };
        match self.recognize_rest(token, &audio).await {
            Ok(result) => Ok(result),
            Err(rest_err) => {
                self.stats.fallback_failures.fetch_add(1, Ordering::Relaxed);
                error!(stream_error = %stream_err, rest_error = %rest_err, "ASR REST fallback failed");
                Err(AsrError::FallbackFailed {
                    stream: Box::new(stream_err),
                    rest: Box::new(rest_err),
                })
            }
        }
    }

    async fn recognize_rest(&self, token: &str, audio: &RestAudio) -> Result<RecognitionResult, AsrError> {
        rest::recognize(&self.http, &self.settings.rest_base(), &self.settings.model, token, audio).await
    }

    /// Open a streaming session for a live client. Zero fields in `params`
    /// take the configured defaults; an empty model takes the configured model.
    pub async fn open_stream(&self, token: &str, params: StreamParams) -> Result<UpstreamSession, AsrError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AsrError::MissingToken);
        }
        let mut params = params.with_defaults(self.settings.sample_rate);
        if params.model.trim().is_empty() {
            params.model = self.settings.model.clone();
        }
        self.dial(token, params).await
    }

    async fn dial(&self, token: &str, params: StreamParams) -> Result<UpstreamSession, AsrError> {
        let base = self.settings.websocket_base();
        if base.is_empty() {
            return Err(AsrError::NotConfigured);
        }
        let endpoint = UpstreamEndpoint {
            url: format!("{}{}", base, STREAM_PATH),
            token: token.to_string(),
            handshake_timeout: self.settings.handshake_timeout(),
        };
        UpstreamSession::open(&endpoint, params).await
    }

    async fn recognize_streaming(&self, token: &str, format: &str, data: &[u8]) -> Result<RecognitionResult, AsrError> {
        let pcm = extract_pcm(format, data, self.settings.sample_rate)?;
        if pcm.data.is_empty() {
            return Err(AsrError::EmptyPcm);
        }

        let params = StreamParams {
            sample_rate: pcm.sample_rate,
            channels: pcm.channels,
            bits: pcm.bits,
            model: self.settings.model.clone(),
        };
        let session = self.dial(token, params).await?;
        let outcome = self.stream_pcm(&session, &pcm).await;
        session.close().await;
        outcome
    }

    /// Push the PCM through an open session and collect the transcript.
    async fn stream_pcm(&self, session: &UpstreamSession, pcm: &PcmBuffer<'_>) -> Result<RecognitionResult, AsrError> {
        for chunk in pcm.data.chunks(frame_size(pcm)) {
            session.send_audio(chunk).await?;
        }
        if let Err(err) = session.send_stop().await {
            debug!(session_id = %session.id(), error = %err, "Sending ASR stop frame failed");
        }

        let wait = adaptive_wait(
            pcm.duration(),
            self.settings.stream_wait_base(),
            self.settings.stream_wait_cap(),
        );
        let deadline = Instant::now() + wait;

        let mut text = String::new();
        let mut req_id = String::new();
        let mut duration_ms = 0u64;

        loop {
            let event = match session.next_event(Some(deadline)).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(AsrError::Timeout { waited }) => {
                    if text.is_empty() {
                        return Err(AsrError::Timeout { waited });
                    }
                    info!(session_id = %session.id(), "ASR deadline reached, using partial transcript");
                    break;
                }
                Err(err) => {
                    if text.is_empty() {
                        return Err(err);
                    }
                    debug!(session_id = %session.id(), error = %err, "ASR read failed after partial transcript");
                    break;
                }
            };

            if let Some(message) = event.error {
                return Err(AsrError::Upstream(message));
            }
            if let Some(id) = event.req_id {
                req_id = id;
            }
            if !event.text.is_empty() {
                text = event.text;
            }
            if let Some(ms) = event.duration_ms {
                duration_ms = ms;
            }
            if event.is_final && !text.is_empty() {
                break;
            }
        }

        if duration_ms == 0 {
            duration_ms = estimate_duration_ms(pcm.data.len(), pcm.sample_rate, self.settings.sample_rate);
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(AsrError::NoTranscript);
        }

        let raw = json!({
            "reqid": req_id,
            "operation": "asr",
            "data": {
                "audio_info": { "duration": duration_ms },
                "result": {
                    "additions": { "duration": duration_ms.to_string() },
                    "text": text,
                },
            },
        });

        Ok(RecognitionResult {
            req_id,
            text,
            duration_ms,
            raw,
        })
    }
}

/// Bytes in 100ms of audio, or [`DEFAULT_FRAME_BYTES`] when that comes out as zero.
pub fn frame_size(pcm: &PcmBuffer<'_>) -> usize {
    let bytes_per_sample = match usize::from(pcm.bits / 8) {
        0 => 2,
        n => n,
    };
    let channels = usize::from(pcm.channels.max(1));
    match (pcm.sample_rate / 10) as usize * bytes_per_sample * channels {
        0 => DEFAULT_FRAME_BYTES,
        n => n,
    }
}

/// How long to wait for a final transcript after the stop frame.
pub fn adaptive_wait(audio: Option<Duration>, base: Duration, cap: Duration) -> Duration {
    let wait = match audio {
        Some(length) if !length.is_zero() => base.max(length.mul_f64(1.5) + WAIT_HEADROOM),
        _ => base,
    };
    wait.min(cap)
}

/// Last-resort duration: byte count as 16-bit samples over the sample rate.
fn estimate_duration_ms(pcm_len: usize, sample_rate: u32, fallback_rate: u32) -> u64 {
    let rate = if sample_rate > 0 { sample_rate } else { fallback_rate };
    if rate == 0 {
        return 0;
    }
    let samples = pcm_len as f64 / 2.0;
    (samples / f64::from(rate) * 1000.0).round() as u64
}
