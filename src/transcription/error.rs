//! Error taxonomy for upstream recognition.
//!
//! Propagation policy:
//! - frame-level noise ([`FrameError`]) is absorbed inside the session
//! - session-level failures escalate to the recognizer, which falls back to REST
//! - input validation failures ([`AsrError::is_input_error`]) are returned as-is

use crate::audio::PcmError;
use crate::transcription::codec::FrameError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AsrError {
    #[error("authorization token is required")]
    MissingToken,

    #[error("audio payload must include url or inline data")]
    EmptyAudio,

    #[error("pcm payload is empty")]
    EmptyPcm,

    #[error(transparent)]
    Pcm(#[from] PcmError),

    #[error("asr websocket endpoint is not configured")]
    NotConfigured,

    #[error("dial asr websocket: {0}")]
    Dial(String),

    #[error("send asr config: {0}")]
    ConfigSend(String),

    #[error("send asr frame: {0}")]
    Send(String),

    #[error("read asr message: {0}")]
    Read(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("cannot {op} while session is {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("qiniu asr error: {0}")]
    Upstream(String),

    #[error("asr websocket timed out waiting for response after {}s", .waited.as_secs())]
    Timeout { waited: Duration },

    #[error("asr websocket produced no transcription")]
    NoTranscript,

    #[error("call asr api: {0}")]
    Http(#[from] reqwest::Error),

    #[error("qiniu api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("decode asr response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("asr websocket failed: {stream}; rest fallback failed: {rest}")]
    FallbackFailed {
        stream: Box<AsrError>,
        #[source]
        rest: Box<AsrError>,
    },
}

impl AsrError {
    /// Failures caused by the request itself. Retrying cannot help.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            AsrError::MissingToken | AsrError::EmptyAudio | AsrError::EmptyPcm | AsrError::Pcm(_)
        )
    }

    /// Failures where the provider took too long to answer.
    pub fn is_timeout(&self) -> bool {
        match self {
            AsrError::Timeout { .. } => true,
            AsrError::Http(err) => err.is_timeout(),
            AsrError::FallbackFailed { rest, .. } => rest.is_timeout(),
            _ => false,
        }
    }
}
