//! # Transcription Module
//!
//! Speech-to-text through the upstream provider. Nothing is recognized
//! locally: this module only speaks the provider's protocols.
//!
//! ## Key Components:
//! - **Frame Codec** (`codec`): pure encode/decode of the binary wire format
//! - **Upstream Session** (`upstream`): one provider WebSocket, from config frame to close
//! - **REST Client** (`rest`): synchronous recognition, used for URLs and as fallback
//! - **Orchestrator** (`recognizer`): chooses the path and owns the fallback policy
//!
//! ## Error Propagation:
//! - malformed frames are skipped inside the session
//! - session failures escalate to the orchestrator, which retries over REST once
//! - invalid input is never retried

pub mod codec;       // Binary frame format
pub mod error;       // AsrError taxonomy
pub mod recognizer;  // Stream-then-REST orchestration
pub mod rest;        // REST recognition endpoint
pub mod upstream;    // Provider WebSocket session

pub use error::AsrError;
pub use recognizer::{AsrClient, AudioInput, RecognitionResult, StatsSnapshot};
pub use upstream::{SessionState, StreamParams, TranscriptEvent, UpstreamSession};
