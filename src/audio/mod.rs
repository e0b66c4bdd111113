//! # Audio Input Handling
//!
//! Helpers for the inline audio that clients upload for one-shot recognition.
//! Streaming clients send PCM directly and never pass through here.

pub mod pcm;

pub use pcm::{extract_pcm, PcmBuffer, PcmError};
