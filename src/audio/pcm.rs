//! # Inline Audio PCM Extraction
//!
//! Turns an inline audio upload into raw PCM plus the format metadata the
//! upstream session needs. Only two containers are understood:
//!
//! - **WAV**: canonical 44-byte RIFF header; channel count, sample rate and
//!   bit depth are read from the `fmt` sub-chunk at fixed offsets
//! - **PCM**: headerless little-endian samples, described by caller defaults
//!
//! Anything else is rejected. No transcoding happens here.

use byteorder::{ByteOrder, LittleEndian};

/// Size of the canonical WAV header that precedes the sample data.
pub const WAV_HEADER_LEN: usize = 44;

const CHANNELS_OFFSET: usize = 22;
const SAMPLE_RATE_OFFSET: usize = 24;
const BITS_OFFSET: usize = 34;

/// Input validation failures. These are never retried.
#[derive(Debug, thiserror::Error)]
pub enum PcmError {
    #[error("wav payload too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported inline audio format: {0}")]
    UnsupportedFormat(String),
}

/// Raw PCM samples plus the format they were recorded in.
///
/// Borrowed from the input buffer; lives only as long as one recognition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBuffer<'a> {
    pub data: &'a [u8],
    pub sample_rate: u32,
    pub channels: u16,
    pub bits: u16,
}

impl PcmBuffer<'_> {
    /// Bytes per sample frame across all channels (never zero).
    pub fn bytes_per_frame(&self) -> usize {
        let bytes_per_sample = usize::from(self.bits / 8).max(1);
        bytes_per_sample * usize::from(self.channels.max(1))
    }

    /// Estimated playback length, when the metadata makes one computable.
    pub fn duration(&self) -> Option<std::time::Duration> {
        if self.sample_rate == 0 || self.data.is_empty() {
            return None;
        }
        let frames = self.data.len() as f64 / self.bytes_per_frame() as f64;
        Some(std::time::Duration::from_secs_f64(
            frames / f64::from(self.sample_rate),
        ))
    }
}

/// Whether a declared format names a WAV container.
///
/// An empty format is treated as WAV, matching what browsers upload.
pub fn is_wav_format(format: &str) -> bool {
    let format = format.trim().to_ascii_lowercase();
    format.is_empty()
        || format == "wav"
        || format == "wave"
        || format.ends_with("/wav")
        || format.ends_with("/wave")
}

/// Extract PCM samples from an inline upload.
///
/// ## Parameters:
/// - **format**: declared container (`wav`, `audio/wav`, `pcm`, ...)
/// - **data**: the uploaded bytes
/// - **fallback_rate**: sample rate used for raw PCM and for WAV headers that
///   declare zero
pub fn extract_pcm<'a>(
    format: &str,
    data: &'a [u8],
    fallback_rate: u32,
) -> Result<PcmBuffer<'a>, PcmError> {
    if is_wav_format(format) {
        if data.len() <= WAV_HEADER_LEN {
            return Err(PcmError::TooShort(data.len()));
        }

        let channels = match LittleEndian::read_u16(&data[CHANNELS_OFFSET..]) {
            0 => 1,
            channels => channels,
        };
        let sample_rate = match LittleEndian::read_u32(&data[SAMPLE_RATE_OFFSET..]) {
            0 => fallback_rate,
            rate => rate,
        };
        let bits = match LittleEndian::read_u16(&data[BITS_OFFSET..]) {
            0 => 16,
            bits => bits,
        };

        return Ok(PcmBuffer {
            data: &data[WAV_HEADER_LEN..],
            sample_rate,
            channels,
            bits,
        });
    }

    if format.to_ascii_lowercase().contains("pcm") {
        return Ok(PcmBuffer {
            data,
            sample_rate: fallback_rate,
            channels: 1,
            bits: 16,
        });
    }

    Err(PcmError::UnsupportedFormat(format.trim().to_string()))
}
