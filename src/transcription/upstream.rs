//! # Upstream Stream Session
//!
//! Owns one WebSocket connection to the provider's streaming recognizer and
//! speaks the binary frame protocol from [`crate::transcription::codec`].
//!
//! ## Session Lifecycle:
//! 1. **Configuring**: socket dialed, config frame being sent
//! 2. **Streaming**: audio frames may be sent
//! 3. **Stopping**: stop frame sent, waiting for the final result
//! 4. **Closed**: socket released (explicit close, upstream EOF, or read error)
//!
//! Configuring and Streaming may jump straight to Closed on error.
//!
//! ## Concurrency:
//! The write half (plus the sequence counter and state) sits behind one async
//! mutex, the read half behind another, so audio forwarding and event reading
//! can run on different tasks. [`UpstreamSession::close`] flips a watch flag
//! that wakes any reader blocked in [`UpstreamSession::next_event`].

use crate::transcription::codec::{self, MessageType, Serialization};
use crate::transcription::error::AsrError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Path of the streaming recognizer, relative to the configured socket base.
pub const STREAM_PATH: &str = "/voice/asr";

/// Audio format and model for one session. Immutable once opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits: u16,
    pub model: String,
}

impl StreamParams {
    /// Fill zero fields with the defaults (16 kHz, mono, 16-bit).
    pub fn with_defaults(mut self, fallback_rate: u32) -> Self {
        if self.sample_rate == 0 {
            self.sample_rate = if fallback_rate > 0 { fallback_rate } else { 16000 };
        }
        if self.channels == 0 {
            self.channels = 1;
        }
        if self.bits == 0 {
            self.bits = 16;
        }
        self
    }
}

/// Where and how to dial.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoint {
    /// Full socket URL, including [`STREAM_PATH`].
    pub url: String,
    pub token: String,
    pub handshake_timeout: Duration,
}

/// Current position in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configuring,
    Streaming,
    Stopping,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Configuring => "configuring",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message from the provider, reduced to what callers care about.
///
/// Skipped noise frames come through as an empty event so that a caller's
/// read loop can keep going.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub duration_ms: Option<u64>,
    pub req_id: Option<String>,
    /// Decoded envelope, passed through for diagnostics.
    pub raw: Option<Value>,
    /// Provider-reported error. Terminal for the session.
    pub error: Option<String>,
}

impl TranscriptEvent {
    /// Build an event from a decoded envelope.
    pub fn from_envelope(envelope: Value) -> Self {
        let transcript = codec::extract_transcript(&envelope);
        let mut event = TranscriptEvent {
            text: transcript.text,
            is_final: transcript.is_final,
            duration_ms: (transcript.duration_ms > 0).then_some(transcript.duration_ms),
            ..Default::default()
        };

        event.error = envelope
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string);

        event.req_id = envelope
            .get("reqid")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        // Provider-native duration fields win over the generic markers.
        let native_duration = envelope
            .pointer("/data/result/additions/duration")
            .and_then(codec::as_millis)
            .or_else(|| envelope.pointer("/data/audio_info/duration").and_then(codec::as_millis));
        if native_duration.is_some() {
            event.duration_ms = native_duration;
        }

        event.raw = Some(envelope);
        event
    }

    /// True for skipped frames that carry nothing worth relaying.
    ///
    /// Any decoded envelope keeps its `raw` payload, so acknowledgements
    /// carrying only a `reqid` are still relayed.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
            && !self.is_final
            && self.error.is_none()
            && self.duration_ms.is_none()
            && self.req_id.is_none()
            && self.raw.is_none()
    }
}

/// Write half plus everything that must change together with it.
struct Writer {
    sink: SplitSink<WsStream, Message>,
    sequence: u32,
    state: SessionState,
}

/// A live streaming session with the provider.
pub struct UpstreamSession {
    id: String,
    params: StreamParams,
    writer: Mutex<Writer>,
    reader: Mutex<SplitStream<WsStream>>,
    closed: watch::Sender<bool>,
    stop_sent: AtomicBool,
}

impl UpstreamSession {
    /// Dial the provider and send the config frame.
    ///
    /// No retries here: failures go straight back to the caller, which owns
    /// the fallback policy.
    pub async fn open(endpoint: &UpstreamEndpoint, params: StreamParams) -> Result<Self, AsrError> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AsrError::Dial(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", endpoint.token.trim()))
            .map_err(|e| AsrError::Dial(format!("invalid token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _response) =
            match tokio::time::timeout(endpoint.handshake_timeout, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(err)) => return Err(AsrError::Dial(describe_dial_error(err))),
                Err(_) => {
                    return Err(AsrError::Dial(format!(
                        "handshake timed out after {}s",
                        endpoint.handshake_timeout.as_secs()
                    )))
                }
            };

        let (sink, stream) = socket.split();
        let (closed, _) = watch::channel(false);
        let session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            params,
            writer: Mutex::new(Writer {
                sink,
                sequence: 1,
                state: SessionState::Configuring,
            }),
            reader: Mutex::new(stream),
            closed,
            stop_sent: AtomicBool::new(false),
        };

        if let Err(err) = session.send_config().await {
            session.close().await;
            return Err(AsrError::ConfigSend(err.to_string()));
        }

        info!(
            session_id = %session.id,
            sample_rate = session.params.sample_rate,
            channels = session.params.channels,
            bits = session.params.bits,
            model = %session.params.model,
            "Upstream ASR session opened"
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub async fn state(&self) -> SessionState {
        if *self.closed.borrow() {
            return SessionState::Closed;
        }
        self.writer.lock().await.state
    }

    async fn send_config(&self) -> Result<(), AsrError> {
        let config = json!({
            "user": { "uid": uuid::Uuid::new_v4().to_string() },
            "audio": {
                "format": "pcm",
                "sample_rate": self.params.sample_rate,
                "bits": self.params.bits,
                "channel": self.params.channels,
                "codec": "raw",
            },
            "request": {
                "model_name": self.params.model,
                "enable_punc": true,
            },
        });
        let payload = serde_json::to_vec(&config).map_err(AsrError::Decode)?;

        let mut writer = self.writer.lock().await;
        self.ensure_open(&writer, "send config", &[SessionState::Configuring])?;
        self.write_frame(&mut writer, MessageType::Config, Serialization::Json, &payload, true)
            .await?;
        writer.state = SessionState::Streaming;
        Ok(())
    }

    /// Send one compressed audio frame. Empty chunks are ignored.
    pub async fn send_audio(&self, chunk: &[u8]) -> Result<(), AsrError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        self.ensure_open(&writer, "send audio", &[SessionState::Streaming])?;
        self.write_frame(&mut writer, MessageType::Audio, Serialization::Raw, chunk, true)
            .await
    }

    /// Signal end of audio. Only the first call sends a frame.
    pub async fn send_stop(&self) -> Result<(), AsrError> {
        if self.stop_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        self.ensure_open(&writer, "send stop", &[SessionState::Streaming])?;
        self.write_frame(&mut writer, MessageType::Stop, Serialization::Raw, &[], false)
            .await?;
        writer.state = SessionState::Stopping;
        debug!(session_id = %self.id, "Stop frame sent");
        Ok(())
    }

    fn ensure_open(&self, writer: &Writer, op: &'static str, allowed: &[SessionState]) -> Result<(), AsrError> {
        let state = if *self.closed.borrow() {
            SessionState::Closed
        } else {
            writer.state
        };
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(AsrError::InvalidState {
                op,
                state: state.as_str(),
            })
        }
    }

    async fn write_frame(
        &self,
        writer: &mut Writer,
        message_type: MessageType,
        serialization: Serialization,
        payload: &[u8],
        compress: bool,
    ) -> Result<(), AsrError> {
        let frame = codec::encode_frame(message_type, serialization, writer.sequence, payload, compress)?;
        writer.sequence = writer.sequence.wrapping_add(1);

        if let Err(err) = writer.sink.send(Message::Binary(frame)).await {
            writer.state = SessionState::Closed;
            self.closed.send_replace(true);
            return Err(AsrError::Send(err.to_string()));
        }
        Ok(())
    }

    /// Wait for the next provider message.
    ///
    /// ## Returns:
    /// - **Ok(Some(event))**: a decoded message; possibly empty when the frame
    ///   was noise, possibly carrying a terminal `error`
    /// - **Ok(None)**: the socket closed cleanly or the session was closed locally
    /// - **Err(Timeout)**: `deadline` passed with nothing received
    /// - **Err(Read)**: the connection failed; the session is now closed
    ///
    /// Only one caller should read at a time.
    pub async fn next_event(&self, deadline: Option<Instant>) -> Result<Option<TranscriptEvent>, AsrError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let entered = Instant::now();
        let mut reader = self.reader.lock().await;

        let next = tokio::select! {
            _ = closed.changed() => return Ok(None),
            next = read_until(&mut reader, deadline) => next,
        };

        let message = match next {
            Err(_elapsed) => {
                return Err(AsrError::Timeout {
                    waited: entered.elapsed(),
                })
            }
            Ok(None) => {
                self.mark_closed();
                return Ok(None);
            }
            Ok(Some(Err(err))) => {
                self.mark_closed();
                return match err {
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Ok(None),
                    other => Err(AsrError::Read(other.to_string())),
                };
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(payload) => match codec::decode_frame(&payload) {
                Ok(frame) => Ok(Some(TranscriptEvent::from_envelope(frame.envelope))),
                Err(err) => {
                    debug!(session_id = %self.id, error = %err, "Skipping undecodable ASR frame");
                    Ok(Some(TranscriptEvent::default()))
                }
            },
            Message::Text(text) => match codec::parse_json_payload(text.as_bytes()) {
                Ok(envelope) => Ok(Some(TranscriptEvent::from_envelope(envelope))),
                Err(err) => {
                    debug!(session_id = %self.id, error = %err, "Skipping unparsable ASR text message");
                    Ok(Some(TranscriptEvent::default()))
                }
            },
            Message::Close(frame) => {
                self.mark_closed();
                match frame {
                    Some(frame) if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
                        Err(AsrError::Read(format!(
                            "upstream closed with code {}: {}",
                            u16::from(frame.code),
                            frame.reason
                        )))
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(Some(TranscriptEvent::default())),
        }
    }

    /// Seed the sequence counter for the next frame.
    #[cfg(test)]
    pub(crate) async fn set_next_sequence(&self, sequence: u32) {
        self.writer.lock().await.sequence = sequence;
    }

    fn mark_closed(&self) {
        if !self.closed.send_replace(true) {
            debug!(session_id = %self.id, "Upstream ASR session reached end of stream");
        }
    }

    /// Close the socket. Safe to call any number of times, from any task.
    pub async fn close(&self) {
        let already_closed = self.closed.send_replace(true);
        let mut writer = self.writer.lock().await;
        if writer.state == SessionState::Closed {
            return;
        }
        writer.state = SessionState::Closed;
        if let Err(err) = writer.sink.close().await {
            if !already_closed {
                warn!(session_id = %self.id, error = %err, "Closing upstream ASR socket failed");
            }
        }
        info!(session_id = %self.id, "Upstream ASR session closed");
    }
}

async fn read_until(
    reader: &mut SplitStream<WsStream>,
    deadline: Option<Instant>,
) -> Result<Option<Result<Message, tungstenite::Error>>, tokio::time::error::Elapsed> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, reader.next()).await,
        None => Ok(reader.next().await),
    }
}

/// Include the HTTP status and body snippet when the handshake was rejected.
fn describe_dial_error(err: tungstenite::Error) -> String {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).trim().to_string())
                .filter(|body| !body.is_empty())
                .unwrap_or_else(|| status.to_string());
            format!("status {}: {}", status.as_u16(), body)
        }
        other => other.to_string(),
    }
}

/// Turn an `http(s)://` API base into the matching `ws(s)://` base.
pub fn derive_websocket_url(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return format!("ws://{}", rest);
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return format!("wss://{}", rest);
    }
    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        return trimmed.to_string();
    }
    format!("wss://{}", trimmed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transcription::codec::{decode_frame, encode_frame, DecodedFrame};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// What a mock provider does after it has read the client's stop frame.
    pub(crate) type Script = Vec<Message>;

    /// Encode an envelope the way the provider does: type 9, gzip, JSON.
    pub(crate) fn server_frame(envelope: Value) -> Message {
        let body = serde_json::to_vec(&envelope).unwrap();
        Message::Binary(encode_frame(MessageType::ServerResponse, Serialization::Json, 1, &body, true).unwrap())
    }

    /// Spawn a one-connection mock provider.
    ///
    /// Every frame the client sends is forwarded on the returned channel.
    /// Once a stop frame arrives the script is played back; if `hold_open`
    /// is set the socket then stays open until the client goes away.
    pub(crate) async fn mock_provider(
        script: Script,
        hold_open: bool,
    ) -> (String, mpsc::UnboundedReceiver<DecodedFrame>) {
        mock_provider_with_delay(script, hold_open, Duration::ZERO).await
    }

    /// Like [`mock_provider`], but the websocket handshake only completes
    /// after `accept_delay`.
    pub(crate) async fn mock_provider_with_delay(
        script: Script,
        hold_open: bool,
        accept_delay: Duration,
    ) -> (String, mpsc::UnboundedReceiver<DecodedFrame>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}{}", listener.local_addr().unwrap(), STREAM_PATH);
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(accept_delay).await;
            let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = socket.next().await {
                let Message::Binary(bytes) = message else { continue };
                let frame = decode_frame(&bytes).unwrap();
                let is_stop = frame.header.message_type == MessageType::Stop;
                let _ = seen_tx.send(frame);
                if is_stop {
                    break;
                }
            }
            for message in script {
                if socket.send(message).await.is_err() {
                    return;
                }
            }
            if hold_open {
                while socket.next().await.is_some() {}
            } else {
                let _ = socket.close(None).await;
            }
        });

        (url, seen_rx)
    }

    pub(crate) fn endpoint(url: &str) -> UpstreamEndpoint {
        UpstreamEndpoint {
            url: url.to_string(),
            token: "test-token".into(),
            handshake_timeout: Duration::from_secs(5),
        }
    }

    fn params() -> StreamParams {
        StreamParams {
            sample_rate: 16000,
            channels: 1,
            bits: 16,
            model: "asr".into(),
        }
    }

    #[test]
    fn test_derive_websocket_url() {
        assert_eq!(derive_websocket_url("https://openai.qiniu.com/v1/"), "wss://openai.qiniu.com/v1");
        assert_eq!(derive_websocket_url("http://localhost:9000"), "ws://localhost:9000");
        assert_eq!(derive_websocket_url("ws://already"), "ws://already");
        assert_eq!(derive_websocket_url("api.example.com"), "wss://api.example.com");
        assert_eq!(derive_websocket_url("  "), "");
    }

    #[test]
    fn test_stream_params_defaults() {
        let filled = StreamParams { sample_rate: 0, channels: 0, bits: 0, model: "m".into() }.with_defaults(8000);
        assert_eq!((filled.sample_rate, filled.channels, filled.bits), (8000, 1, 16));
    }

    #[test]
    fn test_event_from_provider_envelope() {
        let event = TranscriptEvent::from_envelope(json!({
            "reqid": "req-1",
            "data": {
                "audio_info": {"duration": 1234},
                "result": {"text": "hello", "additions": {"duration": "1500"}}
            },
            "is_final": "true"
        }));
        assert_eq!(event.text, "hello");
        assert!(event.is_final);
        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.req_id.as_deref(), Some("req-1"));
        assert!(event.error.is_none());
    }

    #[test]
    fn test_event_error_envelope() {
        let event = TranscriptEvent::from_envelope(json!({"error": {"code": "401", "message": " bad token "}}));
        assert_eq!(event.error.as_deref(), Some("bad token"));
        assert!(!event.is_empty());
    }

    #[test]
    fn test_acknowledgement_envelope_is_not_empty() {
        let ack = TranscriptEvent::from_envelope(json!({"reqid": "r-1", "code": 1000}));
        assert!(ack.text.is_empty());
        assert_eq!(ack.req_id.as_deref(), Some("r-1"));
        assert!(!ack.is_empty());

        let bare = TranscriptEvent::from_envelope(json!({"code": 1000}));
        assert!(!bare.is_empty());
        assert!(TranscriptEvent::default().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase_by_one_per_frame() {
        let (url, mut seen) = mock_provider(vec![], false).await;
        let session = UpstreamSession::open(&endpoint(&url), params()).await.unwrap();
        assert_eq!(session.state().await, SessionState::Streaming);

        session.send_audio(&[1u8; 3200]).await.unwrap();
        session.send_audio(&[]).await.unwrap();
        session.send_audio(&[2u8; 100]).await.unwrap();
        session.send_stop().await.unwrap();
        session.send_stop().await.unwrap();
        assert_eq!(session.state().await, SessionState::Stopping);

        let mut frames = Vec::new();
        while let Some(frame) = seen.recv().await {
            frames.push(frame);
        }
        let kinds: Vec<_> = frames.iter().map(|f| f.header.message_type).collect();
        assert_eq!(
            kinds,
            vec![MessageType::Config, MessageType::Audio, MessageType::Audio, MessageType::Stop]
        );
        let sequences: Vec<_> = frames.iter().map(|f| f.header.sequence.unwrap()).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);

        let config = &frames[0].envelope;
        assert_eq!(config["audio"]["sample_rate"], 16000);
        assert_eq!(config["request"]["model_name"], "asr");
        assert_eq!(frames[1].payload, vec![1u8; 3200]);

        assert_eq!(session.next_event(None).await.unwrap(), None);
        session.close().await;
        session.close().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_sequence_wraps_at_u32_max() {
        let (url, mut seen) = mock_provider(vec![], false).await;
        let session = UpstreamSession::open(&endpoint(&url), params()).await.unwrap();
        session.set_next_sequence(u32::MAX).await;

        session.send_audio(&[1u8; 320]).await.unwrap();
        session.send_audio(&[2u8; 320]).await.unwrap();
        session.send_stop().await.unwrap();

        let mut sequences = Vec::new();
        while let Some(frame) = seen.recv().await {
            sequences.push(frame.header.sequence.unwrap());
        }
        assert_eq!(sequences, vec![1, u32::MAX, 0, 1]);
        session.close().await;
    }

    #[tokio::test]
    async fn test_audio_after_stop_is_rejected() {
        let (url, _seen) = mock_provider(vec![], true).await;
        let session = UpstreamSession::open(&endpoint(&url), params()).await.unwrap();
        session.send_stop().await.unwrap();
        assert!(matches!(
            session.send_audio(&[0u8; 10]).await,
            Err(AsrError::InvalidState { state: "stopping", .. })
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let script = vec![
            server_frame(json!({"result": {"text": "hel"}, "is_final": false})),
            Message::Binary(vec![0x11, 0x91]),
            Message::Text("not json".into()),
            server_frame(json!({"reqid": "r", "result": {"text": "hello"}, "is_final": true})),
        ];
        let (url, _seen) = mock_provider(script, false).await;
        let session = UpstreamSession::open(&endpoint(&url), params()).await.unwrap();
        session.send_stop().await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = session.next_event(None).await.unwrap() {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].text, "hel");
        assert!(events[1].is_empty());
        assert!(events[2].is_empty());
        assert_eq!(events[3].text, "hello");
        assert!(events[3].is_final);
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout() {
        let (url, _seen) = mock_provider(vec![], true).await;
        let session = UpstreamSession::open(&endpoint(&url), params()).await.unwrap();
        session.send_stop().await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(100);
        assert!(matches!(session.next_event(Some(deadline)).await, Err(AsrError::Timeout { .. })));
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_reader() {
        let (url, _seen) = mock_provider(vec![], true).await;
        let session = std::sync::Arc::new(UpstreamSession::open(&endpoint(&url), params()).await.unwrap());
        session.send_stop().await.unwrap();

        let reader = {
            let session = session.clone();
            tokio::spawn(async move { session.next_event(None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close().await;

        let result = tokio::time::timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = UpstreamSession::open(&endpoint(&format!("ws://{}{}", addr, STREAM_PATH)), params()).await;
        assert!(matches!(result, Err(AsrError::Dial(_))));
    }
}
