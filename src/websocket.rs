//! # WebSocket Transcription Bridge
//!
//! Lets a browser stream microphone audio to the speech provider. Clients
//! connect to `/ws/asr` (or `/api/v1/audio/asr/stream`); each connection
//! drives at most one upstream session at a time.
//!
//! ## WebSocket Protocol:
//! 1. **Start**: client sends `{"type":"start","sampleRate":16000,"channels":1,"bits":16}`,
//!    optionally with `model` and `token`
//! 2. **Ready**: server opens the upstream session and answers `{"type":"ready",...}`
//!    echoing the audio format in use
//! 3. **Audio**: binary messages are forwarded verbatim, in order
//! 4. **Stop**: `{"type":"stop"}` asks the provider for the final transcript
//! 5. **Transcripts**: `{"type":"partial"|"final", text, duration_ms, reqid, raw}`
//!
//! `{"type":"ping"}` is answered with `{"type":"pong"}` at any time. Protocol
//! mistakes produce `{"type":"error","error":...,"detail":...}` and leave the
//! connection open.
//!
//! ## Task Layout:
//! The actor owns the client socket. Once the upstream session is open two
//! tokio tasks share it: a writer draining an ordered command channel
//! (audio chunks, stop) and a reader pumping upstream events back to the
//! actor as messages. Either side finishing tears down both; the upstream
//! session's close is idempotent, so the race is harmless.
//!
//! The command channel holds at most [`AUDIO_QUEUE_CAPACITY`] entries. A
//! client that outruns the upstream gets an error and is disconnected.
//! Once the stop frame is out, the writer arms a deadline for the reader,
//! sized like the one-shot path: `max(base, audio * 1.5 + 30s)`, capped.

use crate::handlers::resolve_token;
use crate::state::{AppState, SessionSlot};
use crate::transcription::recognizer::adaptive_wait;
use crate::transcription::{AsrError, StreamParams, TranscriptEvent, UpstreamSession};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Audio chunks (plus the stop) that may wait for the upstream writer.
pub const AUDIO_QUEUE_CAPACITY: usize = 64;

const QUEUE_FULL: &str = "upstream is not keeping up with the audio";
const WRITER_GONE: &str = "upstream writer has stopped";

/// Control message sent by the client. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientControl {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u16,
    pub bits: u16,
    pub model: String,
    pub token: String,
}

/// Transcript fields relayed to the client. Absent values are omitted.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct TranscriptPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reqid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl From<TranscriptEvent> for TranscriptPayload {
    fn from(event: TranscriptEvent) -> Self {
        Self {
            text: (!event.text.is_empty()).then_some(event.text),
            duration_ms: event.duration_ms,
            reqid: event.req_id,
            raw: event.raw,
        }
    }
}

/// Messages the server sends to the client.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ready {
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        channels: u16,
        bits: u16,
    },
    Partial(TranscriptPayload),
    Final(TranscriptPayload),
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Pong,
}

/// Work for the upstream writer task. Processed strictly in order.
#[derive(Debug)]
enum UpstreamCommand {
    Audio(Vec<u8>),
    Stop,
}

/// Reports from the upstream tasks back to the actor.
///
/// Tagged with the session id so that reports from a session that has
/// already been replaced are ignored.
#[derive(Message)]
#[rtype(result = "()")]
enum UpstreamNotice {
    Event { session_id: String, event: TranscriptEvent },
    Failed { session_id: String, error: &'static str, detail: String, terminal: bool },
    /// No final transcript arrived before the post-stop deadline.
    TimedOut { session_id: String },
    Finished { session_id: String },
}

/// A live upstream session and the handles needed to feed it.
struct ActiveStream {
    session: Arc<UpstreamSession>,
    commands: mpsc::Sender<UpstreamCommand>,
    final_seen: bool,
    _slot: SessionSlot,
}

enum StreamPhase {
    Idle,
    Opening,
    Ready(ActiveStream),
}

/// One client connection.
pub struct AsrWebSocket {
    state: AppState,

    /// Token resolved at connect time; a `start` message may override it.
    token: String,

    phase: StreamPhase,

    /// A `stop` arrived while the upstream session was still opening.
    stop_requested: bool,

    last_heartbeat: Instant,
}

impl AsrWebSocket {
    pub fn new(state: AppState, token: String) -> Self {
        Self {
            state,
            token,
            phase: StreamPhase::Idle,
            stop_requested: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!("Failed to serialize client message: {}", err),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, error: &str, detail: Option<String>) {
        match &detail {
            Some(detail) => warn!("ASR websocket error: {}: {}", error, detail),
            None => warn!("ASR websocket error: {}", error),
        }
        self.send(
            ctx,
            &ServerMessage::Error {
                error: error.to_string(),
                detail,
            },
        );
    }

    fn handle_control(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let control = match serde_json::from_str::<ClientControl>(text) {
            Ok(control) => control,
            Err(err) => {
                self.send_error(ctx, "invalid control message", Some(err.to_string()));
                return;
            }
        };

        match control.kind.trim().to_ascii_lowercase().as_str() {
            "start" => self.handle_start(control, ctx),
            "stop" => match &self.phase {
                StreamPhase::Ready(active) => {
                    if let Err(reason) = queue_command(&active.commands, UpstreamCommand::Stop) {
                        self.send_error(ctx, "send stop", Some(reason.to_string()));
                        ctx.stop();
                    }
                }
                StreamPhase::Opening => self.stop_requested = true,
                StreamPhase::Idle => {}
            },
            "ping" => self.send(ctx, &ServerMessage::Pong),
            _ => self.send_error(ctx, "unsupported control message", Some(control.kind)),
        }
    }

    fn handle_start(&mut self, control: ClientControl, ctx: &mut ws::WebsocketContext<Self>) {
        if !matches!(self.phase, StreamPhase::Idle) {
            self.send_error(ctx, "asr stream already started", None);
            return;
        }

        let Some(slot) = self.state.try_acquire_stream() else {
            self.send_error(
                ctx,
                "too many active streams",
                Some(format!("limit is {}", self.state.config.performance.max_concurrent_sessions)),
            );
            return;
        };

        let token = match control.token.trim() {
            "" => self.token.clone(),
            explicit => explicit.to_string(),
        };
        let params = StreamParams {
            sample_rate: control.sample_rate,
            channels: control.channels,
            bits: control.bits,
            model: control.model.trim().to_string(),
        };

        self.phase = StreamPhase::Opening;
        self.stop_requested = false;
        let asr = self.state.asr.clone();
        let open = async move { asr.open_stream(&token, params).await };

        ctx.spawn(open.into_actor(self).map(move |result, act, ctx| match result {
            Ok(session) => act.on_ready(session, slot, ctx),
            Err(err) => {
                act.phase = StreamPhase::Idle;
                act.stop_requested = false;
                act.send_error(ctx, "open upstream stream", Some(err.to_string()));
            }
        }));
    }

    fn on_ready(&mut self, session: UpstreamSession, slot: SessionSlot, ctx: &mut ws::WebsocketContext<Self>) {
        let session = Arc::new(session);
        let (commands, receiver) = mpsc::channel(AUDIO_QUEUE_CAPACITY);
        let (deadline, deadline_rx) = watch::channel(None);
        let params = session.params().clone();
        let settings = self.state.asr.settings();

        spawn_writer(
            session.clone(),
            receiver,
            StopDeadline {
                sender: deadline,
                base: settings.stream_wait_base(),
                cap: settings.stream_wait_cap(),
            },
            ctx.address(),
        );
        spawn_reader(session.clone(), deadline_rx, ctx.address());

        info!("ASR stream {} ready", session.id());
        let stop_now = std::mem::take(&mut self.stop_requested);
        if stop_now {
            debug!("Forwarding stop received while ASR stream {} was opening", session.id());
            // The queue is empty, so this cannot fill it.
            let _ = queue_command(&commands, UpstreamCommand::Stop);
        }
        self.phase = StreamPhase::Ready(ActiveStream {
            session,
            commands,
            final_seen: false,
            _slot: slot,
        });
        self.send(
            ctx,
            &ServerMessage::Ready {
                sample_rate: params.sample_rate,
                channels: params.channels,
                bits: params.bits,
            },
        );
    }

    fn handle_audio(&mut self, chunk: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let StreamPhase::Ready(active) = &self.phase else {
            self.send_error(
                ctx,
                "stream not initialized",
                Some("start message required before audio".to_string()),
            );
            return;
        };

        if let Err(reason) = queue_command(&active.commands, UpstreamCommand::Audio(chunk.to_vec())) {
            self.send_error(ctx, "forward audio chunk", Some(reason.to_string()));
            ctx.stop();
        }
    }

    fn final_seen(&self) -> bool {
        matches!(&self.phase, StreamPhase::Ready(active) if active.final_seen)
    }

    /// The notice's session is the one currently streaming.
    fn is_current(&self, session_id: &str) -> bool {
        matches!(&self.phase, StreamPhase::Ready(active) if active.session.id() == session_id)
    }

    /// Drop the current upstream session, closing its socket in the background.
    fn release_stream(&mut self) {
        if let StreamPhase::Ready(active) = std::mem::replace(&mut self.phase, StreamPhase::Idle) {
            let session = active.session;
            tokio::spawn(async move { session.close().await });
        }
    }
}

/// Queue a command for the writer without waiting.
fn queue_command(commands: &mpsc::Sender<UpstreamCommand>, command: UpstreamCommand) -> Result<(), &'static str> {
    commands.try_send(command).map_err(|err| match err {
        TrySendError::Full(_) => QUEUE_FULL,
        TrySendError::Closed(_) => WRITER_GONE,
    })
}

/// Where the writer publishes the post-stop deadline, and how to size it.
struct StopDeadline {
    sender: watch::Sender<Option<tokio::time::Instant>>,
    base: Duration,
    cap: Duration,
}

/// Playback length of `bytes` of PCM in the session's format.
fn streamed_duration(bytes: usize, params: &StreamParams) -> Option<Duration> {
    let bytes_per_second = u64::from(params.sample_rate)
        * u64::from(params.channels.max(1))
        * u64::from((params.bits / 8).max(1));
    if bytes_per_second == 0 || bytes == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(bytes as f64 / bytes_per_second as f64))
}

/// Forward queued audio and stop commands to the provider, in order.
fn spawn_writer(
    session: Arc<UpstreamSession>,
    mut commands: mpsc::Receiver<UpstreamCommand>,
    deadline: StopDeadline,
    addr: Addr<AsrWebSocket>,
) {
    tokio::spawn(async move {
        let mut streamed = 0usize;
        while let Some(command) = commands.recv().await {
            match command {
                UpstreamCommand::Audio(chunk) => {
                    if let Err(err) = session.send_audio(&chunk).await {
                        addr.do_send(UpstreamNotice::Failed {
                            session_id: session.id().to_string(),
                            error: "forward audio chunk",
                            detail: err.to_string(),
                            terminal: true,
                        });
                        break;
                    }
                    streamed += chunk.len();
                }
                UpstreamCommand::Stop => {
                    if let Err(err) = session.send_stop().await {
                        addr.do_send(UpstreamNotice::Failed {
                            session_id: session.id().to_string(),
                            error: "send stop",
                            detail: err.to_string(),
                            terminal: false,
                        });
                    }
                    let wait = adaptive_wait(
                        streamed_duration(streamed, session.params()),
                        deadline.base,
                        deadline.cap,
                    );
                    deadline.sender.send_replace(Some(tokio::time::Instant::now() + wait));
                    debug!("ASR stream {} waiting up to {:?} for final transcript", session.id(), wait);
                }
            }
        }
        debug!("ASR writer for {} finished", session.id());
    });
}

/// Pump upstream events to the actor until the session ends.
///
/// Reads block without a deadline until the writer publishes one after the
/// stop frame; a read already in flight is restarted with it.
fn spawn_reader(
    session: Arc<UpstreamSession>,
    mut deadline: watch::Receiver<Option<tokio::time::Instant>>,
    addr: Addr<AsrWebSocket>,
) {
    tokio::spawn(async move {
        let session_id = session.id().to_string();
        let mut writer_alive = true;
        loop {
            let current = *deadline.borrow_and_update();
            let next = tokio::select! {
                changed = deadline.changed(), if writer_alive && current.is_none() => {
                    if changed.is_err() {
                        writer_alive = false;
                    }
                    continue;
                }
                next = session.next_event(current) => next,
            };

            match next {
                Ok(Some(event)) => {
                    if event.is_empty() {
                        continue;
                    }
                    let terminal = event.error.is_some();
                    addr.do_send(UpstreamNotice::Event {
                        session_id: session_id.clone(),
                        event,
                    });
                    if terminal {
                        break;
                    }
                }
                Ok(None) => {
                    addr.do_send(UpstreamNotice::Finished { session_id });
                    break;
                }
                Err(AsrError::Timeout { .. }) => {
                    addr.do_send(UpstreamNotice::TimedOut { session_id });
                    break;
                }
                Err(err) => {
                    addr.do_send(UpstreamNotice::Failed {
                        session_id,
                        error: "upstream connection closed",
                        detail: err.to_string(),
                        terminal: true,
                    });
                    break;
                }
            }
        }
    });
}

impl Actor for AsrWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("ASR websocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("ASR websocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.release_stream();
        info!("ASR websocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AsrWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_control(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("ASR websocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("ASR websocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<UpstreamNotice> for AsrWebSocket {
    type Result = ();

    fn handle(&mut self, notice: UpstreamNotice, ctx: &mut Self::Context) {
        match notice {
            UpstreamNotice::Event { session_id, event } => {
                if !self.is_current(&session_id) {
                    return;
                }
                if let Some(message) = event.error.clone() {
                    self.send_error(ctx, "upstream error", Some(message));
                    ctx.stop();
                    return;
                }
                let is_final = event.is_final;
                if is_final {
                    if let StreamPhase::Ready(active) = &mut self.phase {
                        active.final_seen = true;
                    }
                }
                let payload = TranscriptPayload::from(event);
                let message = if is_final {
                    ServerMessage::Final(payload)
                } else {
                    ServerMessage::Partial(payload)
                };
                self.send(ctx, &message);
            }
            UpstreamNotice::Failed { session_id, error, detail, terminal } => {
                if !self.is_current(&session_id) {
                    return;
                }
                self.send_error(ctx, error, Some(detail));
                if terminal {
                    ctx.stop();
                }
            }
            UpstreamNotice::TimedOut { session_id } => {
                if !self.is_current(&session_id) {
                    return;
                }
                if self.final_seen() {
                    info!("ASR stream {} idle after final transcript, releasing", session_id);
                    self.release_stream();
                } else {
                    self.send_error(
                        ctx,
                        "timed out waiting for final transcript",
                        Some("no final transcript before the deadline after stop".to_string()),
                    );
                    ctx.stop();
                }
            }
            UpstreamNotice::Finished { session_id } => {
                if !self.is_current(&session_id) {
                    return;
                }
                if self.final_seen() {
                    info!("ASR stream {} completed", session_id);
                    self.release_stream();
                } else {
                    self.send_error(ctx, "upstream closed before final transcript", None);
                    ctx.stop();
                }
            }
        }
    }
}

/// `GET /ws/asr`: upgrade to the transcription bridge.
///
/// The connection token comes from `?token=`, then the `Authorization`
/// header, then the configured API key.
pub async fn asr_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New ASR websocket connection from: {:?}", req.connection_info().peer_addr());

    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(HashMap::new()));
    let token = resolve_token(&req, query.get("token").map(String::as_str), &state.config);

    ws::start(AsrWebSocket::new(state.get_ref().clone(), token), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::codec::MessageType;
    use crate::transcription::upstream::tests::{mock_provider, mock_provider_with_delay, server_frame};
    use crate::transcription::upstream::STREAM_PATH;
    use crate::transcription::AsrClient;
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message;

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    fn bridge_config(provider_url: &str, max_sessions: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.asr.ws_url = Some(provider_url.trim_end_matches(STREAM_PATH).to_string());
        config.asr.handshake_timeout_secs = 2;
        config.performance.max_concurrent_sessions = max_sessions;
        config
    }

    /// Serve the bridge on an ephemeral port against the given provider socket URL.
    fn serve_bridge(provider_url: &str, max_sessions: usize) -> String {
        serve(bridge_config(provider_url, max_sessions))
    }

    fn serve(config: AppConfig) -> String {
        let asr = AsrClient::new(config.asr.clone()).unwrap();
        let state = AppState::new(config, asr);

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/asr", web::get().to(asr_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("ws://{}/ws/asr?token=test-token", addr)
    }

    async fn connect(url: &str) -> Client {
        tokio_tungstenite::connect_async(url).await.unwrap().0
    }

    async fn send_json(client: &mut Client, value: Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// Next JSON message from the bridge, or `None` once the socket closes.
    async fn next_json(client: &mut Client) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("bridge went silent");
            match message {
                Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    fn start_message() -> Value {
        json!({"type": "start", "sampleRate": 16000, "channels": 1, "bits": 16})
    }

    #[test]
    fn test_server_message_shapes() {
        let ready = ServerMessage::Ready { sample_rate: 16000, channels: 1, bits: 16 };
        assert_eq!(
            serde_json::to_value(&ready).unwrap(),
            json!({"type": "ready", "sampleRate": 16000, "channels": 1, "bits": 16})
        );

        let partial = ServerMessage::Partial(TranscriptPayload { text: Some("hi".into()), ..Default::default() });
        assert_eq!(serde_json::to_value(&partial).unwrap(), json!({"type": "partial", "text": "hi"}));

        let error = ServerMessage::Error { error: "stream not initialized".into(), detail: None };
        assert_eq!(serde_json::to_value(&error).unwrap(), json!({"type": "error", "error": "stream not initialized"}));

        assert_eq!(serde_json::to_value(&ServerMessage::Pong).unwrap(), json!({"type": "pong"}));
    }

    #[test]
    fn test_client_control_defaults() {
        let control: ClientControl = serde_json::from_str(r#"{"type":"START"}"#).unwrap();
        assert_eq!(control.kind, "START");
        assert_eq!((control.sample_rate, control.channels, control.bits), (0, 0, 0));
        assert!(control.token.is_empty());
    }

    #[test]
    fn test_command_queue_is_bounded() {
        let (commands, receiver) = mpsc::channel(2);
        assert!(queue_command(&commands, UpstreamCommand::Audio(vec![1])).is_ok());
        assert!(queue_command(&commands, UpstreamCommand::Audio(vec![2])).is_ok());
        assert_eq!(queue_command(&commands, UpstreamCommand::Audio(vec![3])), Err(QUEUE_FULL));
        assert_eq!(queue_command(&commands, UpstreamCommand::Stop), Err(QUEUE_FULL));

        drop(receiver);
        assert_eq!(queue_command(&commands, UpstreamCommand::Stop), Err(WRITER_GONE));
    }

    #[test]
    fn test_streamed_duration() {
        let params = StreamParams { sample_rate: 16000, channels: 1, bits: 16, model: "asr".into() };
        assert_eq!(streamed_duration(32000, &params), Some(Duration::from_secs(1)));
        assert_eq!(streamed_duration(0, &params), None);

        let stereo = StreamParams { channels: 2, ..params.clone() };
        assert_eq!(streamed_duration(32000, &stereo), Some(Duration::from_millis(500)));

        let unknown_rate = StreamParams { sample_rate: 0, ..params };
        assert_eq!(streamed_duration(32000, &unknown_rate), None);
    }

    #[actix_web::test]
    async fn test_protocol_mistakes_keep_connection_open() {
        let (provider, _seen) = mock_provider(vec![], true).await;
        let url = serve_bridge(&provider, 4);
        let mut client = connect(&url).await;

        client.send(Message::Binary(vec![0u8; 320])).await.unwrap();
        let reply = next_json(&mut client).await.unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "stream not initialized");
        assert_eq!(reply["detail"], "start message required before audio");

        client.send(Message::Text("{not json".into())).await.unwrap();
        assert_eq!(next_json(&mut client).await.unwrap()["error"], "invalid control message");

        send_json(&mut client, json!({"type": "rewind"})).await;
        let reply = next_json(&mut client).await.unwrap();
        assert_eq!(reply["error"], "unsupported control message");
        assert_eq!(reply["detail"], "rewind");

        send_json(&mut client, json!({"type": "ping"})).await;
        assert_eq!(next_json(&mut client).await.unwrap(), json!({"type": "pong"}));
    }

    #[actix_web::test]
    async fn test_stream_relays_partial_and_final() {
        let (provider, mut seen) = mock_provider(
            vec![
                server_frame(json!({"result": {"text": "hello"}, "is_final": false})),
                server_frame(json!({"reqid": "r-7", "result": {"text": "hello world"}, "is_final": true, "duration": 900})),
            ],
            false,
        )
        .await;
        let url = serve_bridge(&provider, 4);
        let mut client = connect(&url).await;

        send_json(&mut client, start_message()).await;
        assert_eq!(
            next_json(&mut client).await.unwrap(),
            json!({"type": "ready", "sampleRate": 16000, "channels": 1, "bits": 16})
        );

        send_json(&mut client, start_message()).await;
        assert_eq!(next_json(&mut client).await.unwrap()["error"], "asr stream already started");

        client.send(Message::Binary(vec![1u8; 3200])).await.unwrap();
        client.send(Message::Binary(vec![2u8; 1600])).await.unwrap();
        send_json(&mut client, json!({"type": "stop"})).await;

        let partial = next_json(&mut client).await.unwrap();
        assert_eq!(partial["type"], "partial");
        assert_eq!(partial["text"], "hello");

        let last = next_json(&mut client).await.unwrap();
        assert_eq!(last["type"], "final");
        assert_eq!(last["text"], "hello world");
        assert_eq!(last["duration_ms"], 900);
        assert_eq!(last["reqid"], "r-7");

        let mut frames = Vec::new();
        while let Some(frame) = seen.recv().await {
            frames.push(frame);
        }
        let audio: Vec<_> = frames
            .iter()
            .filter(|f| f.header.message_type == MessageType::Audio)
            .map(|f| f.payload.clone())
            .collect();
        assert_eq!(audio, vec![vec![1u8; 3200], vec![2u8; 1600]]);
        assert_eq!(frames.last().unwrap().header.message_type, MessageType::Stop);

        send_json(&mut client, json!({"type": "ping"})).await;
        assert_eq!(next_json(&mut client).await.unwrap(), json!({"type": "pong"}));
    }

    #[actix_web::test]
    async fn test_acknowledgement_without_text_is_relayed() {
        let (provider, _seen) = mock_provider(
            vec![
                server_frame(json!({"reqid": "r-1", "code": 1000})),
                server_frame(json!({"reqid": "r-1", "result": {"text": "done"}, "is_final": true})),
            ],
            false,
        )
        .await;
        let url = serve_bridge(&provider, 4);
        let mut client = connect(&url).await;

        send_json(&mut client, start_message()).await;
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "ready");
        send_json(&mut client, json!({"type": "stop"})).await;

        let ack = next_json(&mut client).await.unwrap();
        assert_eq!(ack["type"], "partial");
        assert_eq!(ack["reqid"], "r-1");
        assert_eq!(ack["raw"]["code"], 1000);
        assert!(ack.get("text").is_none());

        let last = next_json(&mut client).await.unwrap();
        assert_eq!(last["type"], "final");
        assert_eq!(last["text"], "done");
    }

    #[actix_web::test]
    async fn test_silent_upstream_times_out_after_stop() {
        let (provider, _seen) = mock_provider(vec![], true).await;
        let mut config = bridge_config(&provider, 4);
        config.asr.stream_wait_base_secs = 1;
        config.asr.stream_wait_cap_secs = 1;
        let url = serve(config);
        let mut client = connect(&url).await;

        send_json(&mut client, start_message()).await;
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "ready");
        client.send(Message::Binary(vec![0u8; 3200])).await.unwrap();
        send_json(&mut client, json!({"type": "stop"})).await;

        let reply = next_json(&mut client).await.unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "timed out waiting for final transcript");
        assert!(next_json(&mut client).await.is_none());
    }

    #[actix_web::test]
    async fn test_stop_while_opening_is_forwarded() {
        let (provider, mut seen) = mock_provider_with_delay(
            vec![server_frame(json!({"result": {"text": "quick"}, "is_final": true}))],
            false,
            Duration::from_millis(300),
        )
        .await;
        let url = serve_bridge(&provider, 4);
        let mut client = connect(&url).await;

        send_json(&mut client, start_message()).await;
        send_json(&mut client, json!({"type": "stop"})).await;

        assert_eq!(next_json(&mut client).await.unwrap()["type"], "ready");
        let last = next_json(&mut client).await.unwrap();
        assert_eq!(last["type"], "final");
        assert_eq!(last["text"], "quick");

        let mut kinds = Vec::new();
        while let Some(frame) = seen.recv().await {
            kinds.push(frame.header.message_type);
        }
        assert_eq!(kinds, vec![MessageType::Config, MessageType::Stop]);
    }

    #[actix_web::test]
    async fn test_client_disconnect_closes_upstream() {
        let (provider, mut seen) = mock_provider(vec![], true).await;
        let url = serve_bridge(&provider, 4);
        let mut client = connect(&url).await;

        send_json(&mut client, start_message()).await;
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "ready");
        client.send(Message::Binary(vec![1u8; 320])).await.unwrap();
        drop(client);

        // The provider's connection task ends once the bridge closes its socket.
        let kinds = tokio::time::timeout(Duration::from_secs(5), async {
            let mut kinds = Vec::new();
            while let Some(frame) = seen.recv().await {
                kinds.push(frame.header.message_type);
            }
            kinds
        })
        .await
        .expect("upstream socket still open after the client left");
        assert_eq!(kinds.first(), Some(&MessageType::Config));
        assert!(!kinds.contains(&MessageType::Stop));
    }

    #[actix_web::test]
    async fn test_upstream_close_without_final_is_reported() {
        let (provider, _seen) = mock_provider(
            vec![server_frame(json!({"result": {"text": "half"}, "is_final": false}))],
            false,
        )
        .await;
        let url = serve_bridge(&provider, 4);
        let mut client = connect(&url).await;

        send_json(&mut client, start_message()).await;
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "ready");
        send_json(&mut client, json!({"type": "stop"})).await;

        assert_eq!(next_json(&mut client).await.unwrap()["type"], "partial");
        let reply = next_json(&mut client).await.unwrap();
        assert_eq!(reply["error"], "upstream closed before final transcript");
        assert!(next_json(&mut client).await.is_none());
    }

    #[actix_web::test]
    async fn test_upstream_error_tears_down_connection() {
        let (provider, _seen) = mock_provider(
            vec![server_frame(json!({"error": {"code": "45000001", "message": "invalid audio"}}))],
            true,
        )
        .await;
        let url = serve_bridge(&provider, 4);
        let mut client = connect(&url).await;

        send_json(&mut client, start_message()).await;
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "ready");
        send_json(&mut client, json!({"type": "stop"})).await;

        let reply = next_json(&mut client).await.unwrap();
        assert_eq!(reply["error"], "upstream error");
        assert_eq!(reply["detail"], "invalid audio");
        assert!(next_json(&mut client).await.is_none());
    }

    #[actix_web::test]
    async fn test_open_failure_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = format!("ws://{}{}", listener.local_addr().unwrap(), STREAM_PATH);
        drop(listener);
        let url = serve_bridge(&closed, 4);
        let mut client = connect(&url).await;

        send_json(&mut client, start_message()).await;
        let reply = next_json(&mut client).await.unwrap();
        assert_eq!(reply["error"], "open upstream stream");
        assert!(reply["detail"].as_str().unwrap().contains("dial asr websocket"));

        send_json(&mut client, json!({"type": "ping"})).await;
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "pong");
    }
}
