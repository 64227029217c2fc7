//! AudioHook websocket listener worker
//!
//! Terminates the provider's media websocket (listen-only), decodes
//! negotiated codec frames, splits dual-channel audio into per-speaker
//! lanes, and forwards buffered chunks plus call lifecycle events to the
//! ingest API.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::Engine;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audiohook::protocol::{self, IngressCommand, MediaDetails, Packet};
use crate::codec::{self, AudioEncoding};
use crate::config::AudioHookConfig;
use crate::model::Speaker;
use crate::retry::{post_json_with_retries, RetryPolicy};
use crate::status::{StatusWriter, WorkerState, HEARTBEAT_INTERVAL};
use crate::{Error, Result};

/// Close code sent when a connection's buffers outrun forwarding
const OVERLOAD_CLOSE_CODE: u16 = 1013;
/// Per-lane hard cap as a multiple of the max chunk size
const OVERLOAD_FACTOR: usize = 4;

type WsSink = SplitSink<WebSocket, Message>;

pub struct AudioHookListener {
    config: AudioHookConfig,
    default_sample_rate: u32,
    default_channels: u16,
    http: reqwest::Client,
    status: Arc<StatusWriter>,
    policy: RetryPolicy,
    dry_run: bool,
    shutdown: watch::Receiver<bool>,
}

/// One per-speaker buffer of decoded mono PCM
struct SpeakerLane {
    label: String,
    buffer: Vec<u8>,
}

/// Per-connection protocol state
struct Connection {
    connection_id: String,
    call_id: String,
    query: HashMap<String, String>,
    media: MediaDetails,
    opened: bool,
    last_command_id: String,
    last_seq: i64,
    lanes: Vec<SpeakerLane>,
    audio_packet_count: u64,
    raw_audio_bytes: u64,
    packets_reported: u64,
    bytes_reported: u64,
    last_flush: Instant,
    end_emitted: bool,
}

impl Connection {
    fn new(connection_id: String, query: HashMap<String, String>) -> Self {
        Self {
            connection_id,
            call_id: String::new(),
            query,
            media: MediaDetails::default(),
            opened: false,
            last_command_id: String::new(),
            last_seq: 0,
            lanes: Vec::new(),
            audio_packet_count: 0,
            raw_audio_bytes: 0,
            packets_reported: 0,
            bytes_reported: 0,
            last_flush: Instant::now(),
            end_emitted: false,
        }
    }

    fn rebuild_lanes(&mut self) {
        self.lanes = self
            .media
            .channel_labels
            .iter()
            .map(|label| SpeakerLane {
                label: label.clone(),
                buffer: Vec::new(),
            })
            .collect();
        if self.lanes.is_empty() {
            self.lanes.push(SpeakerLane {
                label: "mono".to_string(),
                buffer: Vec::new(),
            });
        }
    }
}

impl AudioHookListener {
    pub fn new(
        config: AudioHookConfig,
        default_sample_rate: u32,
        default_channels: u16,
        dry_run: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .user_agent("callwatch-genesys-audiohook/1.0")
            .build()
            .map_err(|err| Error::Internal(err.to_string()))?;

        let status = Arc::new(StatusWriter::new(
            config.status_path.clone(),
            "genesys_audiohook_listener",
            dry_run,
        ));
        status.update(&[
            ("host", json!(&config.host)),
            ("port", json!(config.port)),
            ("path", json!(&config.path)),
            ("connection_count", json!(0)),
            ("active_connections", json!(0)),
            ("forwarded_chunks", json!(0)),
            ("forwarded_events", json!(0)),
            ("forward_failures", json!(0)),
            ("decode_failures", json!(0)),
            ("audio_packets", json!(0)),
            ("audio_bytes", json!(0)),
            ("last_call_id", json!("")),
            ("last_media_format", json!("")),
        ]);

        let policy = RetryPolicy::new(config.retry_max_attempts, config.retry_backoff_seconds);

        Ok(Self {
            config,
            default_sample_rate,
            default_channels,
            http,
            status,
            policy,
            dry_run,
            shutdown,
        })
    }

    /// Serve the websocket endpoint until the shutdown signal flips
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.status.set_state(WorkerState::Starting);
        info!(
            host = %self.config.host,
            port = self.config.port,
            path = %self.config.path,
            target_audio = %self.config.target_audio_ingest_url,
            dry_run = self.dry_run,
            "audiohook listener starting"
        );

        let heartbeat = {
            let status = self.status.clone();
            let mut signal = self.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => status.heartbeat(),
                        _ = signal.changed() => break,
                    }
                }
            })
        };

        let app = Router::new()
            .route(&self.config.path, get(upgrade_or_probe))
            .fallback(not_found)
            .with_state(self.clone());

        let address = self
            .config
            .bind_address()
            .map_err(|err| Error::Config(err.to_string()))?;
        let listener = tokio::net::TcpListener::bind(address).await?;
        self.status.set_state(WorkerState::Running);
        info!(address = %address, "audiohook listener running");

        let mut signal = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = signal.changed().await;
            })
            .await?;

        heartbeat.abort();
        self.status.set_state(WorkerState::Stopped);
        info!("audiohook listener stopped");
        Ok(())
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, query: HashMap<String, String>) {
        let connection_id = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        );
        let mut conn = Connection::new(connection_id.clone(), query);
        self.status.increment("connection_count", 1);
        self.bump_active(1);
        info!(connection_id = %connection_id, "audiohook connection accepted");

        let (mut sink, mut frames) = socket.split();
        let mut shutdown = self.shutdown.clone();

        loop {
            let flow = tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "server shutdown".into(),
                        })))
                        .await;
                    ControlFlow::Break(())
                }
                frame = frames.next() => self.handle_frame(&mut conn, &mut sink, frame).await,
            };
            if flow.is_break() {
                break;
            }
        }

        self.flush_lanes(&mut conn, true, "socket_closed").await;
        self.forward_call_end(&mut conn, "socket_closed").await;
        self.bump_active(-1);
        info!(connection_id = %connection_id, "audiohook connection closed");
    }

    async fn handle_frame(
        &self,
        conn: &mut Connection,
        sink: &mut WsSink,
        frame: Option<std::result::Result<Message, axum::Error>>,
    ) -> ControlFlow<()> {
        match frame {
            None => ControlFlow::Break(()),
            Some(Err(err)) => {
                self.status.set("last_error", json!(err.to_string()));
                warn!(connection_id = %conn.connection_id, error = %err, "audiohook socket error");
                ControlFlow::Break(())
            }
            Some(Ok(Message::Binary(data))) => {
                for packet in protocol::decode_packets(&data) {
                    let flow = match packet {
                        Packet::Command(command) => {
                            self.handle_command(conn, sink, &command).await
                        }
                        Packet::Audio { headers, audio } => {
                            self.handle_audio(conn, sink, &headers, &audio).await
                        }
                        Packet::Unknown { packet_type, size } => {
                            debug!(
                                connection_id = %conn.connection_id,
                                packet_type = format!("0x{packet_type:02x}"),
                                bytes = size,
                                "audiohook packet ignored"
                            );
                            ControlFlow::Continue(())
                        }
                    };
                    if flow.is_break() {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            }
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                Ok(command) => self.handle_command(conn, sink, &command).await,
                Err(_) => {
                    debug!(connection_id = %conn.connection_id, "audiohook command invalid json");
                    ControlFlow::Continue(())
                }
            },
            Some(Ok(Message::Close(_))) => ControlFlow::Break(()),
            Some(Ok(_)) => ControlFlow::Continue(()),
        }
    }

    async fn handle_command(
        &self,
        conn: &mut Connection,
        sink: &mut WsSink,
        command: &Value,
    ) -> ControlFlow<()> {
        let parsed = protocol::parse_command(command);

        // Track correlation fields for replies that omit them
        if let Some(id) = command.get("id").and_then(Value::as_str) {
            if !id.trim().is_empty() {
                conn.last_command_id = id.trim().to_string();
            }
        }
        if let Some(seq) = command.get("seq").and_then(Value::as_i64) {
            if seq > conn.last_seq {
                conn.last_seq = seq;
            }
        }

        match parsed {
            IngressCommand::Open {
                id,
                seq,
                parameters,
                media,
            } => {
                self.handle_open(conn, sink, &id, seq, &parameters, &media)
                    .await;
                ControlFlow::Continue(())
            }
            IngressCommand::Ping { id, seq } => {
                let reply = json!({
                    "version": "2",
                    "type": "pong",
                    "id": if id.is_empty() { conn.last_command_id.clone() } else { id },
                    "seq": if seq == 0 { conn.last_seq } else { seq },
                    "parameters": {},
                });
                self.send_command(conn, sink, &reply).await;
                ControlFlow::Continue(())
            }
            IngressCommand::Close { id, seq } => {
                self.flush_lanes(conn, true, "close_command").await;
                self.forward_call_end(conn, "close_command").await;
                let reply = json!({
                    "version": "2",
                    "type": "closed",
                    "id": if id.is_empty() { conn.last_command_id.clone() } else { id },
                    "seq": if seq == 0 { conn.last_seq } else { seq },
                    "parameters": {},
                });
                self.send_command(conn, sink, &reply).await;
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: 1000,
                        reason: "closed".into(),
                    })))
                    .await;
                ControlFlow::Break(())
            }
            IngressCommand::Disconnect { .. } | IngressCommand::Error { .. } => {
                self.flush_lanes(conn, true, "disconnect").await;
                self.forward_call_end(conn, "disconnect").await;
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: 1011,
                        reason: "disconnect".into(),
                    })))
                    .await;
                ControlFlow::Break(())
            }
            IngressCommand::Event {
                event_type,
                parameters,
                ..
            } => {
                self.forward_event(conn, command, &event_type, &parameters)
                    .await;
                ControlFlow::Continue(())
            }
            IngressCommand::Other { command_type } => {
                debug!(
                    connection_id = %conn.connection_id,
                    command_type = %command_type,
                    "audiohook command ignored"
                );
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle_open(
        &self,
        conn: &mut Connection,
        sink: &mut WsSink,
        id: &str,
        seq: i64,
        parameters: &Value,
        media: &Value,
    ) {
        conn.media =
            protocol::negotiate_media(media, self.default_sample_rate, self.default_channels);
        conn.call_id = extract_call_id(parameters, &conn.query);
        if conn.call_id.is_empty() {
            conn.call_id = format!("audiohook-{}", Utc::now().timestamp_millis());
        }
        conn.opened = true;
        conn.rebuild_lanes();

        self.status.update(&[
            ("last_call_id", json!(&conn.call_id)),
            ("last_media_format", json!(&conn.media.format)),
        ]);

        let reply = json!({
            "version": "2",
            "type": "opened",
            "id": if id.is_empty() { format!("open-{}", conn.connection_id) } else { id.to_string() },
            "seq": if seq == 0 { conn.last_seq } else { seq },
            "parameters": {
                "conversationId": &conn.call_id,
            },
            "media": {
                "type": "audio",
                "format": &conn.media.format,
                "rate": conn.media.rate,
                "channels": &conn.media.channel_labels,
            },
        });
        self.send_command(conn, sink, &reply).await;

        info!(
            connection_id = %conn.connection_id,
            call_id = %conn.call_id,
            format = %conn.media.format,
            rate = conn.media.rate,
            channels = conn.media.channels,
            "audiohook stream opened"
        );
    }

    async fn handle_audio(
        &self,
        conn: &mut Connection,
        sink: &mut WsSink,
        headers: &Map<String, Value>,
        audio: &[u8],
    ) -> ControlFlow<()> {
        if !conn.opened {
            debug!(connection_id = %conn.connection_id, "audiohook audio before open ignored");
            return ControlFlow::Continue(());
        }
        if audio.is_empty() {
            return ControlFlow::Continue(());
        }

        // In-band media updates are legal at packet boundaries
        if let Some(media) = headers.get("media") {
            let update = protocol::extract_media_details(media);
            if !update.format.is_empty() {
                conn.media.format = update.format;
            }
            if update.rate > 0 {
                conn.media.rate = update.rate;
            }
            if update.channels > 0 && update.channels as usize != conn.lanes.len() {
                conn.media.channels = update.channels;
                conn.media.channel_labels = if update.channel_labels.is_empty() {
                    protocol::default_channel_labels(update.channels)
                } else {
                    update.channel_labels
                };
                self.flush_lanes(conn, true, "media_change").await;
                conn.rebuild_lanes();
            } else if !update.channel_labels.is_empty() {
                conn.media.channel_labels = update.channel_labels;
            }
        }

        let encoding = match AudioEncoding::parse(&conn.media.format) {
            Some(encoding) if encoding != AudioEncoding::Wav => encoding,
            _ => {
                self.status.increment("decode_failures", 1);
                debug!(
                    connection_id = %conn.connection_id,
                    format = %conn.media.format,
                    "audiohook media format unsupported"
                );
                return ControlFlow::Continue(());
            }
        };
        let decoded = match codec::decode_frames(encoding, audio) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.status.increment("decode_failures", 1);
                debug!(connection_id = %conn.connection_id, error = %err, "audiohook decode failed");
                return ControlFlow::Continue(());
            }
        };

        conn.audio_packet_count += 1;
        conn.raw_audio_bytes += audio.len() as u64;
        deinterleave_into_lanes(&decoded, &mut conn.lanes);

        let max_bytes = self.max_chunk_bytes(conn);
        if conn
            .lanes
            .iter()
            .any(|lane| lane.buffer.len() > OVERLOAD_FACTOR * max_bytes)
        {
            warn!(
                connection_id = %conn.connection_id,
                call_id = %conn.call_id,
                "audiohook forwarding stalled, closing overloaded connection"
            );
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: OVERLOAD_CLOSE_CODE,
                    reason: "overloaded".into(),
                })))
                .await;
            return ControlFlow::Break(());
        }

        self.flush_lanes(conn, false, "streaming").await;
        ControlFlow::Continue(())
    }

    fn max_chunk_bytes(&self, conn: &Connection) -> usize {
        let bytes_per_second = u64::from(conn.media.rate.max(1)) * 2;
        let min_bytes = (bytes_per_second * self.config.min_chunk_duration_ms / 1000).max(1);
        (bytes_per_second * self.config.max_chunk_duration_ms / 1000).max(min_bytes) as usize
    }

    async fn flush_lanes(&self, conn: &mut Connection, force: bool, reason: &str) {
        let bytes_per_second = u64::from(conn.media.rate.max(1)) * 2;
        let min_bytes =
            ((bytes_per_second * self.config.min_chunk_duration_ms / 1000).max(1)) as usize;
        let max_bytes = self.max_chunk_bytes(conn);
        let interval_elapsed = conn.last_flush.elapsed().as_millis() as u64
            >= self.config.flush_interval_ms;

        let mut pending: Vec<(String, Vec<u8>)> = Vec::new();
        for lane in &mut conn.lanes {
            loop {
                let len = lane.buffer.len();
                if len == 0 {
                    break;
                }
                let due = force || len >= max_bytes || (len >= min_bytes && interval_elapsed);
                if !due {
                    break;
                }
                let take = len.min(max_bytes);
                let chunk: Vec<u8> = lane.buffer.drain(..take).collect();
                pending.push((lane.label.clone(), chunk));
                if !force && lane.buffer.len() < max_bytes {
                    break;
                }
            }
        }

        if pending.is_empty() {
            return;
        }
        conn.last_flush = Instant::now();

        for (label, chunk) in pending {
            self.forward_audio_chunk(conn, &label, chunk, reason).await;
        }

        // Counters ride along with flushes to keep status writes off the hot path
        let packet_delta = conn.audio_packet_count - conn.packets_reported;
        let byte_delta = conn.raw_audio_bytes - conn.bytes_reported;
        if packet_delta > 0 {
            self.status.increment("audio_packets", packet_delta);
            conn.packets_reported = conn.audio_packet_count;
        }
        if byte_delta > 0 {
            self.status.increment("audio_bytes", byte_delta);
            conn.bytes_reported = conn.raw_audio_bytes;
        }
    }

    async fn forward_audio_chunk(
        &self,
        conn: &Connection,
        lane_label: &str,
        chunk: Vec<u8>,
        reason: &str,
    ) {
        if chunk.is_empty() || conn.call_id.is_empty() {
            return;
        }

        let speaker = Speaker::parse(lane_label)
            .map(|speaker| speaker.as_str().to_string())
            .unwrap_or_default();
        let payload = json!({
            "provider": "genesys_audiohook",
            "call_id": &conn.call_id,
            "audio_encoding": "pcm_s16le",
            "sample_rate": conn.media.rate,
            "channels": 1,
            "speaker": speaker,
            "audio_b64": base64::engine::general_purpose::STANDARD.encode(&chunk),
            "status": "active",
            "timestamp": Utc::now().to_rfc3339(),
            "metadata": {
                "connection_id": &conn.connection_id,
                "channel_label": lane_label,
                "channel_labels": &conn.media.channel_labels,
                "media_format": &conn.media.format,
                "flush_reason": reason,
                "audio_packet_count": conn.audio_packet_count,
            },
        });

        if self.dry_run {
            info!(
                call_id = %conn.call_id,
                bytes = chunk.len(),
                speaker = %lane_label,
                "audiohook chunk (dry run)"
            );
            return;
        }

        match post_json_with_retries(
            &self.http,
            &self.config.target_audio_ingest_url,
            Some(&self.config.target_ingest_token),
            &payload,
            &self.policy,
        )
        .await
        {
            Ok(()) => {
                self.status.increment("forwarded_chunks", 1);
                self.status.set("last_call_id", json!(&conn.call_id));
            }
            Err(err) => {
                self.status.increment("forward_failures", 1);
                self.status.set("last_error", json!(err.to_string()));
                warn!(
                    call_id = %conn.call_id,
                    bytes = chunk.len(),
                    error = %err,
                    "audiohook chunk forward failed"
                );
            }
        }
    }

    async fn forward_event(
        &self,
        conn: &Connection,
        command: &Value,
        event_type: &str,
        parameters: &Value,
    ) {
        if conn.call_id.is_empty() {
            return;
        }
        let event_type = if event_type.is_empty() {
            "audiohook_event".to_string()
        } else {
            event_type.to_lowercase()
        };
        let payload = json!({
            "provider": "genesys_audiohook",
            "call_id": &conn.call_id,
            "event_type": event_type,
            "speaker": "",
            "text": extract_event_text(parameters),
            "status": "active",
            "timestamp": Utc::now().to_rfc3339(),
            "metadata": {
                "audiohook_command": command,
                "connection_id": &conn.connection_id,
            },
        });
        self.forward_event_payload(&payload).await;
    }

    async fn forward_call_end(&self, conn: &mut Connection, reason: &str) {
        if conn.end_emitted || conn.call_id.is_empty() {
            return;
        }
        conn.end_emitted = true;
        let payload = json!({
            "provider": "genesys_audiohook",
            "call_id": &conn.call_id,
            "event_type": "end",
            "speaker": "",
            "text": "",
            "status": "ended",
            "timestamp": Utc::now().to_rfc3339(),
            "metadata": {
                "reason": reason,
                "connection_id": &conn.connection_id,
            },
        });
        self.forward_event_payload(&payload).await;
    }

    async fn forward_event_payload(&self, payload: &Value) {
        if self.dry_run {
            info!(
                call_id = ?payload.get("call_id"),
                event_type = ?payload.get("event_type"),
                "audiohook event (dry run)"
            );
            return;
        }

        match post_json_with_retries(
            &self.http,
            &self.config.target_event_ingest_url,
            Some(&self.config.target_ingest_token),
            payload,
            &self.policy,
        )
        .await
        {
            Ok(()) => self.status.increment("forwarded_events", 1),
            Err(err) => {
                self.status.increment("forward_failures", 1);
                self.status.set("last_error", json!(err.to_string()));
                warn!(error = %err, "audiohook event forward failed");
            }
        }
    }

    async fn send_command(&self, conn: &Connection, sink: &mut WsSink, command: &Value) {
        match protocol::encode_command(command) {
            Ok(frame) => {
                if let Err(err) = sink.send(Message::Binary(frame)).await {
                    debug!(
                        connection_id = %conn.connection_id,
                        error = %err,
                        "audiohook command send failed"
                    );
                }
            }
            Err(err) => {
                warn!(connection_id = %conn.connection_id, error = %err, "audiohook command encode failed");
            }
        }
    }

    fn bump_active(&self, delta: i64) {
        if delta >= 0 {
            self.status.increment("active_connections", delta as u64);
        } else {
            self.status
                .decrement_gauge("active_connections", (-delta) as u64);
        }
    }
}

fn deinterleave_into_lanes(decoded: &[u8], lanes: &mut [SpeakerLane]) {
    let lane_count = lanes.len().max(1);
    if lane_count == 1 {
        lanes[0].buffer.extend_from_slice(decoded);
        return;
    }
    let frame_size = lane_count * 2;
    let usable = decoded.len() - decoded.len() % frame_size;
    for frame in decoded[..usable].chunks_exact(frame_size) {
        for (index, lane) in lanes.iter_mut().enumerate() {
            lane.buffer.extend_from_slice(&frame[index * 2..index * 2 + 2]);
        }
    }
}

fn extract_call_id(parameters: &Value, query: &HashMap<String, String>) -> String {
    const KEYS: [&str; 5] = ["conversationId", "conversation_id", "callId", "call_id", "id"];

    for key in KEYS {
        if let Some(value) = parameters.get(key).and_then(Value::as_str) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }
    for key in KEYS {
        if let Some(value) = query.get(key) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }
    String::new()
}

fn extract_event_text(parameters: &Value) -> String {
    const KEYS: [&str; 4] = ["text", "transcript", "utteranceText", "message"];

    for key in KEYS {
        if let Some(value) = parameters.get(key).and_then(Value::as_str) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }

    if let Some(Value::Array(events)) = parameters.get("events") {
        for item in events.iter().filter_map(Value::as_object) {
            for key in KEYS {
                if let Some(value) = item.get(key).and_then(Value::as_str) {
                    if !value.trim().is_empty() {
                        return value.trim().to_string();
                    }
                }
            }
            if let Some(nested) = item.get("parameters") {
                for key in KEYS {
                    if let Some(value) = nested.get(key).and_then(Value::as_str) {
                        if !value.trim().is_empty() {
                            return value.trim().to_string();
                        }
                    }
                }
            }
        }
    }
    String::new()
}

// ------------------------------------------------------------------
// HTTP surface
// ------------------------------------------------------------------

async fn upgrade_or_probe(
    State(listener): State<Arc<AudioHookListener>>,
    Query(query): Query<HashMap<String, String>>,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    match upgrade {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| listener.handle_socket(socket, query))
            .into_response(),
        None => Json(json!({
            "ok": true,
            "service": "genesys_audiohook_listener",
            "path": &listener.config.path,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response(),
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found" }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lanes(labels: &[&str]) -> Vec<SpeakerLane> {
        labels
            .iter()
            .map(|label| SpeakerLane {
                label: label.to_string(),
                buffer: Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_deinterleave_splits_stereo() {
        // Two frames: (L=0x0102, R=0x0304), (L=0x0506, R=0x0708)
        let decoded = [0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07];
        let mut stereo = lanes(&["agent", "customer"]);
        deinterleave_into_lanes(&decoded, &mut stereo);
        assert_eq!(stereo[0].buffer, vec![0x02, 0x01, 0x06, 0x05]);
        assert_eq!(stereo[1].buffer, vec![0x04, 0x03, 0x08, 0x07]);
    }

    #[test]
    fn test_deinterleave_mono_passthrough_and_trim() {
        let decoded = [1u8, 2, 3, 4];
        let mut mono = lanes(&["mono"]);
        deinterleave_into_lanes(&decoded, &mut mono);
        assert_eq!(mono[0].buffer, decoded);

        // Partial trailing frame is dropped for stereo
        let mut stereo = lanes(&["agent", "customer"]);
        deinterleave_into_lanes(&[1, 2, 3, 4, 5, 6], &mut stereo);
        assert_eq!(stereo[0].buffer, vec![1, 2]);
        assert_eq!(stereo[1].buffer, vec![3, 4]);
    }

    #[test]
    fn test_call_id_from_parameters_then_query() {
        let parameters = json!({"conversationId": "conv-7"});
        assert_eq!(
            extract_call_id(&parameters, &HashMap::new()),
            "conv-7".to_string()
        );

        let mut query = HashMap::new();
        query.insert("call_id".to_string(), "q-9".to_string());
        assert_eq!(extract_call_id(&Value::Null, &query), "q-9".to_string());
        assert_eq!(extract_call_id(&Value::Null, &HashMap::new()), String::new());
    }

    #[test]
    fn test_event_text_from_nested_events() {
        let parameters = json!({
            "events": [
                {"parameters": {"transcript": "nested text"}}
            ]
        });
        assert_eq!(extract_event_text(&parameters), "nested text");
        assert_eq!(extract_event_text(&json!({})), "");
    }
}
