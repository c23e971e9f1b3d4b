//! Voice session client
//!
//! Owns one WebSocket connection to the concierge audio server together with
//! the microphone capture graph and the speech player.
//!
//! # Session Flow
//!
//! 1. `new()` - Build the session; nothing is acquired yet
//! 2. `connect()` - Open the WebSocket, start the player, emit `Ready`
//! 3. `start_recording()` / `stop_recording()` - Toggle outbound audio
//! 4. Inbound messages are dispatched to `SessionEvent`s as they arrive
//! 5. `close()` - Release the device, player, and connection (idempotent)
//!
//! There is no retry, reconnect, or connection timeout here; the caller
//! decides what to do after a `ConnectionFailed` or `Closed` event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::playback::{AudioOutput, OutputFactory, Player};
use super::protocol::{
    decode_pcm16, pcm16_from_bytes, ClientMessage, ServerMessage, CAPTURE_SAMPLE_RATE,
    PLAYBACK_SAMPLE_RATE,
};
use super::{ConnectionState, SessionError, SessionEvent};
use crate::audio::{i16_to_f32, AudioError, Capture, CpalInput, CpalOutput, InputDevice};
use crate::metrics::{ErrorRecord, MetricsSummary, SessionMetrics};
use crate::settings::AppSettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receiver for everything the session reports
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Configuration for a voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Audio server endpoint (`ws://` or `wss://`)
    pub url: String,
    /// Samples per outbound frame at 16kHz
    pub frame_samples: usize,
    /// Frames buffered between the audio thread and the socket
    pub frame_channel_capacity: usize,
    /// Rate of inbound speech audio
    pub playback_sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".to_string(),
            frame_samples: 1600,
            frame_channel_capacity: 64,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            url: settings.audio_url.clone(),
            frame_samples: settings.frame_samples.max(1),
            frame_channel_capacity: settings.frame_channel_capacity.max(1),
            playback_sample_rate: settings.playback_sample_rate,
        }
    }

    /// Duration of one outbound frame in milliseconds
    pub fn frame_duration_ms(&self) -> u64 {
        (self.frame_samples as u64 * 1000) / CAPTURE_SAMPLE_RATE as u64
    }
}

/// State shared with the background tasks
struct Shared {
    id: Uuid,
    config: SessionConfig,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    player: Mutex<Option<Player>>,
    capture: Mutex<Capture>,
    events: mpsc::UnboundedSender<SessionEvent>,
    metrics: Arc<SessionMetrics>,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening; the session keeps running
        let _ = self.events.send(event);
    }

    fn report(&self, err: SessionError) {
        self.metrics.record_error(err.category(), err.to_string());
        self.emit(SessionEvent::Error(err));
    }

    /// Encode and send one frame; reports and drops it if not connected
    async fn send_frame(&self, samples: &[i16]) -> Result<(), SessionError> {
        let json = ClientMessage::audio(samples).to_json()?;
        let connected = self.state() == ConnectionState::Connected;

        let mut writer = self.writer.lock().await;
        let sent = match writer.as_mut() {
            Some(write) if connected => Some(write.send(Message::Text(json)).await),
            _ => None,
        };
        drop(writer);

        match sent {
            None => {
                self.metrics.record_frame_unsent();
                let err = SessionError::SendWhileDisconnected;
                self.report(err.clone());
                return Err(err);
            }
            Some(Err(e)) => {
                let err = SessionError::SendFailed(e.to_string());
                log::warn!("VoiceSession {}: {}", self.id, err);
                self.report(err.clone());
                return Err(err);
            }
            Some(Ok(())) => {}
        }

        self.metrics.record_frame_sent();
        Ok(())
    }

    fn dispatch_text(&self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(msg) => {
                self.metrics.record_message();
                self.dispatch(msg);
            }
            Err(e) => self.protocol_error(e),
        }
    }

    fn dispatch_binary(&self, bytes: &[u8]) {
        match pcm16_from_bytes(bytes) {
            Ok(samples) => {
                self.metrics.record_message();
                self.enqueue_audio(&samples);
            }
            Err(e) => self.protocol_error(e),
        }
    }

    /// Route one inbound message to exactly one event
    fn dispatch(&self, msg: ServerMessage) {
        log::trace!("VoiceSession {}: <- {}", self.id, msg.kind());
        match msg {
            ServerMessage::Ready => self.emit(SessionEvent::ServerReady),
            ServerMessage::Audio { data } => match decode_pcm16(&data) {
                Ok(samples) => self.enqueue_audio(&samples),
                Err(e) => self.protocol_error(e),
            },
            ServerMessage::Text { data } => self.emit(SessionEvent::AssistantText(data)),
            ServerMessage::UserText { data } => self.emit(SessionEvent::UserText(data)),
            ServerMessage::Products { data } => {
                log::debug!("VoiceSession {}: {} products", self.id, data.len());
                self.emit(SessionEvent::Products(data));
            }
            ServerMessage::Log { data } => {
                log::debug!("Server: {}", data);
                self.emit(SessionEvent::Log(data));
            }
            ServerMessage::TurnComplete => self.emit(SessionEvent::TurnComplete),
            ServerMessage::BotSpeechStart => self.emit(SessionEvent::BotSpeechStart),
            ServerMessage::BotSpeechEnd => self.emit(SessionEvent::BotSpeechEnd),
        }
    }

    fn enqueue_audio(&self, samples: &[i16]) {
        self.metrics.record_audio_chunk();
        let floats = i16_to_f32(samples);

        let Ok(player) = self.player.lock() else {
            return;
        };
        match player.as_ref() {
            Some(player) => {
                if player.enqueue(floats, self.config.playback_sample_rate) {
                    log::debug!("VoiceSession {}: playback started", self.id);
                }
            }
            None => log::debug!("VoiceSession {}: no audio output, dropping chunk", self.id),
        }
    }

    fn protocol_error(&self, err: SessionError) {
        log::warn!("VoiceSession {}: ignoring message: {}", self.id, err);
        self.metrics.record_protocol_error();
        self.report(err);
    }

    /// Connection ended from the remote side (or the transport failed)
    fn remote_closed(&self) {
        let was_open = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let was_open = *state == ConnectionState::Connected;
            if was_open {
                *state = ConnectionState::Closed;
            }
            was_open
        };

        if was_open {
            log::info!("VoiceSession {}: closed by server", self.id);
            self.release_capture();
            self.emit(SessionEvent::Closed);
        }
    }

    /// Stop recording and give the microphone back
    fn release_capture(&self) {
        if let Ok(mut capture) = self.capture.lock() {
            capture.release();
        }
    }
}

/// One live voice conversation with the concierge
pub struct VoiceSession {
    shared: Arc<Shared>,
    frames_rx: Mutex<Option<mpsc::Receiver<Vec<i16>>>>,
    output_factory: Mutex<Option<OutputFactory>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    released: AtomicBool,
}

impl VoiceSession {
    /// Build a session over the given devices.
    ///
    /// `output` is `None` for sessions that never play audio; inbound audio
    /// is then counted and dropped.
    pub fn new(
        config: SessionConfig,
        input: Arc<dyn InputDevice>,
        output: Option<OutputFactory>,
    ) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_channel_capacity.max(1));
        let metrics = Arc::new(SessionMetrics::new());

        let capture = Capture::new(input, config.frame_samples, frames_tx, metrics.clone());
        let id = Uuid::new_v4();

        log::info!(
            "VoiceSession {}: created ({} samples per frame = {}ms)",
            id,
            config.frame_samples,
            config.frame_duration_ms()
        );

        let session = Self {
            shared: Arc::new(Shared {
                id,
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                player: Mutex::new(None),
                capture: Mutex::new(capture),
                events: events_tx,
                metrics,
                cancel: CancellationToken::new(),
            }),
            frames_rx: Mutex::new(Some(frames_rx)),
            output_factory: Mutex::new(output),
            tasks: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        };

        (session, events_rx)
    }

    /// Session using the default microphone and speaker
    pub fn with_default_devices(config: SessionConfig) -> (Self, EventReceiver) {
        let output: OutputFactory = Box::new(|| -> Result<Box<dyn AudioOutput>, AudioError> {
            Ok(Box::new(CpalOutput::open()?))
        });
        Self::new(config, Arc::new(CpalInput::new()), Some(output))
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_recording(&self) -> bool {
        self.shared
            .capture
            .lock()
            .map(|c| c.is_recording())
            .unwrap_or(false)
    }

    pub fn is_playing(&self) -> bool {
        self.shared
            .player
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(|p| p.is_playing()))
            .unwrap_or(false)
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.shared.metrics.get_summary()
    }

    /// Errors reported during this session, oldest first
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.shared.metrics.get_errors()
    }

    /// Open the connection to the configured endpoint.
    ///
    /// Emits `Ready` on success or `Error(ConnectionFailed)` on failure.
    /// Calling it again once connected is a no-op; calling it while another
    /// call is still connecting returns `Err(ConnectInProgress)`. If
    /// `close()` runs while this is in flight, the connection is abandoned,
    /// anything it set up is released, and `Err(Closed)` is returned.
    pub async fn connect(&self) -> Result<(), SessionError> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|_| SessionError::Closed)?;
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                ConnectionState::Closed => return Err(SessionError::Closed),
                ConnectionState::Connecting => return Err(SessionError::ConnectInProgress),
                ConnectionState::Connected => return Ok(()),
            }
        }

        self.ensure_sender();
        let url = self.shared.config.url.clone();
        log::info!("VoiceSession {}: connecting to {}...", self.shared.id, url);

        let connected = tokio::select! {
            _ = self.shared.cancel.cancelled() => {
                log::info!("VoiceSession {}: closed while connecting", self.shared.id);
                return Err(SessionError::Closed);
            }
            result = connect_async(url.as_str()) => result,
        };

        let ws_stream = match connected {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                let err = SessionError::ConnectionFailed(e.to_string());
                log::warn!("VoiceSession {}: {}", self.shared.id, err);
                if self.shared.state() == ConnectionState::Connecting {
                    self.shared.set_state(ConnectionState::Disconnected);
                }
                self.shared.report(err.clone());
                return Err(err);
            }
        };

        let (mut write, read) = ws_stream.split();

        {
            // Holding the writer lock orders this against close()
            let mut writer = self.shared.writer.lock().await;
            let closed = {
                let mut state = self
                    .shared
                    .state
                    .lock()
                    .map_err(|_| SessionError::Closed)?;
                if *state == ConnectionState::Closed {
                    true
                } else {
                    *state = ConnectionState::Connected;
                    false
                }
            };
            if closed {
                drop(writer);
                let _ = write.close().await;
                log::info!(
                    "VoiceSession {}: closed during handshake, dropping connection",
                    self.shared.id
                );
                return Err(SessionError::Closed);
            }
            *writer = Some(write);
        }

        self.start_player().await;

        // close() cancels before it takes the player or the writer, so under
        // the writer lock either this sees the cancel or close() sees the task
        let _writer = self.shared.writer.lock().await;
        if self.shared.cancel.is_cancelled() {
            let player = self.shared.player.lock().ok().and_then(|mut p| p.take());
            if let Some(mut player) = player {
                player.stop();
            }
            log::info!(
                "VoiceSession {}: closed during player setup, dropping connection",
                self.shared.id
            );
            return Err(SessionError::Closed);
        }

        let reader = tokio::spawn(run_reader(self.shared.clone(), read));
        self.track(reader);

        log::info!("VoiceSession {}: connected", self.shared.id);
        self.shared.emit(SessionEvent::Ready);
        Ok(())
    }

    /// Start sending microphone audio.
    ///
    /// The device is acquired on the first call only; later calls resume
    /// the existing capture graph.
    pub fn start_recording(&self) -> Result<(), SessionError> {
        self.ensure_sender();

        if self.shared.state() == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }

        let mut capture = self.shared.capture.lock().map_err(|_| SessionError::Closed)?;
        match capture.start() {
            Ok(acquired) => {
                if acquired {
                    log::info!("VoiceSession {}: microphone acquired", self.shared.id);
                }
                Ok(())
            }
            Err(e) => {
                drop(capture);
                let err = SessionError::Device(e);
                log::warn!("VoiceSession {}: {}", self.shared.id, err);
                self.shared.report(err.clone());
                Err(err)
            }
        }
    }

    /// Stop sending audio; the microphone stays acquired
    pub fn stop_recording(&self) {
        if let Ok(mut capture) = self.shared.capture.lock() {
            capture.stop();
        }
    }

    /// Send one PCM16 frame directly.
    ///
    /// Reports `SendWhileDisconnected` and drops the frame if no connection
    /// is open.
    pub async fn send_audio(&self, samples: &[i16]) -> Result<(), SessionError> {
        self.shared.send_frame(samples).await
    }

    /// Release the microphone, the player, and the connection.
    ///
    /// Safe to call repeatedly and before `connect()`; only the first call
    /// does anything.
    pub async fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.set_state(ConnectionState::Closed);
        self.shared.cancel.cancel();

        self.shared.release_capture();

        let player = self.shared.player.lock().ok().and_then(|mut p| p.take());
        if let Some(mut player) = player {
            player.stop();
        }

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut write) = writer {
            if let Err(e) = write.close().await {
                log::warn!("VoiceSession {}: error closing WebSocket: {}", self.shared.id, e);
            }
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        log::info!("VoiceSession {}: closed", self.shared.id);
    }

    /// Spawn the frame sender once a runtime is available
    fn ensure_sender(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let Some(rx) = self.frames_rx.lock().ok().and_then(|mut r| r.take()) else {
            return;
        };
        let sender = tokio::spawn(run_sender(self.shared.clone(), rx));
        self.track(sender);
    }

    async fn start_player(&self) {
        let Some(factory) = self.output_factory.lock().ok().and_then(|mut f| f.take()) else {
            return;
        };

        let spawned = tokio::task::spawn_blocking(move || Player::spawn(factory)).await;
        match spawned {
            Ok(Ok(player)) => {
                if let Ok(mut slot) = self.shared.player.lock() {
                    *slot = Some(player);
                }
            }
            Ok(Err(e)) => {
                let err = SessionError::Device(e);
                log::warn!("VoiceSession {}: playback unavailable: {}", self.shared.id, err);
                self.shared.report(err);
            }
            Err(e) => {
                log::error!("VoiceSession {}: player setup panicked: {}", self.shared.id, e);
            }
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        // Player releases its device in its own Drop impl
        self.shared.cancel.cancel();
        self.shared.release_capture();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Forward captured frames to the socket until the session is cancelled
async fn run_sender(shared: Arc<Shared>, mut rx: mpsc::Receiver<Vec<i16>>) {
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        // Failures are already reported as events
        let _ = shared.send_frame(&frame).await;
    }
    log::debug!("VoiceSession {}: sender exiting", shared.id);
}

/// Read and dispatch inbound messages until the connection ends
async fn run_reader(shared: Arc<Shared>, mut read: SplitStream<WsStream>) {
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            next = read.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => shared.dispatch_text(&text),
            Some(Ok(Message::Binary(bytes))) => shared.dispatch_binary(&bytes),
            Some(Ok(Message::Close(frame))) => {
                log::info!("VoiceSession {}: server sent close {:?}", shared.id, frame);
                break;
            }
            Some(Ok(_)) => {} // ping/pong
            Some(Err(e)) => {
                if shared.state() == ConnectionState::Connected {
                    shared.report(SessionError::Disconnected(e.to_string()));
                }
                break;
            }
            None => break,
        }
    }

    shared.remote_closed();
    log::debug!("VoiceSession {}: reader exiting", shared.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.frame_samples, 1600);
        assert_eq!(config.playback_sample_rate, 24000);
        assert_eq!(config.frame_duration_ms(), 100);
    }

    #[test]
    fn test_session_config_from_settings() {
        let settings = AppSettings {
            audio_url: "ws://example:9000".to_string(),
            frame_samples: 0,
            ..Default::default()
        };
        let config = SessionConfig::from_settings(&settings);
        assert_eq!(config.url, "ws://example:9000");
        // Zero would stall the framing loop
        assert_eq!(config.frame_samples, 1);
    }
}
