// Decoder console module
// Facade over the decoder strategy set: one lifecycle API per session,
// per-device exclusivity, bounded one-shot fallback on failure

use crate::decoder::{
    create_backend, fallback_after, select_decoder, DecodeBackend, DecoderConfig, DecoderError,
    DecoderType, DeviceCapabilities, MediaFrame,
};
use crate::events::{self, DecoderEvent, EventReceiver, EventSender};
use crate::surface::RenderSurface;
use crate::transport::{StreamConnection, StreamSource, TransportError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),
    #[error("All decoders failed: {0}")]
    DecodersExhausted(String),
}

/// Session lifecycle states
///
/// `Disconnected` and `Failed` are terminal; a fresh session is required
/// afterwards, sessions are never resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Connected,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Event sender parked until `start` hands it to the driver
struct PendingStart {
    events: EventSender,
}

struct SessionInner {
    id: SessionId,
    config: DecoderConfig,
    decoder: Mutex<DecoderType>,
    state: Mutex<SessionState>,
    frame_count: AtomicU64,
    stopping: AtomicBool,
    stop_requested: Notify,
    join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    pending: Mutex<Option<PendingStart>>,
    surface: Arc<dyn RenderSurface>,
    source: Arc<dyn StreamSource>,
}

impl SessionInner {
    /// Terminal states stick; everything else follows the driver
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = next;
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Wire the pipeline: connect the transport, initialize the back-end.
    /// A decoder that fails to initialize gets one silent fallback attempt.
    fn wire(&self) -> Result<(StreamConnection, Box<dyn DecodeBackend>, Option<String>), ConsoleError> {
        let conn = self.source.connect(&self.config)?;

        let primary = *self.decoder.lock();
        let mut backend = create_backend(primary);
        let first_err = match backend.init(&self.config, self.surface.as_ref()) {
            Ok(()) => {
                log::info!(
                    "Session {} using {} for device {}",
                    self.id,
                    backend.info(),
                    self.config.device_id
                );
                return Ok((conn, backend, None));
            }
            Err(e) => e,
        };

        let Some(next) = fallback_after(primary) else {
            return Err(first_err.into());
        };
        log::warn!(
            "Decoder {} failed to initialize ({}), falling back to {}",
            primary,
            first_err,
            next
        );

        let mut backend = create_backend(next);
        if let Err(second_err) = backend.init(&self.config, self.surface.as_ref()) {
            return Err(ConsoleError::DecodersExhausted(format!(
                "{}: {}; {}: {}",
                primary, first_err, next, second_err
            )));
        }
        *self.decoder.lock() = next;
        log::info!(
            "Session {} using {} for device {}",
            self.id,
            backend.info(),
            self.config.device_id
        );
        Ok((conn, backend, Some(format!("{}: {}", primary, first_err))))
    }

    /// Begin consuming the stream. Returns once the pipeline is wired;
    /// `Connected` arrives asynchronously with the first rendered frame.
    /// All failure is reported through the event channel.
    async fn start(self: &Arc<Self>) {
        let Some(pending) = self.pending.lock().take() else {
            return; // already started, or stopped before starting
        };
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        self.set_state(SessionState::Starting);
        let events = pending.events;

        match self.wire() {
            Ok((conn, backend, fallback_cause)) => {
                let driver = Driver {
                    inner: self.clone(),
                    conn,
                    backend,
                    events,
                    connected: false,
                    fallback_used: fallback_cause.is_some(),
                    fallback_cause,
                };
                let handle = tokio::spawn(driver.run());
                *self.join.lock().await = Some(handle);
            }
            Err(e) => {
                log::error!("Session {} failed to start: {}", self.id, e);
                events.emit(DecoderEvent::error(e.to_string()));
                self.set_state(SessionState::Failed);
                // dropping the sender closes the event channel
            }
        }
    }

    /// Tear the session down. Idempotent; once this resolves no further
    /// event is delivered and nothing remains bound to the surface.
    async fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::SeqCst);
        // A session that never started still holds its event sender
        drop(self.pending.lock().take());
        self.stop_requested.notify_one();

        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.set_state(SessionState::Disconnected);
    }
}

/// Per-session pipeline task: transport chunks in, surface frames out,
/// lifecycle events to the host
struct Driver {
    inner: Arc<SessionInner>,
    conn: StreamConnection,
    backend: Box<dyn DecodeBackend>,
    events: EventSender,
    connected: bool,
    fallback_used: bool,
    /// Cause of a consumed fallback, kept for the terminal cause chain
    fallback_cause: Option<String>,
}

enum ChunkOutcome {
    Continue,
    Ended,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.inner.stop_requested.notified() => None,
                chunk = self.conn.recv() => Some(chunk),
            };

            match next {
                // Caller-initiated teardown: no events past this point
                None => {
                    log::debug!("Session {} stopped by request", self.inner.id);
                    self.inner.surface.clear();
                    self.inner.set_state(SessionState::Disconnected);
                    return;
                }
                Some(Some(chunk)) => {
                    if matches!(self.handle_chunk(&chunk.data), ChunkOutcome::Ended) {
                        return;
                    }
                }
                Some(None) => {
                    self.handle_remote_end();
                    return;
                }
            }
        }
    }

    fn handle_chunk(&mut self, data: &[u8]) -> ChunkOutcome {
        match self.backend.push(data) {
            Ok(frames) => self.submit_frames(frames),
            Err(e) if e.is_transient() => {
                // The back-end resynchronizes on its own; the session stays up
                log::warn!("Session {} stream fault: {}", self.inner.id, e);
                self.events.emit(DecoderEvent::error(e.to_string()));
                ChunkOutcome::Continue
            }
            Err(e) => self.terminal_decoder_fault(e.to_string()),
        }
    }

    fn submit_frames(&mut self, frames: Vec<MediaFrame>) -> ChunkOutcome {
        for frame in frames {
            if let Err(e) = self.inner.surface.submit(frame) {
                return self.terminal_decoder_fault(format!("surface: {}", e));
            }
            self.inner.frame_count.fetch_add(1, Ordering::Relaxed);
            if !self.connected {
                self.connected = true;
                self.inner.set_state(SessionState::Connected);
                self.events.emit(DecoderEvent::Connected);
            }
        }
        ChunkOutcome::Continue
    }

    /// Unrecoverable decoder-path fault: one silent fallback per session,
    /// then a terminal error carrying the chain of variants tried
    fn terminal_decoder_fault(&mut self, cause: String) -> ChunkOutcome {
        let current = *self.inner.decoder.lock();

        if !self.fallback_used {
            if let Some(next) = fallback_after(current) {
                let mut backend = create_backend(next);
                match backend.init(&self.inner.config, self.inner.surface.as_ref()) {
                    Ok(()) => {
                        log::warn!(
                            "Decoder {} failed ({}), switching session {} to {}",
                            current,
                            cause,
                            self.inner.id,
                            next
                        );
                        *self.inner.decoder.lock() = next;
                        self.backend = backend;
                        self.fallback_used = true;
                        self.fallback_cause = Some(format!("{}: {}", current, cause));
                        return ChunkOutcome::Continue;
                    }
                    Err(e) => {
                        return self.fail(format!("{}: {}; {}: {}", current, cause, next, e));
                    }
                }
            }
        }

        let chain = match &self.fallback_cause {
            Some(prior) => format!("{}; {}: {}", prior, current, cause),
            None => format!("{}: {}", current, cause),
        };
        self.fail(chain)
    }

    fn fail(&mut self, cause: String) -> ChunkOutcome {
        log::error!("Session {} failed: {}", self.inner.id, cause);
        self.events.emit(DecoderEvent::error(cause));
        self.events.emit(DecoderEvent::Disconnected);
        self.inner.surface.clear();
        self.inner.set_state(SessionState::Failed);
        ChunkOutcome::Ended
    }

    /// The remote side ended the stream
    fn handle_remote_end(&mut self) {
        let frames = self.backend.flush();
        if matches!(self.submit_frames(frames), ChunkOutcome::Ended) {
            return;
        }

        if self.connected {
            log::info!("Session {} stream ended", self.inner.id);
        } else {
            // Closed before the first frame: that is a fault, not a clean end
            self.events
                .emit(DecoderEvent::error("Stream closed before first frame"));
        }
        self.events.emit(DecoderEvent::Disconnected);
        self.inner.surface.clear();
        self.inner.set_state(SessionState::Disconnected);
    }
}

/// Host-facing handle to one live decode session
pub struct SessionHandle {
    inner: Arc<SessionInner>,
    events: Option<EventReceiver>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn device_id(&self) -> u64 {
        self.inner.config.device_id
    }

    /// The back-end currently serving the session; may change once if the
    /// console fell back after a failure
    pub fn decoder_type(&self) -> DecoderType {
        *self.inner.decoder.lock()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Frames handed to the surface so far
    pub fn frame_count(&self) -> u64 {
        self.inner.frame_count.load(Ordering::Relaxed)
    }

    /// Take the event channel; the host owns it from here on
    pub fn events(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }

    /// Begin consuming the stream; a no-op if already started or stopped
    pub async fn start(&self) {
        self.inner.start().await;
    }

    /// Tear the session down; idempotent, and once it resolves no further
    /// event is delivered
    pub async fn stop(&self) {
        self.inner.stop().await;
    }
}

/// The decoder facade: hides back-end selection behind one lifecycle API
/// and enforces at most one active session per device
pub struct DecoderConsole {
    source: Arc<dyn StreamSource>,
    sessions: Mutex<HashMap<u64, Arc<SessionInner>>>,
}

impl DecoderConsole {
    pub fn new(source: Arc<dyn StreamSource>) -> Self {
        Self {
            source,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session with the default decoder selection
    pub async fn create_session(
        &self,
        config: DecoderConfig,
        surface: Arc<dyn RenderSurface>,
    ) -> SessionHandle {
        self.create_session_with(config, surface, None, None).await
    }

    /// Create a session, choosing the back-end from the caller's preference
    /// and the device's reported capabilities
    ///
    /// Any prior session for the same device is torn down first, so the
    /// transport subscription and the surface are never claimed twice.
    pub async fn create_session_with(
        &self,
        config: DecoderConfig,
        surface: Arc<dyn RenderSurface>,
        capabilities: Option<&DeviceCapabilities>,
        preferred: Option<DecoderType>,
    ) -> SessionHandle {
        let decoder = select_decoder(capabilities, preferred);

        let prior = self.sessions.lock().remove(&config.device_id);
        if let Some(prior) = prior {
            log::info!(
                "Replacing session {} for device {}",
                prior.id,
                config.device_id
            );
            prior.stop().await;
        }

        let (events_tx, events_rx) = events::channel();
        let auto_start = config.auto_start;
        let inner = Arc::new(SessionInner {
            id: SessionId::new(),
            config,
            decoder: Mutex::new(decoder),
            state: Mutex::new(SessionState::Idle),
            frame_count: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            stop_requested: Notify::new(),
            join: tokio::sync::Mutex::new(None),
            pending: Mutex::new(Some(PendingStart { events: events_tx })),
            surface,
            source: self.source.clone(),
        });

        self.sessions
            .lock()
            .insert(inner.config.device_id, inner.clone());
        log::info!(
            "Created session {} for device {} ({})",
            inner.id,
            inner.config.device_id,
            decoder
        );

        let handle = SessionHandle {
            inner,
            events: Some(events_rx),
        };
        if auto_start {
            handle.start().await;
        }
        handle
    }

    /// Stop and forget the session for a device, if any
    pub async fn stop_session(&self, device_id: u64) -> bool {
        let session = self.sessions.lock().remove(&device_id);
        match session {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop().await;
        }
    }

    /// Whether the device has a session that is not in a terminal state
    pub fn is_active(&self, device_id: u64) -> bool {
        self.sessions
            .lock()
            .get(&device_id)
            .map(|s| !s.state().is_terminal())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| !s.state().is_terminal())
            .count()
    }
}
