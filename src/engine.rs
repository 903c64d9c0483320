//! Public engine API
//!
//! An [`Engine`] owns the session table for one local identity. Every
//! operation can be called from any thread; the engine hands work to the
//! per-session worker threads and blocks only where the call is documented
//! to block (`connect`, `listen`, `send_data`, `recv_data`, `recv_frame`).
//!
//! ```text
//!  application threads                 engine                   session threads
//!  ───────────────────                 ──────                   ───────────────
//!  connect ───────────────▶ table.insert ─ spawn ─────────────▶ rtc-session-<h>
//!     ▲                                                             │
//!     └──────────── done gate ◀──────── Stream / Failed ────────────┘
//!  set_signaling ─────────▶ decode + auth ─ route by session_id ──▶ inbox
//!  listen ◀─────────────── accept queue ◀──────── callee reached Stream
//! ```
//!
//! Façade callbacks are never invoked with the table or accept locks held.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::channel::{BufferStatus, ChannelSet};
use crate::config::{Options, ID_LEN_MAX};
use crate::credential::{Credentials, HashAlgorithm};
use crate::error::{Result, RtcError};
use crate::facade::Facade;
use crate::logging;
use crate::misc;
use crate::p2p::signaling::{self, Envelope, Header, Offer, SignalingBody};
use crate::session::{
    ActiveState, AudioCodec, ConnectionType, Frame, Role, SessionHandle, SessionInfo, VideoCodec,
};
use crate::sync::lock;
use crate::table::SlotTable;
use crate::worker::{self, Event, MediaInfo, SessionCore, SessionSpec, Start};

// ============================================================================
// Constants
// ============================================================================

/// Capability bits reported by [`Engine::skill`]
pub const SKILL_P2P: u32 = 1 << 0;
pub const SKILL_WEBRTC: u32 = 1 << 1;
pub const SKILL_PRECONNECT: u32 = 1 << 2;
pub const SKILL_LAN: u32 = 1 << 3;

/// Slack on top of the connect timeout for the worker to notice its deadline
const CONNECT_GRACE: Duration = Duration::from_millis(300);

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Local ids of running engines
static LIVE_IDS: Mutex<Vec<String>> = Mutex::new(Vec::new());

// ============================================================================
// Connect Request
// ============================================================================

/// Parameters of an outgoing session
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub remote_id: String,
    /// Relay token JSON; empty fetches one through `Facade::on_http` (or none in LAN mode)
    pub token: String,
    pub timeout_ms: u64,
    pub trace_id: Option<String>,
    /// Device id for the token request, defaults to `remote_id`
    pub dev_id: String,
    /// Caller capabilities forwarded in the offer
    pub skill: String,
    pub lan_mode: bool,
    pub connection_type: ConnectionType,
    pub audio_codec: Option<AudioCodec>,
    pub video_codec: Option<VideoCodec>,
    pub stream_type: i32,
    pub is_replay: bool,
    pub start_time: u64,
    pub end_time: u64,
}

impl ConnectRequest {
    pub fn new(remote_id: &str, timeout_ms: u64) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            timeout_ms,
            ..Default::default()
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > ID_LEN_MAX {
        return Err(RtcError::InvalidId);
    }
    Ok(())
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Default)]
struct AcceptQueue {
    ready: VecDeque<SessionHandle>,
    break_pending: bool,
    closed: bool,
}

/// State shared by the engine handle and its session threads
pub(crate) struct Shared {
    pub options: Options,
    pub facade: Arc<dyn Facade>,
    log_id: u64,
    sessions: Mutex<SlotTable<Arc<SessionCore>>>,
    accept: Mutex<AcceptQueue>,
    accept_ready: Condvar,
}

impl Shared {
    fn start(options: Options, facade: Arc<dyn Facade>) -> Result<Arc<Self>> {
        let options = options.normalize()?;
        {
            let mut live = lock(&LIVE_IDS);
            if live.iter().any(|id| *id == options.local_id) {
                return Err(RtcError::AlreadyInitialized);
            }
            live.push(options.local_id.clone());
        }

        let log_id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        logging::attach(log_id, Arc::clone(&facade));
        log::info!(
            "Engine {} started: {} sessions, {} channels, preconnect {}",
            options.local_id,
            options.max_session_number,
            options.max_channel_number,
            options.preconnect_enable
        );
        Ok(Arc::new(Self {
            sessions: Mutex::new(SlotTable::new(options.max_session_number as usize)),
            options,
            facade,
            log_id,
            accept: Mutex::new(AcceptQueue::default()),
            accept_ready: Condvar::new(),
        }))
    }

    /// Close every session with `reason` and wait for the session threads
    fn shutdown(&self, reason: RtcError) {
        {
            let mut accept = lock(&self.accept);
            accept.closed = true;
            accept.ready.clear();
        }
        self.accept_ready.notify_all();

        let sessions = lock(&self.sessions).drain();
        log::info!("Engine {} stopping, closing {} sessions", self.options.local_id, sessions.len());
        for session in &sessions {
            session.channels.close_all(reason);
            session.frames.close(reason);
            session.post(Event::Close {
                error: reason,
                code: reason.code(),
            });
        }
        let current = thread::current().id();
        for session in &sessions {
            if let Some(handle) = session.take_thread() {
                if handle.thread().id() != current && handle.join().is_err() {
                    log::error!("Session {} thread panicked", session.handle);
                }
            }
        }

        lock(&LIVE_IDS).retain(|id| *id != self.options.local_id);
        logging::detach(self.log_id);
    }

    fn session(&self, handle: SessionHandle) -> Result<Arc<SessionCore>> {
        lock(&self.sessions)
            .get(handle)
            .cloned()
            .ok_or(RtcError::InvalidHandle)
    }

    fn select(&self, filter: impl Fn(&SessionCore) -> bool) -> Vec<Arc<SessionCore>> {
        lock(&self.sessions)
            .iter()
            .filter(|s| filter(s))
            .cloned()
            .collect()
    }

    fn remove(&self, handle: SessionHandle) -> Option<Arc<SessionCore>> {
        lock(&self.sessions).remove(handle)
    }

    /// Insert a new session; `pre_quota` caps live caller pre-sessions
    fn insert(&self, spec: SessionSpec, pre_quota: Option<usize>) -> Result<Arc<SessionCore>> {
        let mut table = lock(&self.sessions);
        if let Some(quota) = pre_quota {
            let live = table
                .iter()
                .filter(|s| s.is_pre && s.role == Role::Caller && s.lifecycle().error.is_none())
                .count();
            if live >= quota {
                return Err(RtcError::MaxSessionExceeded);
            }
        }
        let channels = ChannelSet::new(&self.options);
        let handle = table.insert_with(|handle| Arc::new(SessionCore::new(handle, spec, channels)))?;
        table.get(handle).cloned().ok_or(RtcError::InvalidHandle)
    }

    /// Hand a callee session to `listen`
    pub(crate) fn enqueue_accept(&self, session: &SessionCore) {
        {
            let mut accept = lock(&self.accept);
            if accept.closed || accept.ready.contains(&session.handle) {
                return;
            }
            accept.ready.push_back(session.handle);
        }
        log::debug!("Session {} ready for listen", session.handle);
        self.accept_ready.notify_all();
    }

    /// Drop a session nobody holds a handle to
    pub(crate) fn reap(&self, session: &SessionCore) {
        let mut table = lock(&self.sessions);
        let same = table
            .get(session.handle)
            .map(|s| std::ptr::eq(Arc::as_ptr(s), session))
            .unwrap_or(false);
        if same {
            table.remove(session.handle);
            log::debug!("Session {} reaped", session.handle);
        }
    }

    fn next_accepted(&self) -> Result<SessionHandle> {
        let mut accept = lock(&self.accept);
        loop {
            if accept.closed {
                return Err(RtcError::NotInitialized);
            }
            if accept.break_pending {
                accept.break_pending = false;
                return Err(RtcError::ListenBreak);
            }
            while let Some(handle) = accept.ready.pop_front() {
                if let Ok(session) = self.session(handle) {
                    if session.lifecycle().error.is_none() {
                        session.mark_delivered();
                        return Ok(handle);
                    }
                }
            }
            accept = self
                .accept_ready
                .wait(accept)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Live caller pre-session to `remote_id`
    fn pre_session(&self, remote_id: &str) -> Option<Arc<SessionCore>> {
        self.select(|s| {
            s.is_pre && s.role == Role::Caller && s.remote_id == remote_id && s.lifecycle().error.is_none()
        })
        .into_iter()
        .next()
    }

    fn spawn(self: &Arc<Self>, session: &Arc<SessionCore>, start: Start) -> Result<()> {
        if let Err(e) = worker::spawn(Arc::clone(self), Arc::clone(session), start) {
            self.remove(session.handle);
            return Err(e);
        }
        Ok(())
    }

    fn report(&self, session: &SessionCore) {
        self.facade.on_session_state(&session.event());
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Session engine for one local identity
///
/// Cloning gives another handle to the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<RwLock<Option<Arc<Shared>>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local_id = self.current().map(|s| s.options.local_id.clone()).ok();
        f.debug_struct("Engine").field("local_id", &local_id).finish()
    }
}

impl Engine {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Validate `options` and start an engine for `options.local_id`
    ///
    /// Fails with `AlreadyInitialized` while another engine runs with the
    /// same local id.
    pub fn init(options: Options, facade: Arc<dyn Facade>) -> Result<Self> {
        let shared = Shared::start(options, facade)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Some(shared))),
        })
    }

    fn current(&self) -> Result<Arc<Shared>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RtcError::NotInitialized)
    }

    fn take(&self) -> Option<Arc<Shared>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_initialized(&self) -> bool {
        self.current().is_ok()
    }

    /// Close every session and stop; later calls fail `NotInitialized`
    pub fn deinit(&self) -> Result<()> {
        let shared = self.take().ok_or(RtcError::NotInitialized)?;
        shared.shutdown(RtcError::SessionClosedExplicit);
        Ok(())
    }

    /// Drop every session (they fail with `Reset`) and restart with `options`
    ///
    /// Invalid `options` are rejected before anything is torn down.
    pub fn reset(&self, options: Options) -> Result<()> {
        self.current()?;
        let options = options.normalize()?;
        let old = self.take().ok_or(RtcError::NotInitialized)?;
        old.shutdown(RtcError::Reset);
        let fresh = Shared::start(options, Arc::clone(&old.facade))?;
        log::info!(
            "Engine {} reset as {} ({} sessions, {} channels)",
            old.options.local_id,
            fresh.options.local_id,
            fresh.options.max_session_number,
            fresh.options.max_channel_number
        );
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(fresh);
        Ok(())
    }

    pub fn options(&self) -> Result<Options> {
        Ok(self.current()?.options.clone())
    }

    // ------------------------------------------------------------------
    // Outgoing sessions
    // ------------------------------------------------------------------

    /// Open a session to `remote_id`, blocking until it streams or fails
    pub fn connect(
        &self,
        remote_id: &str,
        token: &str,
        trace_id: Option<&str>,
        lan_mode: bool,
        timeout_ms: u64,
    ) -> Result<SessionHandle> {
        self.connect_with(ConnectRequest {
            remote_id: remote_id.to_string(),
            token: token.to_string(),
            trace_id: trace_id.map(str::to_string),
            lan_mode,
            timeout_ms,
            ..Default::default()
        })
    }

    /// [`Engine::connect`] with device, media and replay parameters
    pub fn connect_with(&self, request: ConnectRequest) -> Result<SessionHandle> {
        let shared = self.current()?;
        validate_id(&request.remote_id)?;
        if request.timeout_ms == 0 {
            return Err(RtcError::InvalidParameter);
        }

        if let Some(session) = self.take_over_pre_session(&shared, &request.remote_id) {
            log::info!("Session {}: pre-session to {} taken over", session.handle, request.remote_id);
            return Ok(session.handle);
        }

        let started = misc::now_ms();
        let credentials = Credentials::generate(HashAlgorithm::Sha256)?;
        let timeout = Duration::from_millis(request.timeout_ms);
        let deadline = Instant::now() + timeout;
        let session = shared.insert(
            SessionSpec {
                remote_id: request.remote_id.clone(),
                role: Role::Caller,
                is_pre: false,
                session_id: signaling::generate_session_id(),
                trace_id: request.trace_id.clone(),
                dev_id: request.dev_id.clone(),
                lan_mode: request.lan_mode,
                media: MediaInfo::from_request(&request),
            },
            None,
        )?;
        let handle = session.handle;
        log::info!(
            "Session {}: connecting to {} (timeout {} ms, lan {})",
            handle,
            request.remote_id,
            request.timeout_ms,
            request.lan_mode
        );
        shared.spawn(
            &session,
            Start::Caller {
                request,
                credentials,
                deadline,
            },
        )?;

        if !session.done.wait_timeout(timeout + CONNECT_GRACE) {
            session.post(Event::Cancel(RtcError::Timeout));
        }
        let lifecycle = session.lifecycle();
        if lifecycle.is_streaming() && lifecycle.error.is_none() {
            log::info!("Session {}: connected in {} ms", handle, misc::now_ms() - started);
            return Ok(handle);
        }
        shared.remove(handle);
        let err = lifecycle.error.unwrap_or(RtcError::Timeout);
        log::warn!("Session {}: connect failed: {}", handle, err);
        Err(err)
    }

    fn take_over_pre_session(&self, shared: &Shared, remote_id: &str) -> Option<Arc<SessionCore>> {
        let session = shared.pre_session(remote_id)?;
        if !session.lifecycle().is_streaming() || session.is_in_use() {
            return None;
        }
        session.set_in_use(true);
        if matches!(
            session.lifecycle().active_state,
            ActiveState::NotActive | ActiveState::Suspending
        ) {
            session.set_active(ActiveState::Activating);
            shared.report(&session);
        }
        session.post(Event::Activate { in_use: true });
        Some(session)
    }

    /// Start negotiating a pre-session to `remote_id` in the background
    ///
    /// `dev_id` names the device in the token request (empty: `remote_id`).
    /// A suspended pre-session to the same remote is resumed instead.
    pub fn pre_connect(&self, remote_id: &str, dev_id: &str) -> Result<SessionHandle> {
        let shared = self.current()?;
        if !shared.options.preconnect_enable {
            return Err(RtcError::PreconnectUnsupported);
        }
        validate_id(remote_id)?;
        if dev_id.len() > ID_LEN_MAX {
            return Err(RtcError::InvalidId);
        }

        if let Some(session) = shared.pre_session(remote_id) {
            return match session.lifecycle().active_state {
                ActiveState::Activating | ActiveState::Active => Err(RtcError::PreSessionAlreadyActive),
                ActiveState::NotActive | ActiveState::Suspending => {
                    log::info!("Session {}: resuming pre-session to {}", session.handle, remote_id);
                    session.set_active(ActiveState::Activating);
                    shared.report(&session);
                    session.post(Event::Activate { in_use: false });
                    Ok(session.handle)
                }
            };
        }

        let credentials = Credentials::generate(HashAlgorithm::Sha256)?;
        let request = ConnectRequest {
            dev_id: dev_id.to_string(),
            ..ConnectRequest::new(remote_id, shared.options.accept_timeout_ms)
        };
        let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
        let session = shared.insert(
            SessionSpec {
                remote_id: remote_id.to_string(),
                role: Role::Caller,
                is_pre: true,
                session_id: signaling::generate_session_id(),
                trace_id: None,
                dev_id: request.dev_id.clone(),
                lan_mode: false,
                media: MediaInfo::from_request(&request),
            },
            Some(shared.options.max_pre_session_number as usize),
        )?;
        log::info!("Session {}: pre-connecting to {}", session.handle, remote_id);
        shared.spawn(
            &session,
            Start::Caller {
                request,
                credentials,
                deadline,
            },
        )?;
        Ok(session.handle)
    }

    /// Tear down the pre-sessions to `remote_id`, sending `reason` to the peer
    pub fn pre_connect_close(&self, remote_id: &str, reason: i32) -> Result<()> {
        let shared = self.current()?;
        let sessions = shared.select(|s| s.is_pre && s.role == Role::Caller && s.remote_id == remote_id);
        if sessions.is_empty() {
            return Err(RtcError::InvalidPreSession);
        }
        for session in sessions {
            log::info!("Session {}: pre-session closed", session.handle);
            shared.remove(session.handle);
            Self::close_session(&session, reason);
        }
        Ok(())
    }

    /// Abort every outgoing session still negotiating
    pub fn connect_break(&self) -> Result<()> {
        let shared = self.current()?;
        let sessions = shared.select(|s| s.role == Role::Caller && Self::is_negotiating(s));
        log::info!("Breaking {} pending connects", sessions.len());
        for session in sessions {
            session.post(Event::Cancel(RtcError::ConnectBreak));
        }
        Ok(())
    }

    /// Abort outgoing sessions with `trace_id` that are still negotiating
    pub fn connect_break_one(&self, trace_id: &str) -> Result<()> {
        let shared = self.current()?;
        let sessions = shared.select(|s| {
            s.role == Role::Caller && s.trace_id.as_deref() == Some(trace_id) && Self::is_negotiating(s)
        });
        log::info!("Breaking {} pending connects with trace {}", sessions.len(), trace_id);
        for session in sessions {
            session.post(Event::Cancel(RtcError::ConnectBreak));
        }
        Ok(())
    }

    fn is_negotiating(session: &SessionCore) -> bool {
        let lifecycle = session.lifecycle();
        lifecycle.error.is_none() && !lifecycle.is_streaming()
    }

    // ------------------------------------------------------------------
    // Incoming sessions
    // ------------------------------------------------------------------

    /// Block until a remote-initiated session reaches `Stream`
    pub fn listen(&self) -> Result<SessionHandle> {
        self.current()?.next_accepted()
    }

    /// Make one pending (or the next) `listen` return `ListenBreak`
    pub fn listen_break(&self) -> Result<()> {
        let shared = self.current()?;
        lock(&shared.accept).break_pending = true;
        shared.accept_ready.notify_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session control
    // ------------------------------------------------------------------

    /// Close a session; unknown or already closed handles succeed
    ///
    /// A streaming pre-session is suspended instead and can be resumed by
    /// `pre_connect` or taken over by `connect`.
    pub fn close(&self, handle: SessionHandle, reason: i32) -> Result<()> {
        let shared = self.current()?;
        let Ok(session) = shared.session(handle) else {
            return Ok(());
        };
        let lifecycle = session.lifecycle();
        if session.is_pre && session.role == Role::Caller && lifecycle.is_streaming() && lifecycle.error.is_none() {
            session.set_in_use(false);
            if matches!(lifecycle.active_state, ActiveState::Activating | ActiveState::Active) {
                log::info!("Session {}: pre-session suspended", handle);
                session.set_active(ActiveState::Suspending);
                shared.report(&session);
                session.post(Event::Suspend);
            }
            return Ok(());
        }
        shared.remove(handle);
        log::info!("Session {}: closed (reason {})", handle, reason);
        Self::close_session(&session, reason);
        Ok(())
    }

    fn close_session(session: &SessionCore, reason: i32) {
        let error = RtcError::SessionClosedExplicit;
        session.channels.close_all(error);
        session.frames.close(error);
        session.post(Event::Close { error, code: reason });
    }

    /// `Ok` while the session is usable, otherwise the error that ended it
    pub fn check(&self, handle: SessionHandle) -> Result<()> {
        let session = self.current()?.session(handle)?;
        match session.lifecycle().error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tell sessions waiting for `remote_id` that it came online
    pub fn set_remote_online(&self, remote_id: &str) -> Result<()> {
        let shared = self.current()?;
        for session in shared.select(|s| s.role == Role::Caller && s.remote_id == remote_id) {
            if Self::is_negotiating(&session) {
                session.post(Event::RemoteOnline);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    fn data_session(&self, handle: SessionHandle, channel: u32) -> Result<Arc<SessionCore>> {
        let shared = self.current()?;
        if channel >= shared.options.max_channel_number {
            return Err(RtcError::InvalidParameter);
        }
        shared.session(handle)
    }

    /// Queue `data` on `channel`, waiting up to `timeout_ms` for room
    ///
    /// Returns the number of bytes accepted.
    pub fn send_data(&self, handle: SessionHandle, channel: u32, data: &[u8], timeout_ms: u64) -> Result<usize> {
        let session = self.data_session(handle, channel)?;
        session.check_data_ready()?;
        let ch = session.channels.get(channel).ok_or(RtcError::InvalidParameter)?;
        let written = ch.write(data, Instant::now() + Duration::from_millis(timeout_ms));
        if matches!(written, Ok(n) if n > 0) {
            session.wake();
        }
        written
    }

    /// Read from `channel`; `timeout_ms == 0` never blocks and may return 0
    pub fn recv_data(&self, handle: SessionHandle, channel: u32, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let session = self.data_session(handle, channel)?;
        // Data that arrived before a failure stays readable
        if session.lifecycle().error.is_none() {
            session.check_data_ready()?;
        }
        let ch = session.channels.get(channel).ok_or(RtcError::InvalidParameter)?;
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        ch.read(buf, deadline)
    }

    /// Queue a media frame; never blocks, `BufferFull` when the queue is full
    pub fn send_frame(&self, handle: SessionHandle, frame: Frame) -> Result<()> {
        let session = self.current()?.session(handle)?;
        if session.media.connection_type != ConnectionType::Webrtc {
            return Err(RtcError::InvalidParameter);
        }
        session.check_data_ready()?;
        session.frames.push_outbound(frame)?;
        session.wake();
        Ok(())
    }

    /// Next received media frame; `timeout_ms == 0` never blocks
    pub fn recv_frame(&self, handle: SessionHandle, timeout_ms: u64) -> Result<Frame> {
        let session = self.current()?.session(handle)?;
        if session.media.connection_type != ConnectionType::Webrtc {
            return Err(RtcError::InvalidParameter);
        }
        if session.lifecycle().error.is_none() {
            session.check_data_ready()?;
        }
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        session.frames.recv(deadline)
    }

    /// Backpressure snapshot of `channel`
    pub fn check_buffer(&self, handle: SessionHandle, channel: u32) -> Result<BufferStatus> {
        let session = self.data_session(handle, channel)?;
        session.check_data_ready()?;
        let ch = session.channels.get(channel).ok_or(RtcError::InvalidParameter)?;
        Ok(ch.status())
    }

    /// Bytes written to `channel` and not yet acknowledged
    pub fn wait_send_bytes(&self, handle: SessionHandle, channel: u32) -> Result<usize> {
        let session = self.data_session(handle, channel)?;
        let ch = session.channels.get(channel).ok_or(RtcError::InvalidParameter)?;
        Ok(ch.status().unsent_write_bytes)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn get_session_info(&self, handle: SessionHandle) -> Result<SessionInfo> {
        Ok(self.current()?.session(handle)?.info())
    }

    /// Every session as a JSON array of [`SessionInfo`]
    pub fn get_session_list(&self) -> Result<String> {
        let infos: Vec<SessionInfo> = self.current()?.select(|_| true).iter().map(|s| s.info()).collect();
        serde_json::to_string(&infos).map_err(|e| {
            log::error!("Cannot serialize session list: {}", e);
            RtcError::InvalidParameter
        })
    }

    /// Capability bits (`SKILL_*`)
    pub fn skill(&self) -> Result<u32> {
        let shared = self.current()?;
        let mut skill = SKILL_P2P | SKILL_WEBRTC | SKILL_LAN;
        if shared.options.preconnect_enable {
            skill |= SKILL_PRECONNECT;
        }
        Ok(skill)
    }

    pub fn set_log_level(&self, level: log::LevelFilter) {
        logging::set_level(level);
    }

    // ------------------------------------------------------------------
    // Inbound façade traffic
    // ------------------------------------------------------------------

    /// Feed a signaling message received from `remote_id`
    pub fn set_signaling(&self, remote_id: &str, message: &str) -> Result<()> {
        let shared = self.current()?;
        let (envelope, body) = signaling::decode(message).map_err(|e| {
            log::warn!("Bad signaling message from {}: {}", remote_id, e);
            RtcError::from(e)
        })?;
        if envelope.header.to != shared.options.local_id {
            log::warn!(
                "Signaling for {} delivered to {}, dropped",
                envelope.header.to,
                shared.options.local_id
            );
            return Err(RtcError::InvalidId);
        }

        let session_id = envelope.header.session_id.clone();
        let existing = shared
            .select(|s| s.session_id == session_id && s.remote_id == envelope.header.from)
            .into_iter()
            .next();

        match (existing, body) {
            (Some(session), body) => {
                log::debug!("Session {}: {} received", session.handle, body.kind());
                session.post(Event::Signaling(body));
                Ok(())
            }
            (None, SignalingBody::Offer(offer)) => self.accept_offer(&shared, envelope, offer),
            (None, body) => {
                log::debug!("{} for unknown session {} ignored", body.kind(), session_id);
                Ok(())
            }
        }
    }

    fn accept_offer(&self, shared: &Arc<Shared>, envelope: Envelope, offer: Offer) -> Result<()> {
        let header = envelope.header;
        validate_id(&header.from)?;

        let key = offer.token.as_ref().map(|t| t.password.clone()).unwrap_or_default();
        match envelope.auth.as_deref() {
            Some(mac) => {
                if let Err(e) = shared.facade.on_auth(&key, &envelope.body, mac) {
                    log::warn!("Offer from {} failed authentication", header.from);
                    self.reject(shared, &header, RtcError::AuthFailed);
                    return Err(e);
                }
            }
            None => log::debug!("Offer from {} carries no MAC", header.from),
        }

        let created = Credentials::generate(HashAlgorithm::Sha256)
            .map_err(RtcError::from)
            .and_then(|credentials| -> Result<_> {
                let session = shared.insert(
                    SessionSpec {
                        remote_id: header.from.clone(),
                        role: Role::Callee,
                        is_pre: offer.is_pre,
                        session_id: header.session_id.clone(),
                        trace_id: header.trace_id.clone(),
                        dev_id: offer.dev_id.clone(),
                        lan_mode: offer.lan_mode,
                        media: MediaInfo::from_offer(&offer),
                    },
                    None,
                )?;
                Ok((session, credentials))
            });
        let (session, credentials) = match created {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Offer from {} refused: {}", header.from, e);
                self.reject(shared, &header, e);
                return Err(e);
            }
        };
        log::info!(
            "Session {}: offer from {} (session_id {}, pre {})",
            session.handle,
            header.from,
            header.session_id,
            offer.is_pre
        );
        shared.spawn(
            &session,
            Start::Callee {
                header,
                offer,
                credentials,
            },
        )
    }

    fn reject(&self, shared: &Shared, offer_header: &Header, reason: RtcError) {
        let header = Header {
            from: shared.options.local_id.clone(),
            to: offer_header.from.clone(),
            session_id: offer_header.session_id.clone(),
            trace_id: offer_header.trace_id.clone(),
        };
        let sent = signaling::encode(header, &SignalingBody::Reject { code: reason.code() }, None)
            .map_err(RtcError::from)
            .and_then(|text| shared.facade.on_signaling(&offer_header.from, &text));
        if let Err(e) = sent {
            log::debug!("Reject to {} not delivered: {}", offer_header.from, e);
        }
    }

    /// Answer to an `on_http` request
    pub fn set_http_result(&self, api: &str, status: u32, result: &str) -> Result<()> {
        self.deliver_http(api, None, status, result)
    }

    /// Answer to an `on_http` request for a specific device
    pub fn set_http_result_v2(&self, api: &str, status: u32, dev_id: &str, content: &str, result: &str) -> Result<()> {
        log::trace!("HTTP result for {} ({}) request {}", api, dev_id, content);
        self.deliver_http(api, Some(dev_id), status, result)
    }

    fn deliver_http(&self, api: &str, dev_id: Option<&str>, status: u32, result: &str) -> Result<()> {
        let shared = self.current()?;
        let waiting = shared.select(|s| s.awaits_http(api, dev_id));
        if waiting.is_empty() {
            log::debug!("HTTP result for {} with no pending request", api);
            return Ok(());
        }
        for session in waiting {
            session.post(Event::Http {
                status,
                body: result.to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Version
// ============================================================================

/// Crate version packed as `major << 16 | minor << 8 | patch`
pub fn version() -> u32 {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0) & 0xff;
    part(env!("CARGO_PKG_VERSION_MAJOR")) << 16
        | part(env!("CARGO_PKG_VERSION_MINOR")) << 8
        | part(env!("CARGO_PKG_VERSION_PATCH"))
}

pub fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl Facade for Silent {
        fn on_signaling(&self, _remote_id: &str, _message: &str) -> Result<()> {
            Ok(())
        }
    }

    fn engine(local_id: &str) -> Engine {
        Engine::init(Options::new(local_id), Arc::new(Silent)).unwrap()
    }

    #[test]
    fn test_second_init_rejected() {
        let e = engine("unit-dup");
        assert_eq!(
            Engine::init(Options::new("unit-dup"), Arc::new(Silent)).unwrap_err(),
            RtcError::AlreadyInitialized
        );
        e.deinit().unwrap();
        let again = engine("unit-dup");
        again.deinit().unwrap();
    }

    #[test]
    fn test_operations_after_deinit() {
        let e = engine("unit-deinit");
        e.deinit().unwrap();
        assert_eq!(e.deinit(), Err(RtcError::NotInitialized));
        assert_eq!(e.listen(), Err(RtcError::NotInitialized));
        assert!(!e.is_initialized());
    }

    #[test]
    fn test_close_unknown_handle_is_ok() {
        let e = engine("unit-close");
        let handle = SessionHandle::new(3, 1);
        assert_eq!(e.close(handle, 0), Ok(()));
        assert_eq!(e.close(handle, 0), Ok(()));
        assert_eq!(e.check(handle), Err(RtcError::InvalidHandle));
        e.deinit().unwrap();
    }

    #[test]
    fn test_channel_bound_checked_first() {
        let e = engine("unit-bound");
        let handle = SessionHandle::new(0, 1);
        let max = e.options().unwrap().max_channel_number;
        assert_eq!(e.send_data(handle, max, b"x", 10), Err(RtcError::InvalidParameter));
        assert_eq!(e.send_data(handle, 0, b"x", 10), Err(RtcError::InvalidHandle));
        e.deinit().unwrap();
    }

    #[test]
    fn test_listen_break() {
        let e = engine("unit-listen");
        e.listen_break().unwrap();
        assert_eq!(e.listen(), Err(RtcError::ListenBreak));

        let listener = e.clone();
        let t = thread::spawn(move || listener.listen());
        thread::sleep(Duration::from_millis(50));
        e.listen_break().unwrap();
        assert_eq!(t.join().unwrap(), Err(RtcError::ListenBreak));
        e.deinit().unwrap();
    }

    #[test]
    fn test_pre_connect_requires_option() {
        let e = engine("unit-pre");
        assert_eq!(e.pre_connect("dev", ""), Err(RtcError::PreconnectUnsupported));
        assert_eq!(e.skill().unwrap() & SKILL_PRECONNECT, 0);
        assert_eq!(e.pre_connect_close("dev", 0), Err(RtcError::InvalidPreSession));
        e.deinit().unwrap();
    }

    #[test]
    fn test_connect_validates_arguments() {
        let e = engine("unit-args");
        assert_eq!(e.connect("", "", None, true, 100), Err(RtcError::InvalidId));
        assert_eq!(e.connect(&"x".repeat(81), "", None, true, 100), Err(RtcError::InvalidId));
        assert_eq!(e.connect("dev", "", None, true, 0), Err(RtcError::InvalidParameter));
        e.deinit().unwrap();
    }

    #[test]
    fn test_signaling_for_other_id_rejected() {
        let e = engine("unit-sig");
        let header = Header {
            from: "peer".into(),
            to: "someone-else".into(),
            session_id: "s".into(),
            trace_id: None,
        };
        let text = signaling::encode(header, &SignalingBody::Disconnect { code: -14 }, None).unwrap();
        assert_eq!(e.set_signaling("peer", &text), Err(RtcError::InvalidId));
        assert_eq!(e.set_signaling("peer", "not json"), Err(RtcError::InvalidParameter));
        e.deinit().unwrap();
    }

    #[test]
    fn test_version() {
        assert_eq!(version() >> 16, env!("CARGO_PKG_VERSION_MAJOR").parse::<u32>().unwrap());
        assert!(!version_string().is_empty());
    }
}
