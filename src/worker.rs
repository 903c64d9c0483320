//! Session runtime and worker thread
//!
//! Every session is a [`SessionCore`] shared between the engine (application
//! threads) and one worker thread named `rtc-session-<handle>`. Application
//! threads talk to the worker through the session inbox; the worker owns the
//! UDP link and drives the lifecycle:
//!
//! ```text
//!   caller:  token ─▶ bind/gather ─▶ offer ──┐
//!   callee:  bind/gather ─▶ answer ──────────┤
//!                                            ▼
//!              checks ─▶ nominate ─▶ Hello/Verify ─▶ stream loop
//!                                                   (data, acks, frames,
//!                                                    heartbeats, control)
//! ```
//!
//! The `done` gate is notified exactly once, when the session reaches
//! `Stream` or fails; that is what a blocked `connect()` waits on.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::Waker;

use crate::channel::ChannelSet;
use crate::credential::{Credentials, Fingerprint};
use crate::engine::{ConnectRequest, Shared};
use crate::error::RtcError;
use crate::facade::{AesContext, AesMode, AesProvider, PortProtocol, SoftAes, AES_BLOCK_LEN};
use crate::frame::{self, Fragment, FrameQueues, Reassembler};
use crate::misc;
use crate::p2p::candidate::{self, Candidate};
use crate::p2p::connectivity::{BindingMessage, CheckList};
use crate::p2p::handshake::{Handshake, HandshakeError};
use crate::p2p::link::{self, Control, Link, Packet};
use crate::p2p::resilience::{ControlTracker, HeartbeatMonitor};
use crate::p2p::signaling::{self, Answer, Header, Offer, SignalingBody};
use crate::session::{
    ActiveState, AudioCodec, ConnectionType, Lifecycle, Role, SessionEvent, SessionHandle, SessionInfo,
    SessionState, VideoCodec,
};
use crate::sync::{lock, Gate};
use crate::token::RelayToken;

// ============================================================================
// Constants
// ============================================================================

/// HTTP API used to fetch a relay token
pub const TOKEN_API: &str = "rtc.session.token";

/// Worker wake-up interval when nothing happens
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Hello retransmit interval during key negotiation
const HELLO_INTERVAL: Duration = Duration::from_millis(200);

/// Retransmission timeout for channel segments
const DATA_RTO: Duration = Duration::from_millis(200);

/// In-flight segments per channel
const SEND_WINDOW: usize = 32;

/// Close notices are repeated, the link is lossy
const CLOSE_REPEAT: usize = 3;

/// Random AES session key length
const SESSION_KEY_LEN: usize = 16;

// ============================================================================
// Inbox
// ============================================================================

/// Messages from application threads to the worker
#[derive(Debug)]
pub(crate) enum Event {
    Signaling(SignalingBody),
    Http { status: u32, body: String },
    /// Abort negotiation (`connect_break`, connect deadline); ignored once streaming
    Cancel(RtcError),
    /// Tear the session down; `code` is forwarded to the peer
    Close { error: RtcError, code: i32 },
    /// Pre-session resumed or taken over by `connect`
    Activate { in_use: bool },
    /// Pre-session parked by `close`
    Suspend,
    RemoteOnline,
}

/// Media and replay descriptors fixed at creation
#[derive(Debug, Clone, Default)]
pub(crate) struct MediaInfo {
    pub connection_type: ConnectionType,
    pub audio_codec: Option<AudioCodec>,
    pub video_codec: Option<VideoCodec>,
    pub stream_type: i32,
    pub is_replay: bool,
    pub start_time: u64,
    pub end_time: u64,
}

impl MediaInfo {
    pub fn from_request(req: &ConnectRequest) -> Self {
        Self {
            connection_type: req.connection_type,
            audio_codec: req.audio_codec.clone(),
            video_codec: req.video_codec.clone(),
            stream_type: req.stream_type,
            is_replay: req.is_replay,
            start_time: req.start_time,
            end_time: req.end_time,
        }
    }

    pub fn from_offer(offer: &Offer) -> Self {
        Self {
            connection_type: offer.connection_type,
            audio_codec: offer.audio_codec.clone(),
            video_codec: offer.video_codec.clone(),
            stream_type: offer.stream_type,
            is_replay: offer.is_replay,
            start_time: offer.start_time,
            end_time: offer.end_time,
        }
    }
}

struct Status {
    lifecycle: Lifecycle,
    sub_dev_id: String,
    /// `misc::now_ms` when the pre-session was parked
    not_active_since: Option<u64>,
}

// ============================================================================
// Session Core
// ============================================================================

/// Identity of a new session
pub(crate) struct SessionSpec {
    pub remote_id: String,
    pub role: Role,
    pub is_pre: bool,
    pub session_id: String,
    pub trace_id: Option<String>,
    pub dev_id: String,
    pub lan_mode: bool,
    pub media: MediaInfo,
}

pub(crate) struct SessionCore {
    pub handle: SessionHandle,
    pub remote_id: String,
    pub role: Role,
    pub is_pre: bool,
    pub session_id: String,
    pub trace_id: Option<String>,
    pub dev_id: String,
    pub lan_mode: bool,
    pub media: MediaInfo,
    status: Mutex<Status>,
    pub channels: ChannelSet,
    pub frames: FrameQueues,
    inbox: Mutex<VecDeque<Event>>,
    inbox_ready: Condvar,
    waker: Mutex<Option<Arc<Waker>>>,
    /// API and device id of an outstanding `on_http` request
    awaiting_http: Mutex<Option<(String, String)>>,
    /// Reached `Stream` or failed
    pub done: Gate,
    /// The application holds this handle (connect result or pre-session takeover)
    in_use: AtomicBool,
    /// Returned by `listen`
    delivered: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    pub fn new(handle: SessionHandle, spec: SessionSpec, channels: ChannelSet) -> Self {
        let owned = spec.role == Role::Caller && !spec.is_pre;
        Self {
            handle,
            remote_id: spec.remote_id,
            role: spec.role,
            is_pre: spec.is_pre,
            session_id: spec.session_id,
            trace_id: spec.trace_id,
            dev_id: spec.dev_id,
            lan_mode: spec.lan_mode,
            media: spec.media,
            status: Mutex::new(Status {
                lifecycle: Lifecycle::new(spec.is_pre),
                sub_dev_id: String::new(),
                not_active_since: None,
            }),
            channels,
            frames: FrameQueues::new(),
            inbox: Mutex::new(VecDeque::new()),
            inbox_ready: Condvar::new(),
            waker: Mutex::new(None),
            awaiting_http: Mutex::new(None),
            done: Gate::broadcast(),
            in_use: AtomicBool::new(owned),
            delivered: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        lock(&self.status).lifecycle
    }

    fn advance(&self, state: SessionState) -> bool {
        lock(&self.status).lifecycle.advance(state)
    }

    fn fail(&self, err: RtcError) -> bool {
        lock(&self.status).lifecycle.fail(err)
    }

    /// Change the activation sub-state; `NotActive` starts the reserve clock
    pub fn set_active(&self, active: ActiveState) {
        let mut status = lock(&self.status);
        status.lifecycle.active_state = active;
        status.not_active_since = match active {
            ActiveState::NotActive => Some(misc::now_ms()),
            _ => None,
        };
    }

    fn not_active_since(&self) -> Option<u64> {
        lock(&self.status).not_active_since
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::SeqCst);
    }

    pub fn mark_delivered(&self) {
        self.delivered.store(true, Ordering::SeqCst);
    }

    /// Someone will come back for this handle (close/check); otherwise the
    /// worker removes the session itself when it ends
    fn is_owned(&self) -> bool {
        self.in_use.load(Ordering::SeqCst) || self.delivered.load(Ordering::SeqCst)
    }

    pub fn event(&self) -> SessionEvent {
        let status = lock(&self.status);
        SessionEvent {
            remote_id: self.remote_id.clone(),
            handle: self.handle,
            is_pre: self.is_pre,
            state: status.lifecycle.state,
            active_state: status.lifecycle.active_state,
            error: status.lifecycle.error,
        }
    }

    pub fn info(&self) -> SessionInfo {
        let status = lock(&self.status);
        SessionInfo {
            handle: self.handle.as_raw(),
            remote_id: self.remote_id.clone(),
            is_pre: self.is_pre,
            state: status.lifecycle.state,
            active_state: status.lifecycle.active_state,
            connection_type: self.media.connection_type,
            audio_codec: self.media.audio_codec.clone(),
            video_codec: self.media.video_codec.clone(),
            trace_id: self.trace_id.clone(),
            session_id: self.session_id.clone(),
            dev_id: self.dev_id.clone(),
            sub_dev_id: status.sub_dev_id.clone(),
            stream_type: self.media.stream_type,
            is_replay: self.media.is_replay,
            start_time: self.media.start_time,
            end_time: self.media.end_time,
            error: status.lifecycle.error.map(RtcError::code),
        }
    }

    /// Gate for channel and frame operations
    pub fn check_data_ready(&self) -> Result<(), RtcError> {
        let lc = self.lifecycle();
        if let Some(err) = lc.error {
            return Err(err);
        }
        if self.is_pre && matches!(lc.active_state, ActiveState::NotActive | ActiveState::Suspending) {
            return Err(RtcError::PreSessionSuspended);
        }
        if !lc.is_streaming() {
            return Err(RtcError::NotConnected);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------

    pub fn post(&self, event: Event) {
        lock(&self.inbox).push_back(event);
        self.inbox_ready.notify_all();
        self.wake();
    }

    /// Interrupt the worker's socket wait
    pub fn wake(&self) {
        if let Some(waker) = lock(&self.waker).as_ref() {
            if let Err(e) = waker.wake() {
                log::debug!("Session {} waker failed: {}", self.handle, e);
            }
        }
    }

    fn drain_events(&self) -> Vec<Event> {
        lock(&self.inbox).drain(..).collect()
    }

    /// Wait for inbox events until `deadline`
    fn wait_events(&self, deadline: Instant) -> Vec<Event> {
        let mut inbox = lock(&self.inbox);
        while inbox.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inbox = self
                .inbox_ready
                .wait_timeout(inbox, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        inbox.drain(..).collect()
    }

    pub fn awaits_http(&self, api: &str, dev_id: Option<&str>) -> bool {
        match lock(&self.awaiting_http).as_ref() {
            Some((a, d)) => a == api && dev_id.map(|id| id == d).unwrap_or(true),
            None => false,
        }
    }

    pub fn take_thread(&self) -> Option<JoinHandle<()>> {
        lock(&self.thread).take()
    }
}

// ============================================================================
// Spawning
// ============================================================================

/// How a worker starts
pub(crate) enum Start {
    Caller {
        request: ConnectRequest,
        credentials: Credentials,
        deadline: Instant,
    },
    Callee {
        header: Header,
        offer: Offer,
        credentials: Credentials,
    },
}

pub(crate) fn spawn(shared: Arc<Shared>, session: Arc<SessionCore>, start: Start) -> Result<(), RtcError> {
    let name = format!("rtc-session-{}", session.handle);
    let core = Arc::clone(&session);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || run(shared, core, start))
        .map_err(|e| {
            log::error!("Failed to spawn session thread: {}", e);
            RtcError::ThreadCreateFailed
        })?;
    *lock(&session.thread) = Some(handle);
    Ok(())
}

fn run(shared: Arc<Shared>, session: Arc<SessionCore>, start: Start) {
    let mut worker = Worker::new(&shared, &session);
    worker.report();
    let reason = match start {
        Start::Caller {
            request,
            credentials,
            deadline,
        } => worker.run_caller(&request, &credentials, deadline),
        Start::Callee {
            header,
            offer,
            credentials,
        } => worker.run_callee(&header, &offer, &credentials),
    };
    worker.finish(reason);
}

// ============================================================================
// Session Cipher
// ============================================================================

/// AES-CBC with PKCS#7 padding and a random IV per packet
struct SessionCipher {
    ctx: Box<dyn AesContext>,
}

impl SessionCipher {
    fn new(provider: &dyn AesProvider, key: &[u8]) -> Result<Self, RtcError> {
        Ok(Self {
            ctx: provider.create(AesMode::Cbc, key)?,
        })
    }

    fn seal(&mut self, plain: &[u8]) -> Result<([u8; AES_BLOCK_LEN], Vec<u8>), RtcError> {
        let mut iv = [0u8; AES_BLOCK_LEN];
        misc::fill_random(&mut iv).map_err(|_| RtcError::CryptoInitFailed)?;
        let pad = AES_BLOCK_LEN - plain.len() % AES_BLOCK_LEN;
        let mut buf = Vec::with_capacity(plain.len() + pad);
        buf.extend_from_slice(plain);
        buf.resize(plain.len() + pad, pad as u8);
        self.ctx.encrypt(&iv, &mut buf)?;
        Ok((iv, buf))
    }

    fn open(&mut self, iv: &[u8; AES_BLOCK_LEN], sealed: &[u8]) -> Result<Vec<u8>, RtcError> {
        if sealed.is_empty() || sealed.len() % AES_BLOCK_LEN != 0 {
            return Err(RtcError::InvalidParameter);
        }
        let mut buf = sealed.to_vec();
        self.ctx.decrypt(iv, &mut buf)?;
        let pad = buf.last().copied().unwrap_or(0) as usize;
        if pad == 0 || pad > AES_BLOCK_LEN || !buf[buf.len() - pad..].iter().all(|b| *b as usize == pad) {
            return Err(RtcError::InvalidParameter);
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }
}

// ============================================================================
// Negotiation State
// ============================================================================

struct Negotiation {
    checks: CheckList,
    /// Created once the peer's fingerprint is known
    handshake: Option<Handshake>,
    selected: Option<SocketAddr>,
    /// Caller: answer received. Callee: always
    answered: bool,
    remote_requests_seen: bool,
    has_relay: bool,
    last_hello: Option<Instant>,
    keynego_since: Option<Instant>,
}

impl Negotiation {
    fn is_complete(&self) -> bool {
        self.selected.is_some() && self.handshake.as_ref().map(Handshake::is_complete).unwrap_or(false)
    }

    /// Sub-reason when the negotiation deadline passes
    fn timeout_reason(&self) -> RtcError {
        if self.keynego_since.is_some() {
            RtcError::DtlsHandshakeTimeout
        } else if !self.answered {
            RtcError::TimeoutNoAnswer
        } else if self.remote_requests_seen {
            RtcError::TimeoutRemoteNat
        } else if !self.has_relay {
            RtcError::NoRelayAvailable
        } else {
            RtcError::TimeoutLocalNat
        }
    }
}

/// Per-packet view of the stream loop state
struct StreamContext<'h> {
    peer: SocketAddr,
    /// Kept to answer Hellos the peer repeats after we finished
    handshake: &'h Handshake,
    monitor: &'h mut HeartbeatMonitor,
    reassembler: &'h mut Reassembler,
}

/// Local side of the link after gathering
struct Gathered {
    link: Link,
    candidates: Vec<Candidate>,
    has_relay: bool,
    local_priority: u32,
}

// ============================================================================
// Worker
// ============================================================================

struct Worker<'a> {
    shared: &'a Shared,
    session: &'a SessionCore,
    link: Option<Link>,
    cipher: Option<SessionCipher>,
    /// Relay password keying the signaling MAC
    auth_key: Vec<u8>,
    /// Encoded offer, kept for resends
    offer_text: Option<String>,
    /// Encoded answer, kept for duplicate offers
    answer_text: Option<String>,
    upnp_port: Option<u16>,
    frame_seq: u32,
    /// Activation changes in both directions
    control: ControlTracker,
    /// Peer control that arrived before we were streaming
    deferred_control: Option<Control>,
}

impl<'a> Worker<'a> {
    fn new(shared: &'a Shared, session: &'a SessionCore) -> Self {
        Self {
            shared,
            session,
            link: None,
            cipher: None,
            auth_key: Vec::new(),
            offer_text: None,
            answer_text: None,
            upnp_port: None,
            frame_seq: 0,
            control: ControlTracker::new(),
            deferred_control: None,
        }
    }

    fn report(&self) {
        self.shared.facade.on_session_state(&self.session.event());
    }

    fn enter(&self, state: SessionState) {
        if self.session.advance(state) {
            log::debug!("Session {} -> {:?}", self.session.handle, state);
            self.report();
        }
    }

    // ------------------------------------------------------------------
    // Caller
    // ------------------------------------------------------------------

    fn run_caller(&mut self, request: &ConnectRequest, credentials: &Credentials, deadline: Instant) -> RtcError {
        let token = match self.acquire_token(request, deadline) {
            Ok(token) => token,
            Err(e) => return e,
        };
        self.auth_key = token.password.as_bytes().to_vec();

        self.enter(SessionState::P2pConnect);
        let mut gathered = match self.gather(request.lan_mode, &token) {
            Ok(g) => g,
            Err(e) => return e,
        };

        let mut key = [0u8; SESSION_KEY_LEN];
        if misc::fill_random(&mut key).is_err() {
            return RtcError::CryptoInitFailed;
        }
        if let Err(e) = self.init_cipher(&key) {
            return e;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let offer = Offer {
            connection_type: request.connection_type,
            is_pre: self.session.is_pre,
            lan_mode: request.lan_mode,
            dev_id: request.dev_id.clone(),
            skill: request.skill.clone(),
            candidates: std::mem::take(&mut gathered.candidates),
            fingerprint: credentials.fingerprint.to_string(),
            aes_key: misc::hex_encode(&key, None),
            timeout_ms: remaining.as_millis() as u64,
            token: (token != RelayToken::default()).then(|| token.clone()),
            audio_codec: request.audio_codec.clone(),
            video_codec: request.video_codec.clone(),
            stream_type: request.stream_type,
            is_replay: request.is_replay,
            start_time: request.start_time,
            end_time: request.end_time,
        };
        let text = match self.encode_signaling(&SignalingBody::Offer(offer)) {
            Ok(t) => t,
            Err(e) => return e,
        };
        if let Err(e) = self.deliver_signaling(&text) {
            log::warn!("Session {}: offer delivery failed: {}", self.session.handle, e);
            return e;
        }
        log::info!(
            "Session {}: offer sent to {} (session_id {})",
            self.session.handle,
            self.session.remote_id,
            self.session.session_id
        );
        self.offer_text = Some(text);

        let nego = Negotiation {
            checks: CheckList::new(true, gathered.local_priority),
            handshake: None,
            selected: None,
            answered: false,
            remote_requests_seen: false,
            has_relay: gathered.has_relay,
            last_hello: None,
            keynego_since: None,
        };
        self.link = Some(gathered.link);
        self.negotiate_and_stream(nego, credentials, deadline)
    }

    fn acquire_token(&mut self, request: &ConnectRequest, deadline: Instant) -> Result<RelayToken, RtcError> {
        if !request.token.trim().is_empty() {
            return RelayToken::parse(&request.token);
        }
        if request.lan_mode {
            return Ok(RelayToken::default());
        }

        let dev_id = if request.dev_id.is_empty() {
            self.session.remote_id.as_str()
        } else {
            request.dev_id.as_str()
        };
        let content = serde_json::json!({
            "remote_id": self.session.remote_id,
            "dev_id": dev_id,
            "session_id": self.session.session_id,
        })
        .to_string();
        *lock(&self.session.awaiting_http) = Some((TOKEN_API.to_string(), dev_id.to_string()));
        log::debug!("Session {}: requesting token for {}", self.session.handle, dev_id);
        self.shared.facade.on_http(TOKEN_API, dev_id, &content)?;

        let token_deadline = deadline.min(Instant::now() + Duration::from_millis(self.shared.options.token_timeout_ms));
        let result = loop {
            if Instant::now() >= token_deadline {
                break Err(RtcError::GetTokenTimeout);
            }
            let mut answer = None;
            for event in self.session.wait_events(token_deadline) {
                match event {
                    Event::Cancel(error) | Event::Close { error, .. } => return Err(error),
                    Event::Http { status, body } => answer = Some((status, body)),
                    other => log::trace!("Session {}: {:?} ignored while fetching token", self.session.handle, other),
                }
            }
            if let Some((status, body)) = answer {
                if status != 200 {
                    log::warn!("Session {}: token request failed with status {}", self.session.handle, status);
                    break Err(RtcError::HttpFailed);
                }
                break RelayToken::parse(&body);
            }
        };
        *lock(&self.session.awaiting_http) = None;
        result
    }

    // ------------------------------------------------------------------
    // Callee
    // ------------------------------------------------------------------

    fn run_callee(&mut self, header: &Header, offer: &Offer, credentials: &Credentials) -> RtcError {
        let token = offer.token.clone().unwrap_or_default();
        self.auth_key = token.password.as_bytes().to_vec();

        self.enter(SessionState::P2pConnect);
        let expected = match Fingerprint::parse(&offer.fingerprint) {
            Ok(fp) => fp,
            Err(e) => {
                log::warn!("Session {}: bad offer fingerprint: {}", self.session.handle, e);
                return RtcError::DtlsHandshakeFailed;
            }
        };
        let key = match misc::hex_decode(&offer.aes_key) {
            Some(k) => k,
            None => return RtcError::InvalidAesKey,
        };
        if let Err(e) = self.init_cipher(&key) {
            return e;
        }
        let mut gathered = match self.gather(offer.lan_mode, &token) {
            Ok(g) => g,
            Err(e) => return e,
        };

        let answer = Answer {
            candidates: std::mem::take(&mut gathered.candidates),
            fingerprint: credentials.fingerprint.to_string(),
            sub_dev_id: String::new(),
        };
        let text = match self.encode_signaling(&SignalingBody::Answer(answer)) {
            Ok(t) => t,
            Err(e) => return e,
        };
        if let Err(e) = self.deliver_signaling(&text) {
            return e;
        }
        self.answer_text = Some(text);
        log::info!(
            "Session {}: answered {} (session_id {})",
            self.session.handle,
            header.from,
            header.session_id
        );

        let handshake = match Handshake::new(credentials, expected) {
            Ok(h) => h,
            Err(e) => return e.into(),
        };
        let mut checks = CheckList::new(false, gathered.local_priority);
        for c in &offer.candidates {
            checks.add_remote(c);
        }
        let nego = Negotiation {
            checks,
            handshake: Some(handshake),
            selected: None,
            answered: true,
            remote_requests_seen: false,
            has_relay: gathered.has_relay,
            last_hello: None,
            keynego_since: None,
        };
        self.link = Some(gathered.link);

        let timeout_ms = if offer.timeout_ms > 0 {
            offer.timeout_ms
        } else {
            self.shared.options.accept_timeout_ms
        };
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        self.negotiate_and_stream(nego, credentials, deadline)
    }

    // ------------------------------------------------------------------
    // Shared setup
    // ------------------------------------------------------------------

    fn init_cipher(&mut self, key: &[u8]) -> Result<(), RtcError> {
        let provider: &dyn AesProvider = self.shared.facade.aes().unwrap_or(&SoftAes);
        self.cipher = Some(SessionCipher::new(provider, key)?);
        Ok(())
    }

    fn gather(&mut self, lan_mode: bool, token: &RelayToken) -> Result<Gathered, RtcError> {
        let tag = link::session_tag(&self.session.session_id);
        let link = Link::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), tag).map_err(|e| {
            log::error!("Session {}: bind failed: {}", self.session.handle, e);
            RtcError::UdpPortBindFailed
        })?;
        let base = link.local_addr().map_err(|_| RtcError::UdpPortBindFailed)?;
        *lock(&self.session.waker) = Some(link.waker());

        let mut candidates = candidate::gather_host_candidates(&self.shared.facade.on_get_address(), base.port());
        if candidates.is_empty() {
            log::warn!("Session {}: no local host candidate", self.session.handle);
            return Err(RtcError::TimeoutNoLocalCandidate);
        }
        let local_priority = candidates[0].priority;
        let host_base = candidates[0].address;

        let mut has_relay = false;
        if !lan_mode {
            if let Some(upnp) = self.shared.facade.upnp() {
                let mapped = candidate::gather_upnp_candidates(upnp, host_base);
                if !mapped.is_empty() {
                    self.upnp_port = Some(base.port());
                }
                candidates.extend(mapped);
            }
            let relays = candidate::gather_relay_candidates(&token.relay_servers(), host_base);
            has_relay = !relays.is_empty();
            candidates.extend(relays);
        }
        candidate::sort_by_priority(&mut candidates);
        for c in &candidates {
            log::debug!("Session {}: local candidate {}", self.session.handle, c);
        }
        Ok(Gathered {
            link,
            candidates,
            has_relay,
            local_priority,
        })
    }

    fn header(&self) -> Header {
        Header {
            from: self.shared.options.local_id.clone(),
            to: self.session.remote_id.clone(),
            session_id: self.session.session_id.clone(),
            trace_id: self.session.trace_id.clone(),
        }
    }

    fn encode_signaling(&self, body: &SignalingBody) -> Result<String, RtcError> {
        signaling::encode(self.header(), body, Some(&self.auth_key)).map_err(|e| {
            log::error!("Session {}: cannot encode {}: {}", self.session.handle, body.kind(), e);
            RtcError::from(e)
        })
    }

    fn deliver_signaling(&self, text: &str) -> Result<(), RtcError> {
        if self.session.lan_mode {
            self.shared.facade.on_lan_signaling(&self.session.remote_id, text)
        } else {
            self.shared.facade.on_signaling(&self.session.remote_id, text)
        }
    }

    fn send(&self, to: SocketAddr, packet: &Packet) {
        if let Some(link) = &self.link {
            if let Err(e) = link.send_to(packet, to) {
                log::debug!("Session {}: send to {} failed: {}", self.session.handle, to, e);
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<(), RtcError> {
        match self.link.as_mut() {
            Some(link) => link.wait(timeout).map_err(|e| {
                log::error!("Session {}: poll failed: {}", self.session.handle, e);
                RtcError::UdpPortBindFailed
            }),
            None => {
                thread::sleep(timeout);
                Ok(())
            }
        }
    }

    fn recv(&mut self) -> Option<(SocketAddr, Packet)> {
        self.link.as_mut().and_then(Link::recv)
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    fn negotiate_and_stream(&mut self, nego: Negotiation, credentials: &Credentials, deadline: Instant) -> RtcError {
        let (peer, handshake) = match self.negotiate(nego, credentials, deadline) {
            Ok(established) => established,
            Err(e) => {
                self.report_upnp(Some(e));
                if self.session.role == Role::Caller && e == RtcError::ConnectBreak {
                    self.send_disconnect(e);
                }
                return e;
            }
        };
        self.report_upnp(None);
        self.stream(peer, handshake)
    }

    fn negotiate(
        &mut self,
        mut nego: Negotiation,
        credentials: &Credentials,
        deadline: Instant,
    ) -> Result<(SocketAddr, Handshake), RtcError> {
        let controlling = self.session.role == Role::Caller;
        let handshake_timeout = Duration::from_millis(self.shared.options.handshake_timeout_ms);

        loop {
            let now = Instant::now();
            if now >= deadline {
                let reason = nego.timeout_reason();
                log::warn!("Session {}: negotiation timed out: {}", self.session.handle, reason);
                return Err(reason);
            }

            for event in self.session.drain_events() {
                match event {
                    Event::Cancel(error) | Event::Close { error, .. } => return Err(error),
                    Event::Signaling(body) => self.on_negotiation_signaling(&mut nego, body, credentials)?,
                    Event::RemoteOnline => {
                        if !nego.answered {
                            if let Some(text) = self.offer_text.clone() {
                                log::info!("Session {}: remote online, resending offer", self.session.handle);
                                self.deliver_signaling(&text)?;
                            }
                        }
                    }
                    other => log::trace!("Session {}: {:?} ignored during negotiation", self.session.handle, other),
                }
            }

            while let Some((from, packet)) = self.recv() {
                self.on_negotiation_packet(&mut nego, controlling, from, packet)?;
            }

            if let Some(peer) = nego.selected {
                if nego.keynego_since.is_none() {
                    log::info!("Session {}: path selected {}", self.session.handle, peer);
                    nego.keynego_since = Some(now);
                    self.enter(SessionState::DtlsSrtpKeyNego);
                }
                if nego.is_complete() {
                    if let Some(handshake) = nego.handshake.take() {
                        return Ok((peer, handshake));
                    }
                }
                if let Some(since) = nego.keynego_since {
                    if now.duration_since(since) >= handshake_timeout {
                        return Err(RtcError::DtlsHandshakeTimeout);
                    }
                }
                let hello_due = nego
                    .last_hello
                    .map(|t| now.duration_since(t) >= HELLO_INTERVAL)
                    .unwrap_or(true);
                if hello_due {
                    if let Some(hello) = nego.handshake.as_ref().map(Handshake::hello) {
                        self.send(peer, &hello);
                        nego.last_hello = Some(now);
                    }
                }
            } else if let Some((request, to)) = nego.checks.next_request(now) {
                self.send(to, &Packet::Binding(BindingMessage::Request(request)));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            self.wait(POLL_INTERVAL.min(remaining))?;
        }
    }

    fn on_negotiation_signaling(
        &mut self,
        nego: &mut Negotiation,
        body: SignalingBody,
        credentials: &Credentials,
    ) -> Result<(), RtcError> {
        match body {
            SignalingBody::Answer(answer) if self.session.role == Role::Caller => {
                if nego.answered {
                    return Ok(());
                }
                let expected = Fingerprint::parse(&answer.fingerprint).map_err(|e| {
                    log::warn!("Session {}: bad answer fingerprint: {}", self.session.handle, e);
                    RtcError::DtlsHandshakeFailed
                })?;
                nego.handshake = Some(Handshake::new(credentials, expected)?);
                for c in &answer.candidates {
                    nego.checks.add_remote(c);
                }
                nego.answered = true;
                lock(&self.session.status).sub_dev_id = answer.sub_dev_id;
                log::info!(
                    "Session {}: answer received, {} candidate pairs",
                    self.session.handle,
                    nego.checks.pair_count()
                );
            }
            SignalingBody::Offer(_) if self.session.role == Role::Callee => {
                // Our answer was lost
                if let Some(text) = self.answer_text.clone() {
                    self.deliver_signaling(&text)?;
                }
            }
            SignalingBody::Reject { code } => {
                let err = RtcError::from_code(code).unwrap_or(RtcError::RemoteNoResponse);
                log::warn!("Session {}: rejected by remote: {}", self.session.handle, err);
                return Err(err);
            }
            SignalingBody::Disconnect { .. } => return Err(RtcError::SessionClosedRemote),
            other => log::debug!("Session {}: unexpected {} ignored", self.session.handle, other.kind()),
        }
        Ok(())
    }

    fn on_negotiation_packet(
        &mut self,
        nego: &mut Negotiation,
        controlling: bool,
        from: SocketAddr,
        packet: Packet,
    ) -> Result<(), RtcError> {
        match packet {
            Packet::Binding(BindingMessage::Request(request)) => {
                nego.remote_requests_seen = true;
                self.send(from, &Packet::Binding(BindingMessage::Response(request.answer(from))));
                if nego.checks.add_remote(&Candidate::peer_reflexive(from)) {
                    log::debug!("Session {}: peer reflexive candidate {}", self.session.handle, from);
                }
                if !controlling && request.use_candidate && nego.selected.is_none() {
                    nego.selected = Some(from);
                }
            }
            Packet::Binding(BindingMessage::Response(response)) => {
                if let Some(addr) = nego.checks.handle_response(&response) {
                    if controlling && nego.selected.is_none() {
                        nego.selected = Some(addr);
                        let nomination = nego.checks.nomination(addr);
                        self.send(addr, &Packet::Binding(BindingMessage::Request(nomination)));
                    }
                }
            }
            Packet::Hello { nonce, cert_der } => {
                let Some(handshake) = nego.handshake.as_mut() else {
                    return Ok(());
                };
                let verify = handshake.on_hello(nonce, &cert_der).map_err(|e| {
                    log::warn!("Session {}: hello from {} rejected: {}", self.session.handle, from, e);
                    RtcError::from(e)
                })?;
                if nego.selected.is_none() {
                    nego.selected = Some(from);
                }
                self.send(from, &verify);
            }
            Packet::Verify { signature } => {
                if let Some(handshake) = nego.handshake.as_mut() {
                    match handshake.on_verify(&signature) {
                        Ok(()) => log::debug!("Session {}: peer verified", self.session.handle),
                        Err(HandshakeError::OutOfOrder) => {}
                        Err(e) => {
                            log::warn!("Session {}: verify failed: {}", self.session.handle, e);
                            return Err(e.into());
                        }
                    }
                }
            }
            Packet::Control(Control::Close { .. }) => return Err(RtcError::SessionClosedRemote),
            Packet::Reliable { seq, control } => {
                // Peer is streaming already; keep its latest change for later
                self.send(from, &Packet::ControlAck { seq });
                if self.control.accept(seq) {
                    log::debug!("Session {}: {:?} deferred until streaming", self.session.handle, control);
                    self.deferred_control = Some(control);
                }
            }
            // Peer already streaming; it retransmits once we are
            _ => {}
        }
        Ok(())
    }

    fn report_upnp(&self, error: Option<RtcError>) {
        if let (Some(port), Some(upnp)) = (self.upnp_port, self.shared.facade.upnp()) {
            upnp.bind_result(PortProtocol::Udp, port, error);
        }
    }

    fn send_disconnect(&self, reason: RtcError) {
        let text = match self.encode_signaling(&SignalingBody::Disconnect { code: reason.code() }) {
            Ok(t) => t,
            Err(_) => return,
        };
        if let Err(e) = self.deliver_signaling(&text) {
            log::debug!("Session {}: disconnect not delivered: {}", self.session.handle, e);
        }
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    fn stream(&mut self, peer: SocketAddr, handshake: Handshake) -> RtcError {
        if self.session.is_pre {
            self.session.set_active(ActiveState::Active);
        }
        self.enter(SessionState::Stream);
        log::info!(
            "Session {}: streaming with {} via {}",
            self.session.handle,
            self.session.remote_id,
            peer
        );
        self.session.done.notify();
        if self.session.role == Role::Callee && !self.session.is_pre {
            self.shared.enqueue_accept(self.session);
        }
        if let Some(control) = self.deferred_control.take() {
            if let Err(reason) = self.apply_remote_control(control) {
                return reason;
            }
        }

        let options = &self.shared.options;
        let fragment_len = options.fragment_len as usize;
        let reserve_ms = options.pre_session_reserve_ms;
        let mut monitor = HeartbeatMonitor::new(
            Duration::from_millis(options.heartbeat_interval_ms),
            Duration::from_millis(options.heartbeat_timeout_ms),
            Instant::now(),
        );
        let mut path_state = monitor.state();
        let mut reassembler = Reassembler::new();

        loop {
            let now = Instant::now();

            for event in self.session.drain_events() {
                match event {
                    Event::Close { error, code } => {
                        self.send_close(peer, code);
                        return error;
                    }
                    Event::Suspend => {
                        let packet = self.control.submit(Control::Suspend, now);
                        self.send(peer, &packet);
                        self.session.set_active(ActiveState::NotActive);
                        self.report();
                    }
                    Event::Activate { in_use } => {
                        let packet = self.control.submit(Control::Activate { in_use }, now);
                        self.send(peer, &packet);
                        self.session.set_active(ActiveState::Active);
                        self.report();
                    }
                    Event::Signaling(SignalingBody::Disconnect { .. }) => return RtcError::SessionClosedRemote,
                    other => log::trace!("Session {}: {:?} ignored while streaming", self.session.handle, other),
                }
            }

            while let Some((from, packet)) = self.recv() {
                if from == peer {
                    monitor.on_peer_activity(now);
                }
                let mut ctx = StreamContext {
                    peer,
                    handshake: &handshake,
                    monitor: &mut monitor,
                    reassembler: &mut reassembler,
                };
                if let Err(reason) = self.on_stream_packet(&mut ctx, from, packet, now) {
                    return reason;
                }
            }

            if let Err(reason) = self.flush_channels(peer, fragment_len, now) {
                return reason;
            }
            if let Err(reason) = self.flush_frames(peer, fragment_len) {
                return reason;
            }

            if let Some(control) = self.control.poll_retransmit(now) {
                self.send(peer, &control);
            }
            if let Some(heartbeat) = monitor.poll_send(now) {
                self.send(peer, &heartbeat);
            }
            if monitor.check_timeout(now) {
                log::warn!(
                    "Session {}: heartbeat timeout (last rtt {:?})",
                    self.session.handle,
                    monitor.rtt()
                );
                return RtcError::SessionClosedTimeout;
            }
            if monitor.state() != path_state {
                log::debug!("Session {}: path {:?} -> {:?}", self.session.handle, path_state, monitor.state());
                path_state = monitor.state();
            }

            if self.session.is_pre {
                if let Some(since) = self.session.not_active_since() {
                    if misc::check_timeout(since, reserve_ms) {
                        log::info!("Session {}: suspended pre-session expired", self.session.handle);
                        self.send_close(peer, RtcError::PreSessionReserveTimeout.code());
                        return RtcError::PreSessionReserveTimeout;
                    }
                }
            }

            if let Err(reason) = self.wait(POLL_INTERVAL) {
                return reason;
            }
        }
    }

    fn on_stream_packet(
        &mut self,
        ctx: &mut StreamContext<'_>,
        from: SocketAddr,
        packet: Packet,
        now: Instant,
    ) -> Result<(), RtcError> {
        let peer = ctx.peer;
        match packet {
            Packet::Binding(BindingMessage::Request(request)) => {
                self.send(from, &Packet::Binding(BindingMessage::Response(request.answer(from))));
            }
            Packet::Binding(BindingMessage::Response(_)) | Packet::Verify { .. } => {}
            Packet::Hello { nonce, .. } => {
                // Peer missed our Verify; only the pinned peer gets a reply
                if from == peer {
                    if let Some(reply) = ctx.handshake.cached_reply(&nonce) {
                        self.send(from, &reply);
                    }
                }
            }
            _ if from != peer => log::trace!("Session {}: dropping packet from {}", self.session.handle, from),
            Packet::Data {
                channel,
                seq,
                iv,
                payload,
            } => {
                let Some(ch) = self.session.channels.get(channel) else {
                    return Ok(());
                };
                let plain = match self.cipher.as_mut().map(|c| c.open(&iv, &payload)) {
                    Some(Ok(p)) => p,
                    _ => {
                        log::debug!("Session {}: undecryptable segment dropped", self.session.handle);
                        return Ok(());
                    }
                };
                let ack = ch.on_data(seq, &plain);
                self.send(peer, &Packet::Ack { channel, seq: ack });
            }
            Packet::Ack { channel, seq } => {
                if let Some(ch) = self.session.channels.get(channel) {
                    ch.on_ack(seq);
                }
            }
            Packet::Frame {
                frame_seq,
                index,
                count,
                frame_type,
                pts,
                timestamp,
                iv,
                payload,
            } => {
                let data = match self.cipher.as_mut().map(|c| c.open(&iv, &payload)) {
                    Some(Ok(p)) => p,
                    _ => return Ok(()),
                };
                let fragment = Fragment {
                    frame_seq,
                    index,
                    count,
                    frame_type,
                    pts,
                    timestamp,
                    data,
                };
                if let Some(frame) = ctx.reassembler.push(fragment) {
                    self.session.frames.push_inbound(frame);
                }
            }
            Packet::Heartbeat { seq, reply } => {
                if let Some(answer) = ctx.monitor.on_heartbeat(seq, reply, now) {
                    self.send(peer, &answer);
                }
            }
            Packet::Control(control) => return self.apply_remote_control(control),
            Packet::Reliable { seq, control } => {
                self.send(peer, &Packet::ControlAck { seq });
                if self.control.accept(seq) {
                    return self.apply_remote_control(control);
                }
            }
            Packet::ControlAck { seq } => self.control.on_ack(seq),
        }
        Ok(())
    }

    fn apply_remote_control(&self, control: Control) -> Result<(), RtcError> {
        match control {
            Control::Close { code } => {
                log::info!(
                    "Session {}: closed by remote ({:?})",
                    self.session.handle,
                    RtcError::from_code(code)
                );
                return Err(RtcError::SessionClosedRemote);
            }
            Control::Suspend => {
                self.session.set_active(ActiveState::NotActive);
                self.report();
            }
            Control::Activate { in_use } => {
                self.session.set_active(ActiveState::Active);
                self.report();
                if in_use && self.session.role == Role::Callee {
                    self.shared.enqueue_accept(self.session);
                }
            }
        }
        Ok(())
    }

    fn flush_channels(&mut self, peer: SocketAddr, fragment_len: usize, now: Instant) -> Result<(), RtcError> {
        let session = self.session;
        for ch in session.channels.iter() {
            let mut segments = ch.retransmit_due(now, DATA_RTO);
            segments.extend(ch.take_segments(fragment_len, SEND_WINDOW, now));
            for (seq, data) in segments {
                let (iv, payload) = self.seal(&data)?;
                self.send(
                    peer,
                    &Packet::Data {
                        channel: ch.id(),
                        seq,
                        iv,
                        payload,
                    },
                );
            }
        }
        Ok(())
    }

    fn flush_frames(&mut self, peer: SocketAddr, fragment_len: usize) -> Result<(), RtcError> {
        while let Some(frame) = self.session.frames.pop_outbound() {
            let seq = self.frame_seq;
            self.frame_seq = self.frame_seq.wrapping_add(1);
            for fragment in frame::fragment(&frame, seq, fragment_len)? {
                let (iv, payload) = self.seal(&fragment.data)?;
                self.send(
                    peer,
                    &Packet::Frame {
                        frame_seq: fragment.frame_seq,
                        index: fragment.index,
                        count: fragment.count,
                        frame_type: fragment.frame_type,
                        pts: fragment.pts,
                        timestamp: fragment.timestamp,
                        iv,
                        payload,
                    },
                );
            }
        }
        Ok(())
    }

    fn seal(&mut self, data: &[u8]) -> Result<([u8; AES_BLOCK_LEN], Vec<u8>), RtcError> {
        match self.cipher.as_mut() {
            Some(cipher) => cipher.seal(data),
            None => Err(RtcError::CryptoInitFailed),
        }
    }

    fn send_close(&self, peer: SocketAddr, code: i32) {
        let close = Packet::Control(Control::Close { code });
        for _ in 0..CLOSE_REPEAT {
            self.send(peer, &close);
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn finish(&mut self, reason: RtcError) {
        if self.session.fail(reason) {
            log::info!("Session {} ended: {}", self.session.handle, reason);
            self.report();
        }
        self.session.channels.close_all(reason);
        self.session.frames.close(reason);
        self.session.done.notify();
        *lock(&self.session.awaiting_http) = None;
        *lock(&self.session.waker) = None;

        if let (Some(port), Some(upnp)) = (self.upnp_port, self.shared.facade.upnp()) {
            upnp.release_port(PortProtocol::Udp, port);
        }
        self.link = None;

        if !self.session.is_owned() {
            self.shared.reap(self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn core(role: Role, is_pre: bool) -> SessionCore {
        SessionCore::new(
            SessionHandle::new(0, 1),
            SessionSpec {
                remote_id: "dev".into(),
                role,
                is_pre,
                session_id: "s1".into(),
                trace_id: None,
                dev_id: String::new(),
                lan_mode: true,
                media: MediaInfo::default(),
            },
            ChannelSet::new(&Options::new("app")),
        )
    }

    fn nego() -> Negotiation {
        Negotiation {
            checks: CheckList::new(true, 100),
            handshake: None,
            selected: None,
            answered: false,
            remote_requests_seen: false,
            has_relay: false,
            last_hello: None,
            keynego_since: None,
        }
    }

    #[test]
    fn test_cipher_roundtrip() {
        let mut cipher = SessionCipher::new(&SoftAes, &[7u8; SESSION_KEY_LEN]).unwrap();
        for len in [0usize, 1, 15, 16, 17, 1024] {
            let plain = vec![0xA5u8; len];
            let (iv, sealed) = cipher.seal(&plain).unwrap();
            assert_eq!(sealed.len() % AES_BLOCK_LEN, 0);
            assert!(sealed.len() > len);
            assert_eq!(cipher.open(&iv, &sealed).unwrap(), plain);
        }
    }

    #[test]
    fn test_cipher_rejects_garbage() {
        let mut cipher = SessionCipher::new(&SoftAes, &[1u8; SESSION_KEY_LEN]).unwrap();
        let iv = [0u8; AES_BLOCK_LEN];
        assert_eq!(cipher.open(&iv, &[]), Err(RtcError::InvalidParameter));
        assert_eq!(cipher.open(&iv, &[0u8; 5]), Err(RtcError::InvalidParameter));

        let mut other = SessionCipher::new(&SoftAes, &[2u8; SESSION_KEY_LEN]).unwrap();
        let (iv, sealed) = cipher.seal(b"payload").unwrap();
        assert_ne!(other.open(&iv, &sealed).ok(), Some(b"payload".to_vec()));
    }

    #[test]
    fn test_timeout_reason_classification() {
        let mut n = nego();
        assert_eq!(n.timeout_reason(), RtcError::TimeoutNoAnswer);
        n.answered = true;
        assert_eq!(n.timeout_reason(), RtcError::NoRelayAvailable);
        n.has_relay = true;
        assert_eq!(n.timeout_reason(), RtcError::TimeoutLocalNat);
        n.remote_requests_seen = true;
        assert_eq!(n.timeout_reason(), RtcError::TimeoutRemoteNat);
        n.keynego_since = Some(Instant::now());
        assert_eq!(n.timeout_reason(), RtcError::DtlsHandshakeTimeout);
    }

    #[test]
    fn test_data_gate_follows_lifecycle() {
        let session = core(Role::Caller, false);
        assert_eq!(session.check_data_ready(), Err(RtcError::NotConnected));
        assert!(session.advance(SessionState::P2pConnect));
        assert!(session.advance(SessionState::DtlsSrtpKeyNego));
        assert!(session.advance(SessionState::Stream));
        assert_eq!(session.check_data_ready(), Ok(()));
        assert!(session.fail(RtcError::SessionClosedRemote));
        assert!(!session.fail(RtcError::Timeout));
        assert_eq!(session.check_data_ready(), Err(RtcError::SessionClosedRemote));
    }

    #[test]
    fn test_suspended_pre_session_gated() {
        let session = core(Role::Caller, true);
        assert!(!session.is_owned());
        session.advance(SessionState::P2pConnect);
        session.advance(SessionState::DtlsSrtpKeyNego);
        session.advance(SessionState::Stream);
        session.set_active(ActiveState::Active);
        assert_eq!(session.check_data_ready(), Ok(()));

        session.set_active(ActiveState::NotActive);
        assert!(session.not_active_since().is_some());
        assert_eq!(session.check_data_ready(), Err(RtcError::PreSessionSuspended));

        session.set_active(ActiveState::Activating);
        assert!(session.not_active_since().is_none());
    }

    #[test]
    fn test_inbox_and_http_routing() {
        let session = core(Role::Caller, false);
        assert!(session.is_owned());
        assert!(session
            .wait_events(Instant::now() + Duration::from_millis(10))
            .is_empty());

        session.post(Event::RemoteOnline);
        session.post(Event::Cancel(RtcError::ConnectBreak));
        let events = session.wait_events(Instant::now() + Duration::from_secs(1));
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::Cancel(RtcError::ConnectBreak)));
        assert!(session.drain_events().is_empty());

        assert!(!session.awaits_http(TOKEN_API, None));
        *lock(&session.awaiting_http) = Some((TOKEN_API.to_string(), "dev".to_string()));
        assert!(session.awaits_http(TOKEN_API, None));
        assert!(session.awaits_http(TOKEN_API, Some("dev")));
        assert!(!session.awaits_http(TOKEN_API, Some("other")));
        assert!(!session.awaits_http("other.api", None));
    }
}
