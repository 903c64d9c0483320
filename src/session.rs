//! Session data model
//!
//! Handles, lifecycle states and the descriptive information reported by
//! `get_session_info`. The state machine itself runs in the worker; this
//! module only defines which transitions are legal.
//!
//! ```text
//!   GetToken ──▶ P2pConnect ──▶ DtlsSrtpKeyNego ──▶ Stream
//!      │             │                 │              │
//!      └─────────────┴─────────┬───────┴──────────────┘
//!                              ▼
//!                            Failed (terminal)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RtcError;

// ============================================================================
// Handle
// ============================================================================

/// Generation-checked session handle
///
/// The raw form is a non-negative `i32`: slot index in the low 16 bits,
/// slot generation (15 bits) above it. A stale handle whose slot was reused
/// no longer matches the slot's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u16,
    generation: u16,
}

/// Generations wrap inside 15 bits so the raw handle stays non-negative
pub(crate) const GENERATION_MASK: u16 = 0x7fff;

impl SessionHandle {
    pub(crate) fn new(index: u16, generation: u16) -> Self {
        Self {
            index,
            generation: generation & GENERATION_MASK,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn as_raw(&self) -> i32 {
        ((self.generation as i32) << 16) | self.index as i32
    }

    /// Decode a raw handle; negative values are never valid
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw < 0 {
            return None;
        }
        Some(Self::new((raw & 0xffff) as u16, (raw >> 16) as u16))
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

// ============================================================================
// States
// ============================================================================

/// Main lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    GetToken,
    P2pConnect,
    DtlsSrtpKeyNego,
    Stream,
    Failed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::GetToken => 0,
            SessionState::P2pConnect => 1,
            SessionState::DtlsSrtpKeyNego => 2,
            SessionState::Stream => 3,
            SessionState::Failed => 4,
        }
    }

    /// Legal transitions: strictly forward, and `Failed` from anything but itself
    pub fn can_advance_to(self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Failed, _) => false,
            (_, SessionState::Failed) => true,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Failed
    }
}

/// Activation sub-state of pre-sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActiveState {
    NotActive,
    Activating,
    Active,
    Suspending,
}

/// Transport flavour, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    P2p,
    Webrtc,
}

/// Which side initiated the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

// ============================================================================
// Codecs and Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioCodec {
    pub name: String,
    pub sample_rate: u32,
    pub channel_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoCodec {
    pub name: String,
    pub clock_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    Audio,
    VideoP,
    VideoI,
}

/// Media frame; payload content is opaque to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Presentation timestamp
    pub pts: u64,
    /// Wall-clock timestamp in milliseconds
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

// ============================================================================
// Lifecycle
// ============================================================================

/// State pair plus the error that ended the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub state: SessionState,
    pub active_state: ActiveState,
    pub error: Option<RtcError>,
}

impl Lifecycle {
    pub fn new(is_pre: bool) -> Self {
        Self {
            state: SessionState::GetToken,
            active_state: if is_pre {
                ActiveState::Activating
            } else {
                ActiveState::NotActive
            },
            error: None,
        }
    }

    /// Move forward; returns `false` (and changes nothing) on an illegal move
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) || next == SessionState::Failed {
            return false;
        }
        self.state = next;
        true
    }

    /// Enter `Failed` with `error`; the first failure wins
    pub fn fail(&mut self, error: RtcError) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Failed;
        self.error = Some(error);
        true
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Stream
    }
}

/// State change delivered to `Facade::on_session_state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub remote_id: String,
    pub handle: SessionHandle,
    pub is_pre: bool,
    pub state: SessionState,
    pub active_state: ActiveState,
    pub error: Option<RtcError>,
}

/// Snapshot returned by `Engine::get_session_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub handle: i32,
    pub remote_id: String,
    pub is_pre: bool,
    pub state: SessionState,
    pub active_state: ActiveState,
    pub connection_type: ConnectionType,
    pub audio_codec: Option<AudioCodec>,
    pub video_codec: Option<VideoCodec>,
    pub trace_id: Option<String>,
    pub session_id: String,
    pub dev_id: String,
    pub sub_dev_id: String,
    pub stream_type: i32,
    pub is_replay: bool,
    pub start_time: u64,
    pub end_time: u64,
    /// Wire code of the terminal error, if any
    pub error: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY: [SessionState; 4] = [
        SessionState::GetToken,
        SessionState::P2pConnect,
        SessionState::DtlsSrtpKeyNego,
        SessionState::Stream,
    ];

    #[test]
    fn test_handle_raw_roundtrip() {
        let h = SessionHandle::new(17, 0x7fff);
        assert!(h.as_raw() >= 0);
        assert_eq!(SessionHandle::from_raw(h.as_raw()), Some(h));
        assert_eq!(SessionHandle::from_raw(-1), None);
    }

    #[test]
    fn test_forward_only() {
        for (i, from) in HAPPY.iter().enumerate() {
            for (j, to) in HAPPY.iter().enumerate() {
                assert_eq!(from.can_advance_to(*to), j > i, "{:?} -> {:?}", from, to);
            }
            assert!(from.can_advance_to(SessionState::Failed));
        }
        for s in HAPPY {
            assert!(!SessionState::Failed.can_advance_to(s));
        }
        assert!(!SessionState::Failed.can_advance_to(SessionState::Failed));
    }

    #[test]
    fn test_lifecycle_first_failure_wins() {
        let mut lc = Lifecycle::new(false);
        assert!(lc.advance(SessionState::P2pConnect));
        assert!(!lc.advance(SessionState::GetToken));
        assert!(lc.fail(RtcError::TimeoutNoAnswer));
        assert!(!lc.fail(RtcError::ConnectBreak));
        assert_eq!(lc.error, Some(RtcError::TimeoutNoAnswer));
        assert!(!lc.advance(SessionState::Stream));
    }

    #[test]
    fn test_pre_session_starts_activating() {
        assert_eq!(Lifecycle::new(true).active_state, ActiveState::Activating);
        assert_eq!(Lifecycle::new(false).active_state, ActiveState::NotActive);
    }
}
