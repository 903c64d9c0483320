//! Engine options
//!
//! Options are fixed for the lifetime of an engine instance (until
//! `Engine::reset`). Buffer sizes apply uniformly to every session of the
//! engine. Options can be built in code or loaded from JSON; missing JSON
//! fields take their defaults.

use serde::{Deserialize, Serialize};

use crate::error::RtcError;

// ============================================================================
// Limits
// ============================================================================

/// Hard cap on channels per session
pub const CHANNEL_NUMBER_MAX: u32 = 320;

/// Hard cap on concurrent sessions per engine
pub const SESSION_NUMBER_MAX: u32 = 1024;

/// Maximum length of local/remote/device ids in bytes
pub const ID_LEN_MAX: usize = 80;

/// Video bitrate bounds in kbps
pub const VIDEO_BITRATE_MIN_KBPS: u32 = 600;
pub const VIDEO_BITRATE_MAX_KBPS: u32 = 4000;

/// Largest link payload fragment (keeps datagrams under a typical MTU)
pub const FRAGMENT_LEN_MAX: u32 = 1200;

const DEFAULT_CHANNEL_NUMBER: u32 = 4;
const DEFAULT_SESSION_NUMBER: u32 = 8;
const DEFAULT_PRE_SESSION_NUMBER: u32 = 2;
const DEFAULT_BUF_SIZE: u32 = 256 * 1024;
const DEFAULT_VIDEO_BITRATE_KBPS: u32 = 1600;
const DEFAULT_FRAGMENT_LEN: u32 = 1024;

// ============================================================================
// Options
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Identity of this endpoint in signaling
    pub local_id: String,
    pub max_channel_number: u32,
    pub max_session_number: u32,
    pub max_pre_session_number: u32,
    /// Per-channel send capacity in bytes; missing entries use the default
    pub send_buf_size: Vec<u32>,
    /// Per-channel receive capacity in bytes; missing entries use the default
    pub recv_buf_size: Vec<u32>,
    pub video_bitrate_kbps: u32,
    pub preconnect_enable: bool,
    /// Payload bytes per link packet
    pub fragment_len: u32,
    pub heartbeat_interval_ms: u64,
    /// Silence after which a streaming session is declared dead
    pub heartbeat_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Wait for an HTTP token answer
    pub token_timeout_ms: u64,
    /// Negotiation deadline for incoming sessions
    pub accept_timeout_ms: u64,
    /// How long a suspended pre-session is kept before it is reclaimed
    pub pre_session_reserve_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            local_id: String::new(),
            max_channel_number: DEFAULT_CHANNEL_NUMBER,
            max_session_number: DEFAULT_SESSION_NUMBER,
            max_pre_session_number: DEFAULT_PRE_SESSION_NUMBER,
            send_buf_size: Vec::new(),
            recv_buf_size: Vec::new(),
            video_bitrate_kbps: DEFAULT_VIDEO_BITRATE_KBPS,
            preconnect_enable: false,
            fragment_len: DEFAULT_FRAGMENT_LEN,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            token_timeout_ms: 5_000,
            accept_timeout_ms: 15_000,
            pre_session_reserve_ms: 60_000,
        }
    }
}

impl Options {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            ..Self::default()
        }
    }

    /// Parse options from JSON
    pub fn from_json(json: &str) -> Result<Self, RtcError> {
        serde_json::from_str(json).map_err(|e| {
            log::warn!("Invalid options JSON: {}", e);
            RtcError::InvalidParameter
        })
    }

    /// Same send/receive capacity for every channel
    pub fn with_uniform_buffers(mut self, send: u32, recv: u32) -> Self {
        let n = self.max_channel_number as usize;
        self.send_buf_size = vec![send; n];
        self.recv_buf_size = vec![recv; n];
        self
    }

    /// Check bounds and fill in defaults
    ///
    /// Hard errors: empty or over-long `local_id`, channel/session counts
    /// out of range. Soft issues (bitrate, fragment length, missing buffer
    /// sizes) are corrected with a warning.
    pub fn normalize(mut self) -> Result<Self, RtcError> {
        if self.local_id.is_empty() || self.local_id.len() > ID_LEN_MAX {
            return Err(RtcError::InvalidId);
        }
        if self.max_channel_number == 0 || self.max_channel_number > CHANNEL_NUMBER_MAX {
            log::warn!(
                "max_channel_number {} outside 1..={}",
                self.max_channel_number,
                CHANNEL_NUMBER_MAX
            );
            return Err(RtcError::InvalidParameter);
        }
        if self.max_session_number == 0 || self.max_session_number > SESSION_NUMBER_MAX {
            log::warn!(
                "max_session_number {} outside 1..={}",
                self.max_session_number,
                SESSION_NUMBER_MAX
            );
            return Err(RtcError::InvalidParameter);
        }
        if self.max_pre_session_number > self.max_session_number {
            self.max_pre_session_number = self.max_session_number;
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(RtcError::InvalidParameter);
        }

        let n = self.max_channel_number as usize;
        for sizes in [&mut self.send_buf_size, &mut self.recv_buf_size] {
            sizes.resize(n, DEFAULT_BUF_SIZE);
            for size in sizes.iter_mut().filter(|s| **s == 0) {
                *size = DEFAULT_BUF_SIZE;
            }
        }
        // A receive buffer must hold at least one full segment
        for size in self.recv_buf_size.iter_mut().filter(|s| **s < FRAGMENT_LEN_MAX) {
            log::warn!("recv_buf_size {} raised to {}", size, FRAGMENT_LEN_MAX);
            *size = FRAGMENT_LEN_MAX;
        }

        if self.video_bitrate_kbps == 0 {
            self.video_bitrate_kbps = DEFAULT_VIDEO_BITRATE_KBPS;
        }
        let clamped = self
            .video_bitrate_kbps
            .clamp(VIDEO_BITRATE_MIN_KBPS, VIDEO_BITRATE_MAX_KBPS);
        if clamped != self.video_bitrate_kbps {
            log::warn!("video bitrate {} kbps clamped to {}", self.video_bitrate_kbps, clamped);
            self.video_bitrate_kbps = clamped;
        }

        if self.fragment_len == 0 || self.fragment_len > FRAGMENT_LEN_MAX {
            log::warn!("fragment_len {} reset to {}", self.fragment_len, DEFAULT_FRAGMENT_LEN);
            self.fragment_len = DEFAULT_FRAGMENT_LEN;
        }
        Ok(self)
    }

    pub fn send_capacity(&self, channel: u32) -> usize {
        self.send_buf_size
            .get(channel as usize)
            .copied()
            .unwrap_or(DEFAULT_BUF_SIZE) as usize
    }

    pub fn recv_capacity(&self, channel: u32) -> usize {
        self.recv_buf_size
            .get(channel as usize)
            .copied()
            .unwrap_or(DEFAULT_BUF_SIZE) as usize
    }
}

// ============================================================================
// Tests
// ============================================================================
