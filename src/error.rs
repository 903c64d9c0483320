//! Error taxonomy for the session engine
//!
//! Every public operation reports failures through [`RtcError`]. Each kind
//! keeps the stable negative integer of the SDK's wire protocol: codes travel
//! inside `reject`/`disconnect` signaling messages and link close packets, so
//! both ends must agree on them.

use std::fmt;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, RtcError>;

/// Errors returned by engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtcError {
    /// Engine not initialized (or already torn down)
    NotInitialized,
    /// An engine with the same local id is already running
    AlreadyInitialized,
    /// Generic deadline elapsed with nothing transferred
    Timeout,
    /// Remote or local id empty or longer than `ID_LEN_MAX`
    InvalidId,
    /// Bad argument rejected at the call boundary
    InvalidParameter,
    /// Remote peer reported offline by the signaling layer
    DeviceOffline,
    /// Connectivity checks failed and no relay was usable
    NoRelayAvailable,
    /// Handle unknown, stale or already closed
    InvalidHandle,
    /// Remote peer closed the session
    SessionClosedRemote,
    /// Heartbeats lapsed
    SessionClosedTimeout,
    /// Session closed by a local `close()` call
    SessionClosedExplicit,
    /// Remote or local buffer cannot take more data
    BufferFull,
    /// `listen()` interrupted by `listen_break()`
    ListenBreak,
    /// Session table (or pre-session quota) exhausted
    MaxSessionExceeded,
    /// UDP socket bind failed
    UdpPortBindFailed,
    /// Negotiation interrupted by `connect_break()`
    ConnectBreak,
    /// Worker thread could not be spawned
    ThreadCreateFailed,
    /// Operation requires a pre-session but the handle is not one
    InvalidPreSession,
    /// Session has not reached STREAM yet
    NotConnected,
    /// Pre-session already activating or active for this remote
    PreSessionAlreadyActive,
    /// Pre-session is not active
    PreSessionNotActive,
    /// Pre-session suspended by `close()`
    PreSessionSuspended,
    /// Allocation failed
    OutOfMemory,
    /// HTTP façade returned a failure
    HttpFailed,
    /// Pre-connect disabled in options
    PreconnectUnsupported,
    /// Peer certificate does not match the signaled fingerprint
    DtlsFingerprintMismatch,
    /// Token request received no answer in time
    GetTokenTimeout,
    /// Signaling authentication rejected
    AuthFailed,
    /// Credential or cipher setup failed
    CryptoInitFailed,
    /// Handshake failed (bad signature or malformed certificate)
    DtlsHandshakeFailed,
    /// Handshake did not complete in time
    DtlsHandshakeTimeout,
    /// Remote stopped answering during negotiation
    RemoteNoResponse,
    /// Suspended pre-session reclaimed after its reserve time
    PreSessionReserveTimeout,
    /// Engine reset while the session was alive
    Reset,
    /// AES key rejected by the cipher
    InvalidAesKey,
    /// Relay token malformed
    InvalidToken,
    /// Offer sent but no answer arrived before the deadline
    TimeoutNoAnswer,
    /// No local host candidate could be gathered
    TimeoutNoLocalCandidate,
    /// Connectivity checks failed on the local NAT side
    TimeoutLocalNat,
    /// Connectivity checks failed on the remote NAT side
    TimeoutRemoteNat,
}

/// Every kind with its wire code, in code order
const CODES: &[(RtcError, i32)] = &[
    (RtcError::NotInitialized, -1),
    (RtcError::AlreadyInitialized, -2),
    (RtcError::Timeout, -3),
    (RtcError::InvalidId, -4),
    (RtcError::InvalidParameter, -5),
    (RtcError::DeviceOffline, -6),
    (RtcError::NoRelayAvailable, -10),
    (RtcError::InvalidHandle, -11),
    (RtcError::SessionClosedRemote, -12),
    (RtcError::SessionClosedTimeout, -13),
    (RtcError::SessionClosedExplicit, -14),
    (RtcError::BufferFull, -15),
    (RtcError::ListenBreak, -16),
    (RtcError::MaxSessionExceeded, -17),
    (RtcError::UdpPortBindFailed, -18),
    (RtcError::ConnectBreak, -19),
    (RtcError::ThreadCreateFailed, -22),
    (RtcError::InvalidPreSession, -24),
    (RtcError::NotConnected, -25),
    (RtcError::PreSessionAlreadyActive, -26),
    (RtcError::PreSessionNotActive, -27),
    (RtcError::PreSessionSuspended, -28),
    (RtcError::OutOfMemory, -29),
    (RtcError::HttpFailed, -30),
    (RtcError::PreconnectUnsupported, -31),
    (RtcError::DtlsFingerprintMismatch, -32),
    (RtcError::GetTokenTimeout, -33),
    (RtcError::AuthFailed, -34),
    (RtcError::CryptoInitFailed, -35),
    (RtcError::DtlsHandshakeFailed, -37),
    (RtcError::DtlsHandshakeTimeout, -38),
    (RtcError::RemoteNoResponse, -39),
    (RtcError::PreSessionReserveTimeout, -40),
    (RtcError::Reset, -41),
    (RtcError::InvalidAesKey, -47),
    (RtcError::InvalidToken, -49),
    (RtcError::TimeoutNoAnswer, -50),
    (RtcError::TimeoutNoLocalCandidate, -51),
    (RtcError::TimeoutLocalNat, -52),
    (RtcError::TimeoutRemoteNat, -53),
];

impl RtcError {
    /// Stable negative code of this error
    pub fn code(self) -> i32 {
        CODES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, code)| *code)
            .unwrap_or(-5)
    }

    /// Map a wire code back to its kind
    pub fn from_code(code: i32) -> Option<Self> {
        CODES.iter().find(|(_, c)| *c == code).map(|(kind, _)| *kind)
    }

    /// Whether this error belongs to the timeout class
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            RtcError::Timeout
                | RtcError::GetTokenTimeout
                | RtcError::DtlsHandshakeTimeout
                | RtcError::SessionClosedTimeout
                | RtcError::PreSessionReserveTimeout
                | RtcError::TimeoutNoAnswer
                | RtcError::TimeoutNoLocalCandidate
                | RtcError::TimeoutLocalNat
                | RtcError::TimeoutRemoteNat
        )
    }

    /// Whether the session ended (as opposed to a rejected call)
    pub fn is_session_closed(self) -> bool {
        matches!(
            self,
            RtcError::SessionClosedRemote
                | RtcError::SessionClosedTimeout
                | RtcError::SessionClosedExplicit
                | RtcError::Reset
        )
    }
}

impl fmt::Display for RtcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RtcError::NotInitialized => "engine not initialized",
            RtcError::AlreadyInitialized => "engine already initialized",
            RtcError::Timeout => "operation timed out",
            RtcError::InvalidId => "invalid id",
            RtcError::InvalidParameter => "invalid parameter",
            RtcError::DeviceOffline => "device not online",
            RtcError::NoRelayAvailable => "no relay server available",
            RtcError::InvalidHandle => "invalid session handle",
            RtcError::SessionClosedRemote => "session closed by remote",
            RtcError::SessionClosedTimeout => "session closed on heartbeat timeout",
            RtcError::SessionClosedExplicit => "session closed locally",
            RtcError::BufferFull => "buffer full",
            RtcError::ListenBreak => "listen interrupted",
            RtcError::MaxSessionExceeded => "maximum number of sessions reached",
            RtcError::UdpPortBindFailed => "udp port bind failed",
            RtcError::ConnectBreak => "connect interrupted",
            RtcError::ThreadCreateFailed => "failed to create session thread",
            RtcError::InvalidPreSession => "not a pre-session",
            RtcError::NotConnected => "session not connected",
            RtcError::PreSessionAlreadyActive => "pre-session already active",
            RtcError::PreSessionNotActive => "pre-session not active",
            RtcError::PreSessionSuspended => "pre-session suspended",
            RtcError::OutOfMemory => "out of memory",
            RtcError::HttpFailed => "http request failed",
            RtcError::PreconnectUnsupported => "pre-connect not enabled",
            RtcError::DtlsFingerprintMismatch => "peer certificate fingerprint mismatch",
            RtcError::GetTokenTimeout => "timed out fetching relay token",
            RtcError::AuthFailed => "signaling authentication failed",
            RtcError::CryptoInitFailed => "crypto initialization failed",
            RtcError::DtlsHandshakeFailed => "handshake failed",
            RtcError::DtlsHandshakeTimeout => "handshake timed out",
            RtcError::RemoteNoResponse => "remote not responding",
            RtcError::PreSessionReserveTimeout => "suspended pre-session expired",
            RtcError::Reset => "engine reset",
            RtcError::InvalidAesKey => "invalid aes key",
            RtcError::InvalidToken => "invalid relay token",
            RtcError::TimeoutNoAnswer => "timed out waiting for answer",
            RtcError::TimeoutNoLocalCandidate => "no local host candidate",
            RtcError::TimeoutLocalNat => "local nat traversal failed",
            RtcError::TimeoutRemoteNat => "remote nat traversal failed",
        };
        write!(f, "{} ({})", text, self.code())
    }
}

impl std::error::Error for RtcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for (kind, code) in CODES {
            assert!(*code < 0, "{:?}", kind);
            assert!(seen.insert(*code), "duplicate code {}", code);
            assert_eq!(kind.code(), *code);
        }
    }

    #[test]
    fn test_from_code_roundtrip() {
        assert_eq!(RtcError::from_code(-32), Some(RtcError::DtlsFingerprintMismatch));
        assert_eq!(RtcError::from_code(-19), Some(RtcError::ConnectBreak));
        assert_eq!(RtcError::from_code(0), None);
        assert_eq!(RtcError::from_code(-21), None);
    }

    #[test]
    fn test_timeout_class() {
        assert!(RtcError::TimeoutNoAnswer.is_timeout());
        assert!(RtcError::GetTokenTimeout.is_timeout());
        assert!(!RtcError::ConnectBreak.is_timeout());
        assert!(!RtcError::AuthFailed.is_timeout());
    }

    #[test]
    fn test_display_includes_code() {
        assert_eq!(RtcError::InvalidHandle.to_string(), "invalid session handle (-11)");
    }
}
