//! Signaling codec
//!
//! Offers, answers and teardown notices travel through the application's
//! signaling channel (`Facade::on_signaling` out, `Engine::set_signaling`
//! in) as JSON envelopes:
//!
//! ```text
//! {
//!   "header": {"from": "app-1", "to": "dev-123", "session_id": "..", "trace_id": ".."},
//!   "body":   "{\"type\":\"offer\", ...}",
//!   "auth":   "base64(hmac-sha256(relay password, body))"
//! }
//! ```
//!
//! The body is kept as a string so the MAC covers the exact bytes sent.
//!
//! # Session Flow
//!
//! ```text
//! Caller                                          Callee
//!   │─── offer (candidates, fingerprint, key) ─────►│
//!   │◄── answer (candidates, fingerprint) ──────────│
//!   │         ... link checks + handshake ...       │
//!   │─── disconnect (code) ────────────────────────►│  (only if the link is gone)
//! ```

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::hmac;
use serde::{Deserialize, Serialize};

use super::candidate::Candidate;
use crate::error::RtcError;
use crate::misc;
use crate::session::{AudioCodec, ConnectionType, VideoCodec};
use crate::token::RelayToken;

// ============================================================================
// Constants
// ============================================================================

/// Largest signaling message accepted
pub const MAX_MESSAGE_SIZE: usize = 200 * 1024;

/// Length of generated session ids
pub const SESSION_ID_LEN: usize = 32;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub from: String,
    pub to: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Session proposal from the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub is_pre: bool,
    #[serde(default)]
    pub lan_mode: bool,
    #[serde(default)]
    pub dev_id: String,
    /// Caller capabilities, opaque JSON
    #[serde(default)]
    pub skill: String,
    pub candidates: Vec<Candidate>,
    pub fingerprint: String,
    /// Hex session key for payload encryption
    pub aes_key: String,
    /// Negotiation deadline the caller is working with
    pub timeout_ms: u64,
    /// Caller's relay token; its password keys the envelope MAC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<RelayToken>,
    #[serde(default)]
    pub audio_codec: Option<AudioCodec>,
    #[serde(default)]
    pub video_codec: Option<VideoCodec>,
    #[serde(default)]
    pub stream_type: i32,
    #[serde(default)]
    pub is_replay: bool,
    #[serde(default)]
    pub start_time: u64,
    #[serde(default)]
    pub end_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub candidates: Vec<Candidate>,
    pub fingerprint: String,
    #[serde(default)]
    pub sub_dev_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingBody {
    Offer(Offer),
    Answer(Answer),
    /// Offer refused; `code` is an `RtcError` wire code
    Reject { code: i32 },
    /// Session abandoned by the sender
    Disconnect { code: i32 },
}

impl SignalingBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingBody::Offer(_) => "offer",
            SignalingBody::Answer(_) => "answer",
            SignalingBody::Reject { .. } => "reject",
            SignalingBody::Disconnect { .. } => "disconnect",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    Serialization(String),
    Deserialization(String),
    MessageTooLarge(usize),
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::Serialization(e) => write!(f, "serialization error: {}", e),
            SignalingError::Deserialization(e) => write!(f, "deserialization error: {}", e),
            SignalingError::MessageTooLarge(size) => {
                write!(f, "message too large: {} bytes (max {})", size, MAX_MESSAGE_SIZE)
            }
        }
    }
}

impl std::error::Error for SignalingError {}

impl From<SignalingError> for RtcError {
    fn from(_: SignalingError) -> Self {
        RtcError::InvalidParameter
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialize `body` into an envelope, MAC'd with `auth_key` when given
pub fn encode(header: Header, body: &SignalingBody, auth_key: Option<&[u8]>) -> Result<String, SignalingError> {
    let body = serde_json::to_string(body).map_err(|e| SignalingError::Serialization(e.to_string()))?;
    let auth = auth_key.filter(|k| !k.is_empty()).map(|k| compute_auth(k, &body));
    let envelope = Envelope { header, body, auth };
    let text = serde_json::to_string(&envelope).map_err(|e| SignalingError::Serialization(e.to_string()))?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(SignalingError::MessageTooLarge(text.len()));
    }
    Ok(text)
}

/// Parse an envelope and its body
pub fn decode(text: &str) -> Result<(Envelope, SignalingBody), SignalingError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(SignalingError::MessageTooLarge(text.len()));
    }
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| SignalingError::Deserialization(e.to_string()))?;
    let body: SignalingBody =
        serde_json::from_str(&envelope.body).map_err(|e| SignalingError::Deserialization(e.to_string()))?;
    Ok((envelope, body))
}

/// `base64(hmac-sha256(key, body))`
pub fn compute_auth(key: &[u8], body: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    BASE64.encode(hmac::sign(&key, body.as_bytes()).as_ref())
}

pub fn verify_auth(key: &[u8], body: &str, mac: &str) -> bool {
    let Ok(tag) = BASE64.decode(mac.trim()) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, body.as_bytes(), &tag).is_ok()
}

/// Random signaling session id
pub fn generate_session_id() -> String {
    misc::rand_string(SESSION_ID_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            from: "app-1".into(),
            to: "dev-123".into(),
            session_id: generate_session_id(),
            trace_id: Some("trace-7".into()),
        }
    }

    fn offer() -> SignalingBody {
        SignalingBody::Offer(Offer {
            connection_type: ConnectionType::Webrtc,
            is_pre: false,
            lan_mode: true,
            dev_id: "dev-123".into(),
            skill: String::new(),
            candidates: vec![Candidate::host("192.168.1.2:5000".parse().unwrap())],
            fingerprint: "sha-256 00".into(),
            aes_key: "00112233445566778899aabbccddeeff".into(),
            timeout_ms: 5000,
            token: None,
            audio_codec: Some(AudioCodec {
                name: "PCMA".into(),
                sample_rate: 8000,
                channel_number: 1,
            }),
            video_codec: None,
            stream_type: 0,
            is_replay: false,
            start_time: 0,
            end_time: 0,
        })
    }

    #[test]
    fn test_encode_decode_offer() {
        let text = encode(header(), &offer(), Some(b"pw".as_slice())).unwrap();
        let (env, body) = decode(&text).unwrap();
        assert_eq!(body, offer());
        assert_eq!(env.header.trace_id.as_deref(), Some("trace-7"));
        assert!(verify_auth(b"pw", &env.body, env.auth.as_deref().unwrap()));
        assert!(!verify_auth(b"other", &env.body, env.auth.as_deref().unwrap()));
    }

    #[test]
    fn test_no_auth_without_key() {
        let text = encode(header(), &SignalingBody::Disconnect { code: -14 }, Some(b"".as_slice())).unwrap();
        let (env, body) = decode(&text).unwrap();
        assert!(env.auth.is_none());
        assert_eq!(body, SignalingBody::Disconnect { code: -14 });
        assert!(text.contains("\\\"type\\\":\\\"disconnect\\\""));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode("nope"), Err(SignalingError::Deserialization(_))));
        let bad_body = r#"{"header":{"from":"a","to":"b","session_id":"s"},"body":"{}"}"#;
        assert!(matches!(decode(bad_body), Err(SignalingError::Deserialization(_))));
    }

    #[test]
    fn test_decode_too_large() {
        let huge = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert_eq!(decode(&huge), Err(SignalingError::MessageTooLarge(MAX_MESSAGE_SIZE + 1)));
    }

    #[test]
    fn test_verify_auth_bad_base64() {
        assert!(!verify_auth(b"k", "{}", "***"));
    }

    #[test]
    fn test_session_id_shape() {
        let a = generate_session_id();
        assert_eq!(a.len(), SESSION_ID_LEN);
        assert_ne!(a, generate_session_id());
    }
}
