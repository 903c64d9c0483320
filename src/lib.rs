//! P2P RTC session engine
//!
//! This crate establishes and runs peer-to-peer media/data sessions between
//! two endpoints identified by opaque ids:
//! - session lifecycle (token, candidate exchange, key negotiation, streaming)
//! - reliable multiplexed data channels and media frame queues
//! - per-session self-signed credentials with fingerprint pinning
//! - a façade trait through which the host supplies signaling, HTTP,
//!   logging, AES and UPnP
//!
//! ```no_run
//! use std::sync::Arc;
//! use p2p_rtc::{Engine, Facade, Options, RtcError};
//!
//! struct Cloud;
//!
//! impl Facade for Cloud {
//!     fn on_signaling(&self, remote_id: &str, message: &str) -> Result<(), RtcError> {
//!         // hand `message` to the signaling service for `remote_id`
//!         Ok(())
//!     }
//! }
//!
//! let engine = Engine::init(Options::new("app-1"), Arc::new(Cloud))?;
//! let handle = engine.connect("dev-123", "", None, true, 5000)?;
//! engine.send_data(handle, 0, b"hello", 1000)?;
//! engine.close(handle, 0)?;
//! # Ok::<(), RtcError>(())
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod channel;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod facade;
pub mod frame;
pub mod logging;
pub mod misc;
pub mod session;
pub mod sync;
pub mod token;

pub mod p2p;

mod table;
mod worker;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::BufferStatus;
pub use config::Options;
pub use credential::{Credentials, CryptoError, Fingerprint, HashAlgorithm};
pub use engine::{version, version_string, ConnectRequest, Engine, SKILL_LAN, SKILL_P2P, SKILL_PRECONNECT, SKILL_WEBRTC};
pub use error::{Result, RtcError};
pub use facade::{AesContext, AesMode, AesProvider, Facade, PortMapping, PortProtocol, SoftAes, UpnpProvider};
pub use session::{
    ActiveState, AudioCodec, ConnectionType, Frame, FrameType, Role, SessionEvent, SessionHandle, SessionInfo,
    SessionState, VideoCodec,
};
pub use token::RelayToken;
pub use worker::TOKEN_API;
