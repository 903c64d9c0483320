//! P2P transport for sessions
//!
//! Everything a session thread needs to get from "two ids" to an
//! authenticated UDP path: candidate gathering, the signaling codec,
//! connectivity checks, the link packet format, the handshake and
//! heartbeats.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      P2P Module Structure                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  candidate.rs    - candidate types, priorities and gathering  │
//! │  signaling.rs    - offer/answer envelopes and their MAC       │
//! │  connectivity.rs - binding checks and nomination              │
//! │  link.rs         - datagram format and the session socket     │
//! │  handshake.rs    - certificate pinning and key proof          │
//! │  resilience.rs   - heartbeats on established paths            │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod candidate;
pub mod connectivity;
pub mod handshake;
pub mod link;
pub mod resilience;
pub mod signaling;

pub use candidate::{
    calculate_priority,
    enumerate_local_addresses,
    gather_host_candidates,
    gather_relay_candidates,
    gather_upnp_candidates,
    sort_by_priority,
    Candidate,
    CandidateType,
};

pub use signaling::{
    decode,
    encode,
    generate_session_id,
    Answer,
    Envelope,
    Header,
    Offer,
    SignalingBody,
    SignalingError,
    MAX_MESSAGE_SIZE,
};

pub use link::{Control, Link, LinkError, Packet, MAX_DATAGRAM_SIZE};
