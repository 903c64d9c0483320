//! Session link: packet format and UDP socket
//!
//! Every datagram carries a magic, the session tag (derived from the
//! signaling session id, so stray traffic from other sessions is dropped)
//! and one bincode-encoded [`Packet`]:
//!
//! ```text
//! ┌────────┬──────────────┬──────────────────────────┐
//! │ "PR"   │ tag (u64 BE) │ bincode(Packet)          │
//! │ 2 bytes│ 8 bytes      │ ≤ MAX_DATAGRAM_SIZE - 10 │
//! └────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! The socket is a non-blocking mio `UdpSocket` registered with a `Poll`
//! together with a `Waker`, so application threads can interrupt a session
//! thread blocked in [`Link::wait`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bincode::Options as _;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use ring::digest;
use serde::{Deserialize, Serialize};

use super::connectivity::BindingMessage;
use crate::facade::AES_BLOCK_LEN;
use crate::session::FrameType;

// ============================================================================
// Constants
// ============================================================================

/// Maximum UDP payload we send
pub const MAX_DATAGRAM_SIZE: usize = 1350;

/// Handshake nonce length
pub const NONCE_LEN: usize = 32;

const MAGIC: [u8; 2] = *b"PR";
const HEADER_LEN: usize = 10;

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

// ============================================================================
// Packets
// ============================================================================

/// In-band session control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Pre-session resumed; `in_use` when the application took it over
    Activate { in_use: bool },
    /// Pre-session parked by its owner
    Suspend,
    /// Session torn down; `code` is an `RtcError` wire code
    Close { code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Binding(BindingMessage),
    /// Handshake: our certificate and challenge
    Hello { nonce: [u8; NONCE_LEN], cert_der: Vec<u8> },
    /// Handshake: signature over both nonces
    Verify { signature: Vec<u8> },
    /// Encrypted channel segment
    Data {
        channel: u32,
        seq: u32,
        iv: [u8; AES_BLOCK_LEN],
        payload: Vec<u8>,
    },
    /// Cumulative channel acknowledgement
    Ack { channel: u32, seq: u32 },
    /// Encrypted media frame fragment
    Frame {
        frame_seq: u32,
        index: u16,
        count: u16,
        frame_type: FrameType,
        pts: u64,
        timestamp: u64,
        iv: [u8; AES_BLOCK_LEN],
        payload: Vec<u8>,
    },
    Heartbeat { seq: u32, reply: bool },
    /// Fire-and-forget control (close notices are repeated instead)
    Control(Control),
    /// Control retransmitted until the peer acknowledges `seq`
    Reliable { seq: u32, control: Control },
    ControlAck { seq: u32 },
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum LinkError {
    Io(io::Error),
    Encode(String),
    Decode(String),
    /// Datagram too large to send
    TooLarge(usize),
    /// Not one of our datagrams (bad magic or another session's tag)
    Foreign,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Io(e) => write!(f, "socket error: {}", e),
            LinkError::Encode(e) => write!(f, "encode error: {}", e),
            LinkError::Decode(e) => write!(f, "decode error: {}", e),
            LinkError::TooLarge(n) => write!(f, "datagram too large: {} bytes (max {})", n, MAX_DATAGRAM_SIZE),
            LinkError::Foreign => write!(f, "foreign datagram"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        LinkError::Io(e)
    }
}

// ============================================================================
// Codec
// ============================================================================

fn codec() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

/// Tag shared by both ends of a signaling session
pub fn session_tag(session_id: &str) -> u64 {
    let hash = digest::digest(&digest::SHA256, session_id.as_bytes());
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&hash.as_ref()[..8]);
    u64::from_be_bytes(tag)
}

pub fn encode_packet(tag: u64, packet: &Packet) -> Result<Vec<u8>, LinkError> {
    let body = codec().serialize(packet).map_err(|e| LinkError::Encode(e.to_string()))?;
    let total = HEADER_LEN + body.len();
    if total > MAX_DATAGRAM_SIZE {
        return Err(LinkError::TooLarge(total));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a datagram addressed to the session with `tag`
pub fn decode_packet(tag: u64, datagram: &[u8]) -> Result<Packet, LinkError> {
    if datagram.len() < HEADER_LEN || datagram[..2] != MAGIC {
        return Err(LinkError::Foreign);
    }
    let mut got = [0u8; 8];
    got.copy_from_slice(&datagram[2..HEADER_LEN]);
    if u64::from_be_bytes(got) != tag {
        return Err(LinkError::Foreign);
    }
    codec()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .deserialize(&datagram[HEADER_LEN..])
        .map_err(|e| LinkError::Decode(e.to_string()))
}

// ============================================================================
// Link
// ============================================================================

pub struct Link {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    tag: u64,
    buf: Vec<u8>,
}

impl Link {
    pub fn bind(addr: SocketAddr, tag: u64) -> io::Result<Self> {
        let mut socket = UdpSocket::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut socket, SOCKET, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            socket,
            poll,
            events: Events::with_capacity(16),
            waker,
            tag,
            buf: vec![0u8; 2048],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle that interrupts [`Link::wait`] from another thread
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Send one packet; a full socket buffer drops it like the network would
    pub fn send_to(&self, packet: &Packet, to: SocketAddr) -> Result<(), LinkError> {
        let datagram = encode_packet(self.tag, packet)?;
        match self.socket.send_to(&datagram, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("Socket buffer full, dropped packet to {}", to);
                Ok(())
            }
            Err(e) => Err(LinkError::Io(e)),
        }
    }

    /// Block until the socket is readable, the waker fires or `timeout` passes
    pub fn wait(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Next valid packet already queued on the socket, if any
    pub fn recv(&mut self) -> Option<(SocketAddr, Packet)> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ICMP errors surface here on some platforms; keep draining
                    log::debug!("recv_from failed: {}", e);
                    if e.kind() == io::ErrorKind::ConnectionRefused
                        || e.kind() == io::ErrorKind::ConnectionReset
                    {
                        continue;
                    }
                    return None;
                }
            };
            match decode_packet(self.tag, &self.buf[..len]) {
                Ok(packet) => return Some((from, packet)),
                Err(e) => log::trace!("Dropping datagram from {}: {}", from, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::connectivity::BindingRequest;

    #[test]
    fn test_encode_decode_packet() {
        let tag = session_tag("abc");
        let packet = Packet::Data {
            channel: 3,
            seq: 9,
            iv: [7; AES_BLOCK_LEN],
            payload: vec![1, 2, 3],
        };
        let bytes = encode_packet(tag, &packet).unwrap();
        assert_eq!(&bytes[..2], b"PR");
        assert_eq!(decode_packet(tag, &bytes).unwrap(), packet);
    }

    #[test]
    fn test_foreign_tag_rejected() {
        let bytes = encode_packet(session_tag("a"), &Packet::Heartbeat { seq: 1, reply: false }).unwrap();
        assert!(matches!(decode_packet(session_tag("b"), &bytes), Err(LinkError::Foreign)));
        assert!(matches!(decode_packet(0, b"xx"), Err(LinkError::Foreign)));
    }

    #[test]
    fn test_oversized_rejected() {
        let packet = Packet::Verify {
            signature: vec![0; MAX_DATAGRAM_SIZE],
        };
        assert!(matches!(encode_packet(1, &packet), Err(LinkError::TooLarge(_))));

        // Largest signature that still fits: header + variant tag + length prefix
        let fits = Packet::Verify {
            signature: vec![0; MAX_DATAGRAM_SIZE - HEADER_LEN - 4 - 8],
        };
        let bytes = encode_packet(1, &fits).unwrap();
        assert_eq!(bytes.len(), MAX_DATAGRAM_SIZE);
        assert_eq!(decode_packet(1, &bytes).unwrap(), fits);
    }

    #[test]
    fn test_reliable_control_encoding() {
        let packet = Packet::Reliable {
            seq: 4,
            control: Control::Activate { in_use: true },
        };
        let bytes = encode_packet(2, &packet).unwrap();
        assert_eq!(decode_packet(2, &bytes).unwrap(), packet);
        let ack = encode_packet(2, &Packet::ControlAck { seq: 4 }).unwrap();
        assert_eq!(decode_packet(2, &ack).unwrap(), Packet::ControlAck { seq: 4 });
    }

    #[test]
    fn test_truncated_decode_error() {
        let bytes = encode_packet(5, &Packet::Control(Control::Close { code: -14 })).unwrap();
        assert!(matches!(
            decode_packet(5, &bytes[..bytes.len() - 1]),
            Err(LinkError::Decode(_))
        ));
    }

    #[test]
    fn test_link_loopback_exchange() {
        let tag = session_tag("loop");
        let mut a = Link::bind("127.0.0.1:0".parse().unwrap(), tag).unwrap();
        let mut b = Link::bind("127.0.0.1:0".parse().unwrap(), tag).unwrap();
        let request = Packet::Binding(BindingMessage::Request(BindingRequest::new(1, false)));
        a.send_to(&request, b.local_addr().unwrap()).unwrap();

        let mut got = None;
        for _ in 0..50 {
            b.wait(Duration::from_millis(20)).unwrap();
            if let Some(p) = b.recv() {
                got = Some(p);
                break;
            }
        }
        let (from, packet) = got.expect("no packet received");
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(packet, request);
        assert!(a.recv().is_none());
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let mut link = Link::bind("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        let waker = link.waker();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });
        let start = std::time::Instant::now();
        link.wait(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        t.join().unwrap();
    }
}
