//! Link handshake
//!
//! Authenticates the selected path with the per-session credentials. Each side
//! sends its certificate and a fresh nonce; the receiver pins the certificate
//! to the fingerprint from signaling and answers with an ECDSA signature over
//! `peer_nonce || own_nonce`.
//!
//! ```text
//!   A                                              B
//!   │─── Hello { nonce_a, cert_a } ───────────────►│  cert_a ~ fingerprint_a?
//!   │◄── Verify { sign_b(nonce_a || nonce_b) } ────│
//!   │◄── Hello { nonce_b, cert_b } ────────────────│
//!   │─── Verify { sign_a(nonce_b || nonce_a) } ───►│
//! ```
//!
//! Hellos are retransmitted until the peer's Verify checks out; a repeated
//! Hello with the same nonce is answered with the same Verify.

use std::fmt;

use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair as _, UnparsedPublicKey};
use x509_parser::prelude::*;

use super::link::{Packet, NONCE_LEN};
use crate::credential::{Credentials, Fingerprint};
use crate::error::RtcError;
use crate::misc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Local key could not be loaded
    Key(String),
    /// Peer certificate does not hash to the signaled fingerprint
    FingerprintMismatch,
    BadCertificate(String),
    BadSignature,
    /// Verify arrived before the peer's Hello
    OutOfOrder,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Key(e) => write!(f, "local key error: {}", e),
            HandshakeError::FingerprintMismatch => write!(f, "peer certificate fingerprint mismatch"),
            HandshakeError::BadCertificate(e) => write!(f, "bad peer certificate: {}", e),
            HandshakeError::BadSignature => write!(f, "bad peer signature"),
            HandshakeError::OutOfOrder => write!(f, "verify before hello"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<HandshakeError> for RtcError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Key(_) => RtcError::CryptoInitFailed,
            HandshakeError::FingerprintMismatch => RtcError::DtlsFingerprintMismatch,
            _ => RtcError::DtlsHandshakeFailed,
        }
    }
}

struct Peer {
    nonce: [u8; NONCE_LEN],
    public_key: Vec<u8>,
    /// Our Verify for this nonce, replayed on repeated Hellos
    reply: Vec<u8>,
}

pub struct Handshake {
    key: EcdsaKeyPair,
    rng: SystemRandom,
    cert_der: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    expected: Fingerprint,
    peer: Option<Peer>,
    verified: bool,
}

impl Handshake {
    pub fn new(credentials: &Credentials, expected: Fingerprint) -> Result<Self, HandshakeError> {
        let rng = SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            credentials.pkcs8_der(),
            &rng,
        )
        .map_err(|e| HandshakeError::Key(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        misc::fill_random(&mut nonce).map_err(|_| HandshakeError::Key("rng failure".to_string()))?;
        log::trace!("Handshake key loaded ({} byte public key)", key.public_key().as_ref().len());
        Ok(Self {
            key,
            rng,
            cert_der: credentials.cert_der.clone(),
            nonce,
            expected,
            peer: None,
            verified: false,
        })
    }

    pub fn hello(&self) -> Packet {
        Packet::Hello {
            nonce: self.nonce,
            cert_der: self.cert_der.clone(),
        }
    }

    /// Check the peer's Hello and produce our Verify
    pub fn on_hello(&mut self, nonce: [u8; NONCE_LEN], cert_der: &[u8]) -> Result<Packet, HandshakeError> {
        if let Some(peer) = &self.peer {
            if peer.nonce == nonce {
                return Ok(Packet::Verify {
                    signature: peer.reply.clone(),
                });
            }
        }
        if !self.expected.matches(cert_der) {
            return Err(HandshakeError::FingerprintMismatch);
        }
        let (_, cert) =
            parse_x509_certificate(cert_der).map_err(|e| HandshakeError::BadCertificate(e.to_string()))?;
        let public_key = cert.public_key().subject_public_key.data.to_vec();

        let mut message = Vec::with_capacity(2 * NONCE_LEN);
        message.extend_from_slice(&nonce);
        message.extend_from_slice(&self.nonce);
        let reply = self
            .key
            .sign(&self.rng, &message)
            .map_err(|e| HandshakeError::Key(e.to_string()))?
            .as_ref()
            .to_vec();

        // A new nonce means the peer restarted; its old signature no longer counts
        self.verified = false;
        self.peer = Some(Peer {
            nonce,
            public_key,
            reply: reply.clone(),
        });
        Ok(Packet::Verify { signature: reply })
    }

    /// Check the peer's signature over `our_nonce || peer_nonce`
    pub fn on_verify(&mut self, signature_bytes: &[u8]) -> Result<(), HandshakeError> {
        let peer = self.peer.as_ref().ok_or(HandshakeError::OutOfOrder)?;
        let mut message = Vec::with_capacity(2 * NONCE_LEN);
        message.extend_from_slice(&self.nonce);
        message.extend_from_slice(&peer.nonce);
        UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, &peer.public_key)
            .verify(&message, signature_bytes)
            .map_err(|_| HandshakeError::BadSignature)?;
        self.verified = true;
        Ok(())
    }

    /// Peer proved possession of the pinned certificate's key
    pub fn is_complete(&self) -> bool {
        self.verified
    }

    /// Verify to replay when the peer repeats its Hello after we finished
    pub fn cached_reply(&self, nonce: &[u8; NONCE_LEN]) -> Option<Packet> {
        self.peer
            .as_ref()
            .filter(|p| &p.nonce == nonce)
            .map(|p| Packet::Verify {
                signature: p.reply.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::HashAlgorithm;

    fn creds() -> Credentials {
        Credentials::generate(HashAlgorithm::Sha256).unwrap()
    }

    fn pair() -> (Handshake, Handshake) {
        let a = creds();
        let b = creds();
        (
            Handshake::new(&a, b.fingerprint.clone()).unwrap(),
            Handshake::new(&b, a.fingerprint.clone()).unwrap(),
        )
    }

    fn hello_parts(p: Packet) -> ([u8; NONCE_LEN], Vec<u8>) {
        match p {
            Packet::Hello { nonce, cert_der } => (nonce, cert_der),
            other => panic!("expected hello, got {:?}", other),
        }
    }

    fn signature(p: Packet) -> Vec<u8> {
        match p {
            Packet::Verify { signature } => signature,
            other => panic!("expected verify, got {:?}", other),
        }
    }

    #[test]
    fn test_mutual_handshake() {
        let (mut a, mut b) = pair();
        let (na, ca) = hello_parts(a.hello());
        let (nb, cb) = hello_parts(b.hello());

        let vb = signature(b.on_hello(na, &ca).unwrap());
        let va = signature(a.on_hello(nb, &cb).unwrap());
        a.on_verify(&vb).unwrap();
        b.on_verify(&va).unwrap();
        assert!(a.is_complete());
        assert!(b.is_complete());
    }

    #[test]
    fn test_fingerprint_mismatch() {
        let (_, mut b) = pair();
        let stranger = creds();
        let (nonce, _) = hello_parts(b.hello());
        assert_eq!(
            b.on_hello(nonce, &stranger.cert_der),
            Err(HandshakeError::FingerprintMismatch)
        );
        assert_eq!(
            RtcError::from(HandshakeError::FingerprintMismatch),
            RtcError::DtlsFingerprintMismatch
        );
    }

    #[test]
    fn test_bad_signature_rejected() {
        let (mut a, mut b) = pair();
        let (nb, cb) = hello_parts(b.hello());
        a.on_hello(nb, &cb).unwrap();
        let (na, ca) = hello_parts(a.hello());
        let mut vb = signature(b.on_hello(na, &ca).unwrap());
        let last = vb.len() - 1;
        vb[last] ^= 0xff;
        assert_eq!(a.on_verify(&vb), Err(HandshakeError::BadSignature));
        assert!(!a.is_complete());
    }

    #[test]
    fn test_verify_before_hello() {
        let (mut a, _) = pair();
        assert_eq!(a.on_verify(&[0u8; 64]), Err(HandshakeError::OutOfOrder));
    }

    #[test]
    fn test_repeated_hello_replays_reply() {
        let (mut a, b) = pair();
        let (nb, cb) = hello_parts(b.hello());
        let first = a.on_hello(nb, &cb).unwrap();
        let second = a.on_hello(nb, &cb).unwrap();
        assert_eq!(first, second);
        assert_eq!(a.cached_reply(&nb), Some(first));
        assert_eq!(a.cached_reply(&[0u8; NONCE_LEN]), None);
    }
}
