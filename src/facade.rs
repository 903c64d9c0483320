//! External service façade
//!
//! The embedding application owns signaling transport, HTTP, logging,
//! optional hardware AES and UPnP port mapping. The engine reaches all of
//! them through [`Facade`], invoked from session worker threads with no
//! engine lock held. Implementations touching shared state must do their own
//! locking.
//!
//! ```text
//!   Engine ──on_signaling/on_http──▶ application ──▶ cloud
//!   Engine ◀──set_signaling/set_http_result── application ◀── cloud
//! ```

use std::fmt;
use std::net::IpAddr;

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::RtcError;
use crate::p2p::signaling;
use crate::session::SessionEvent;

/// AES block size in bytes
pub const AES_BLOCK_LEN: usize = 16;

// ============================================================================
// AES
// ============================================================================

/// Cipher mode requested from an [`AesProvider`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesMode {
    Cbc,
}

/// A keyed cipher context; buffers are whole blocks, padding is the caller's job
pub trait AesContext: Send {
    fn encrypt(&mut self, iv: &[u8; AES_BLOCK_LEN], buf: &mut [u8]) -> Result<(), RtcError>;
    fn decrypt(&mut self, iv: &[u8; AES_BLOCK_LEN], buf: &mut [u8]) -> Result<(), RtcError>;
}

/// Factory for cipher contexts (e.g. a hardware engine)
pub trait AesProvider: Send + Sync {
    fn create(&self, mode: AesMode, key: &[u8]) -> Result<Box<dyn AesContext>, RtcError>;
}

/// Software AES-CBC used when the façade supplies no provider
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftAes;

#[derive(Clone)]
enum SoftKey {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

struct SoftAesContext {
    key: SoftKey,
}

impl AesProvider for SoftAes {
    fn create(&self, mode: AesMode, key: &[u8]) -> Result<Box<dyn AesContext>, RtcError> {
        let AesMode::Cbc = mode;
        let key = match key.len() {
            16 => SoftKey::Aes128(key.try_into().map_err(|_| RtcError::InvalidAesKey)?),
            24 => SoftKey::Aes192(key.try_into().map_err(|_| RtcError::InvalidAesKey)?),
            32 => SoftKey::Aes256(key.try_into().map_err(|_| RtcError::InvalidAesKey)?),
            _ => return Err(RtcError::InvalidAesKey),
        };
        Ok(Box::new(SoftAesContext { key }))
    }
}

macro_rules! cbc_encrypt {
    ($cipher:ty, $key:expr, $iv:expr, $buf:expr) => {{
        let len = $buf.len();
        cbc::Encryptor::<$cipher>::new_from_slices($key, $iv)
            .map_err(|_| RtcError::InvalidAesKey)?
            .encrypt_padded_mut::<NoPadding>($buf, len)
            .map(|_| ())
            .map_err(|_| RtcError::InvalidParameter)
    }};
}

macro_rules! cbc_decrypt {
    ($cipher:ty, $key:expr, $iv:expr, $buf:expr) => {{
        cbc::Decryptor::<$cipher>::new_from_slices($key, $iv)
            .map_err(|_| RtcError::InvalidAesKey)?
            .decrypt_padded_mut::<NoPadding>($buf)
            .map(|_| ())
            .map_err(|_| RtcError::InvalidParameter)
    }};
}

impl AesContext for SoftAesContext {
    fn encrypt(&mut self, iv: &[u8; AES_BLOCK_LEN], buf: &mut [u8]) -> Result<(), RtcError> {
        match &self.key {
            SoftKey::Aes128(k) => cbc_encrypt!(Aes128, k, iv, buf),
            SoftKey::Aes192(k) => cbc_encrypt!(Aes192, k, iv, buf),
            SoftKey::Aes256(k) => cbc_encrypt!(Aes256, k, iv, buf),
        }
    }

    fn decrypt(&mut self, iv: &[u8; AES_BLOCK_LEN], buf: &mut [u8]) -> Result<(), RtcError> {
        match &self.key {
            SoftKey::Aes128(k) => cbc_decrypt!(Aes128, k, iv, buf),
            SoftKey::Aes192(k) => cbc_decrypt!(Aes192, k, iv, buf),
            SoftKey::Aes256(k) => cbc_decrypt!(Aes256, k, iv, buf),
        }
    }
}

// ============================================================================
// UPnP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortProtocol::Udp => write!(f, "UDP"),
            PortProtocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// A port mapping reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: PortProtocol,
    pub external_port: u16,
    pub remote_host: String,
    pub internal_port: u16,
    pub internal_client: String,
    /// Gateway depth (1 = closest router)
    pub route_level: u32,
    pub index: u32,
}

/// NAT port-mapping cooperation
pub trait UpnpProvider: Send + Sync {
    /// Map `local_port`; returns the public address and port on success
    fn alloc_port(&self, protocol: PortProtocol, local_port: u16) -> Option<(IpAddr, u16)>;
    fn release_port(&self, protocol: PortProtocol, local_port: u16);
    /// Outcome of using a mapping (`None` = worked)
    fn bind_result(&self, protocol: PortProtocol, local_port: u16, error: Option<RtcError>);
    fn request_port_list(&self) -> Vec<PortMapping> {
        Vec::new()
    }
}

// ============================================================================
// Façade
// ============================================================================

/// Severity passed to [`Facade::on_log`]
pub type LogLevel = log::Level;

/// Callbacks implemented by the embedding application
pub trait Facade: Send + Sync {
    /// Deliver a signaling message to `remote_id` through the cloud
    fn on_signaling(&self, remote_id: &str, message: &str) -> Result<(), RtcError>;

    /// Deliver a signaling message on the local network (LAN mode)
    fn on_lan_signaling(&self, remote_id: &str, message: &str) -> Result<(), RtcError> {
        self.on_signaling(remote_id, message)
    }

    /// Sink for engine log records
    fn on_log(&self, _level: LogLevel, _message: &str) {}

    /// Maximum level forwarded to [`Facade::on_log`]
    fn log_level(&self) -> Option<log::LevelFilter> {
        None
    }

    /// Verify the MAC attached to a signaling body, keyed by the relay password
    ///
    /// Default: base64 HMAC-SHA256 as produced by the engine itself.
    fn on_auth(&self, key: &str, body: &str, mac: &str) -> Result<(), RtcError> {
        if signaling::verify_auth(key.as_bytes(), body, mac) {
            Ok(())
        } else {
            Err(RtcError::AuthFailed)
        }
    }

    /// Issue an HTTP API request; the answer comes back through `set_http_result`
    fn on_http(&self, _api: &str, _dev_id: &str, _content: &str) -> Result<(), RtcError> {
        Err(RtcError::HttpFailed)
    }

    fn aes(&self) -> Option<&dyn AesProvider> {
        None
    }

    fn upnp(&self) -> Option<&dyn UpnpProvider> {
        None
    }

    fn on_session_state(&self, _event: &SessionEvent) {}

    /// Local interface addresses for host candidates; empty = enumerate
    fn on_get_address(&self) -> Vec<IpAddr> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_aes_roundtrip() {
        let ctx_key = [7u8; 16];
        let mut ctx = SoftAes.create(AesMode::Cbc, &ctx_key).unwrap();
        let iv = [1u8; AES_BLOCK_LEN];
        let plain = *b"0123456789abcdef0123456789abcdef";
        let mut buf = plain;
        ctx.encrypt(&iv, &mut buf).unwrap();
        assert_ne!(buf, plain);
        ctx.decrypt(&iv, &mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_soft_aes_rejects_bad_input() {
        assert!(SoftAes.create(AesMode::Cbc, &[0u8; 15]).is_err());
        let mut ctx = SoftAes.create(AesMode::Cbc, &[0u8; 32]).unwrap();
        let mut partial = [0u8; 10];
        assert_eq!(
            ctx.encrypt(&[0u8; AES_BLOCK_LEN], &mut partial),
            Err(RtcError::InvalidParameter)
        );
    }

    struct Minimal;

    impl Facade for Minimal {
        fn on_signaling(&self, _remote_id: &str, _message: &str) -> Result<(), RtcError> {
            Ok(())
        }
    }

    #[test]
    fn test_default_auth() {
        let mac = signaling::compute_auth(b"secret", "{}");
        assert!(Minimal.on_auth("secret", "{}", &mac).is_ok());
        assert_eq!(Minimal.on_auth("other", "{}", &mac), Err(RtcError::AuthFailed));
        assert!(Minimal.aes().is_none());
        assert_eq!(Minimal.on_http("x", "y", "z"), Err(RtcError::HttpFailed));
    }
}
