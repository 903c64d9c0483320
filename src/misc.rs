//! Timing, randomness and string helpers
//!
//! Pure functions with no shared state apart from the process clock origin.

use std::cmp::Ordering;
use std::sync::OnceLock;
use std::time::Instant;

use ring::rand::{SecureRandom, SystemRandom};

const ALPHANUMERIC: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DECIMAL: &[u8] = b"0123456789";
const HEX_DIGITS: &[u8] = b"0123456789abcdef";

// ============================================================================
// Clock
// ============================================================================

fn clock_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Monotonic milliseconds since the first call in this process
pub fn now_ms() -> u64 {
    clock_origin().elapsed().as_millis() as u64
}

/// True once `timeout_ms` has elapsed since `begin_ms` (a [`now_ms`] value)
pub fn check_timeout(begin_ms: u64, timeout_ms: u64) -> bool {
    now_ms().saturating_sub(begin_ms) >= timeout_ms
}

// ============================================================================
// Randomness
// ============================================================================

/// Fill `buf` from the system CSPRNG
pub fn fill_random(buf: &mut [u8]) -> Result<(), ring::error::Unspecified> {
    SystemRandom::new().fill(buf)
}

fn rand_from_charset(len: usize, charset: &[u8]) -> String {
    let mut bytes = vec![0u8; len];
    // All-zero bytes on CSPRNG failure still yield a valid (if predictable) string
    let _ = fill_random(&mut bytes);
    bytes
        .iter()
        .map(|b| charset[*b as usize % charset.len()] as char)
        .collect()
}

/// Random alphanumeric string of `len` characters
pub fn rand_string(len: usize) -> String {
    rand_from_charset(len, ALPHANUMERIC)
}

/// Random decimal string of `len` digits
pub fn rand_string_dec(len: usize) -> String {
    rand_from_charset(len, DECIMAL)
}

// ============================================================================
// Hex
// ============================================================================

/// Lowercase hex, optionally joined by `sep`
pub fn hex_encode(bytes: &[u8], sep: Option<char>) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            if let Some(sep) = sep {
                out.push(sep);
            }
        }
        out.push(HEX_DIGITS[(b >> 4) as usize] as char);
        out.push(HEX_DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

/// Bytes [`hex_to_buf`] needs for `n` input bytes, terminator included
pub fn hex_len(n: usize, with_sep: bool) -> usize {
    let seps = if with_sep { n.saturating_sub(1) } else { 0 };
    n * 2 + seps + 1
}

/// Write lowercase hex of `bytes` plus a NUL terminator into `dst`
///
/// Returns the number of bytes written (terminator included), or `None`
/// without touching `dst` when it is too small.
pub fn hex_to_buf(dst: &mut [u8], bytes: &[u8], sep: Option<u8>) -> Option<usize> {
    let needed = hex_len(bytes.len(), sep.is_some());
    if dst.len() < needed {
        return None;
    }
    let mut pos = 0;
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            if let Some(sep) = sep {
                dst[pos] = sep;
                pos += 1;
            }
        }
        dst[pos] = HEX_DIGITS[(b >> 4) as usize];
        dst[pos + 1] = HEX_DIGITS[(b & 0x0f) as usize];
        pos += 2;
    }
    dst[pos] = 0;
    Some(pos + 1)
}

/// Value of a single hex digit
pub fn char_to_hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode hex digits, ignoring `:` separators
pub fn hex_decode(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|c| *c != b':').collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| Some(char_to_hex(pair[0])? << 4 | char_to_hex(pair[1])?))
        .collect()
}

// ============================================================================
// Comparison
// ============================================================================

/// Case-insensitive comparison of at most `n` bytes
pub fn strncicmp(a: &str, b: &str, n: usize) -> Ordering {
    let lhs = a.bytes().take(n).map(|c| c.to_ascii_lowercase());
    let rhs = b.bytes().take(n).map(|c| c.to_ascii_lowercase());
    lhs.cmp(rhs)
}

/// Case-insensitive equality
pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.len() == b.len() && strncicmp(a, b, a.len()) == Ordering::Equal
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_timeout() {
        let start = now_ms();
        assert!(!check_timeout(start, 10_000));
        assert!(check_timeout(start, 0));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(check_timeout(start, 20));
    }

    #[test]
    fn test_rand_string_charset() {
        let s = rand_string(64);
        assert_eq!(s.len(), 64);
        assert!(s.bytes().all(|c| c.is_ascii_alphanumeric()));

        let d = rand_string_dec(19);
        assert_eq!(d.len(), 19);
        assert!(d.bytes().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x0a, 0xff, 0x10], Some(':')), "0a:ff:10");
        assert_eq!(hex_encode(&[0xde, 0xad], None), "dead");
        assert_eq!(hex_encode(&[], Some(':')), "");
    }

    #[test]
    fn test_hex_to_buf_too_small() {
        let mut dst = [0x55u8; 4];
        assert_eq!(hex_to_buf(&mut dst, &[1, 2], Some(b':')), None);
        assert_eq!(dst, [0x55; 4]);

        let mut dst = [0x55u8; 6];
        assert_eq!(hex_to_buf(&mut dst, &[1, 2], Some(b':')), Some(6));
        assert_eq!(&dst, b"01:02\0");
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode("0a:FF:10"), Some(vec![0x0a, 0xff, 0x10]));
        assert_eq!(hex_decode("abc"), None);
        assert_eq!(hex_decode("zz"), None);
    }

    #[test]
    fn test_strncicmp() {
        assert_eq!(strncicmp("SHA-256", "sha-256", 7), Ordering::Equal);
        assert_eq!(strncicmp("abcX", "ABCY", 3), Ordering::Equal);
        assert_eq!(strncicmp("abc", "abd", 3), Ordering::Less);
        assert!(eq_ignore_case("Turn", "TURN"));
        assert!(!eq_ignore_case("turn", "turns"));
    }
}
