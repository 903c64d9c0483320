//! Connectivity checks
//!
//! Binding requests are sent from the session socket to every remote
//! candidate; a response proves the path works in both directions. The
//! controlling side (caller) then nominates one working path by repeating the
//! request with `use_candidate` set.
//!
//! ```text
//! Caller (controlling)                               Callee (controlled)
//!   │─── BindingRequest (txn, prio) ─────────────────────────►│
//!   │◄── BindingResponse (txn, mapped) ───────────────────────│
//!   │─── BindingRequest (txn', use_candidate) ───────────────►│  path selected
//! ```
//!
//! Pair priority follows RFC 8445 Section 6.1.2.3:
//! `2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::candidate::Candidate;
use crate::misc;

// ============================================================================
// Constants
// ============================================================================

pub const TRANSACTION_ID_LEN: usize = 12;

/// First retransmit interval
pub const INITIAL_RTO: Duration = Duration::from_millis(100);

/// Retransmit interval ceiling; checks continue until the session deadline
pub const MAX_RTO: Duration = Duration::from_millis(800);

/// Minimum gap between two requests
pub const PACE_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Binding Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    pub priority: u64,
    /// Set by the controlling side to select this path
    pub use_candidate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResponse {
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    /// Source address the request arrived from
    pub mapped_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingMessage {
    Request(BindingRequest),
    Response(BindingResponse),
}

impl BindingRequest {
    pub fn new(priority: u64, use_candidate: bool) -> Self {
        Self {
            transaction_id: generate_transaction_id(),
            priority,
            use_candidate,
        }
    }

    /// Success response for a request received from `from`
    pub fn answer(&self, from: SocketAddr) -> BindingResponse {
        BindingResponse {
            transaction_id: self.transaction_id,
            mapped_address: from,
        }
    }
}

fn generate_transaction_id() -> [u8; TRANSACTION_ID_LEN] {
    let mut id = [0u8; TRANSACTION_ID_LEN];
    // A zeroed id still matches its own response; uniqueness is best effort
    let _ = misc::fill_random(&mut id);
    id
}

/// RFC 8445 pair priority
pub fn calculate_pair_priority(local_priority: u32, remote_priority: u32, is_controlling: bool) -> u64 {
    let (g, d) = if is_controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

// ============================================================================
// Candidate Pairs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Waiting,
    InProgress,
    Succeeded,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub remote: Candidate,
    pub priority: u64,
    pub state: CheckState,
    transmit_count: u32,
    last_sent: Option<Instant>,
    transaction_id: Option<[u8; TRANSACTION_ID_LEN]>,
}

impl CandidatePair {
    fn current_rto(&self) -> Duration {
        let multiplier = 1u32 << self.transmit_count.saturating_sub(1).min(4);
        (INITIAL_RTO * multiplier).min(MAX_RTO)
    }

    fn needs_retransmit(&self, now: Instant) -> bool {
        self.state == CheckState::InProgress
            && self
                .last_sent
                .map(|sent| now.duration_since(sent) >= self.current_rto())
                .unwrap_or(true)
    }
}

// ============================================================================
// Check List
// ============================================================================

/// Pairs between the session socket and each remote candidate
#[derive(Debug)]
pub struct CheckList {
    pairs: Vec<CandidatePair>,
    is_controlling: bool,
    /// Priority of our best local candidate, used for every pair
    local_priority: u32,
    last_check_time: Option<Instant>,
}

impl CheckList {
    pub fn new(is_controlling: bool, local_priority: u32) -> Self {
        Self {
            pairs: Vec::new(),
            is_controlling,
            local_priority,
            last_check_time: None,
        }
    }

    /// Add a remote candidate; relays and duplicates are ignored
    pub fn add_remote(&mut self, remote: &Candidate) -> bool {
        if remote.is_relay() || !remote.address.is_ipv4() {
            return false;
        }
        if self.pairs.iter().any(|p| p.remote.address == remote.address) {
            return false;
        }
        self.pairs.push(CandidatePair {
            remote: remote.clone(),
            priority: calculate_pair_priority(self.local_priority, remote.priority, self.is_controlling),
            state: CheckState::Waiting,
            transmit_count: 0,
            last_sent: None,
            transaction_id: None,
        });
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        true
    }

    /// Next request to send, honouring pacing
    ///
    /// Retransmissions of in-progress checks come before new checks.
    pub fn next_request(&mut self, now: Instant) -> Option<(BindingRequest, SocketAddr)> {
        if let Some(last) = self.last_check_time {
            if now.duration_since(last) < PACE_INTERVAL {
                return None;
            }
        }

        let idx = self
            .pairs
            .iter()
            .position(|p| p.needs_retransmit(now))
            .or_else(|| self.pairs.iter().position(|p| p.state == CheckState::Waiting))?;

        let pair = &mut self.pairs[idx];
        let request = match pair.transaction_id {
            Some(id) => BindingRequest {
                transaction_id: id,
                priority: pair.priority,
                use_candidate: false,
            },
            None => {
                let request = BindingRequest::new(pair.priority, false);
                pair.transaction_id = Some(request.transaction_id);
                pair.state = CheckState::InProgress;
                request
            }
        };
        pair.transmit_count += 1;
        pair.last_sent = Some(now);
        self.last_check_time = Some(now);
        Some((request, pair.remote.address))
    }

    /// Match a response; returns the remote address of the pair that succeeded
    pub fn handle_response(&mut self, response: &BindingResponse) -> Option<SocketAddr> {
        let pair = self
            .pairs
            .iter_mut()
            .find(|p| p.transaction_id == Some(response.transaction_id))?;
        pair.state = CheckState::Succeeded;
        Some(pair.remote.address)
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Request nominating the path to `remote`
    pub fn nomination(&self, remote: SocketAddr) -> BindingRequest {
        let priority = self
            .pairs
            .iter()
            .find(|p| p.remote.address == remote)
            .map(|p| p.priority)
            .unwrap_or(0);
        BindingRequest::new(priority, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str) -> Candidate {
        Candidate::host(addr.parse().unwrap())
    }

    #[test]
    fn test_pair_priority_symmetric() {
        let a = calculate_pair_priority(100, 200, true);
        let b = calculate_pair_priority(200, 100, false);
        assert_eq!(a, b);
        assert_eq!(calculate_pair_priority(5, 5, true), (1u64 << 32) * 5 + 10);
    }

    #[test]
    fn test_add_remote_skips_relay_and_duplicates() {
        let mut list = CheckList::new(true, 1000);
        assert!(list.add_remote(&host("10.0.0.2:4000")));
        assert!(!list.add_remote(&host("10.0.0.2:4000")));
        let relay = Candidate::relay("1.2.3.4:3478".parse().unwrap(), "10.0.0.1:1".parse().unwrap());
        assert!(!list.add_remote(&relay));
        assert_eq!(list.pair_count(), 1);
    }

    #[test]
    fn test_request_response_success() {
        let mut list = CheckList::new(true, 1000);
        list.add_remote(&host("10.0.0.2:4000"));
        let now = Instant::now();
        let (req, addr) = list.next_request(now).unwrap();
        assert_eq!(addr, "10.0.0.2:4000".parse().unwrap());
        assert!(!req.use_candidate);

        let resp = req.answer("10.0.0.1:5000".parse().unwrap());
        assert_eq!(list.handle_response(&resp), Some(addr));
        // Succeeded pairs are not retried
        assert!(list.next_request(now + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_unknown_response_ignored() {
        let mut list = CheckList::new(false, 1000);
        list.add_remote(&host("10.0.0.2:4000"));
        let stray = BindingRequest::new(1, false).answer("10.0.0.9:1".parse().unwrap());
        assert_eq!(list.handle_response(&stray), None);
    }

    #[test]
    fn test_pacing_and_backoff() {
        let mut list = CheckList::new(true, 1000);
        list.add_remote(&host("10.0.0.2:4000"));
        let t0 = Instant::now();
        let (first, _) = list.next_request(t0).unwrap();
        // Too soon for anything
        assert!(list.next_request(t0 + Duration::from_millis(10)).is_none());
        // Before the first RTO there is nothing to retransmit
        assert!(list.next_request(t0 + Duration::from_millis(50)).is_none());
        let (again, _) = list.next_request(t0 + INITIAL_RTO).unwrap();
        assert_eq!(first.transaction_id, again.transaction_id);
        // Second RTO doubles
        assert!(list.next_request(t0 + INITIAL_RTO + Duration::from_millis(150)).is_none());
        assert!(list.next_request(t0 + INITIAL_RTO * 3).is_some());
    }

    #[test]
    fn test_higher_priority_checked_first() {
        let mut list = CheckList::new(true, 1000);
        list.add_remote(&Candidate::mapped("1.2.3.4:1".parse().unwrap(), "10.0.0.2:1".parse().unwrap()));
        list.add_remote(&host("10.0.0.2:4000"));
        let (_, addr) = list.next_request(Instant::now()).unwrap();
        assert_eq!(addr, "10.0.0.2:4000".parse().unwrap());
    }

    #[test]
    fn test_nomination_flag() {
        let mut list = CheckList::new(true, 1000);
        list.add_remote(&host("10.0.0.2:4000"));
        let req = list.nomination("10.0.0.2:4000".parse().unwrap());
        assert!(req.use_candidate);
        assert!(req.priority > 0);
    }
}
