//! Heartbeats for established sessions
//!
//! A streaming session sends a heartbeat every `interval` and answers the
//! peer's heartbeats. Any packet from the peer counts as proof of life;
//! silence for `timeout` ends the session with `SessionClosedTimeout`.
//!
//! ```text
//!   Active ──(missed replies)──▶ Degraded ──(silence ≥ timeout)──▶ Failed
//!     ▲                              │
//!     └────────(peer heard)──────────┘
//! ```
//!
//! Activation changes (suspend, resume, takeover) travel as
//! [`Packet::Reliable`] and are repeated until the peer acknowledges them.
//! Only the latest change is outstanding; a newer one supersedes it.

use std::time::{Duration, Instant};

use super::link::{Control, Packet};

/// Missed replies before the path is reported degraded
pub const MISSED_HEARTBEATS_DEGRADED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Active,
    Degraded,
    Failed,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    state: PathState,
    next_seq: u32,
    last_sent: Option<(u32, Instant)>,
    last_heard: Instant,
    missed: u32,
    rtt: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            state: PathState::Active,
            next_seq: 1,
            last_sent: None,
            last_heard: now,
            missed: 0,
            rtt: None,
        }
    }

    pub fn state(&self) -> PathState {
        self.state
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Heartbeat to send now, if one is due
    pub fn poll_send(&mut self, now: Instant) -> Option<Packet> {
        if self.state == PathState::Failed {
            return None;
        }
        if let Some((seq, sent)) = self.last_sent {
            if now.duration_since(sent) < self.interval {
                return None;
            }
            if seq != 0 {
                // Previous heartbeat never answered
                self.missed += 1;
                if self.missed >= MISSED_HEARTBEATS_DEGRADED && self.state == PathState::Active {
                    log::debug!("Path degraded after {} missed heartbeats", self.missed);
                    self.state = PathState::Degraded;
                }
            }
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        self.last_sent = Some((seq, now));
        Some(Packet::Heartbeat { seq, reply: false })
    }

    /// Any packet from the peer
    pub fn on_peer_activity(&mut self, now: Instant) {
        self.last_heard = now;
        if self.state == PathState::Degraded {
            self.state = PathState::Active;
        }
    }

    /// Handle a heartbeat; returns the reply to send for requests
    pub fn on_heartbeat(&mut self, seq: u32, reply: bool, now: Instant) -> Option<Packet> {
        self.on_peer_activity(now);
        if !reply {
            return Some(Packet::Heartbeat { seq, reply: true });
        }
        if let Some((sent_seq, sent_at)) = self.last_sent {
            if sent_seq == seq {
                self.rtt = Some(now.duration_since(sent_at));
                self.missed = 0;
                // Mark answered
                self.last_sent = Some((0, sent_at));
            }
        }
        None
    }

    /// True once, when the peer has been silent for the timeout
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.state == PathState::Failed {
            return false;
        }
        if now.duration_since(self.last_heard) >= self.timeout {
            self.state = PathState::Failed;
            return true;
        }
        false
    }
}

// ============================================================================
// Reliable Control
// ============================================================================

/// Retransmit interval for unacknowledged control
pub const CONTROL_RTO: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ControlTracker {
    next_seq: u32,
    /// Outstanding control and when it was last sent
    pending: Option<(u32, Control, Instant)>,
    /// Highest peer sequence already applied
    applied: u32,
}

impl Default for ControlTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlTracker {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            pending: None,
            applied: 0,
        }
    }

    /// Queue `control`, replacing anything unacknowledged; returns the first transmission
    pub fn submit(&mut self, control: Control, now: Instant) -> Packet {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        self.pending = Some((seq, control.clone(), now));
        Packet::Reliable { seq, control }
    }

    /// Retransmission due at `now`, if any
    pub fn poll_retransmit(&mut self, now: Instant) -> Option<Packet> {
        let (seq, control, sent) = self.pending.as_mut()?;
        if now.duration_since(*sent) < CONTROL_RTO {
            return None;
        }
        *sent = now;
        Some(Packet::Reliable {
            seq: *seq,
            control: control.clone(),
        })
    }

    pub fn on_ack(&mut self, seq: u32) {
        if matches!(self.pending, Some((pending, _, _)) if pending == seq) {
            self.pending = None;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Peer control received; true when it is newer than anything applied.
    /// The caller acknowledges `seq` either way.
    pub fn accept(&mut self, seq: u32) -> bool {
        if seq > self.applied {
            self.applied = seq;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(now: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_millis(100), Duration::from_millis(500), now)
    }

    #[test]
    fn test_heartbeat_schedule() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        assert!(matches!(m.poll_send(t0), Some(Packet::Heartbeat { seq: 1, reply: false })));
        assert!(m.poll_send(t0 + Duration::from_millis(50)).is_none());
        assert!(matches!(
            m.poll_send(t0 + Duration::from_millis(100)),
            Some(Packet::Heartbeat { seq: 2, .. })
        ));
    }

    #[test]
    fn test_request_gets_reply() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        assert_eq!(
            m.on_heartbeat(9, false, t0),
            Some(Packet::Heartbeat { seq: 9, reply: true })
        );
        assert_eq!(m.on_heartbeat(9, true, t0), None);
    }

    #[test]
    fn test_rtt_measured() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        m.poll_send(t0);
        m.on_heartbeat(1, true, t0 + Duration::from_millis(30));
        assert_eq!(m.rtt(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_degraded_then_recovered() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        m.poll_send(t0);
        m.poll_send(t0 + Duration::from_millis(100));
        m.poll_send(t0 + Duration::from_millis(200));
        assert_eq!(m.state(), PathState::Degraded);
        m.on_peer_activity(t0 + Duration::from_millis(250));
        assert_eq!(m.state(), PathState::Active);
    }

    #[test]
    fn test_timeout_fires_once() {
        let t0 = Instant::now();
        let mut m = monitor(t0);
        assert!(!m.check_timeout(t0 + Duration::from_millis(400)));
        m.on_peer_activity(t0 + Duration::from_millis(400));
        assert!(!m.check_timeout(t0 + Duration::from_millis(800)));
        assert!(m.check_timeout(t0 + Duration::from_millis(900)));
        assert!(!m.check_timeout(t0 + Duration::from_millis(1000)));
        assert_eq!(m.state(), PathState::Failed);
        assert!(m.poll_send(t0 + Duration::from_millis(1000)).is_none());
    }

    #[test]
    fn test_control_retransmitted_until_acked() {
        let t0 = Instant::now();
        let mut tracker = ControlTracker::new();
        let first = tracker.submit(Control::Activate { in_use: true }, t0);
        assert_eq!(
            first,
            Packet::Reliable {
                seq: 1,
                control: Control::Activate { in_use: true }
            }
        );
        assert!(tracker.poll_retransmit(t0 + Duration::from_millis(50)).is_none());
        assert_eq!(tracker.poll_retransmit(t0 + CONTROL_RTO), Some(first.clone()));
        assert!(tracker.poll_retransmit(t0 + CONTROL_RTO + Duration::from_millis(10)).is_none());
        assert_eq!(tracker.poll_retransmit(t0 + CONTROL_RTO * 2), Some(first));

        // Stale ack leaves it outstanding
        tracker.on_ack(7);
        assert!(tracker.is_pending());
        tracker.on_ack(1);
        assert!(!tracker.is_pending());
        assert!(tracker.poll_retransmit(t0 + CONTROL_RTO * 5).is_none());
    }

    #[test]
    fn test_newer_control_supersedes() {
        let t0 = Instant::now();
        let mut tracker = ControlTracker::new();
        tracker.submit(Control::Activate { in_use: false }, t0);
        let suspend = tracker.submit(Control::Suspend, t0);
        assert_eq!(
            suspend,
            Packet::Reliable {
                seq: 2,
                control: Control::Suspend
            }
        );
        // Ack of the superseded one does not clear the newer
        tracker.on_ack(1);
        assert!(tracker.is_pending());
        assert_eq!(tracker.poll_retransmit(t0 + CONTROL_RTO), Some(suspend));
    }

    #[test]
    fn test_duplicate_control_applied_once() {
        let mut tracker = ControlTracker::new();
        assert!(tracker.accept(1));
        assert!(!tracker.accept(1));
        assert!(tracker.accept(3));
        // Reordered older control
        assert!(!tracker.accept(2));
    }
}
