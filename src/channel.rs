//! Channel multiplexer
//!
//! Each session owns a fixed table of channels. A channel is a reliable,
//! ordered byte stream over the session link:
//!
//! ```text
//!   send_data ──▶ [ unsent | in flight ] ──seq──▶ peer ──▶ [ received ] ──▶ recv_data
//!                       ▲        │                              │
//!                       └── ack ─┴──────────── cumulative ack ◀─┘
//! ```
//!
//! Unsent plus in-flight bytes never exceed the channel's send capacity;
//! writers block (up to their deadline) when it is full. The receiver only
//! accepts the next in-order segment when it fits its receive capacity, so a
//! slow reader throttles the sender through withheld acks (Go-Back-N).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::Options;
use crate::error::RtcError;
use crate::sync::lock;

/// Backpressure snapshot returned by `check_buffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStatus {
    /// Bytes accepted by `send_data` and not yet acknowledged by the peer
    pub unsent_write_bytes: usize,
    /// Bytes received and not yet read by `recv_data`
    pub unread_recv_bytes: usize,
    /// Bytes `send_data` could accept right now
    pub free_send_capacity: usize,
}

struct Segment {
    seq: u32,
    data: Vec<u8>,
    sent_at: Instant,
}

#[derive(Default)]
struct ChannelState {
    unsent: VecDeque<u8>,
    in_flight: VecDeque<Segment>,
    in_flight_bytes: usize,
    next_seq: u32,
    received: VecDeque<u8>,
    expected_seq: u32,
    closed: Option<RtcError>,
}

impl ChannelState {
    fn pending(&self) -> usize {
        self.unsent.len() + self.in_flight_bytes
    }
}

/// `a <= b` in wrapping sequence space
fn seq_le(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

fn wait_until<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Instant,
) -> MutexGuard<'a, T> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    cond.wait_timeout(guard, remaining)
        .unwrap_or_else(PoisonError::into_inner)
        .0
}

pub(crate) struct Channel {
    id: u32,
    send_capacity: usize,
    recv_capacity: usize,
    state: Mutex<ChannelState>,
    readable: Condvar,
    writable: Condvar,
}

impl Channel {
    pub fn new(id: u32, send_capacity: usize, recv_capacity: usize) -> Self {
        Self {
            id,
            send_capacity,
            recv_capacity,
            state: Mutex::new(ChannelState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    // ------------------------------------------------------------------
    // Application side
    // ------------------------------------------------------------------

    /// Buffer as much of `data` as fits, waiting up to `deadline` for room
    ///
    /// Returns the number of bytes accepted, `Timeout` if none could be.
    pub fn write(&self, data: &[u8], deadline: Instant) -> Result<usize, RtcError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = lock(&self.state);
        loop {
            if let Some(err) = state.closed {
                return Err(err);
            }
            let free = self.send_capacity.saturating_sub(state.pending());
            if free > 0 {
                let n = free.min(data.len());
                state.unsent.extend(&data[..n]);
                return Ok(n);
            }
            if Instant::now() >= deadline {
                return Err(RtcError::Timeout);
            }
            state = wait_until(&self.writable, state, deadline);
        }
    }

    /// Read buffered bytes, waiting up to `deadline` when nothing is there
    ///
    /// With `deadline == None` the call never blocks and may return 0.
    pub fn read(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, RtcError> {
        let mut state = lock(&self.state);
        loop {
            if !state.received.is_empty() {
                let n = buf.len().min(state.received.len());
                for (dst, src) in buf.iter_mut().zip(state.received.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if let Some(err) = state.closed {
                return Err(err);
            }
            let deadline = match deadline {
                None => return Ok(0),
                Some(d) => d,
            };
            if Instant::now() >= deadline {
                return Err(RtcError::Timeout);
            }
            state = wait_until(&self.readable, state, deadline);
        }
    }

    pub fn status(&self) -> BufferStatus {
        let state = lock(&self.state);
        let pending = state.pending();
        BufferStatus {
            unsent_write_bytes: pending,
            unread_recv_bytes: state.received.len(),
            free_send_capacity: self.send_capacity.saturating_sub(pending),
        }
    }

    // ------------------------------------------------------------------
    // Link side
    // ------------------------------------------------------------------

    /// Cut new segments from unsent bytes, bounded by `window` in-flight segments
    pub fn take_segments(&self, max_len: usize, window: usize, now: Instant) -> Vec<(u32, Vec<u8>)> {
        let mut state = lock(&self.state);
        let mut out = Vec::new();
        while !state.unsent.is_empty() && state.in_flight.len() < window {
            let n = max_len.min(state.unsent.len());
            let data: Vec<u8> = state.unsent.drain(..n).collect();
            let seq = state.next_seq;
            state.next_seq = seq.wrapping_add(1);
            state.in_flight_bytes += data.len();
            out.push((seq, data.clone()));
            state.in_flight.push_back(Segment {
                seq,
                data,
                sent_at: now,
            });
        }
        out
    }

    /// Go-Back-N: once the oldest segment has waited `rto`, resend the window
    pub fn retransmit_due(&self, now: Instant, rto: Duration) -> Vec<(u32, Vec<u8>)> {
        let mut state = lock(&self.state);
        let due = state
            .in_flight
            .front()
            .map(|s| now.duration_since(s.sent_at) >= rto)
            .unwrap_or(false);
        if !due {
            return Vec::new();
        }
        state
            .in_flight
            .iter_mut()
            .map(|s| {
                s.sent_at = now;
                (s.seq, s.data.clone())
            })
            .collect()
    }

    /// Cumulative acknowledgement of every segment up to `ack`
    pub fn on_ack(&self, ack: u32) {
        let mut state = lock(&self.state);
        let mut freed = 0;
        while let Some(front) = state.in_flight.front() {
            if !seq_le(front.seq, ack) || !seq_le(ack, state.next_seq.wrapping_sub(1)) {
                break;
            }
            freed += front.data.len();
            state.in_flight.pop_front();
        }
        if freed > 0 {
            state.in_flight_bytes -= freed;
            self.writable.notify_all();
        }
    }

    /// Accept an in-order segment if it fits; returns the cumulative ack to send
    ///
    /// An empty buffer takes any segment, so a peer fragmenting wider than
    /// our capacity still makes progress.
    pub fn on_data(&self, seq: u32, data: &[u8]) -> u32 {
        let mut state = lock(&self.state);
        let fits = state.received.is_empty() || state.received.len() + data.len() <= self.recv_capacity;
        if seq == state.expected_seq && fits {
            state.received.extend(data);
            state.expected_seq = seq.wrapping_add(1);
            self.readable.notify_all();
        }
        state.expected_seq.wrapping_sub(1)
    }

    /// Fail blocked and future operations with `err`; the first error wins
    pub fn close(&self, err: RtcError) {
        let mut state = lock(&self.state);
        if state.closed.is_none() {
            state.closed = Some(err);
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// The fixed channel table of one session
pub(crate) struct ChannelSet {
    channels: Vec<Channel>,
}

impl ChannelSet {
    pub fn new(options: &Options) -> Self {
        let channels = (0..options.max_channel_number)
            .map(|id| Channel::new(id, options.send_capacity(id), options.recv_capacity(id)))
            .collect();
        Self { channels }
    }

    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn close_all(&self, err: RtcError) {
        for channel in &self.channels {
            channel.close(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_write_respects_capacity() {
        let ch = Channel::new(0, 8, 64);
        assert_eq!(ch.write(b"0123456789", soon(0)).unwrap(), 8);
        let status = ch.status();
        assert_eq!(status.unsent_write_bytes, 8);
        assert_eq!(status.free_send_capacity, 0);
        assert_eq!(ch.write(b"x", soon(20)), Err(RtcError::Timeout));
    }

    #[test]
    fn test_segments_ack_free_space() {
        let ch = Channel::new(0, 8, 64);
        ch.write(b"abcdefgh", soon(0)).unwrap();
        let segs = ch.take_segments(3, 16, Instant::now());
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0], (0, b"abc".to_vec()));
        assert_eq!(segs[2], (2, b"gh".to_vec()));
        // In-flight bytes still count against capacity
        assert_eq!(ch.status().free_send_capacity, 0);

        ch.on_ack(1);
        assert_eq!(ch.status().unsent_write_bytes, 2);
        ch.on_ack(2);
        assert_eq!(ch.status().free_send_capacity, 8);
    }

    #[test]
    fn test_ack_before_any_data_is_ignored() {
        let ch = Channel::new(0, 8, 64);
        ch.write(b"ab", soon(0)).unwrap();
        ch.take_segments(1, 16, Instant::now());
        ch.on_ack(u32::MAX);
        assert_eq!(ch.status().unsent_write_bytes, 2);
    }

    #[test]
    fn test_retransmit_go_back_n() {
        let ch = Channel::new(0, 64, 64);
        ch.write(b"abcdef", soon(0)).unwrap();
        let start = Instant::now();
        ch.take_segments(2, 16, start);
        assert!(ch.retransmit_due(start, Duration::from_millis(100)).is_empty());
        let later = start + Duration::from_millis(150);
        let resent = ch.retransmit_due(later, Duration::from_millis(100));
        assert_eq!(resent.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_receive_in_order_only() {
        let ch = Channel::new(0, 64, 4);
        assert_eq!(ch.on_data(1, b"zz"), u32::MAX);
        assert_eq!(ch.on_data(0, b"ab"), 0);
        assert_eq!(ch.on_data(0, b"ab"), 0);
        // Does not fit the 4-byte receive buffer yet
        assert_eq!(ch.on_data(1, b"cde"), 0);

        let mut buf = [0u8; 8];
        assert_eq!(ch.read(&mut buf, None).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(ch.on_data(1, b"cde"), 1);
    }

    #[test]
    fn test_segment_wider_than_buffer_accepted_when_empty() {
        let ch = Channel::new(0, 64, 4);
        assert_eq!(ch.on_data(0, b"abcdefgh"), 0);
        // Now full; the next segment waits for a read
        assert_eq!(ch.on_data(1, b"ij"), 0);

        let mut buf = [0u8; 16];
        assert_eq!(ch.read(&mut buf, None).unwrap(), 8);
        assert_eq!(&buf[..8], b"abcdefgh");
        assert_eq!(ch.on_data(1, b"ij"), 1);
    }

    #[test]
    fn test_read_nonblocking_and_timeout() {
        let ch = Channel::new(0, 64, 64);
        let mut buf = [0u8; 4];
        assert_eq!(ch.read(&mut buf, None).unwrap(), 0);
        let start = Instant::now();
        assert_eq!(ch.read(&mut buf, Some(soon(30))), Err(RtcError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_close_wakes_reader() {
        let ch = Arc::new(Channel::new(0, 64, 64));
        let closer = Arc::clone(&ch);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close(RtcError::SessionClosedRemote);
        });
        let mut buf = [0u8; 4];
        let start = Instant::now();
        assert_eq!(ch.read(&mut buf, Some(soon(5000))), Err(RtcError::SessionClosedRemote));
        assert!(start.elapsed() < Duration::from_secs(1));
        t.join().unwrap();
    }

    #[test]
    fn test_buffered_data_readable_after_close() {
        let ch = Channel::new(0, 64, 64);
        ch.on_data(0, b"tail");
        ch.close(RtcError::SessionClosedRemote);
        let mut buf = [0u8; 8];
        assert_eq!(ch.read(&mut buf, None).unwrap(), 4);
        assert_eq!(ch.read(&mut buf, None), Err(RtcError::SessionClosedRemote));
    }

    #[test]
    fn test_channel_set_sizes() {
        let opts = Options::new("dev")
            .with_uniform_buffers(100, 200)
            .normalize()
            .unwrap();
        let set = ChannelSet::new(&opts);
        assert!(set.get(opts.max_channel_number - 1).is_some());
        assert!(set.get(opts.max_channel_number).is_none());
        assert_eq!(set.get(0).unwrap().status().free_send_capacity, 100);
    }
}
