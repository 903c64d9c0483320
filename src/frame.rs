//! Media frame queues
//!
//! Frames are best effort: the outbound queue is bounded and `send_frame`
//! fails with `BufferFull` instead of blocking; frames leave in submission
//! order. Large frames are split into fragments on the link and reassembled
//! on the far side; a frame that loses a fragment is dropped once a newer
//! frame completes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Instant;

use crate::error::RtcError;
use crate::session::{Frame, FrameType};
use crate::sync::lock;

/// Frames waiting in either direction before the queue reports full
pub const FRAME_QUEUE_MAX: usize = 64;

/// Frames being reassembled at once
const PARTIAL_FRAMES_MAX: usize = 16;

#[derive(Default)]
struct Inbound {
    frames: VecDeque<Frame>,
    closed: Option<RtcError>,
}

pub(crate) struct FrameQueues {
    outbound: Mutex<VecDeque<Frame>>,
    inbound: Mutex<Inbound>,
    readable: Condvar,
}

impl FrameQueues {
    pub fn new() -> Self {
        Self {
            outbound: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(Inbound::default()),
            readable: Condvar::new(),
        }
    }

    pub fn push_outbound(&self, frame: Frame) -> Result<(), RtcError> {
        if let Some(err) = lock(&self.inbound).closed {
            return Err(err);
        }
        let mut queue = lock(&self.outbound);
        if queue.len() >= FRAME_QUEUE_MAX {
            return Err(RtcError::BufferFull);
        }
        queue.push_back(frame);
        Ok(())
    }

    pub fn pop_outbound(&self) -> Option<Frame> {
        lock(&self.outbound).pop_front()
    }

    /// Queue a received frame, dropping the oldest when the reader lags
    pub fn push_inbound(&self, frame: Frame) {
        let mut inbound = lock(&self.inbound);
        if inbound.frames.len() >= FRAME_QUEUE_MAX {
            log::debug!("Inbound frame queue full, dropping oldest frame");
            inbound.frames.pop_front();
        }
        inbound.frames.push_back(frame);
        self.readable.notify_all();
    }

    /// Next received frame, waiting up to `deadline` (`None` = don't block)
    pub fn recv(&self, deadline: Option<Instant>) -> Result<Frame, RtcError> {
        let mut inbound = lock(&self.inbound);
        loop {
            if let Some(frame) = inbound.frames.pop_front() {
                return Ok(frame);
            }
            if let Some(err) = inbound.closed {
                return Err(err);
            }
            let deadline = match deadline {
                Some(d) if Instant::now() < d => d,
                _ => return Err(RtcError::Timeout),
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            inbound = self
                .readable
                .wait_timeout(inbound, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn close(&self, err: RtcError) {
        let mut inbound = lock(&self.inbound);
        if inbound.closed.is_none() {
            inbound.closed = Some(err);
        }
        self.readable.notify_all();
    }
}

// ============================================================================
// Fragmentation
// ============================================================================

/// One piece of a frame as carried on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub frame_seq: u32,
    pub index: u16,
    pub count: u16,
    pub frame_type: FrameType,
    pub pts: u64,
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// Split `frame` into fragments of at most `max_len` payload bytes
pub(crate) fn fragment(frame: &Frame, frame_seq: u32, max_len: usize) -> Result<Vec<Fragment>, RtcError> {
    let chunks: Vec<&[u8]> = if frame.payload.is_empty() {
        vec![&[]]
    } else {
        frame.payload.chunks(max_len.max(1)).collect()
    };
    let count = u16::try_from(chunks.len()).map_err(|_| RtcError::InvalidParameter)?;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, data)| Fragment {
            frame_seq,
            index: i as u16,
            count,
            frame_type: frame.frame_type,
            pts: frame.pts,
            timestamp: frame.timestamp,
            data: data.to_vec(),
        })
        .collect())
}

struct Partial {
    pieces: Vec<Option<Vec<u8>>>,
    received: usize,
    frame_type: FrameType,
    pts: u64,
    timestamp: u64,
}

/// Rebuilds frames from fragments, delivering them in sequence order
#[derive(Default)]
pub(crate) struct Reassembler {
    partial: BTreeMap<u32, Partial>,
    last_delivered: Option<u32>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_stale(&self, frame_seq: u32) -> bool {
        match self.last_delivered {
            Some(last) => (frame_seq.wrapping_sub(last) as i32) <= 0,
            None => false,
        }
    }

    /// Feed one fragment; returns the frame it completed, if any
    pub fn push(&mut self, frag: Fragment) -> Option<Frame> {
        if frag.count == 0 || frag.index >= frag.count || self.is_stale(frag.frame_seq) {
            return None;
        }
        let partial = self.partial.entry(frag.frame_seq).or_insert_with(|| Partial {
            pieces: vec![None; frag.count as usize],
            received: 0,
            frame_type: frag.frame_type,
            pts: frag.pts,
            timestamp: frag.timestamp,
        });
        if partial.pieces.len() != frag.count as usize {
            return None;
        }
        let slot = &mut partial.pieces[frag.index as usize];
        if slot.is_none() {
            *slot = Some(frag.data);
            partial.received += 1;
        }

        if partial.received < partial.pieces.len() {
            if self.partial.len() > PARTIAL_FRAMES_MAX {
                self.partial.pop_first();
            }
            return None;
        }

        let done = self.partial.remove(&frag.frame_seq)?;
        // Older incomplete frames can no longer be delivered in order
        self.partial.retain(|seq, _| (seq.wrapping_sub(frag.frame_seq) as i32) > 0);
        self.last_delivered = Some(frag.frame_seq);
        Some(Frame {
            frame_type: done.frame_type,
            pts: done.pts,
            timestamp: done.timestamp,
            payload: done.pieces.into_iter().flatten().flatten().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(len: usize) -> Frame {
        Frame {
            frame_type: FrameType::VideoI,
            pts: 90_000,
            timestamp: 1_700_000_000_000,
            payload: (0..len).map(|i| i as u8).collect(),
        }
    }

    #[test]
    fn test_outbound_bounded_and_ordered() {
        let q = FrameQueues::new();
        for i in 0..FRAME_QUEUE_MAX {
            let mut f = frame(1);
            f.pts = i as u64;
            q.push_outbound(f).unwrap();
        }
        assert_eq!(q.push_outbound(frame(1)), Err(RtcError::BufferFull));
        assert_eq!(q.pop_outbound().unwrap().pts, 0);
        assert_eq!(q.pop_outbound().unwrap().pts, 1);
    }

    #[test]
    fn test_recv_timeout_and_close() {
        let q = FrameQueues::new();
        assert_eq!(q.recv(None), Err(RtcError::Timeout));
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(q.recv(Some(deadline)), Err(RtcError::Timeout));
        q.close(RtcError::SessionClosedRemote);
        assert_eq!(q.recv(None), Err(RtcError::SessionClosedRemote));
        assert_eq!(q.push_outbound(frame(1)), Err(RtcError::SessionClosedRemote));
    }

    #[test]
    fn test_fragment_and_reassemble_out_of_order() {
        let sent = frame(2500);
        let mut frags = fragment(&sent, 7, 1000).unwrap();
        assert_eq!(frags.len(), 3);
        frags.reverse();

        let mut r = Reassembler::new();
        assert!(r.push(frags[0].clone()).is_none());
        assert!(r.push(frags[1].clone()).is_none());
        assert_eq!(r.push(frags[2].clone()), Some(sent));
    }

    #[test]
    fn test_empty_frame_single_fragment() {
        let frags = fragment(&frame(0), 1, 1000).unwrap();
        assert_eq!(frags.len(), 1);
        let mut r = Reassembler::new();
        assert_eq!(r.push(frags[0].clone()).unwrap().payload.len(), 0);
    }

    #[test]
    fn test_incomplete_older_frame_dropped() {
        let mut r = Reassembler::new();
        let old = fragment(&frame(2000), 1, 1000).unwrap();
        let new = fragment(&frame(10), 2, 1000).unwrap();
        assert!(r.push(old[0].clone()).is_none());
        assert!(r.push(new[0].clone()).is_some());
        // Late fragment of the superseded frame is discarded
        assert!(r.push(old[1].clone()).is_none());
    }
}
