//! Generation-checked slot arena for sessions
//!
//! Handles stay valid until their slot is released; a released slot bumps its
//! generation so stale handles are rejected instead of aliasing a newer
//! session.

use crate::error::RtcError;
use crate::session::{SessionHandle, GENERATION_MASK};

struct Slot<T> {
    generation: u16,
    entry: Option<T>,
}

pub(crate) struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
    len: usize,
}

impl<T> SlotTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity: capacity.min(u16::MAX as usize),
            len: 0,
        }
    }

    /// Insert an entry built from its future handle
    pub fn insert_with(&mut self, build: impl FnOnce(SessionHandle) -> T) -> Result<SessionHandle, RtcError> {
        if self.len >= self.capacity {
            return Err(RtcError::MaxSessionExceeded);
        }
        let index = match self.slots.iter().position(|s| s.entry.is_none()) {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        let handle = SessionHandle::new(index as u16, slot.generation);
        slot.entry = Some(build(handle));
        self.len += 1;
        Ok(handle)
    }

    fn slot(&self, handle: SessionHandle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation())
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&T> {
        self.slot(handle).and_then(|s| s.entry.as_ref())
    }

    pub fn remove(&mut self, handle: SessionHandle) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation())?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
        self.len -= 1;
        Some(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.entry.as_ref())
    }

    /// Remove and return every entry
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for slot in &mut self.slots {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
                out.push(entry);
            }
        }
        self.len = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut table = SlotTable::new(4);
        let h = table.insert_with(|h| h.as_raw()).unwrap();
        assert_eq!(table.get(h), Some(&h.as_raw()));
        assert_eq!(table.remove(h), Some(h.as_raw()));
        assert_eq!(table.get(h), None);
        assert_eq!(table.remove(h), None);
        assert!(table.drain().is_empty());
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut table = SlotTable::new(1);
        let first = table.insert_with(|_| "a").unwrap();
        table.remove(first);
        let second = table.insert_with(|_| "b").unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert_eq!(table.get(first), None);
        assert_eq!(table.get(second), Some(&"b"));
    }

    #[test]
    fn test_capacity() {
        let mut table = SlotTable::new(2);
        table.insert_with(|_| 1).unwrap();
        table.insert_with(|_| 2).unwrap();
        assert_eq!(table.insert_with(|_| 3), Err(RtcError::MaxSessionExceeded));
    }

    #[test]
    fn test_drain() {
        let mut table = SlotTable::new(3);
        let a = table.insert_with(|_| 1).unwrap();
        table.insert_with(|_| 2).unwrap();
        assert_eq!(table.drain().len(), 2);
        assert_eq!(table.get(a), None);
        assert_eq!(table.iter().count(), 0);
    }
}
