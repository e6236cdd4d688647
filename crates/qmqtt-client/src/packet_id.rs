//! Packet identifier allocation.
//!
//! Identifiers are non-zero 16-bit values shared by QoS 1/2 PUBLISH,
//! SUBSCRIBE and UNSUBSCRIBE. An identifier stays reserved until its
//! handshake completes or the request is cancelled; a resent packet keeps
//! the identifier it was first sent with.

use ahash::AHashSet;

/// Largest number of identifiers that can be in flight at once.
pub const MAX_IN_FLIGHT: usize = u16::MAX as usize;

/// Hands out unused packet identifiers.
///
/// Allocation walks forward from a cursor and wraps from 65535 back to 1, so
/// an identifier freed a moment ago is not immediately handed out again.
#[derive(Debug)]
pub struct PacketIdAllocator {
    cursor: u16,
    in_use: AHashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            cursor: 1,
            in_use: AHashSet::new(),
        }
    }

    /// Reserve the next unused identifier after the cursor.
    ///
    /// This is not the smallest free value: with 1..=3 in use and 1 released,
    /// the next call returns 4. Returns `None` when all 65535 identifiers are
    /// in flight.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.in_use.len() >= MAX_IN_FLIGHT {
            return None;
        }
        // At least one id is free, so this terminates within one lap.
        loop {
            let candidate = self.cursor;
            self.cursor = next_id(self.cursor);
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    /// Mark an identifier as taken, e.g. when restoring a session.
    ///
    /// Returns `false` for 0 or an id that is already in use.
    pub fn reserve(&mut self, id: u16) -> bool {
        id != 0 && self.in_use.insert(id)
    }

    /// Free an identifier once its exchange is over.
    pub fn release(&mut self, id: u16) -> bool {
        self.in_use.remove(&id)
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Forget every reservation and restart the cursor at 1.
    pub fn clear(&mut self) {
        self.in_use.clear();
        self.cursor = 1;
    }
}

fn next_id(id: u16) -> u16 {
    match id.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), Some(3));
        assert_eq!(ids.in_use_count(), 3);
    }

    #[test]
    fn test_released_id_not_reused_first() {
        let mut ids = PacketIdAllocator::new();
        for _ in 0..3 {
            ids.allocate();
        }
        assert!(ids.release(1));
        assert_eq!(ids.allocate(), Some(4));
    }

    #[test]
    fn test_skips_ids_in_use() {
        let mut ids = PacketIdAllocator::new();
        assert!(ids.reserve(2));
        assert!(ids.reserve(3));
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(4));
        assert!(!ids.reserve(4));
        assert!(!ids.reserve(0));
    }

    #[test]
    fn test_wraps_without_zero() {
        let mut ids = PacketIdAllocator::new();
        ids.cursor = u16::MAX;
        assert_eq!(ids.allocate(), Some(u16::MAX));
        assert_eq!(ids.allocate(), Some(1));
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let mut ids = PacketIdAllocator::new();
        for expected in 1..=u16::MAX {
            assert_eq!(ids.allocate(), Some(expected));
        }
        assert_eq!(ids.in_use_count(), MAX_IN_FLIGHT);
        assert_eq!(ids.allocate(), None);
        assert_eq!(ids.allocate(), None);

        assert!(ids.release(4242));
        assert!(!ids.release(4242));
        assert_eq!(ids.allocate(), Some(4242));
        assert_eq!(ids.allocate(), None);
    }

    #[test]
    fn test_never_hands_out_an_id_in_flight() {
        let mut ids = PacketIdAllocator::new();
        let held = ids.allocate().unwrap();
        for _ in 0..(MAX_IN_FLIGHT * 2) {
            let id = ids.allocate().unwrap();
            assert_ne!(id, held);
            assert_ne!(id, 0);
            ids.release(id);
        }
        assert!(ids.is_in_use(held));
    }

    #[test]
    fn test_clear() {
        let mut ids = PacketIdAllocator::new();
        ids.allocate();
        ids.allocate();
        ids.clear();
        assert_eq!(ids.in_use_count(), 0);
        assert_eq!(ids.allocate(), Some(1));
    }
}
