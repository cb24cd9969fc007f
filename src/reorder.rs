//! Per-peer receive window for send-after-send ordering.
//!
//! An RTS whose message id is ahead of the peer's expected id is parked
//! at `msg_id % size` until the gap fills. Parked packets live in the
//! out-of-order staging pool so the receive buffer they arrived in can
//! be reposted immediately.

use crate::error::{Error, Result};
use crate::pool::PktId;

/// Sliding reorder window over inbound message ids.
pub struct RecvWindow {
    expected: u32,
    size: usize,
    slots: Vec<Option<PktId>>,
    pending: usize,
}

impl RecvWindow {
    pub fn new(size: usize) -> Self {
        Self {
            expected: 0,
            size,
            slots: vec![None; size],
            pending: 0,
        }
    }

    /// The next message id to be delivered.
    #[inline]
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Whether `msg_id` is the one the window is waiting for.
    #[inline]
    pub fn is_expected(&self, msg_id: u32) -> bool {
        msg_id == self.expected
    }

    /// Number of parked packets.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Park an out-of-order packet at its message id slot.
    ///
    /// A message id at or beyond the window edge, or a second packet for
    /// an already-parked id, is a protocol violation.
    pub fn insert(&mut self, msg_id: u32, pkt: PktId) -> Result<()> {
        let distance = msg_id.wrapping_sub(self.expected);
        if distance == 0 {
            return Err(Error::Protocol(format!(
                "message id {} is in order, not parkable",
                msg_id
            )));
        }
        if distance as usize >= self.size {
            return Err(Error::Protocol(format!(
                "message id {} beyond reorder window (expected {}, size {})",
                msg_id, self.expected, self.size
            )));
        }
        let slot = &mut self.slots[msg_id as usize % self.size];
        if slot.is_some() {
            return Err(Error::Protocol(format!(
                "duplicate message id {} in reorder window",
                msg_id
            )));
        }
        *slot = Some(pkt);
        self.pending += 1;
        Ok(())
    }

    /// Advance past a delivered message id.
    #[inline]
    pub fn advance(&mut self) {
        self.expected = self.expected.wrapping_add(1);
    }

    /// Take the parked packet for the expected id, if present.
    ///
    /// Does not advance; the caller advances after processing so a
    /// failed delivery does not lose its place in the sequence.
    pub fn take_expected(&mut self) -> Option<PktId> {
        let slot = &mut self.slots[self.expected as usize % self.size];
        let pkt = slot.take();
        if pkt.is_some() {
            self.pending -= 1;
        }
        pkt
    }

    /// Drain every parked packet, for peer teardown.
    pub fn drain(&mut self) -> Vec<PktId> {
        self.pending = 0;
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_not_parkable() {
        let mut win = RecvWindow::new(8);
        assert!(win.insert(0, PktId(0)).is_err());
    }

    #[test]
    fn test_park_and_release() {
        let mut win = RecvWindow::new(8);
        // ids 1 and 2 arrive before 0
        win.insert(1, PktId(11)).unwrap();
        win.insert(2, PktId(12)).unwrap();
        assert_eq!(win.pending(), 2);

        // id 0 delivered directly from the wire
        assert!(win.is_expected(0));
        win.advance();

        assert_eq!(win.take_expected(), Some(PktId(11)));
        win.advance();
        assert_eq!(win.take_expected(), Some(PktId(12)));
        win.advance();
        assert_eq!(win.take_expected(), None);
        assert_eq!(win.pending(), 0);
        assert_eq!(win.expected(), 3);
    }

    #[test]
    fn test_gap_holds_back_successors() {
        let mut win = RecvWindow::new(8);
        win.insert(2, PktId(12)).unwrap();
        // id 1 still missing; nothing to take for id 0
        assert_eq!(win.take_expected(), None);
        win.advance(); // 0 delivered
        assert_eq!(win.take_expected(), None);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut win = RecvWindow::new(8);
        win.insert(3, PktId(1)).unwrap();
        assert!(matches!(win.insert(3, PktId(2)), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_beyond_window_rejected() {
        let mut win = RecvWindow::new(8);
        assert!(matches!(win.insert(8, PktId(1)), Err(Error::Protocol(_))));
        assert!(matches!(win.insert(100, PktId(1)), Err(Error::Protocol(_))));
        // id behind the expected one wraps to a huge distance
        let mut win = RecvWindow::new(8);
        win.advance();
        win.advance();
        assert!(matches!(win.insert(1, PktId(1)), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_drain() {
        let mut win = RecvWindow::new(4);
        win.insert(1, PktId(1)).unwrap();
        win.insert(2, PktId(2)).unwrap();
        let drained = win.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(win.pending(), 0);
    }
}
