//! Operation-tracking records and their arenas.
//!
//! Every in-flight transmit or receive is tracked by an entry living in
//! a fixed-capacity arena. The 32-bit slot id travels on the wire so the
//! remote side can address control and data packets at the entry
//! directly. Slot ids are paired with a local generation counter: a
//! completion that refers to a released slot is detected by its stale
//! generation and dropped.

use std::collections::VecDeque;

use bitflags::bitflags;
use slab::Slab;

use crate::error::{Error, Result};
use crate::packet::RmaIov;
use crate::peer::Addr;
use crate::pool::PktId;

/// Transmit operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    MsgSend,
    TaggedSend,
    RmaWrite,
    RmaRead,
}

/// Receive operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOp {
    /// Untagged receive, or the unexpected entry for an untagged RTS.
    Msg,
    /// Tagged receive.
    Tagged,
    /// Target side of an emulated write; data lands in a registered region.
    Write,
    /// Initiator-side destination of an emulated read.
    Read,
}

/// Transmit entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Not in the arena; entries return here when released.
    Free,
    /// RTS formatted and (being) sent.
    Rts,
    /// Streaming data packets under a CTS grant.
    Send,
    /// Read request issued over the shared-memory transport.
    ShmRma,
    /// Shared-memory read request hit a full ring; queued for retry.
    QueuedShmRma,
    /// Control packet hit a full ring; queued for retry.
    QueuedCtrl,
    /// RTS hit receiver-not-ready; queued behind the peer's backoff.
    QueuedRtsRnr,
    /// Data packet hit receiver-not-ready; queued behind the backoff.
    QueuedDataRnr,
    /// Remote side: streaming a read response.
    SentReadRsp,
    /// Remote side: read response hit a full ring; queued for retry.
    QueuedReadRsp,
    /// Initiator side: waiting for the paired receive to finish.
    WaitReadFinish,
}

/// Receive entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Not in the arena; entries return here when released.
    Free,
    /// Posted, waiting for an RTS.
    Init,
    /// Created for an RTS nothing matched; holds the staged packet.
    Unexp,
    /// Matched with an RTS.
    Matched,
    /// Receiving data packets of a large message.
    Recv,
    /// Control packet (CTS) hit a full ring; queued for retry.
    QueuedCtrl,
    /// Reserved for the receiver-driven shared-memory pull path.
    QueuedShmLargeRead,
    /// End-of-read acknowledgement hit a full ring; queued for retry.
    QueuedEor,
    /// CTS hit receiver-not-ready; queued behind the peer's backoff.
    QueuedCtsRnr,
    /// Initiator-side read destination waiting for response data.
    WaitReadFinish,
}

bitflags! {
    /// Entry-local flags (never on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u16 {
        /// Posted multi-receive buffer (the master entry).
        const MULTI_RECV_POSTED   = 1 << 4;
        /// Consumer carved out of a multi-receive buffer.
        const MULTI_RECV_CONSUMER = 1 << 5;
        /// Entry completes without writing a CQ record.
        const NO_COMPLETION       = 1 << 6;
    }
}

/// Sender-side per-operation record.
pub struct TxEntry {
    pub op: TxOp,
    pub addr: Addr,
    /// Own slot id; travels in the RTS.
    pub tx_id: u32,
    /// Peer's slot id, learned from the CTS.
    pub rx_id: u32,
    pub msg_id: u32,
    pub tag: u64,
    pub cq_data: Option<u64>,
    /// Payload segments, owned for the lifetime of the operation.
    pub iov: Vec<Vec<u8>>,
    pub iov_index: usize,
    pub iov_offset: usize,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub total_len: u64,
    /// Data packets still allowed under the current CTS grant.
    pub window: u64,
    pub credit_request: u16,
    pub credit_allocated: u16,
    pub state: TxState,
    pub flags: EntryFlags,
    /// Remote iov descriptors for emulated RMA.
    pub rma_iov: Vec<RmaIov>,
    /// Paired receive slot on the initiator (emulated read).
    pub rma_loc_rx_id: u32,
    /// Packets waiting to be (re)sent to this peer.
    pub queued_pkts: VecDeque<PktId>,
    /// Opaque application context echoed in the completion.
    pub context: u64,
    /// Paired receive finished; completion due (emulated read).
    pub read_done: bool,
    /// The operation routes over the shared-memory transport.
    pub shm: bool,
}

impl TxEntry {
    pub fn new(op: TxOp, addr: Addr, iov: Vec<Vec<u8>>, context: u64) -> Self {
        let total_len = iov.iter().map(|s| s.len() as u64).sum();
        Self {
            op,
            addr,
            tx_id: 0,
            rx_id: 0,
            msg_id: 0,
            tag: 0,
            cq_data: None,
            iov,
            iov_index: 0,
            iov_offset: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            total_len,
            window: 0,
            credit_request: 0,
            credit_allocated: 0,
            state: TxState::Rts,
            flags: EntryFlags::default(),
            rma_iov: Vec::new(),
            rma_loc_rx_id: 0,
            queued_pkts: VecDeque::new(),
            context,
            read_done: false,
            shm: false,
        }
    }

    /// Copy the next payload segment at the cursor into `dst`.
    ///
    /// Advances the iov cursor and `bytes_sent`; returns the number of
    /// bytes copied (0 when the payload is exhausted).
    pub fn copy_next_seg(&mut self, dst: &mut [u8]) -> usize {
        let mut written = 0;
        while written < dst.len() && self.iov_index < self.iov.len() {
            let seg = &self.iov[self.iov_index];
            let avail = seg.len() - self.iov_offset;
            if avail == 0 {
                self.iov_index += 1;
                self.iov_offset = 0;
                continue;
            }
            let n = avail.min(dst.len() - written);
            dst[written..written + n]
                .copy_from_slice(&seg[self.iov_offset..self.iov_offset + n]);
            written += n;
            self.iov_offset += n;
            if self.iov_offset == seg.len() {
                self.iov_index += 1;
                self.iov_offset = 0;
            }
        }
        self.bytes_sent += written as u64;
        written
    }

    #[inline]
    pub fn fully_acked(&self) -> bool {
        self.bytes_acked == self.total_len
    }
}

/// Receiver-side per-operation record.
pub struct RxEntry {
    pub op: RxOp,
    pub addr: Addr,
    /// Sender's slot id, from the RTS.
    pub tx_id: u32,
    /// Own slot id; advertised to the sender in the CTS.
    pub rx_id: u32,
    pub msg_id: u32,
    pub tag: u64,
    /// Tag bits ignored during matching.
    pub ignore: u64,
    pub cq_data: Option<u64>,
    /// Destination segments, owned until completion.
    pub iov: Vec<Vec<u8>>,
    pub bytes_done: u64,
    pub total_len: u64,
    /// Data packets granted but not yet received.
    pub window: u64,
    /// Sender's credit proposal from the RTS.
    pub credit_request: u16,
    /// Total credits granted to the sender so far.
    pub credit_cts: u16,
    pub state: RxState,
    pub flags: EntryFlags,
    /// Master entry this consumer was carved from.
    pub master_id: Option<u32>,
    /// Consumer's byte offset within the master buffer.
    pub master_offset: u64,
    /// Consumers carved out of this master entry.
    pub consumers: Vec<u32>,
    /// Master: bytes carved out of the buffer so far.
    pub consumed: u64,
    /// Staged RTS of an unexpected message.
    pub unexp_pkt: Option<PktId>,
    /// Packets waiting to be (re)sent to this peer.
    pub queued_pkts: VecDeque<PktId>,
    pub context: u64,
    /// Write-target descriptors from the RTS.
    pub rma_iov: Vec<RmaIov>,
    /// Responder's read-response slot, for the EOR.
    pub readrsp_tx_id: u32,
    /// Initiator's transmit slot paired with this read destination.
    pub paired_tx_id: u32,
    /// The operation routes over the shared-memory transport.
    pub shm: bool,
    /// The message did not fit the posted buffer.
    pub truncated: bool,
    /// A CTS grant is owed but could not be issued yet.
    pub pending_cts: bool,
}

impl RxEntry {
    pub fn new(op: RxOp, addr: Addr, iov: Vec<Vec<u8>>, context: u64) -> Self {
        Self {
            op,
            addr,
            tx_id: 0,
            rx_id: 0,
            msg_id: 0,
            tag: 0,
            ignore: 0,
            cq_data: None,
            iov,
            bytes_done: 0,
            total_len: 0,
            window: 0,
            credit_request: 0,
            credit_cts: 0,
            state: RxState::Init,
            flags: EntryFlags::default(),
            master_id: None,
            master_offset: 0,
            consumers: Vec::new(),
            consumed: 0,
            unexp_pkt: None,
            queued_pkts: VecDeque::new(),
            context,
            rma_iov: Vec::new(),
            readrsp_tx_id: 0,
            paired_tx_id: 0,
            shm: false,
            truncated: false,
            pending_cts: false,
        }
    }

    /// Total capacity of the destination segments.
    pub fn capacity(&self) -> u64 {
        self.iov.iter().map(|s| s.len() as u64).sum()
    }

    /// Scatter `data` into the destination segments at `offset`.
    ///
    /// Bytes beyond the capacity are dropped and the entry is marked
    /// truncated. `bytes_done` counts received bytes either way so the
    /// completion condition is reached even for truncated messages.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) {
        let mut remaining = data;
        let mut pos = offset;
        let mut seg_start = 0u64;
        for seg in &mut self.iov {
            let seg_len = seg.len() as u64;
            if !remaining.is_empty() && pos < seg_start + seg_len {
                let in_seg = (pos - seg_start) as usize;
                let n = remaining.len().min(seg.len() - in_seg);
                seg[in_seg..in_seg + n].copy_from_slice(&remaining[..n]);
                remaining = &remaining[n..];
                pos += n as u64;
            }
            seg_start += seg_len;
        }
        if !remaining.is_empty() {
            self.truncated = true;
        }
        self.bytes_done += data.len() as u64;
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.bytes_done == self.total_len
    }
}

/// Fixed-capacity slot arena with generation tracking.
pub struct Arena<T> {
    slab: Slab<T>,
    gens: Vec<u32>,
    capacity: usize,
}

pub type TxArena = Arena<TxEntry>;
pub type RxArena = Arena<RxEntry>;

impl<T> Arena<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            gens: vec![0; capacity],
            capacity,
        }
    }

    /// Allocate a slot; the closure receives the slot id so the entry
    /// can record its own wire id. Fails with `Again` at capacity.
    pub fn alloc_with(&mut self, f: impl FnOnce(u32) -> T) -> Result<u32> {
        if self.slab.len() >= self.capacity {
            return Err(Error::Again);
        }
        let vacant = self.slab.vacant_entry();
        let id = vacant.key() as u32;
        vacant.insert(f(id));
        Ok(id)
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<&T> {
        self.slab.get(id as usize)
    }

    #[inline]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slab.get_mut(id as usize)
    }

    /// Current generation of a slot.
    #[inline]
    pub fn gen(&self, id: u32) -> u32 {
        self.gens.get(id as usize).copied().unwrap_or(0)
    }

    /// Whether a (slot, generation) pair still refers to a live entry.
    pub fn is_current(&self, id: u32, gen: u32) -> bool {
        self.slab.contains(id as usize) && self.gen(id) == gen
    }

    /// Remove an entry, invalidating outstanding references to the slot.
    pub fn release(&mut self, id: u32) -> Option<T> {
        if !self.slab.contains(id as usize) {
            return None;
        }
        self.gens[id as usize] = self.gens[id as usize].wrapping_add(1);
        Some(self.slab.remove(id as usize))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slab.iter().map(|(k, v)| (k as u32, v))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(iov: Vec<Vec<u8>>) -> TxEntry {
        TxEntry::new(TxOp::MsgSend, Addr(0), iov, 0)
    }

    #[test]
    fn test_arena_capacity_and_generations() {
        let mut arena: TxArena = Arena::new(2);
        let a = arena
            .alloc_with(|id| {
                let mut e = tx(vec![]);
                e.tx_id = id;
                e
            })
            .unwrap();
        let _b = arena.alloc_with(|_| tx(vec![])).unwrap();
        assert!(matches!(arena.alloc_with(|_| tx(vec![])), Err(Error::Again)));

        let gen = arena.gen(a);
        assert!(arena.is_current(a, gen));
        arena.release(a).unwrap();
        assert!(!arena.is_current(a, gen));

        // slot is reused with a fresh generation
        let a2 = arena.alloc_with(|_| tx(vec![])).unwrap();
        assert_eq!(a2, a);
        assert!(arena.is_current(a2, gen + 1));
        assert!(!arena.is_current(a2, gen));
    }

    #[test]
    fn test_copy_next_seg_spans_segments() {
        let mut e = tx(vec![b"abcd".to_vec(), b"ef".to_vec(), b"ghij".to_vec()]);
        assert_eq!(e.total_len, 10);

        let mut dst = [0u8; 3];
        assert_eq!(e.copy_next_seg(&mut dst), 3);
        assert_eq!(&dst, b"abc");
        assert_eq!(e.copy_next_seg(&mut dst), 3);
        assert_eq!(&dst, b"def");
        assert_eq!(e.copy_next_seg(&mut dst), 3);
        assert_eq!(&dst, b"ghi");
        assert_eq!(e.copy_next_seg(&mut dst), 1);
        assert_eq!(dst[0], b'j');
        assert_eq!(e.copy_next_seg(&mut dst), 0);
        assert_eq!(e.bytes_sent, 10);
    }

    #[test]
    fn test_write_at_scatters() {
        let mut e = RxEntry::new(RxOp::Msg, Addr(0), vec![vec![0; 4], vec![0; 4]], 0);
        e.total_len = 6;
        e.write_at(2, b"xxyy");
        assert_eq!(e.iov[0], vec![0, 0, b'x', b'x']);
        assert_eq!(e.iov[1], vec![b'y', b'y', 0, 0]);
        assert!(!e.truncated);
        assert_eq!(e.bytes_done, 4);
    }

    #[test]
    fn test_write_at_truncates() {
        let mut e = RxEntry::new(RxOp::Msg, Addr(0), vec![vec![0; 4]], 0);
        e.total_len = 8;
        e.write_at(0, b"abcdefgh");
        assert_eq!(e.iov[0], b"abcd".to_vec());
        assert!(e.truncated);
        assert_eq!(e.bytes_done, 8);
        assert!(e.is_complete());
    }
}
