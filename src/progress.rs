//! The progress engine.
//!
//! A single pump pass polls both transport completion queues, expires
//! RNR backoff, retries queued packets, streams pending large messages,
//! reposts receive buffers and refreshes the resource-management flags.
//! The hosting runtime calls [`Endpoint::progress`] from exactly one
//! thread.

use tracing::{debug, trace, warn};

use crate::endpoint::{decode_pkt_ctx, lane_mut, Endpoint, RmFlags, Submit};
use crate::entry::{TxOp, TxState};
use crate::error::EIO;
use crate::packet::{
    parse_rts, DataHdr, PktFlags, PktType, ReadRspHdr, DATA_HDR_SIZE, READRSP_HDR_SIZE,
};
use crate::peer::{initial_timeout_interval, Addr, PeerFlags};
use crate::pool::{EntryKind, EntryRef, PktId};
use crate::transport::{CqeKind, TransportCqe, TransportError};

/// Result of retrying a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    Flushed,
    Blocked,
}

impl Endpoint {
    /// Run one pass of the progress engine.
    pub fn progress(&mut self) {
        self.poll_lane(false);
        if self.shm.is_some() {
            self.poll_lane(true);
        }
        self.expire_backoff();
        self.retry_connacks();
        self.drain_tx_queued();
        self.drain_rx_queued();
        self.drain_tx_pending();
        self.drain_read_pending();
        self.repost_recv_bufs();
        self.update_rm_full();
    }

    // ------------------------------------------------------------------
    // Transport completion polling
    // ------------------------------------------------------------------

    fn poll_lane(&mut self, use_shm: bool) {
        let mut cqes = std::mem::take(&mut self.scratch_cqes);
        cqes.clear();
        {
            let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
            let max = lane.cq_read_size;
            lane.transport.poll_cq(max, &mut cqes);
        }
        for cqe in cqes.drain(..) {
            match cqe.kind {
                CqeKind::Recv => {
                    let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
                    lane.posted_bufs = lane.posted_bufs.saturating_sub(1);
                    if let Some(err) = cqe.err {
                        warn!(addr = cqe.addr.0, ?err, "receive completion error");
                        continue;
                    }
                    self.handle_recv_frame(use_shm, cqe.addr, cqe.data);
                }
                CqeKind::Send => self.handle_send_cqe(use_shm, cqe),
            }
        }
        self.scratch_cqes = cqes;
    }

    /// Classify one send completion: success advances the owning entry,
    /// RNR starts backoff, anything else is fatal for the peer.
    fn handle_send_cqe(&mut self, use_shm: bool, cqe: TransportCqe) {
        let (_, pkt) = decode_pkt_ctx(cqe.ctx);
        let (owner, pkt_type, addr, acked) = {
            let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
            let entry = lane.tx_pool.get(pkt);
            let acked = pkt_acked_bytes(entry.pkt_type, entry.frame());
            (entry.owner, entry.pkt_type, Addr(entry.addr), acked)
        };

        if let Some(peer) = self.peers.get_mut(addr) {
            peer.tx_pending = peer.tx_pending.saturating_sub(1);
        }

        match cqe.err {
            Some(TransportError::Rnr) => {
                self.handle_rnr(use_shm, pkt, addr, owner, pkt_type);
                return;
            }
            Some(TransportError::Fatal(errno)) => {
                lane_mut(&mut self.main, &mut self.shm, use_shm)
                    .tx_pool
                    .free(pkt);
                self.handle_peer_fatal(addr, errno);
                return;
            }
            None => {}
        }

        // A delivered data-class packet returns its transmit credit.
        if is_data_class(pkt_type) {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.tx_credits += 1;
            }
        }

        lane_mut(&mut self.main, &mut self.shm, use_shm)
            .tx_pool
            .free(pkt);

        match owner {
            Some(EntryRef {
                kind: EntryKind::Tx,
                id,
                gen,
            }) if self.tx.is_current(id, gen) => {
                self.tx_pkt_acked(id, pkt_type, acked);
            }
            Some(EntryRef {
                kind: EntryKind::Rx,
                ..
            }) => {
                // CTS and EOR completions need no further bookkeeping.
            }
            Some(r) => {
                debug!(id = r.id, "completion for released entry dropped");
            }
            None => {}
        }
    }

    /// Advance a transmit entry after one of its packets was delivered.
    fn tx_pkt_acked(&mut self, tx_id: u32, pkt_type: u8, acked: u64) {
        let (op, state, shm, done) = {
            let Some(entry) = self.tx.get_mut(tx_id) else {
                return;
            };
            entry.bytes_acked += acked;
            let done = entry.bytes_acked == entry.total_len
                && entry.bytes_sent == entry.total_len
                && entry.queued_pkts.is_empty();
            (entry.op, entry.state, entry.shm, done)
        };

        if pkt_type == PktType::Rts as u8 && op == TxOp::RmaRead {
            // the read request is out; park until the response lands
            if state == TxState::Rts {
                if let Some(entry) = self.tx.get_mut(tx_id) {
                    entry.state = TxState::WaitReadFinish;
                }
            }
            return;
        }
        if !done {
            return;
        }
        match state {
            TxState::Rts | TxState::Send => {
                if let Some(e) = self.release_tx_entry(tx_id) {
                    self.write_tx_completion(e);
                }
            }
            TxState::SentReadRsp => {
                // over shared memory the responder waits for the EOR
                if !shm {
                    self.release_tx_entry(tx_id);
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // RNR backoff
    // ------------------------------------------------------------------

    /// Receiver-not-ready: queue the packet behind the peer's backoff.
    fn handle_rnr(
        &mut self,
        use_shm: bool,
        pkt: PktId,
        addr: Addr,
        owner: Option<EntryRef>,
        pkt_type: u8,
    ) {
        let now = self.now_us();
        let cfg_interval = self.cfg.timeout_interval;
        let max_timeout = self.cfg.max_timeout;

        if is_data_class(pkt_type) {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.tx_credits += 1;
            }
        }

        let mut enter_backoff = false;
        {
            let peer = self.peers.get_or_create(addr);
            if !peer.flags.contains(PeerFlags::IN_BACKOFF) {
                peer.flags |= PeerFlags::IN_BACKOFF;
                peer.rnr_ts = now;
                enter_backoff = true;
            }
            if !peer.flags.contains(PeerFlags::BACKED_OFF_THIS_PASS) {
                peer.flags |= PeerFlags::BACKED_OFF_THIS_PASS;
                if peer.timeout_interval == 0 {
                    peer.timeout_interval = initial_timeout_interval(cfg_interval);
                } else {
                    peer.raise_backoff(max_timeout);
                }
            }
        }
        if enter_backoff {
            self.peer_backoff.push(addr);
            debug!(addr = addr.0, "peer entered rnr backoff");
        }

        match owner {
            Some(EntryRef {
                kind: EntryKind::Tx,
                id,
                gen,
            }) if self.tx.is_current(id, gen) => {
                let state = match pkt_type {
                    t if t == PktType::Rts as u8 => TxState::QueuedRtsRnr,
                    t if t == PktType::ReadRsp as u8 => TxState::QueuedReadRsp,
                    _ => TxState::QueuedDataRnr,
                };
                self.queue_tx_pkt(id, pkt, state);
            }
            Some(EntryRef {
                kind: EntryKind::Rx,
                id,
                gen,
            }) if self.rx.is_current(id, gen) => {
                let state = if pkt_type == PktType::Eor as u8 {
                    crate::entry::RxState::QueuedEor
                } else {
                    crate::entry::RxState::QueuedCtsRnr
                };
                self.queue_rx_pkt(id, pkt, state);
            }
            _ => {
                // the owning entry is gone; drop the packet
                lane_mut(&mut self.main, &mut self.shm, use_shm)
                    .tx_pool
                    .free(pkt);
            }
        }
    }

    /// Walk the backoff list, releasing peers whose window elapsed.
    fn expire_backoff(&mut self) {
        let now = self.now_us();
        let max_timeout = self.cfg.max_timeout;
        let peers = &mut self.peers;
        self.peer_backoff.retain(|&addr| {
            let Some(peer) = peers.get_mut(addr) else {
                return false;
            };
            peer.flags.remove(PeerFlags::BACKED_OFF_THIS_PASS);
            if peer.backoff_expired(now, max_timeout) {
                peer.flags.remove(PeerFlags::IN_BACKOFF);
                trace!(addr = addr.0, "rnr backoff expired");
                false
            } else {
                true
            }
        });
    }

    /// Retry CONNACK replies the transport refused earlier.
    fn retry_connacks(&mut self) {
        let pending = std::mem::take(&mut self.connack_pending);
        for addr in pending {
            let owed = self
                .peers
                .get_mut(addr)
                .map(|p| std::mem::take(&mut p.conn_ack_pending))
                .unwrap_or(false);
            if owed {
                let use_shm = self.use_shm(addr);
                self.send_connack(use_shm, addr);
            }
        }
    }

    // ------------------------------------------------------------------
    // Queued-packet retry
    // ------------------------------------------------------------------

    fn drain_tx_queued(&mut self) {
        let n = self.tx_queued.len();
        let mut blocked: Vec<Addr> = Vec::new();
        for _ in 0..n {
            let Some(id) = self.tx_queued.pop_front() else {
                break;
            };
            let Some(addr) = self.tx.get(id).map(|e| e.addr) else {
                continue;
            };
            if blocked.contains(&addr) {
                self.tx_queued.push_back(id);
                continue;
            }
            match self.flush_tx_queued_entry(id) {
                Flush::Flushed => {}
                Flush::Blocked => {
                    blocked.push(addr);
                    self.tx_queued.push_back(id);
                }
            }
        }
    }

    fn flush_tx_queued_entry(&mut self, tx_id: u32) -> Flush {
        loop {
            let Some((pkt, addr, shm)) = self
                .tx
                .get(tx_id)
                .and_then(|e| e.queued_pkts.front().map(|&p| (p, e.addr, e.shm)))
            else {
                break;
            };
            let pkt_type = {
                let lane = lane_mut(&mut self.main, &mut self.shm, shm);
                lane.tx_pool.get(pkt).pkt_type
            };
            if is_data_class(pkt_type) {
                let credits = self.peers.get(addr).map(|p| p.tx_credits).unwrap_or(0);
                if credits == 0 {
                    return Flush::Blocked;
                }
            }
            match self.submit_pkt(shm, pkt) {
                Ok(Submit::Sent) => {
                    if let Some(e) = self.tx.get_mut(tx_id) {
                        e.queued_pkts.pop_front();
                    }
                    if let Some(peer) = self.peers.get_mut(addr) {
                        peer.rnr_queued_pkt_cnt = peer.rnr_queued_pkt_cnt.saturating_sub(1);
                        if is_data_class(pkt_type) {
                            peer.tx_credits -= 1;
                        }
                    }
                }
                Ok(Submit::Blocked) => return Flush::Blocked,
                Err(e) => {
                    warn!(tx_id, error = %e, "queued packet submission failed");
                    lane_mut(&mut self.main, &mut self.shm, shm).tx_pool.free(pkt);
                    if let Some(entry) = self.release_tx_entry(tx_id) {
                        self.write_tx_err_completion(entry, EIO);
                    }
                    return Flush::Flushed;
                }
            }
        }

        // all queued packets flushed; resume the pre-queue state
        let mut to_pending = false;
        if let Some(entry) = self.tx.get_mut(tx_id) {
            entry.state = match entry.state {
                TxState::QueuedRtsRnr | TxState::QueuedCtrl => {
                    if entry.op == TxOp::RmaRead && entry.shm {
                        TxState::ShmRma
                    } else {
                        TxState::Rts
                    }
                }
                TxState::QueuedShmRma => TxState::ShmRma,
                TxState::QueuedDataRnr => TxState::Send,
                TxState::QueuedReadRsp => TxState::SentReadRsp,
                other => other,
            };
            to_pending = matches!(entry.state, TxState::Send | TxState::SentReadRsp)
                && entry.window > 0
                && entry.bytes_sent < entry.total_len;
        }
        if to_pending {
            self.tx_pending.push_back(tx_id);
        }
        Flush::Flushed
    }

    fn drain_rx_queued(&mut self) {
        let n = self.rx_queued.len();
        let mut blocked: Vec<Addr> = Vec::new();
        for _ in 0..n {
            let Some(id) = self.rx_queued.pop_front() else {
                break;
            };
            let Some(addr) = self.rx.get(id).map(|e| e.addr) else {
                continue;
            };
            if blocked.contains(&addr) {
                self.rx_queued.push_back(id);
                continue;
            }
            match self.flush_rx_queued_entry(id) {
                Flush::Flushed => {}
                Flush::Blocked => {
                    blocked.push(addr);
                    self.rx_queued.push_back(id);
                }
            }
        }
    }

    fn flush_rx_queued_entry(&mut self, rx_id: u32) -> Flush {
        let mut flushed_any = false;
        loop {
            let Some((pkt, shm)) = self
                .rx
                .get(rx_id)
                .and_then(|e| e.queued_pkts.front().map(|&p| (p, e.shm)))
            else {
                break;
            };
            let addr = self.rx.get(rx_id).map(|e| e.addr).unwrap_or(Addr(0));
            match self.submit_pkt(shm, pkt) {
                Ok(Submit::Sent) => {
                    flushed_any = true;
                    if let Some(e) = self.rx.get_mut(rx_id) {
                        e.queued_pkts.pop_front();
                    }
                    if let Some(peer) = self.peers.get_mut(addr) {
                        peer.rnr_queued_pkt_cnt = peer.rnr_queued_pkt_cnt.saturating_sub(1);
                    }
                }
                Ok(Submit::Blocked) => return Flush::Blocked,
                Err(e) => {
                    warn!(rx_id, error = %e, "queued control packet failed");
                    lane_mut(&mut self.main, &mut self.shm, shm).tx_pool.free(pkt);
                    self.fail_rx_entry(rx_id, EIO);
                    return Flush::Flushed;
                }
            }
        }

        let (state, pending_cts) = match self.rx.get(rx_id) {
            Some(e) => (e.state, e.pending_cts),
            None => return Flush::Flushed,
        };
        match state {
            crate::entry::RxState::QueuedEor => {
                if flushed_any {
                    // the acknowledgement left; the destination is done
                    self.release_rx_entry(rx_id);
                } else {
                    // the acknowledgement never got a packet; try again
                    self.send_eor(rx_id);
                }
                return Flush::Flushed;
            }
            crate::entry::RxState::QueuedCtrl | crate::entry::RxState::QueuedCtsRnr => {
                if let Some(e) = self.rx.get_mut(rx_id) {
                    e.state = crate::entry::RxState::Recv;
                }
            }
            _ => {}
        }
        if pending_cts {
            // clear the marker first so a still-deferred grant can
            // re-queue the entry
            if let Some(e) = self.rx.get_mut(rx_id) {
                e.pending_cts = false;
            }
            if let Err(e) = self.post_cts(rx_id) {
                warn!(rx_id, error = %e, "deferred cts failed");
            }
        }
        Flush::Flushed
    }

    // ------------------------------------------------------------------
    // Pending streams
    // ------------------------------------------------------------------

    fn drain_tx_pending(&mut self) {
        let n = self.tx_pending.len();
        for _ in 0..n {
            let Some(id) = self.tx_pending.pop_front() else {
                break;
            };
            if self.stream_tx_entry(id) {
                self.tx_pending.push_back(id);
            }
        }
    }

    /// Stream data (or read-response) packets for one entry until its
    /// window, the peer's credits, or the transport ring runs out.
    ///
    /// Returns true when the entry should stay on the pending list.
    fn stream_tx_entry(&mut self, tx_id: u32) -> bool {
        loop {
            let Some(entry) = self.tx.get(tx_id) else {
                return false;
            };
            let readrsp = entry.state == TxState::SentReadRsp;
            if !matches!(entry.state, TxState::Send | TxState::SentReadRsp) {
                return false;
            }
            if entry.bytes_sent >= entry.total_len {
                return false;
            }
            if entry.window == 0 {
                // a further CTS re-arms the entry
                return false;
            }
            let addr = entry.addr;
            let shm = entry.shm;
            let rx_id = entry.rx_id;
            let seg_offset = entry.bytes_sent;
            let remaining = entry.total_len - entry.bytes_sent;

            {
                let Some(peer) = self.peers.get(addr) else {
                    return false;
                };
                if peer.flags.contains(PeerFlags::IN_BACKOFF) {
                    return true;
                }
                if peer.tx_credits == 0 {
                    return true;
                }
            }

            let cap = if readrsp {
                self.readrsp_cap(shm)
            } else {
                self.data_cap(shm)
            };
            let seg = remaining.min(cap as u64) as usize;

            let lane = lane_mut(&mut self.main, &mut self.shm, shm);
            let Ok(pkt) = lane.tx_pool.alloc() else {
                return true;
            };

            let flags = if shm { PktFlags::SHM_HDR } else { PktFlags::empty() };
            let hdr_len = if readrsp {
                ReadRspHdr::new(flags, rx_id, tx_id, seg as u32, seg_offset)
                    .encode(lane.tx_pool.get_mut(pkt).buf_mut())
            } else {
                DataHdr::new(flags, rx_id, seg as u32, seg_offset)
                    .encode(lane.tx_pool.get_mut(pkt).buf_mut())
            };
            let gen = self.tx.gen(tx_id);
            let copied = match self.tx.get_mut(tx_id) {
                Some(entry) => {
                    let buf = lane.tx_pool.get_mut(pkt).buf_mut();
                    entry.copy_next_seg(&mut buf[hdr_len..hdr_len + seg])
                }
                None => {
                    lane.tx_pool.free(pkt);
                    return false;
                }
            };
            debug_assert_eq!(copied, seg);
            let pkt_entry = lane.tx_pool.get_mut(pkt);
            pkt_entry.set_len(hdr_len + copied);
            pkt_entry.pkt_type = if readrsp {
                PktType::ReadRsp as u8
            } else {
                PktType::Data as u8
            };
            pkt_entry.addr = addr.0;
            pkt_entry.owner = Some(EntryRef {
                kind: EntryKind::Tx,
                id: tx_id,
                gen,
            });

            match self.submit_pkt(shm, pkt) {
                Ok(Submit::Sent) => {
                    if let Some(peer) = self.peers.get_mut(addr) {
                        peer.tx_credits -= 1;
                    }
                    if let Some(entry) = self.tx.get_mut(tx_id) {
                        entry.window -= 1;
                    }
                    trace!(tx_id, seg, seg_offset, "data packet sent");
                }
                Ok(Submit::Blocked) => {
                    // the formatted packet keeps its payload; retried
                    // from the queued list
                    let state = if readrsp {
                        TxState::QueuedReadRsp
                    } else {
                        TxState::QueuedDataRnr
                    };
                    self.queue_tx_pkt(tx_id, pkt, state);
                    return false;
                }
                Err(e) => {
                    warn!(tx_id, error = %e, "data packet submission failed");
                    lane_mut(&mut self.main, &mut self.shm, shm).tx_pool.free(pkt);
                    if let Some(entry) = self.release_tx_entry(tx_id) {
                        self.write_tx_err_completion(entry, EIO);
                    }
                    return false;
                }
            }
        }
    }

    /// Complete emulated reads whose paired receive finished.
    fn drain_read_pending(&mut self) {
        let n = self.read_pending.len();
        for _ in 0..n {
            let Some(id) = self.read_pending.pop_front() else {
                break;
            };
            let Some(done) = self.tx.get(id).map(|e| e.read_done) else {
                continue;
            };
            if done {
                if let Some(entry) = self.release_tx_entry(id) {
                    self.write_tx_completion(entry);
                }
            } else {
                self.read_pending.push_back(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer-fatal drain and resource flags
    // ------------------------------------------------------------------

    /// Drain every operation to a failed peer with error completions
    /// and reset the peer record.
    pub(crate) fn handle_peer_fatal(&mut self, addr: Addr, errno: i32) {
        warn!(addr = addr.0, errno, "peer failed, draining its operations");

        let tx_ids: Vec<u32> = self
            .tx
            .iter()
            .filter(|(_, e)| e.addr == addr)
            .map(|(id, _)| id)
            .collect();
        for id in tx_ids {
            if let Some(entry) = self.release_tx_entry(id) {
                self.write_tx_err_completion(entry, errno);
            }
        }

        let rx_ids: Vec<u32> = self
            .rx
            .iter()
            .filter(|(_, e)| e.addr == addr)
            .map(|(id, _)| id)
            .collect();
        for id in rx_ids {
            if let Some(entry) = self.release_rx_entry(id) {
                if !entry.flags.contains(crate::entry::EntryFlags::NO_COMPLETION) {
                    self.write_rx_err_completion(entry, errno);
                }
            }
        }

        if let Some(peer) = self.peers.get_mut(addr) {
            if let Some(mut robuf) = peer.robuf.take() {
                for pkt in robuf.drain() {
                    self.ooo_pool.free(pkt);
                }
            }
        }
        if let Some(peer) = self.peers.get_mut(addr) {
            *peer = Default::default();
        }
        self.peer_backoff.retain(|&a| a != addr);
        self.connack_pending.retain(|&a| a != addr);
    }

    fn update_rm_full(&mut self) {
        self.rm_full.set(RmFlags::TX_CQ_FULL, self.tx_cq.is_full());
        self.rm_full.set(RmFlags::RX_CQ_FULL, self.rx_cq.is_full());
    }
}

/// Payload bytes acknowledged by the delivery of a packet.
fn pkt_acked_bytes(pkt_type: u8, frame: &[u8]) -> u64 {
    if pkt_type == PktType::Rts as u8 {
        parse_rts(frame)
            .map(|v| v.payload.len() as u64)
            .unwrap_or(0)
    } else if pkt_type == PktType::Data as u8 {
        frame.len().saturating_sub(DATA_HDR_SIZE) as u64
    } else if pkt_type == PktType::ReadRsp as u8 {
        frame.len().saturating_sub(READRSP_HDR_SIZE) as u64
    } else {
        0
    }
}

/// Whether a packet type consumes a transmit credit.
fn is_data_class(pkt_type: u8) -> bool {
    pkt_type == PktType::Data as u8 || pkt_type == PktType::ReadRsp as u8
}
