//! Receive-side state machine.
//!
//! Classifies inbound frames, matches RTS packets against posted
//! receives (expected path) or stages them as unexpected, reassembles
//! large messages under CTS grants, splits multi-receive buffers, and
//! performs the target side of emulated RMA.

use tracing::{debug, error, trace, warn};

use crate::cq::{Completion, CompletionFlags, ErrCompletion};
use crate::endpoint::{lane_mut, Endpoint, RecvArgs, RmFlags, Submit};
use crate::entry::{EntryFlags, RxEntry, RxOp, RxState, TxEntry, TxOp, TxState};
use crate::error::{Error, Result, EMSGSIZE, EPROTO};
use crate::packet::{
    parse_rts, pkt_type_of, ConnAckHdr, CtsHdr, DataHdr, EorHdr, PktFlags, PktType, ReadRspHdr,
    RmaIov, CONNACK_HDR_SIZE, CTS_HDR_SIZE, DATA_HDR_SIZE, READRSP_HDR_SIZE,
};
use crate::peer::{match_tag, Addr};
use crate::pool::{EntryKind, EntryRef};
use crate::reorder::RecvWindow;

/// Owned summary of a parsed RTS, usable after the frame is released.
#[derive(Debug, Clone)]
pub(crate) struct RtsInfo {
    pub addr: Addr,
    pub shm: bool,
    pub flags: PktFlags,
    pub credit_request: u16,
    pub tx_id: u32,
    pub msg_id: u32,
    pub tag: u64,
    pub data_len: u64,
    pub cq_data: Option<u64>,
    pub rma_iov: Vec<RmaIov>,
}

/// Result of scanning the posted-receive lists for an RTS.
enum PostedMatch {
    /// Plain entry at a list position; consumed by the message.
    Plain(u32),
    /// Multi-receive master with room; a consumer is carved from it.
    Master(u32),
    None,
}

fn div_ceil_u64(n: u64, d: u64) -> u64 {
    if n == 0 {
        0
    } else {
        (n + d - 1) / d
    }
}

impl Endpoint {
    // ------------------------------------------------------------------
    // Receive posting
    // ------------------------------------------------------------------

    pub(crate) fn post_recv_common(&mut self, args: RecvArgs) -> Result<()> {
        if self.rm_full.contains(RmFlags::RX_CQ_FULL) {
            return Err(Error::Again);
        }
        if args.iov.len() > self.cfg.rx_iov_limit {
            return Err(Error::IovLimitExceeded {
                count: args.iov.len(),
                limit: self.cfg.rx_iov_limit,
            });
        }
        if args.multi_recv {
            if args.tagged {
                return Err(Error::InvalidConfig(
                    "multi-receive buffers must be untagged".into(),
                ));
            }
            if args.iov.len() != 1 {
                return Err(Error::InvalidConfig(
                    "multi-receive takes a single buffer".into(),
                ));
            }
            return self.post_multi_recv(args);
        }

        // Unexpected messages are matched first, in arrival order.
        if let Some(unexp_id) =
            self.find_unexp_match(args.addr, args.tagged, args.tag, args.ignore)
        {
            return self.match_unexpected(unexp_id, args);
        }

        let op = if args.tagged { RxOp::Tagged } else { RxOp::Msg };
        let rx_id = self.rx.alloc_with(|id| {
            let mut e = RxEntry::new(op, args.addr, args.iov, args.context);
            e.rx_id = id;
            e.tag = args.tag;
            e.ignore = args.ignore;
            e
        })?;
        if args.tagged {
            self.rx_tagged_list.push_back(rx_id);
        } else {
            self.rx_list.push_back(rx_id);
        }
        Ok(())
    }

    fn post_multi_recv(&mut self, args: RecvArgs) -> Result<()> {
        let addr = args.addr;
        let master_id = self.rx.alloc_with(|id| {
            let mut e = RxEntry::new(RxOp::Msg, addr, args.iov, args.context);
            e.rx_id = id;
            e.flags |= EntryFlags::MULTI_RECV_POSTED;
            e
        })?;
        self.rx_list.push_back(master_id);

        // Absorb unexpected messages that fit, oldest first.
        loop {
            let Some(master) = self.rx.get(master_id) else {
                break;
            };
            let remaining = master.capacity() - master.consumed;
            let unexp = self.rx_unexp_list.iter().copied().find(|&id| {
                self.rx
                    .get(id)
                    .map(|e| addr.matches(e.addr) && e.total_len <= remaining)
                    .unwrap_or(false)
            });
            let Some(unexp_id) = unexp else {
                break;
            };
            self.rx_unexp_list.retain(|&x| x != unexp_id);
            self.consume_unexp_into_master(master_id, unexp_id);
        }
        Ok(())
    }

    /// First unexpected entry matching a freshly posted receive.
    fn find_unexp_match(&mut self, addr: Addr, tagged: bool, tag: u64, ignore: u64) -> Option<u32> {
        let list = if tagged {
            &self.rx_unexp_tagged_list
        } else {
            &self.rx_unexp_list
        };
        let found = list.iter().copied().find(|&id| {
            self.rx
                .get(id)
                .map(|e| {
                    addr.matches(e.addr) && (!tagged || match_tag(tag, ignore, e.tag))
                })
                .unwrap_or(false)
        })?;
        if tagged {
            self.rx_unexp_tagged_list.retain(|&x| x != found);
        } else {
            self.rx_unexp_list.retain(|&x| x != found);
        }
        Some(found)
    }

    /// Merge a posted receive into a staged unexpected entry and replay
    /// the saved RTS against it.
    fn match_unexpected(&mut self, unexp_id: u32, args: RecvArgs) -> Result<()> {
        let (frame, addr, shm) = {
            let Some(entry) = self.rx.get_mut(unexp_id) else {
                return Err(Error::Protocol(format!("no unexpected entry {}", unexp_id)));
            };
            let Some(pkt) = entry.unexp_pkt.take() else {
                return Err(Error::Protocol(format!(
                    "unexpected entry {} lost its packet",
                    unexp_id
                )));
            };
            entry.iov = args.iov;
            entry.context = args.context;
            entry.ignore = args.ignore;
            let addr = entry.addr;
            let shm = entry.shm;
            let frame = self.unexp_pool.get(pkt).frame().to_vec();
            self.unexp_pool.free(pkt);
            (frame, addr, shm)
        };
        let view = parse_rts(&frame)?;
        let payload_off = frame.len() - view.payload.len();
        let info = rts_info_of(&view, addr, shm);
        self.process_matched_rts(unexp_id, &info, &frame[payload_off..])
    }

    /// Carve a consumer for a staged unexpected message and replay it.
    fn consume_unexp_into_master(&mut self, master_id: u32, unexp_id: u32) {
        let Some(mut unexp) = self.rx.release(unexp_id) else {
            return;
        };
        let Some(pkt) = unexp.unexp_pkt.take() else {
            return;
        };
        let frame = self.unexp_pool.get(pkt).frame().to_vec();
        self.unexp_pool.free(pkt);
        let view = match parse_rts(&frame) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "staged unexpected frame unparsable");
                return;
            }
        };
        let payload_off = frame.len() - view.payload.len();
        let info = rts_info_of(&view, unexp.addr, unexp.shm);
        match self.carve_consumer(master_id, &info) {
            Ok(consumer_id) => {
                if let Err(e) = self.process_matched_rts(consumer_id, &info, &frame[payload_off..])
                {
                    warn!(error = %e, "replay of unexpected message failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "could not carve multi-receive consumer");
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame classification
    // ------------------------------------------------------------------

    /// Stage an inbound datagram in the lane's receive pool and process it.
    pub(crate) fn handle_recv_frame(&mut self, use_shm: bool, src: Addr, data: Vec<u8>) {
        let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
        let pkt = match lane.rx_pool.alloc() {
            Ok(p) => p,
            Err(_) => {
                warn!(addr = src.0, "receive pool exhausted, dropping frame");
                return;
            }
        };
        if lane.rx_pool.get_mut(pkt).fill(&data).is_err() {
            lane.rx_pool.free(pkt);
            warn!(addr = src.0, len = data.len(), "oversized frame dropped");
            return;
        }
        lane.rx_pool.get_mut(pkt).addr = src.0;

        let frame = lane.rx_pool.get(pkt).frame().to_vec();
        lane.rx_pool.free(pkt);

        let ty = match pkt_type_of(&frame) {
            Ok(t) => t,
            Err(e) => {
                warn!(addr = src.0, error = %e, "unclassifiable frame dropped");
                return;
            }
        };
        let res = match ty {
            PktType::Rts => self.handle_rts(use_shm, src, frame),
            PktType::Cts => self.handle_cts(&frame),
            PktType::Data => self.handle_data(src, &frame),
            PktType::ReadRsp => self.handle_readrsp(&frame),
            PktType::Eor => self.handle_eor(&frame),
            PktType::ConnAck => self.handle_connack(src, &frame),
        };
        if let Err(e) = res {
            warn!(addr = src.0, pkt_type = ?ty, error = %e, "inbound frame failed");
        }
    }

    /// RTS arrival: peer init, handshake reply, reordering, delivery.
    fn handle_rts(&mut self, use_shm: bool, src: Addr, frame: Vec<u8>) -> Result<()> {
        let need_sas = self.cfg.enable_sas_ordering && {
            let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
            !lane.transport.provides_sas()
        };
        let (msg_id, has_src_addr) = {
            let view = parse_rts(&frame)?;
            (view.hdr.msg_id, !view.src_addr.is_empty())
        };

        let rx_window = self.cfg.rx_window_size;
        let tx_max = self.cfg.tx_max_credits;
        let recvwin = self.cfg.recvwin_size;
        let peer = self.peers.get_or_create(src);
        if !peer.rx_init {
            peer.rx_init = true;
            peer.rx_credits = rx_window;
            if !peer.tx_init {
                peer.tx_init = true;
                peer.tx_credits = tx_max;
            }
            if need_sas {
                peer.robuf = Some(RecvWindow::new(recvwin));
            }
        }
        if has_src_addr {
            let view = parse_rts(&frame)?;
            self.peers.get_or_create(src).name = Some(view.src_addr.to_vec());
            self.send_connack(use_shm, src);
        }

        // Reordering: a message id ahead of the expected one parks in
        // the out-of-order pool until the gap fills.
        if need_sas {
            let expected = self
                .peers
                .get(src)
                .and_then(|p| p.robuf.as_ref())
                .map(|rb| rb.is_expected(msg_id));
            if expected == Some(false) {
                let pkt = match self.ooo_pool.alloc() {
                    Ok(p) => p,
                    Err(_) => {
                        warn!(addr = src.0, msg_id, "out-of-order pool exhausted, dropping");
                        return Ok(());
                    }
                };
                self.ooo_pool.get_mut(pkt).fill(&frame)?;
                let insert = self
                    .peers
                    .get_mut(src)
                    .and_then(|p| p.robuf.as_mut())
                    .map(|rb| rb.insert(msg_id, pkt))
                    .unwrap_or(Err(Error::Protocol("reorder window missing".into())));
                if let Err(e) = insert {
                    // A message id beyond the window (or a duplicate) is
                    // a protocol violation; the packet is dropped.
                    self.ooo_pool.free(pkt);
                    warn!(addr = src.0, msg_id, error = %e, "reorder insert failed");
                }
                return Ok(());
            }
        }

        self.deliver_rts(src, use_shm, &frame)?;
        if need_sas {
            if let Some(rb) = self.peers.get_mut(src).and_then(|p| p.robuf.as_mut()) {
                rb.advance();
            }
            self.drain_reorder(src, use_shm);
        }
        Ok(())
    }

    /// Release contiguously buffered successors after an in-order delivery.
    fn drain_reorder(&mut self, src: Addr, use_shm: bool) {
        loop {
            let Some(pkt) = self
                .peers
                .get_mut(src)
                .and_then(|p| p.robuf.as_mut())
                .and_then(|rb| rb.take_expected())
            else {
                return;
            };
            let frame = self.ooo_pool.get(pkt).frame().to_vec();
            self.ooo_pool.free(pkt);
            if let Err(e) = self.deliver_rts(src, use_shm, &frame) {
                warn!(addr = src.0, error = %e, "buffered rts delivery failed");
            }
            if let Some(rb) = self.peers.get_mut(src).and_then(|p| p.robuf.as_mut()) {
                rb.advance();
            }
        }
    }

    /// Deliver one in-order RTS: classify by operation and match.
    fn deliver_rts(&mut self, src: Addr, use_shm: bool, frame: &[u8]) -> Result<()> {
        let view = parse_rts(frame)?;
        let payload_off = frame.len() - view.payload.len();
        let info = rts_info_of(&view, src, use_shm);
        let payload = &frame[payload_off..];

        if info.flags.contains(PktFlags::READ_REQ) {
            return self.handle_read_req(&info);
        }
        if info.flags.contains(PktFlags::WRITE) {
            return self.handle_write_rts(&info, payload);
        }

        match self.match_posted(&info) {
            PostedMatch::Plain(rx_id) => {
                self.rx_list.retain(|&x| x != rx_id);
                self.rx_tagged_list.retain(|&x| x != rx_id);
                self.process_matched_rts(rx_id, &info, payload)
            }
            PostedMatch::Master(master_id) => match self.carve_consumer(master_id, &info) {
                Ok(consumer_id) => self.process_matched_rts(consumer_id, &info, payload),
                Err(_) => {
                    // no consumer slot available; keep the message
                    self.stage_unexpected(&info, frame);
                    Ok(())
                }
            },
            PostedMatch::None => {
                self.stage_unexpected(&info, frame);
                Ok(())
            }
        }
    }

    /// Scan the posted list for the first matching receive, FIFO.
    fn match_posted(&self, info: &RtsInfo) -> PostedMatch {
        let tagged = info.flags.contains(PktFlags::TAGGED);
        let list = if tagged {
            &self.rx_tagged_list
        } else {
            &self.rx_list
        };
        for &id in list.iter() {
            let Some(e) = self.rx.get(id) else {
                continue;
            };
            if e.state != RxState::Init {
                continue;
            }
            if !e.addr.matches(info.addr) {
                continue;
            }
            if tagged && !match_tag(e.tag, e.ignore, info.tag) {
                continue;
            }
            if e.flags.contains(EntryFlags::MULTI_RECV_POSTED) {
                let remaining = e.capacity() - e.consumed;
                if info.data_len > remaining {
                    continue;
                }
                return PostedMatch::Master(id);
            }
            return PostedMatch::Plain(id);
        }
        PostedMatch::None
    }

    /// Create a consumer entry over the next `data_len` bytes of a
    /// multi-receive master buffer.
    fn carve_consumer(&mut self, master_id: u32, info: &RtsInfo) -> Result<u32> {
        let (offset, context) = {
            let master = self
                .rx
                .get_mut(master_id)
                .ok_or_else(|| Error::Protocol(format!("no master entry {}", master_id)))?;
            let offset = master.consumed;
            master.consumed += info.data_len;
            (offset, master.context)
        };
        let addr = info.addr;
        let len = info.data_len as usize;
        let res = self.rx.alloc_with(|id| {
            let mut e = RxEntry::new(RxOp::Msg, addr, vec![vec![0u8; len]], context);
            e.rx_id = id;
            e.flags |= EntryFlags::MULTI_RECV_CONSUMER;
            e.master_id = Some(master_id);
            e.master_offset = offset;
            e
        });
        match res {
            Ok(id) => {
                if let Some(master) = self.rx.get_mut(master_id) {
                    master.consumers.push(id);
                }
                Ok(id)
            }
            Err(e) => {
                // roll the carve back; the message goes unexpected
                if let Some(master) = self.rx.get_mut(master_id) {
                    master.consumed = offset;
                }
                Err(e)
            }
        }
    }

    /// Common processing once an RTS has a receive entry: copy the
    /// inline payload, complete small messages, start streaming for
    /// large ones.
    fn process_matched_rts(&mut self, rx_id: u32, info: &RtsInfo, payload: &[u8]) -> Result<()> {
        {
            let entry = self
                .rx
                .get_mut(rx_id)
                .ok_or_else(|| Error::Protocol(format!("no rx entry {}", rx_id)))?;
            entry.addr = info.addr;
            entry.tx_id = info.tx_id;
            entry.msg_id = info.msg_id;
            if info.flags.contains(PktFlags::TAGGED) {
                entry.tag = info.tag;
            }
            entry.cq_data = info.cq_data;
            entry.total_len = info.data_len;
            entry.credit_request = info.credit_request;
            entry.shm = info.shm;
            entry.state = RxState::Matched;
            if !payload.is_empty() {
                entry.write_at(0, payload);
            }
            trace!(
                rx_id,
                tx_id = info.tx_id,
                msg_id = info.msg_id,
                total_len = info.data_len,
                inline = payload.len(),
                "rts matched"
            );
            if !entry.is_complete() {
                entry.state = RxState::Recv;
            }
        }
        let complete = self
            .rx
            .get(rx_id)
            .map(|e| e.is_complete())
            .unwrap_or(false);
        if complete {
            self.finalize_rx(rx_id);
            Ok(())
        } else {
            self.post_cts(rx_id)
        }
    }

    /// Stage an RTS nothing matched; a later receive post replays it.
    fn stage_unexpected(&mut self, info: &RtsInfo, frame: &[u8]) {
        let pkt = match self.unexp_pool.alloc() {
            Ok(p) => p,
            Err(_) => {
                error!(addr = info.addr.0, "unexpected pool exhausted, message dropped");
                return;
            }
        };
        if self.unexp_pool.get_mut(pkt).fill(frame).is_err() {
            self.unexp_pool.free(pkt);
            error!(addr = info.addr.0, "unexpected frame exceeds staging pool entry");
            return;
        }
        let tagged = info.flags.contains(PktFlags::TAGGED);
        let op = if tagged { RxOp::Tagged } else { RxOp::Msg };
        let info = info.clone();
        let res = self.rx.alloc_with(|id| {
            let mut e = RxEntry::new(op, info.addr, Vec::new(), 0);
            e.rx_id = id;
            e.tx_id = info.tx_id;
            e.msg_id = info.msg_id;
            e.tag = info.tag;
            e.total_len = info.data_len;
            e.credit_request = info.credit_request;
            e.cq_data = info.cq_data;
            e.shm = info.shm;
            e.state = RxState::Unexp;
            e.unexp_pkt = Some(pkt);
            e
        });
        match res {
            Ok(id) => {
                if tagged {
                    self.rx_unexp_tagged_list.push_back(id);
                } else {
                    self.rx_unexp_list.push_back(id);
                }
                debug!(addr = info.addr.0, msg_id = info.msg_id, "message staged unexpected");
            }
            Err(_) => {
                self.unexp_pool.free(pkt);
                error!(addr = info.addr.0, "receive arena exhausted, unexpected message dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // CTS emission and credit grants
    // ------------------------------------------------------------------

    /// Data-packet payload capacity on a lane.
    pub(crate) fn data_cap(&self, shm: bool) -> usize {
        let mtu = if shm {
            self.shm.as_ref().map(|l| l.mtu).unwrap_or(self.main.mtu)
        } else {
            self.main.mtu
        };
        mtu - DATA_HDR_SIZE
    }

    /// Issue (or re-issue) a CTS granting data-packet credits.
    ///
    /// A receiver with no credits to grant leaves the entry flagged; the
    /// progress engine retries once credits return.
    pub(crate) fn post_cts(&mut self, rx_id: u32) -> Result<()> {
        let (addr, shm, tx_id, remaining_pkts) = {
            let entry = self
                .rx
                .get(rx_id)
                .ok_or_else(|| Error::Protocol(format!("no rx entry {}", rx_id)))?;
            let cap = self.data_cap(entry.shm) as u64;
            let ungranted = (entry.total_len - entry.bytes_done)
                .saturating_sub(entry.window * cap);
            (
                entry.addr,
                entry.shm,
                entry.tx_id,
                div_ceil_u64(ungranted, cap),
            )
        };
        if remaining_pkts == 0 {
            return Ok(());
        }

        let (credit_request, rx_credits) = {
            let entry = self.rx.get(rx_id).ok_or(Error::Cancelled)?;
            let peer = self.peers.get_or_create(addr);
            (entry.credit_request as u64, peer.rx_credits as u64)
        };
        let grant = remaining_pkts.min(credit_request.max(1)).min(rx_credits);
        if grant == 0 {
            let entry = self.rx.get_mut(rx_id).ok_or(Error::Cancelled)?;
            if !entry.pending_cts {
                entry.pending_cts = true;
                self.rx_queued.push_back(rx_id);
            }
            debug!(rx_id, "cts deferred, no receive credits");
            return Ok(());
        }

        let lane = lane_mut(&mut self.main, &mut self.shm, shm);
        let pkt = match lane.tx_pool.alloc() {
            Ok(p) => p,
            Err(_) => {
                let entry = self.rx.get_mut(rx_id).ok_or(Error::Cancelled)?;
                if !entry.pending_cts {
                    entry.pending_cts = true;
                    self.rx_queued.push_back(rx_id);
                }
                return Ok(());
            }
        };

        {
            let peer = self.peers.get_or_create(addr);
            peer.rx_credits -= grant as u16;
        }
        let gen = self.rx.gen(rx_id);
        {
            let entry = self.rx.get_mut(rx_id).ok_or(Error::Cancelled)?;
            entry.credit_cts = entry.credit_cts.saturating_add(grant as u16);
            entry.window += grant;
            entry.pending_cts = false;
        }

        let flags = if shm { PktFlags::SHM_HDR } else { PktFlags::empty() };
        let hdr = CtsHdr::new(flags, tx_id, rx_id, grant);
        let lane = lane_mut(&mut self.main, &mut self.shm, shm);
        let pkt_entry = lane.tx_pool.get_mut(pkt);
        let len = hdr.encode(pkt_entry.buf_mut());
        pkt_entry.set_len(len);
        debug_assert_eq!(len, CTS_HDR_SIZE);
        pkt_entry.pkt_type = PktType::Cts as u8;
        pkt_entry.addr = addr.0;
        pkt_entry.owner = Some(EntryRef {
            kind: EntryKind::Rx,
            id: rx_id,
            gen,
        });

        trace!(rx_id, tx_id, grant, "cts issued");
        match self.submit_pkt(shm, pkt)? {
            Submit::Sent => Ok(()),
            Submit::Blocked => {
                let in_backoff = self
                    .peers
                    .get(addr)
                    .map(|p| p.flags.contains(crate::peer::PeerFlags::IN_BACKOFF))
                    .unwrap_or(false);
                let state = if in_backoff {
                    RxState::QueuedCtsRnr
                } else {
                    RxState::QueuedCtrl
                };
                self.queue_rx_pkt(rx_id, pkt, state);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Data, read-response, EOR, CONNACK arrivals
    // ------------------------------------------------------------------

    /// Sender-side CTS arrival: adopt the grant and resume streaming.
    fn handle_cts(&mut self, frame: &[u8]) -> Result<()> {
        let hdr = CtsHdr::from_bytes(frame)?;
        let window = { hdr.window };
        let hdr_tx_id = { hdr.tx_id };
        let hdr_rx_id = { hdr.rx_id };
        let Some(entry) = self.tx.get_mut(hdr_tx_id) else {
            debug!(tx_id = hdr_tx_id, "cts for released entry dropped");
            return Ok(());
        };
        entry.rx_id = hdr_rx_id;
        entry.credit_allocated = entry.credit_allocated.saturating_add(window as u16);
        let was_idle = entry.window == 0;
        entry.window += window;
        if entry.state == TxState::Rts {
            entry.state = TxState::Send;
        }
        let resume = entry.state == TxState::Send
            && was_idle
            && entry.bytes_sent < entry.total_len;
        let tx_id = entry.tx_id;
        trace!(tx_id, window, "cts received");
        if resume {
            self.tx_pending.push_back(tx_id);
        }
        Ok(())
    }

    /// Data packet arrival: refill the addressed receive entry.
    fn handle_data(&mut self, src: Addr, frame: &[u8]) -> Result<()> {
        let hdr = DataHdr::from_bytes(frame)?;
        let seg_size = { hdr.seg_size } as usize;
        let seg_offset = { hdr.seg_offset };
        if frame.len() < DATA_HDR_SIZE + seg_size {
            return Err(Error::BufferTooSmall {
                required: DATA_HDR_SIZE + seg_size,
                available: frame.len(),
            });
        }
        let payload = &frame[DATA_HDR_SIZE..DATA_HDR_SIZE + seg_size];
        let rx_id = { hdr.rx_id };

        let Some((state, entry_addr, op)) = self.rx.get(rx_id).map(|e| (e.state, e.addr, e.op))
        else {
            debug!(rx_id, "data for released entry dropped");
            return Ok(());
        };
        // Data is valid only once the CTS went out.
        match state {
            RxState::Recv | RxState::QueuedCtrl | RxState::QueuedCtsRnr => {}
            state => {
                self.fail_rx_entry(rx_id, EPROTO);
                return Err(Error::Protocol(format!(
                    "data packet for rx entry {} in state {:?}",
                    rx_id, state
                )));
            }
        }
        if entry_addr != src {
            self.fail_rx_entry(rx_id, EPROTO);
            return Err(Error::Protocol(format!(
                "data packet for rx entry {} from wrong peer {}",
                rx_id, src.0
            )));
        }

        let rma_iov = if op == RxOp::Write {
            self.rx
                .get(rx_id)
                .map(|e| e.rma_iov.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        if let Some(entry) = self.rx.get_mut(rx_id) {
            entry.window = entry.window.saturating_sub(1);
        }
        self.peers.get_or_create(src).rx_credits += 1;

        if op == RxOp::Write {
            self.rma_write(&rma_iov, seg_offset, payload)?;
            if let Some(entry) = self.rx.get_mut(rx_id) {
                entry.bytes_done += seg_size as u64;
            }
        } else if let Some(entry) = self.rx.get_mut(rx_id) {
            entry.write_at(seg_offset, payload);
        }

        let Some((complete, exhausted)) = self
            .rx
            .get(rx_id)
            .map(|e| (e.is_complete(), e.window == 0))
        else {
            return Ok(());
        };
        if complete {
            self.finalize_rx(rx_id);
        } else if exhausted {
            // Grant more credits as they returned with the data.
            self.post_cts(rx_id)?;
        }
        Ok(())
    }

    /// Initiator-side read-response arrival.
    fn handle_readrsp(&mut self, frame: &[u8]) -> Result<()> {
        let hdr = ReadRspHdr::from_bytes(frame)?;
        let seg_size = { hdr.seg_size } as usize;
        let seg_offset = { hdr.seg_offset };
        if frame.len() < READRSP_HDR_SIZE + seg_size {
            return Err(Error::BufferTooSmall {
                required: READRSP_HDR_SIZE + seg_size,
                available: frame.len(),
            });
        }
        let payload = &frame[READRSP_HDR_SIZE..READRSP_HDR_SIZE + seg_size];
        let hdr_rx_id = { hdr.rx_id };
        let hdr_tx_id = { hdr.tx_id };

        // The response addresses the initiator's transmit slot; the
        // paired receive entry holds the destination buffer.
        let Some(tx_entry) = self.tx.get(hdr_rx_id) else {
            debug!(tx_id = hdr_rx_id, "read response for released entry dropped");
            return Ok(());
        };
        if tx_entry.op != TxOp::RmaRead {
            return Err(Error::Protocol(format!(
                "read response addressed at non-read entry {}",
                hdr_rx_id
            )));
        }
        let rx_id = tx_entry.rma_loc_rx_id;

        let Some(paired) = self.rx.get(rx_id).map(|e| e.paired_tx_id) else {
            debug!(rx_id, "read destination released, response dropped");
            return Ok(());
        };
        if paired != hdr_rx_id {
            self.fail_rx_entry(rx_id, EPROTO);
            return Err(Error::Protocol(format!(
                "read response pairing mismatch on rx entry {}",
                rx_id
            )));
        }
        let complete = {
            let Some(entry) = self.rx.get_mut(rx_id) else {
                return Ok(());
            };
            entry.readrsp_tx_id = hdr_tx_id;
            if entry.state == RxState::WaitReadFinish {
                entry.state = RxState::Recv;
            }
            entry.write_at(seg_offset, payload);
            entry.is_complete()
        };
        if complete {
            self.finalize_rx(rx_id);
        }
        Ok(())
    }

    /// Responder-side end-of-read acknowledgement.
    fn handle_eor(&mut self, frame: &[u8]) -> Result<()> {
        let hdr = EorHdr::from_bytes(frame)?;
        let tx_id = { hdr.tx_id };
        let Some(entry) = self.tx.get(tx_id) else {
            debug!(tx_id, "eor for released entry dropped");
            return Ok(());
        };
        match entry.state {
            TxState::SentReadRsp | TxState::QueuedReadRsp => {}
            state => {
                return Err(Error::Protocol(format!(
                    "eor for tx entry {} in state {:?}",
                    tx_id, state
                )));
            }
        }
        trace!(tx_id, "read response acknowledged");
        self.release_tx_entry(tx_id);
        Ok(())
    }

    /// CM acknowledgement: stop piggybacking the source address.
    fn handle_connack(&mut self, src: Addr, frame: &[u8]) -> Result<()> {
        ConnAckHdr::from_bytes(frame)?;
        let peer = self.peers.get_or_create(src);
        peer.state = crate::peer::PeerState::Acked;
        trace!(addr = src.0, "peer acked");
        Ok(())
    }

    /// Reply to a handshake RTS; retried by the progress engine when the
    /// transport is busy.
    pub(crate) fn send_connack(&mut self, use_shm: bool, addr: Addr) {
        let mut buf = [0u8; CONNACK_HDR_SIZE];
        let len = ConnAckHdr::new().encode(&mut buf);
        let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
        match lane.transport.inject(addr, &buf[..len]) {
            Ok(()) => {
                self.peers.get_or_create(addr).conn_ack_pending = false;
            }
            Err(_) => {
                let peer = self.peers.get_or_create(addr);
                if !peer.conn_ack_pending {
                    peer.conn_ack_pending = true;
                    self.connack_pending.push(addr);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Emulated RMA target helpers
    // ------------------------------------------------------------------

    /// Check that every descriptor names a registered window.
    fn validate_rma(&self, iovs: &[RmaIov]) -> Result<()> {
        for iov in iovs {
            let key = { iov.key };
            let offset = { iov.offset };
            let len = { iov.len };
            let region = self
                .regions
                .get(key as usize)
                .ok_or(Error::UnknownRegion(key))?;
            if (offset + len) as usize > region.len() {
                return Err(Error::Protocol(format!(
                    "rma window [{}, {}) outside region {} of {} bytes",
                    offset,
                    offset + len,
                    key,
                    region.len()
                )));
            }
        }
        Ok(())
    }

    /// Scatter payload bytes at a message offset across the windows.
    fn rma_write(&mut self, iovs: &[RmaIov], msg_offset: u64, data: &[u8]) -> Result<()> {
        let mut rem = data;
        let mut pos = msg_offset;
        let mut win_base = 0u64;
        for iov in iovs {
            if rem.is_empty() {
                break;
            }
            let len = { iov.len };
            let win_end = win_base + len;
            if pos < win_end {
                let in_win = pos - win_base;
                let key = { iov.key };
                let offset = { iov.offset };
                let region = self
                    .regions
                    .get_mut(key as usize)
                    .ok_or(Error::UnknownRegion(key))?;
                let start = (offset + in_win) as usize;
                let n = rem.len().min((len - in_win) as usize);
                region[start..start + n].copy_from_slice(&rem[..n]);
                rem = &rem[n..];
                pos += n as u64;
            }
            win_base = win_end;
        }
        if !rem.is_empty() {
            return Err(Error::Protocol(
                "write payload extends beyond the rma windows".into(),
            ));
        }
        Ok(())
    }

    /// Gather the bytes named by read descriptors.
    fn rma_read_regions(&self, iovs: &[RmaIov]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for iov in iovs {
            let key = { iov.key };
            let offset = { iov.offset } as usize;
            let len = { iov.len } as usize;
            let region = self
                .regions
                .get(key as usize)
                .ok_or(Error::UnknownRegion(key))?;
            out.extend_from_slice(&region[offset..offset + len]);
        }
        Ok(out)
    }

    /// Target side of an emulated write: no matching, payload lands in
    /// the named windows.
    fn handle_write_rts(&mut self, info: &RtsInfo, payload: &[u8]) -> Result<()> {
        self.validate_rma(&info.rma_iov)?;
        let window: u64 = info.rma_iov.iter().map(|r| r.len).sum();
        if info.data_len > window {
            return Err(Error::Protocol(format!(
                "write of {} bytes into {} byte window",
                info.data_len, window
            )));
        }

        let info_c = info.clone();
        let rx_id = self.rx.alloc_with(|id| {
            let mut e = RxEntry::new(RxOp::Write, info_c.addr, Vec::new(), 0);
            e.rx_id = id;
            e.tx_id = info_c.tx_id;
            e.msg_id = info_c.msg_id;
            e.total_len = info_c.data_len;
            e.credit_request = info_c.credit_request;
            e.cq_data = info_c.cq_data;
            e.rma_iov = info_c.rma_iov;
            e.shm = info_c.shm;
            e.state = RxState::Matched;
            e.flags |= EntryFlags::NO_COMPLETION;
            e
        })?;

        if !payload.is_empty() {
            let rma_iov = info.rma_iov.clone();
            self.rma_write(&rma_iov, 0, payload)?;
            if let Some(entry) = self.rx.get_mut(rx_id) {
                entry.bytes_done += payload.len() as u64;
            }
        }
        let complete = self
            .rx
            .get(rx_id)
            .map(|e| e.is_complete())
            .unwrap_or(true);
        if complete {
            self.finalize_rx(rx_id);
            Ok(())
        } else {
            if let Some(entry) = self.rx.get_mut(rx_id) {
                entry.state = RxState::Recv;
            }
            self.post_cts(rx_id)
        }
    }

    /// Responder side of an emulated read: allocate a response entry
    /// streaming the named bytes back at the initiator.
    fn handle_read_req(&mut self, info: &RtsInfo) -> Result<()> {
        self.validate_rma(&info.rma_iov)?;
        let data = self.rma_read_regions(&info.rma_iov)?;
        if data.len() as u64 != info.data_len {
            return Err(Error::Protocol(format!(
                "read request length {} does not match windows ({})",
                info.data_len,
                data.len()
            )));
        }
        let addr = info.addr;
        let initiator_tx = info.tx_id;
        let shm = info.shm;
        let cap = self.readrsp_cap(shm) as u64;
        let total = info.data_len;
        let tx_id = self.tx.alloc_with(|id| {
            let mut e = TxEntry::new(TxOp::RmaRead, addr, vec![data], 0);
            e.tx_id = id;
            // the response addresses the initiator's transmit slot
            e.rx_id = initiator_tx;
            e.flags |= EntryFlags::NO_COMPLETION;
            e.state = TxState::SentReadRsp;
            e.window = div_ceil_u64(total, cap).max(1);
            e.shm = shm;
            e
        })?;
        self.tx_pending.push_back(tx_id);
        trace!(tx_id, initiator_tx, total, "read response scheduled");
        Ok(())
    }

    /// Read-response payload capacity on a lane.
    pub(crate) fn readrsp_cap(&self, shm: bool) -> usize {
        let mtu = if shm {
            self.shm.as_ref().map(|l| l.mtu).unwrap_or(self.main.mtu)
        } else {
            self.main.mtu
        };
        (mtu - READRSP_HDR_SIZE).min(self.cfg.efa_read_segment_size)
    }

    // ------------------------------------------------------------------
    // Completion paths
    // ------------------------------------------------------------------

    /// Route a finished receive entry to its completion path.
    pub(crate) fn finalize_rx(&mut self, rx_id: u32) {
        let Some(op) = self.rx.get(rx_id).map(|e| e.op) else {
            return;
        };
        if op == RxOp::Read {
            self.finish_read_dest(rx_id);
            return;
        }
        let Some(entry) = self.release_rx_entry(rx_id) else {
            return;
        };
        if entry.flags.contains(EntryFlags::MULTI_RECV_CONSUMER) {
            self.finish_consumer(entry);
            return;
        }
        if op == RxOp::Write {
            if entry.cq_data.is_some() {
                self.write_rx_cq(Completion {
                    context: 0,
                    flags: CompletionFlags::REMOTE_WRITE
                        | CompletionFlags::RMA
                        | CompletionFlags::REMOTE_CQ_DATA,
                    len: entry.total_len,
                    buf: Vec::new(),
                    data: entry.cq_data.unwrap_or(0),
                    tag: 0,
                });
            }
            return;
        }
        self.write_rx_completion(entry);
    }

    /// Completion of the destination side of an emulated read.
    ///
    /// Reads over shared memory acknowledge the responder with an EOR;
    /// the entry stays alive until the acknowledgement leaves.
    fn finish_read_dest(&mut self, rx_id: u32) {
        let (shm, paired_tx) = {
            let Some(entry) = self.rx.get(rx_id) else {
                return;
            };
            (entry.shm, entry.paired_tx_id)
        };
        // hand the destination buffer to the waiting transmit entry
        let buf = self
            .rx
            .get_mut(rx_id)
            .map(|e| std::mem::take(&mut e.iov))
            .unwrap_or_default();
        if let Some(tx) = self.tx.get_mut(paired_tx) {
            tx.read_done = true;
            tx.iov = buf;
        }
        if shm {
            self.send_eor(rx_id);
        } else {
            self.release_rx_entry(rx_id);
        }
    }

    /// Send the end-of-read acknowledgement for a shm read.
    pub(crate) fn send_eor(&mut self, rx_id: u32) {
        let (addr, responder_tx, paired_tx) = {
            let Some(entry) = self.rx.get(rx_id) else {
                return;
            };
            (entry.addr, entry.readrsp_tx_id, entry.paired_tx_id)
        };
        let lane = lane_mut(&mut self.main, &mut self.shm, true);
        let pkt = match lane.tx_pool.alloc() {
            Ok(p) => p,
            Err(_) => {
                if let Some(entry) = self.rx.get_mut(rx_id) {
                    entry.state = RxState::QueuedEor;
                    self.rx_queued.push_back(rx_id);
                }
                return;
            }
        };
        let gen = self.rx.gen(rx_id);
        let hdr = EorHdr::new(PktFlags::SHM_HDR, responder_tx, paired_tx);
        let lane = lane_mut(&mut self.main, &mut self.shm, true);
        let pkt_entry = lane.tx_pool.get_mut(pkt);
        let len = hdr.encode(pkt_entry.buf_mut());
        pkt_entry.set_len(len);
        pkt_entry.pkt_type = PktType::Eor as u8;
        pkt_entry.addr = addr.0;
        pkt_entry.owner = Some(EntryRef {
            kind: EntryKind::Rx,
            id: rx_id,
            gen,
        });
        match self.submit_pkt(true, pkt) {
            Ok(Submit::Sent) => {
                self.release_rx_entry(rx_id);
            }
            Ok(Submit::Blocked) => {
                self.queue_rx_pkt(rx_id, pkt, RxState::QueuedEor);
            }
            Err(e) => {
                warn!(rx_id, error = %e, "eor submission failed");
                lane_mut(&mut self.main, &mut self.shm, true).tx_pool.free(pkt);
                self.release_rx_entry(rx_id);
            }
        }
    }

    /// Completion of a multi-receive consumer: copy its bytes into the
    /// master buffer and maybe release the master.
    fn finish_consumer(&mut self, entry: RxEntry) {
        let master_id = entry.master_id.unwrap_or(u32::MAX);
        if let Some(master) = self.rx.get_mut(master_id) {
            let off = entry.master_offset as usize;
            if let (Some(master_buf), Some(data)) = (master.iov.first_mut(), entry.iov.first()) {
                let n = data.len().min(master_buf.len().saturating_sub(off));
                master_buf[off..off + n].copy_from_slice(&data[..n]);
            }
            master.consumers.retain(|&c| c != entry.rx_id);
        }

        let mut flags = CompletionFlags::RECV;
        if entry.cq_data.is_some() {
            flags |= CompletionFlags::REMOTE_CQ_DATA;
        }
        self.write_rx_cq(Completion {
            context: entry.context,
            flags,
            len: entry.total_len,
            buf: entry.iov,
            data: entry.cq_data.unwrap_or(0),
            tag: entry.tag,
        });
        self.check_master_release(master_id);
    }

    /// Release a multi-receive master once its remaining space is below
    /// the threshold and every consumer has completed.
    pub(crate) fn check_master_release(&mut self, master_id: u32) {
        let release = {
            let Some(master) = self.rx.get(master_id) else {
                return;
            };
            let remaining = master.capacity() - master.consumed;
            master.flags.contains(EntryFlags::MULTI_RECV_POSTED)
                && master.consumers.is_empty()
                && remaining < self.cfg.min_multi_recv_size as u64
        };
        if !release {
            return;
        }
        self.rx_list.retain(|&x| x != master_id);
        let Some(master) = self.release_rx_entry(master_id) else {
            return;
        };
        self.write_rx_cq(Completion {
            context: master.context,
            flags: CompletionFlags::RECV | CompletionFlags::MULTI_RECV,
            len: master.consumed,
            buf: master.iov,
            data: 0,
            tag: 0,
        });
    }

    /// Ordinary receive completion, or a truncation error completion.
    pub(crate) fn write_rx_completion(&mut self, entry: RxEntry) {
        let mut flags = CompletionFlags::RECV;
        if entry.op == RxOp::Tagged {
            flags |= CompletionFlags::TAGGED;
        }
        if entry.cq_data.is_some() {
            flags |= CompletionFlags::REMOTE_CQ_DATA;
        }
        if entry.truncated {
            let len = entry.capacity();
            self.write_rx_cq_err(ErrCompletion {
                completion: Completion {
                    context: entry.context,
                    flags,
                    len,
                    buf: entry.iov,
                    data: entry.cq_data.unwrap_or(0),
                    tag: entry.tag,
                },
                err: EMSGSIZE,
            });
            return;
        }
        self.write_rx_cq(Completion {
            context: entry.context,
            flags,
            len: entry.total_len,
            buf: entry.iov,
            data: entry.cq_data.unwrap_or(0),
            tag: entry.tag,
        });
    }

    /// Error completion for a receive entry released early.
    pub(crate) fn write_rx_err_completion(&mut self, entry: RxEntry, errno: i32) {
        let mut flags = CompletionFlags::RECV;
        if entry.op == RxOp::Tagged {
            flags |= CompletionFlags::TAGGED;
        }
        if entry.flags.contains(EntryFlags::MULTI_RECV_POSTED) {
            flags |= CompletionFlags::MULTI_RECV;
        }
        let len = if entry.flags.contains(EntryFlags::MULTI_RECV_POSTED) {
            entry.consumed
        } else {
            entry.bytes_done.min(entry.capacity())
        };
        self.write_rx_cq_err(ErrCompletion {
            completion: Completion {
                context: entry.context,
                flags,
                len,
                buf: entry.iov,
                data: 0,
                tag: entry.tag,
            },
            err: errno,
        });
    }

    /// Transmit completion.
    pub(crate) fn write_tx_completion(&mut self, entry: TxEntry) {
        if entry.flags.contains(EntryFlags::NO_COMPLETION) {
            return;
        }
        let mut flags = CompletionFlags::SEND;
        let mut tag = entry.tag;
        match entry.op {
            TxOp::TaggedSend => flags |= CompletionFlags::TAGGED,
            TxOp::RmaWrite => {
                flags = CompletionFlags::RMA | CompletionFlags::WRITE;
                tag = 0;
            }
            TxOp::RmaRead => {
                flags = CompletionFlags::RMA | CompletionFlags::READ;
                tag = 0;
            }
            TxOp::MsgSend => {}
        }
        self.write_tx_cq(Completion {
            context: entry.context,
            flags,
            len: entry.total_len,
            buf: entry.iov,
            data: 0,
            tag,
        });
    }

    /// Error completion for a transmit entry.
    pub(crate) fn write_tx_err_completion(&mut self, entry: TxEntry, errno: i32) {
        if entry.flags.contains(EntryFlags::NO_COMPLETION) {
            return;
        }
        let flags = match entry.op {
            TxOp::MsgSend => CompletionFlags::SEND,
            TxOp::TaggedSend => CompletionFlags::SEND | CompletionFlags::TAGGED,
            TxOp::RmaWrite => CompletionFlags::RMA | CompletionFlags::WRITE,
            TxOp::RmaRead => CompletionFlags::RMA | CompletionFlags::READ,
        };
        let tag = entry.tag;
        self.write_tx_cq_err(ErrCompletion {
            completion: Completion {
                context: entry.context,
                flags,
                len: entry.bytes_acked,
                buf: entry.iov,
                data: 0,
                tag,
            },
            err: errno,
        });
    }

    /// Fail a receive entry with a per-entry error completion.
    pub(crate) fn fail_rx_entry(&mut self, rx_id: u32, errno: i32) {
        if let Some(entry) = self.release_rx_entry(rx_id) {
            if !entry.flags.contains(EntryFlags::NO_COMPLETION) {
                self.write_rx_err_completion(entry, errno);
            }
        }
    }

    // A completion that cannot be written leaves the application blind;
    // per the error contract this is unrecoverable.
    pub(crate) fn write_rx_cq(&mut self, completion: Completion) {
        if self.rx_cq.write(completion).is_err() {
            error!("receive completion queue overflow");
            std::process::abort();
        }
    }

    pub(crate) fn write_rx_cq_err(&mut self, err: ErrCompletion) {
        if self.rx_cq.write_err(err).is_err() {
            error!("receive completion queue overflow");
            std::process::abort();
        }
    }

    pub(crate) fn write_tx_cq(&mut self, completion: Completion) {
        if self.tx_cq.write(completion).is_err() {
            error!("transmit completion queue overflow");
            std::process::abort();
        }
    }

    pub(crate) fn write_tx_cq_err(&mut self, err: ErrCompletion) {
        if self.tx_cq.write_err(err).is_err() {
            error!("transmit completion queue overflow");
            std::process::abort();
        }
    }

    // ------------------------------------------------------------------
    // Entry release
    // ------------------------------------------------------------------

    /// Release a transmit entry, returning any queued packets to the
    /// pool and dropping the slot from every engine list.
    pub(crate) fn release_tx_entry(&mut self, tx_id: u32) -> Option<TxEntry> {
        let mut entry = self.tx.release(tx_id)?;
        let shm = entry.shm;
        let lane = lane_mut(&mut self.main, &mut self.shm, shm);
        for pkt in entry.queued_pkts.drain(..) {
            lane.tx_pool.free(pkt);
        }
        self.tx_queued.retain(|&x| x != tx_id);
        self.tx_pending.retain(|&x| x != tx_id);
        self.read_pending.retain(|&x| x != tx_id);
        entry.state = TxState::Free;
        Some(entry)
    }

    /// Release a receive entry, returning staged packets to their pools
    /// and dropping the slot from every engine list.
    pub(crate) fn release_rx_entry(&mut self, rx_id: u32) -> Option<RxEntry> {
        let mut entry = self.rx.release(rx_id)?;
        let shm = entry.shm;
        let lane = lane_mut(&mut self.main, &mut self.shm, shm);
        for pkt in entry.queued_pkts.drain(..) {
            lane.tx_pool.free(pkt);
        }
        if let Some(pkt) = entry.unexp_pkt.take() {
            self.unexp_pool.free(pkt);
        }
        self.rx_queued.retain(|&x| x != rx_id);
        self.rx_list.retain(|&x| x != rx_id);
        self.rx_tagged_list.retain(|&x| x != rx_id);
        self.rx_unexp_list.retain(|&x| x != rx_id);
        self.rx_unexp_tagged_list.retain(|&x| x != rx_id);
        entry.state = RxState::Free;
        Some(entry)
    }
}

/// Build the owned RTS summary from a parsed view.
fn rts_info_of(view: &crate::packet::RtsView<'_>, addr: Addr, shm: bool) -> RtsInfo {
    RtsInfo {
        addr,
        shm,
        flags: view.hdr.flags(),
        credit_request: { view.hdr.credit_request },
        tx_id: { view.hdr.tx_id },
        msg_id: { view.hdr.msg_id },
        tag: { view.hdr.tag },
        data_len: { view.hdr.data_len },
        cq_data: view.cq_data,
        rma_iov: view.rma_iov.clone(),
    }
}
