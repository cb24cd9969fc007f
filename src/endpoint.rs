//! Endpoint construction and the submit paths.
//!
//! The endpoint owns the packet pools, entry arenas and peer table, and
//! drives one or two lower transports: the main fabric and, optionally,
//! a shared-memory sibling for co-located peers. All submit operations
//! are non-blocking; `Error::Again` asks the caller to retry after a
//! `progress` pass has freed resources.

use std::collections::VecDeque;
use std::sync::Arc;

use bitflags::bitflags;
use slab::Slab;
use tracing::{debug, trace};

use crate::config::RdmConfig;
use crate::cq::CompletionQueue;
use crate::entry::{
    EntryFlags, RxArena, RxEntry, RxOp, RxState, TxArena, TxEntry, TxOp, TxState,
};
use crate::error::{Error, Result};
use crate::packet::{
    encode_rts, rts_hdr_len, PktFlags, RmaIov, RtsHdr, MAX_NAME_LEN, MTU_MAX_LIMIT,
};
use crate::peer::{Addr, PeerFlags, PeerState, PeerTable};
use crate::pool::{EntryKind, EntryRef, PktId, PktPool};
use crate::transport::{DatagramTransport, TransportCqe};

bitflags! {
    /// Resource-management flags refreshed each progress pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RmFlags: u8 {
        const TX_CQ_FULL = 1 << 0;
        const RX_CQ_FULL = 1 << 1;
    }
}

/// Arguments for [`Endpoint::sendmsg`].
pub struct SendArgs {
    pub addr: Addr,
    pub iov: Vec<Vec<u8>>,
    /// `Some` makes the send tagged.
    pub tag: Option<u64>,
    /// Remote CQ data delivered with the receiver's completion.
    pub cq_data: Option<u64>,
    pub context: u64,
}

/// Arguments for [`Endpoint::recvmsg`].
pub struct RecvArgs {
    /// Source filter; `Addr::UNSPEC` accepts any peer.
    pub addr: Addr,
    pub iov: Vec<Vec<u8>>,
    pub tagged: bool,
    pub tag: u64,
    pub ignore: u64,
    /// Post the buffer as a multi-receive master.
    pub multi_recv: bool,
    pub context: u64,
}

/// One lower transport plus its packet pools and posting state.
pub(crate) struct TransportLane {
    pub transport: Box<dyn DatagramTransport>,
    pub tx_pool: PktPool,
    pub rx_pool: PktPool,
    pub posted_bufs: usize,
    pub bufs_to_post: usize,
    pub mtu: usize,
    pub cq_read_size: usize,
}

/// Pick the lane for an operation without borrowing the whole endpoint.
pub(crate) fn lane_mut<'a>(
    main: &'a mut TransportLane,
    shm: &'a mut Option<TransportLane>,
    use_shm: bool,
) -> &'a mut TransportLane {
    match shm {
        Some(lane) if use_shm => lane,
        _ => main,
    }
}

/// Encode the (lane, pool slot) pair a send completion will echo back.
pub(crate) fn pkt_ctx(shm: bool, pkt: PktId) -> u64 {
    ((shm as u64) << 32) | pkt.0 as u64
}

/// Decode a send completion context.
pub(crate) fn decode_pkt_ctx(ctx: u64) -> (bool, PktId) {
    ((ctx >> 32) & 1 == 1, PktId((ctx & 0xffff_ffff) as usize))
}

/// Outcome of a packet submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submit {
    Sent,
    /// Ring full or peer in backoff; the packet must be queued.
    Blocked,
}

/// Reliable datagram messaging endpoint.
pub struct Endpoint {
    pub(crate) cfg: RdmConfig,
    pub(crate) src_addr: Vec<u8>,
    pub(crate) main: TransportLane,
    pub(crate) shm: Option<TransportLane>,
    pub(crate) tx_cq: Arc<CompletionQueue>,
    pub(crate) rx_cq: Arc<CompletionQueue>,
    pub(crate) peers: PeerTable,
    pub(crate) tx: TxArena,
    pub(crate) rx: RxArena,
    /// Staging pool for unexpected-message RTS packets.
    pub(crate) unexp_pool: PktPool,
    /// Staging pool for out-of-order RTS packets.
    pub(crate) ooo_pool: PktPool,
    /// Posted untagged receives.
    pub(crate) rx_list: VecDeque<u32>,
    /// Posted tagged receives.
    pub(crate) rx_tagged_list: VecDeque<u32>,
    /// Unexpected untagged messages.
    pub(crate) rx_unexp_list: VecDeque<u32>,
    /// Unexpected tagged messages.
    pub(crate) rx_unexp_tagged_list: VecDeque<u32>,
    /// Transmit entries with queued packets to retry.
    pub(crate) tx_queued: VecDeque<u32>,
    /// Receive entries with queued packets or a deferred CTS.
    pub(crate) rx_queued: VecDeque<u32>,
    /// Large-message senders with streaming left to do.
    pub(crate) tx_pending: VecDeque<u32>,
    /// Emulated-read initiators waiting for their paired receive.
    pub(crate) read_pending: VecDeque<u32>,
    /// Peers currently backing off after RNR.
    pub(crate) peer_backoff: Vec<Addr>,
    /// Peers owed a CONNACK that could not be sent yet.
    pub(crate) connack_pending: Vec<Addr>,
    pub(crate) rm_full: RmFlags,
    /// Registered windows addressable by emulated RMA.
    pub(crate) regions: Slab<Vec<u8>>,
    start: minstant::Instant,
    pub(crate) scratch_cqes: Vec<TransportCqe>,
}

impl Endpoint {
    /// Create an endpoint over the given transports.
    ///
    /// `src_addr` is this endpoint's name, piggybacked on the first RTS
    /// to each peer until the peer acknowledges it.
    pub fn new(
        cfg: RdmConfig,
        src_addr: &[u8],
        main_transport: Box<dyn DatagramTransport>,
        shm_transport: Option<Box<dyn DatagramTransport>>,
        tx_cq: Arc<CompletionQueue>,
        rx_cq: Arc<CompletionQueue>,
    ) -> Result<Self> {
        if src_addr.len() > MAX_NAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "source address length {} exceeds {}",
                src_addr.len(),
                MAX_NAME_LEN
            )));
        }
        if cfg.tx_min_credits > cfg.tx_max_credits {
            return Err(Error::InvalidConfig(
                "tx_min_credits exceeds tx_max_credits".into(),
            ));
        }
        if cfg.tx_iov_limit > crate::packet::IOV_LIMIT
            || cfg.rx_iov_limit > crate::packet::IOV_LIMIT
        {
            return Err(Error::InvalidConfig(format!(
                "iov limit exceeds protocol maximum {}",
                crate::packet::IOV_LIMIT
            )));
        }

        let make_lane = |transport: Box<dyn DatagramTransport>, cq_read_size: usize| {
            let mtu = if cfg.mtu_size != 0 {
                cfg.mtu_size.min(transport.mtu()).min(MTU_MAX_LIMIT)
            } else {
                transport.mtu().min(MTU_MAX_LIMIT)
            };
            TransportLane {
                transport,
                tx_pool: PktPool::new(cfg.tx_size, mtu, cfg.enable_poisoning),
                rx_pool: PktPool::new(cfg.rx_size, mtu, cfg.enable_poisoning),
                posted_bufs: 0,
                bufs_to_post: cfg.rx_size,
                mtu,
                cq_read_size,
            }
        };

        let main = make_lane(main_transport, cfg.efa_cq_read_size);
        let shm = shm_transport.map(|t| make_lane(t, cfg.shm_cq_read_size));
        let staging_mtu = main.mtu.max(shm.as_ref().map_or(0, |l| l.mtu));

        let mut ep = Self {
            unexp_pool: PktPool::new(cfg.rx_size, staging_mtu, cfg.enable_poisoning),
            ooo_pool: PktPool::new(cfg.rx_size, staging_mtu, cfg.enable_poisoning),
            tx: TxArena::new(cfg.tx_size),
            rx: RxArena::new(cfg.rx_size),
            peers: PeerTable::new(),
            rx_list: VecDeque::new(),
            rx_tagged_list: VecDeque::new(),
            rx_unexp_list: VecDeque::new(),
            rx_unexp_tagged_list: VecDeque::new(),
            tx_queued: VecDeque::new(),
            rx_queued: VecDeque::new(),
            tx_pending: VecDeque::new(),
            read_pending: VecDeque::new(),
            peer_backoff: Vec::new(),
            connack_pending: Vec::new(),
            rm_full: RmFlags::default(),
            regions: Slab::new(),
            start: minstant::Instant::now(),
            scratch_cqes: Vec::new(),
            src_addr: src_addr.to_vec(),
            main,
            shm,
            tx_cq,
            rx_cq,
            cfg,
        };
        ep.repost_recv_bufs();
        Ok(ep)
    }

    /// Microseconds since endpoint construction.
    #[inline]
    pub(crate) fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Mark a peer as co-located so its traffic routes over shared memory.
    pub fn set_peer_local(&mut self, addr: Addr) -> Result<()> {
        if self.shm.is_none() {
            return Err(Error::InvalidConfig(
                "no shared-memory transport bound".into(),
            ));
        }
        self.peers.get_or_create(addr).is_local = true;
        Ok(())
    }

    /// Register a window addressable by emulated RMA; returns its key.
    pub fn register_region(&mut self, len: usize) -> u64 {
        self.regions.insert(vec![0u8; len]) as u64
    }

    /// Read access to a registered region.
    pub fn region(&self, key: u64) -> Option<&[u8]> {
        self.regions.get(key as usize).map(|r| r.as_slice())
    }

    /// Write access to a registered region.
    pub fn region_mut(&mut self, key: u64) -> Option<&mut [u8]> {
        self.regions.get_mut(key as usize).map(|r| r.as_mut_slice())
    }

    /// Untagged send.
    pub fn send(&mut self, addr: Addr, iov: Vec<Vec<u8>>, context: u64) -> Result<()> {
        self.post_send(TxOp::MsgSend, addr, iov, 0, None, Vec::new(), context)
    }

    /// Tagged send.
    pub fn tsend(&mut self, addr: Addr, iov: Vec<Vec<u8>>, tag: u64, context: u64) -> Result<()> {
        self.post_send(TxOp::TaggedSend, addr, iov, tag, None, Vec::new(), context)
    }

    /// Send with full argument control.
    pub fn sendmsg(&mut self, args: SendArgs) -> Result<()> {
        let (op, tag) = match args.tag {
            Some(tag) => (TxOp::TaggedSend, tag),
            None => (TxOp::MsgSend, 0),
        };
        self.post_send(op, args.addr, args.iov, tag, args.cq_data, Vec::new(), args.context)
    }

    /// Emulated RMA write into the peer's registered regions.
    pub fn write(
        &mut self,
        addr: Addr,
        iov: Vec<Vec<u8>>,
        rma: Vec<RmaIov>,
        cq_data: Option<u64>,
        context: u64,
    ) -> Result<()> {
        let total: u64 = iov.iter().map(|s| s.len() as u64).sum();
        if total as usize > self.cfg.efa_max_emulated_write_size {
            return Err(Error::MessageTooLarge {
                size: total as usize,
                max: self.cfg.efa_max_emulated_write_size,
            });
        }
        let window: u64 = rma.iter().map(|r| r.len).sum();
        if window != total {
            return Err(Error::InvalidConfig(
                "rma iov length does not match payload length".into(),
            ));
        }
        self.post_send(TxOp::RmaWrite, addr, iov, 0, cq_data, rma, context)
    }

    /// Emulated RMA read from the peer's registered regions into `dest`.
    pub fn read(&mut self, addr: Addr, dest: Vec<u8>, rma: Vec<RmaIov>, context: u64) -> Result<()> {
        if self.rm_full.contains(RmFlags::TX_CQ_FULL) {
            return Err(Error::Again);
        }
        let total: u64 = rma.iter().map(|r| r.len).sum();
        if total as usize > self.cfg.efa_max_emulated_read_size {
            return Err(Error::MessageTooLarge {
                size: total as usize,
                max: self.cfg.efa_max_emulated_read_size,
            });
        }
        if dest.len() as u64 != total {
            return Err(Error::InvalidConfig(
                "read destination does not match rma iov length".into(),
            ));
        }
        if rma.len() > crate::packet::IOV_LIMIT {
            return Err(Error::IovLimitExceeded {
                count: rma.len(),
                limit: crate::packet::IOV_LIMIT,
            });
        }

        self.init_peer_tx(addr);
        let use_shm = self.use_shm(addr);

        // Destination entry paired with the read; completes internally.
        let rx_id = self.rx.alloc_with(|id| {
            let mut e = RxEntry::new(RxOp::Read, addr, vec![dest], 0);
            e.rx_id = id;
            e.total_len = total;
            e.state = RxState::WaitReadFinish;
            e.flags |= EntryFlags::NO_COMPLETION;
            e.shm = use_shm;
            e
        })?;

        let credit_request = self.credit_request_for(addr);
        let tx_id = match self.tx.alloc_with(|id| {
            let mut e = TxEntry::new(TxOp::RmaRead, addr, Vec::new(), context);
            e.tx_id = id;
            e.total_len = total;
            e.rma_iov = rma;
            e.rma_loc_rx_id = rx_id;
            e.credit_request = credit_request;
            e.shm = use_shm;
            e
        }) {
            Ok(id) => id,
            Err(e) => {
                self.rx.release(rx_id);
                return Err(e);
            }
        };
        if let Some(rx_entry) = self.rx.get_mut(rx_id) {
            rx_entry.paired_tx_id = tx_id;
        }

        match self.format_and_send_rts(tx_id, use_shm) {
            Ok(()) => {
                if use_shm {
                    if let Some(e) = self.tx.get_mut(tx_id) {
                        e.state = match e.state {
                            TxState::QueuedCtrl => TxState::QueuedShmRma,
                            _ => TxState::ShmRma,
                        };
                    }
                }
                self.read_pending.push_back(tx_id);
                Ok(())
            }
            Err(e) => {
                self.tx.release(tx_id);
                self.rx.release(rx_id);
                Err(e)
            }
        }
    }

    /// Untagged receive. Matches unexpected messages first.
    pub fn recv(&mut self, addr: Addr, iov: Vec<Vec<u8>>, context: u64) -> Result<()> {
        self.post_recv_common(RecvArgs {
            addr,
            iov,
            tagged: false,
            tag: 0,
            ignore: 0,
            multi_recv: false,
            context,
        })
    }

    /// Tagged receive.
    pub fn trecv(
        &mut self,
        addr: Addr,
        iov: Vec<Vec<u8>>,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> Result<()> {
        self.post_recv_common(RecvArgs {
            addr,
            iov,
            tagged: true,
            tag,
            ignore,
            multi_recv: false,
            context,
        })
    }

    /// Receive with full argument control, including multi-receive.
    pub fn recvmsg(&mut self, args: RecvArgs) -> Result<()> {
        self.post_recv_common(args)
    }

    /// Cancel a posted receive by its context.
    ///
    /// Writes an error completion with `ECANCELED`. In-flight data
    /// cannot be cancelled.
    pub fn cancel_recv(&mut self, context: u64) -> Result<()> {
        let found = self
            .rx_list
            .iter()
            .chain(self.rx_tagged_list.iter())
            .copied()
            .find(|&id| {
                self.rx
                    .get(id)
                    .map(|e| e.context == context && e.state == RxState::Init)
                    .unwrap_or(false)
            });
        let Some(id) = found else {
            return Err(Error::Cancelled);
        };
        if let Some(entry) = self.release_rx_entry(id) {
            self.write_rx_err_completion(entry, crate::error::ECANCELED);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Send-side internals
    // ------------------------------------------------------------------

    /// Whether operations to `addr` route over the shared-memory lane.
    pub(crate) fn use_shm(&self, addr: Addr) -> bool {
        self.shm.is_some()
            && self.cfg.enable_shm_transfer
            && self.peers.get(addr).map(|p| p.is_local).unwrap_or(false)
    }

    /// First-send initialization of a peer's transmit state.
    pub(crate) fn init_peer_tx(&mut self, addr: Addr) {
        let max = self.cfg.tx_max_credits;
        let peer = self.peers.get_or_create(addr);
        if !peer.tx_init {
            peer.tx_init = true;
            peer.tx_credits = max;
        }
    }

    /// Credit request proposed in the next RTS to `addr`.
    ///
    /// The proposal is clamped into the configured bounds; a sender with
    /// no credits left still proposes the minimum so the receiver can
    /// grant once credits free up.
    pub(crate) fn credit_request_for(&self, addr: Addr) -> u16 {
        let credits = self.peers.get(addr).map(|p| p.tx_credits).unwrap_or(0);
        credits.clamp(self.cfg.tx_min_credits, self.cfg.tx_max_credits)
    }

    fn post_send(
        &mut self,
        op: TxOp,
        addr: Addr,
        iov: Vec<Vec<u8>>,
        tag: u64,
        cq_data: Option<u64>,
        rma_iov: Vec<RmaIov>,
        context: u64,
    ) -> Result<()> {
        if self.rm_full.contains(RmFlags::TX_CQ_FULL) {
            return Err(Error::Again);
        }
        if iov.len() > self.cfg.tx_iov_limit {
            return Err(Error::IovLimitExceeded {
                count: iov.len(),
                limit: self.cfg.tx_iov_limit,
            });
        }

        self.init_peer_tx(addr);
        let use_shm = self.use_shm(addr);
        let credit_request = self.credit_request_for(addr);

        let tx_id = self.tx.alloc_with(|id| {
            let mut e = TxEntry::new(op, addr, iov, context);
            e.tx_id = id;
            e.tag = tag;
            e.cq_data = cq_data;
            e.rma_iov = rma_iov;
            e.credit_request = credit_request;
            e.shm = use_shm;
            e
        })?;

        match self.format_and_send_rts(tx_id, use_shm) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.tx.release(tx_id);
                Err(e)
            }
        }
    }

    /// Format the RTS for a transmit entry and submit or queue it.
    ///
    /// The packet buffer is secured before the message id is assigned,
    /// so a pool shortage does not leave a gap in the per-peer id
    /// sequence.
    pub(crate) fn format_and_send_rts(&mut self, tx_id: u32, use_shm: bool) -> Result<()> {
        let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
        let mtu = lane.mtu;
        let pkt = lane.tx_pool.alloc()?;

        let Some(entry) = self.tx.get(tx_id) else {
            lane_mut(&mut self.main, &mut self.shm, use_shm)
                .tx_pool
                .free(pkt);
            return Err(Error::Protocol(format!("no tx entry {}", tx_id)));
        };
        let addr = entry.addr;
        let op = entry.op;
        let total_len = entry.total_len;
        let tag = entry.tag;
        let credit_request = entry.credit_request;
        let cq_data = entry.cq_data;
        let rma_iov = entry.rma_iov.clone();
        let gen = self.tx.gen(tx_id);

        let peer = self.peers.get_or_create(addr);
        let include_src = peer.state != PeerState::Acked;
        if peer.state == PeerState::Free {
            peer.state = PeerState::ConnReqSent;
        }
        let msg_id = peer.alloc_msg_id();

        let mut flags = PktFlags::CREDIT_REQUEST;
        if op == TxOp::TaggedSend {
            flags |= PktFlags::TAGGED;
        }
        if op == TxOp::RmaWrite {
            flags |= PktFlags::WRITE;
        }
        if op == TxOp::RmaRead {
            flags |= PktFlags::READ_REQ;
        }
        if cq_data.is_some() {
            flags |= PktFlags::REMOTE_CQ_DATA;
        }
        if include_src {
            flags |= PktFlags::REMOTE_SRC_ADDR;
        }
        if use_shm {
            flags |= PktFlags::SHM_HDR;
        }

        let src = if include_src {
            self.src_addr.clone()
        } else {
            Vec::new()
        };
        let hdr_len = rts_hdr_len(flags, src.len(), rma_iov.len());
        let payload_cap = if op == TxOp::RmaRead {
            0
        } else {
            (mtu - hdr_len).min(self.cfg.max_memcpy_size)
        };
        // SHM_HDR_DATA marks a shm frame whose payload is complete;
        // it adds no section, so the header length stays put.
        if use_shm && payload_cap as u64 >= total_len {
            flags |= PktFlags::SHM_HDR_DATA;
        }

        let hdr = RtsHdr::new(flags, credit_request, tx_id, msg_id, tag, total_len);

        // Encode header and sections, then stream the inline payload
        // straight out of the entry's segments into the packet buffer.
        let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
        let frame_len = encode_rts(
            lane.tx_pool.get_mut(pkt).buf_mut(),
            &hdr,
            cq_data,
            &src,
            &rma_iov,
            &[],
        );
        debug_assert_eq!(frame_len, hdr_len);
        let inline_len = match self.tx.get_mut(tx_id) {
            Some(entry) => {
                let buf = lane.tx_pool.get_mut(pkt).buf_mut();
                let cap = payload_cap.min(buf.len() - frame_len);
                let n = entry.copy_next_seg(&mut buf[frame_len..frame_len + cap]);
                entry.msg_id = msg_id;
                entry.state = TxState::Rts;
                n
            }
            None => {
                lane.tx_pool.free(pkt);
                return Err(Error::Protocol(format!("tx entry {} vanished", tx_id)));
            }
        };

        let pkt_entry = lane.tx_pool.get_mut(pkt);
        pkt_entry.set_len(frame_len + inline_len);
        pkt_entry.pkt_type = crate::packet::PktType::Rts as u8;
        pkt_entry.addr = addr.0;
        pkt_entry.owner = Some(EntryRef {
            kind: EntryKind::Tx,
            id: tx_id,
            gen,
        });

        trace!(tx_id, msg_id, total_len, inline_len, "rts formatted");

        match self.submit_pkt(use_shm, pkt) {
            Ok(Submit::Sent) => Ok(()),
            Ok(Submit::Blocked) => {
                self.queue_tx_pkt(tx_id, pkt, TxState::QueuedCtrl);
                Ok(())
            }
            Err(e) => {
                lane_mut(&mut self.main, &mut self.shm, use_shm)
                    .tx_pool
                    .free(pkt);
                Err(e)
            }
        }
    }

    /// Submit a formatted packet on a lane.
    ///
    /// A peer in backoff blocks the submission outright; the transport
    /// blocking with `Again` is reported the same way so the caller can
    /// queue the packet.
    pub(crate) fn submit_pkt(&mut self, use_shm: bool, pkt: PktId) -> Result<Submit> {
        let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
        let addr = Addr(lane.tx_pool.get(pkt).addr);
        if let Some(peer) = self.peers.get(addr) {
            if peer.flags.contains(PeerFlags::IN_BACKOFF) {
                return Ok(Submit::Blocked);
            }
        }
        let ctx = pkt_ctx(use_shm, pkt);
        let lane = lane_mut(&mut self.main, &mut self.shm, use_shm);
        let res = lane
            .transport
            .send(addr, lane.tx_pool.get(pkt).frame(), ctx);
        match res {
            Ok(()) => {
                self.peers.get_or_create(addr).tx_pending += 1;
                Ok(Submit::Sent)
            }
            Err(Error::Again) => Ok(Submit::Blocked),
            Err(e) => Err(e),
        }
    }

    /// Queue a blocked packet on its transmit entry.
    pub(crate) fn queue_tx_pkt(&mut self, tx_id: u32, pkt: PktId, state: TxState) {
        let Some(entry) = self.tx.get_mut(tx_id) else {
            return;
        };
        let was_queued = entry.state == TxState::QueuedCtrl
            || entry.state == TxState::QueuedRtsRnr
            || entry.state == TxState::QueuedDataRnr
            || entry.state == TxState::QueuedReadRsp
            || entry.state == TxState::QueuedShmRma;
        entry.queued_pkts.push_back(pkt);
        entry.state = state;
        let addr = entry.addr;
        self.peers.get_or_create(addr).rnr_queued_pkt_cnt += 1;
        if !was_queued {
            self.tx_queued.push_back(tx_id);
        }
        debug!(tx_id, ?state, "tx packet queued");
    }

    /// Queue a blocked packet on its receive entry.
    pub(crate) fn queue_rx_pkt(&mut self, rx_id: u32, pkt: PktId, state: RxState) {
        let Some(entry) = self.rx.get_mut(rx_id) else {
            return;
        };
        let was_queued = entry.state == RxState::QueuedCtrl
            || entry.state == RxState::QueuedCtsRnr
            || entry.state == RxState::QueuedEor;
        entry.queued_pkts.push_back(pkt);
        entry.state = state;
        let addr = entry.addr;
        self.peers.get_or_create(addr).rnr_queued_pkt_cnt += 1;
        if !was_queued {
            self.rx_queued.push_back(rx_id);
        }
        debug!(rx_id, ?state, "rx packet queued");
    }

    /// Keep receive buffers posted on both lanes.
    pub(crate) fn repost_recv_bufs(&mut self) {
        for lane in std::iter::once(&mut self.main).chain(self.shm.as_mut()) {
            while lane.posted_bufs < lane.bufs_to_post {
                match lane.transport.post_recv() {
                    Ok(()) => lane.posted_bufs += 1,
                    Err(_) => break,
                }
            }
        }
    }
}
