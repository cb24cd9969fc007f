#![allow(dead_code)]

//! Shared harness for the integration tests.
//!
//! `SimFabric` wires endpoints together in process. A send on one
//! endpoint's transport becomes a receive completion on the target's
//! transport, gated by the target's posted-receive budget; an exhausted
//! budget (or an injected fault) produces an RNR completion at the
//! sender, like the real thing. Frames can be captured and released out
//! of order to exercise the reorder window.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use rdmsg::{
    Addr, Completion, CompletionQueue, CqeKind, DatagramTransport, Endpoint, PktType, RdmConfig,
    TransportCqe, TransportError,
};

#[derive(Default)]
struct Node {
    posted: usize,
    cqes: VecDeque<TransportCqe>,
    /// Inbound frames held back by capture mode.
    captured: Vec<(u64, Vec<u8>)>,
    capture: bool,
    /// Sends targeting this node that will complete with RNR.
    rnr_next: usize,
    /// Sends targeting this node that will complete fatally.
    fatal_next: usize,
    /// Sends *from* this node that will be refused with `Again`.
    ring_full_next: usize,
    /// Delivered packet counts by wire type, keyed by the sender.
    delivered_from: HashMap<(u64, u8), usize>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<u64, Node>,
}

impl Inner {
    fn node(&mut self, addr: u64) -> &mut Node {
        self.nodes.entry(addr).or_default()
    }
}

/// An in-process datagram network shared by test endpoints.
#[derive(Clone, Default)]
pub struct SimFabric {
    inner: Rc<RefCell<Inner>>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport bound to `addr` on this fabric.
    pub fn transport(&self, addr: u64, mtu: usize) -> Box<dyn DatagramTransport> {
        self.inner.borrow_mut().node(addr);
        Box::new(SimTransport {
            addr,
            mtu,
            inner: self.inner.clone(),
        })
    }

    /// The next `count` sends to `dest` complete with RNR.
    pub fn set_rnr(&self, dest: u64, count: usize) {
        self.inner.borrow_mut().node(dest).rnr_next = count;
    }

    /// The next `count` sends to `dest` complete fatally.
    pub fn set_fatal(&self, dest: u64, count: usize) {
        self.inner.borrow_mut().node(dest).fatal_next = count;
    }

    /// The next `count` sends *from* `src` are refused with `Again`.
    pub fn set_ring_full(&self, src: u64, count: usize) {
        self.inner.borrow_mut().node(src).ring_full_next = count;
    }

    /// Hold frames addressed at `dest` instead of delivering them.
    pub fn capture(&self, dest: u64, on: bool) {
        self.inner.borrow_mut().node(dest).capture = on;
    }

    /// Deliver captured frames in the given permutation.
    pub fn release_captured(&self, dest: u64, order: &[usize]) {
        let mut inner = self.inner.borrow_mut();
        let node = inner.node(dest);
        let captured = std::mem::take(&mut node.captured);
        for &i in order {
            let (src, frame) = captured[i].clone();
            deliver(node, src, frame);
        }
    }

    /// Number of captured frames waiting at `dest`.
    pub fn captured_count(&self, dest: u64) -> usize {
        self.inner.borrow_mut().node(dest).captured.len()
    }

    /// Packets of `ty` delivered from `src` to `dest` so far.
    pub fn delivered(&self, src: u64, dest: u64, ty: PktType) -> usize {
        self.inner
            .borrow_mut()
            .node(dest)
            .delivered_from
            .get(&(src, ty as u8))
            .copied()
            .unwrap_or(0)
    }
}

fn deliver(node: &mut Node, src: u64, frame: Vec<u8>) {
    node.posted = node.posted.saturating_sub(1);
    let ty = frame.first().copied().unwrap_or(0);
    *node.delivered_from.entry((src, ty)).or_insert(0) += 1;
    node.cqes.push_back(TransportCqe {
        kind: CqeKind::Recv,
        ctx: 0,
        addr: Addr(src),
        data: frame,
        err: None,
    });
}

struct SimTransport {
    addr: u64,
    mtu: usize,
    inner: Rc<RefCell<Inner>>,
}

impl DatagramTransport for SimTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn post_recv(&mut self) -> rdmsg::Result<()> {
        self.inner.borrow_mut().node(self.addr).posted += 1;
        Ok(())
    }

    fn send(&mut self, addr: Addr, frame: &[u8], ctx: u64) -> rdmsg::Result<()> {
        assert!(frame.len() <= self.mtu, "frame exceeds mtu");
        let mut inner = self.inner.borrow_mut();
        if inner.node(self.addr).ring_full_next > 0 {
            inner.node(self.addr).ring_full_next -= 1;
            return Err(rdmsg::Error::Again);
        }

        let err = {
            let dest = inner.node(addr.0);
            if dest.rnr_next > 0 {
                dest.rnr_next -= 1;
                Some(TransportError::Rnr)
            } else if dest.fatal_next > 0 {
                dest.fatal_next -= 1;
                Some(TransportError::Fatal(5))
            } else if dest.posted == 0 && !dest.capture {
                Some(TransportError::Rnr)
            } else {
                None
            }
        };

        if err.is_none() {
            let dest = inner.node(addr.0);
            if dest.capture {
                dest.captured.push((self.addr, frame.to_vec()));
            } else {
                deliver(dest, self.addr, frame.to_vec());
            }
        }
        inner.node(self.addr).cqes.push_back(TransportCqe {
            kind: CqeKind::Send,
            ctx,
            addr,
            data: Vec::new(),
            err,
        });
        Ok(())
    }

    fn inject(&mut self, addr: Addr, frame: &[u8]) -> rdmsg::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let dest = inner.node(addr.0);
        if dest.posted == 0 && !dest.capture {
            return Err(rdmsg::Error::Again);
        }
        if dest.capture {
            dest.captured.push((self.addr, frame.to_vec()));
        } else {
            deliver(dest, self.addr, frame.to_vec());
        }
        Ok(())
    }

    fn poll_cq(&mut self, max: usize, out: &mut Vec<TransportCqe>) {
        let mut inner = self.inner.borrow_mut();
        let node = inner.node(self.addr);
        for _ in 0..max {
            match node.cqes.pop_front() {
                Some(cqe) => out.push(cqe),
                None => break,
            }
        }
    }
}

/// Two endpoints wired over one fabric.
pub struct TestPair {
    pub fabric: SimFabric,
    pub a: Endpoint,
    pub b: Endpoint,
    pub a_cq: Arc<CompletionQueue>,
    pub b_cq: Arc<CompletionQueue>,
}

pub const ADDR_A: Addr = Addr(1);
pub const ADDR_B: Addr = Addr(2);

/// Build a connected pair with 4 KiB MTU transports.
pub fn pair(cfg: RdmConfig) -> TestPair {
    pair_mtu(cfg, 4096)
}

pub fn pair_mtu(cfg: RdmConfig, mtu: usize) -> TestPair {
    let fabric = SimFabric::new();
    let a_cq = Arc::new(CompletionQueue::new(cfg.cq_size));
    let b_cq = Arc::new(CompletionQueue::new(cfg.cq_size));
    let a = Endpoint::new(
        cfg.clone(),
        b"node-a",
        fabric.transport(ADDR_A.0, mtu),
        None,
        a_cq.clone(),
        a_cq.clone(),
    )
    .expect("endpoint a");
    let b = Endpoint::new(
        cfg,
        b"node-b",
        fabric.transport(ADDR_B.0, mtu),
        None,
        b_cq.clone(),
        b_cq.clone(),
    )
    .expect("endpoint b");
    TestPair {
        fabric,
        a,
        b,
        a_cq,
        b_cq,
    }
}

/// Build a pair that also shares a shared-memory fabric, with both
/// peers marked co-located.
pub fn shm_pair(cfg: RdmConfig, mtu: usize, shm_mtu: usize) -> (TestPair, SimFabric) {
    let fabric = SimFabric::new();
    let shm_fabric = SimFabric::new();
    let a_cq = Arc::new(CompletionQueue::new(cfg.cq_size));
    let b_cq = Arc::new(CompletionQueue::new(cfg.cq_size));
    let mut a = Endpoint::new(
        cfg.clone(),
        b"node-a",
        fabric.transport(ADDR_A.0, mtu),
        Some(shm_fabric.transport(ADDR_A.0, shm_mtu)),
        a_cq.clone(),
        a_cq.clone(),
    )
    .expect("endpoint a");
    let mut b = Endpoint::new(
        cfg,
        b"node-b",
        fabric.transport(ADDR_B.0, mtu),
        Some(shm_fabric.transport(ADDR_B.0, shm_mtu)),
        b_cq.clone(),
        b_cq.clone(),
    )
    .expect("endpoint b");
    a.set_peer_local(ADDR_B).expect("peer local");
    b.set_peer_local(ADDR_A).expect("peer local");
    (
        TestPair {
            fabric,
            a,
            b,
            a_cq,
            b_cq,
        },
        shm_fabric,
    )
}

/// Pump both endpoints `rounds` times.
pub fn pump(pair: &mut TestPair, rounds: usize) {
    for _ in 0..rounds {
        pair.a.progress();
        pair.b.progress();
    }
}

/// Drain every completion currently queued.
pub fn drain(cq: &CompletionQueue) -> Vec<Completion> {
    let mut out = Vec::new();
    while let Some(c) = cq.read() {
        out.push(c);
    }
    out
}

/// Flatten a completion's buffers.
pub fn flat(completion: &Completion) -> Vec<u8> {
    completion.buf.concat()
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Call at the top of a test to see the engine's tracing output:
/// `RUST_LOG=rdmsg=trace cargo test -- --nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
