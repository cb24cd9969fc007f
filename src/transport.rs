//! Lower datagram transport abstraction.
//!
//! The engine drives two sibling transports with an identical surface:
//! the main fabric and, optionally, a shared-memory transport for
//! co-located peers. Routing picks one per peer; everything above this
//! trait is transport-agnostic.

use crate::error::Result;
use crate::peer::Addr;

/// Failure reported by a transport completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Receiver not ready: transient back-pressure, retried after backoff.
    Rnr,
    /// Any other completion error; fatal for the peer.
    Fatal(i32),
}

/// Direction of a transport completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeKind {
    Send,
    Recv,
}

/// One completion drained from a transport completion queue.
#[derive(Debug)]
pub struct TransportCqe {
    pub kind: CqeKind,
    /// Caller context passed to `send`; 0 for receive completions.
    pub ctx: u64,
    /// Destination (send) or source (receive) peer.
    pub addr: Addr,
    /// Received frame bytes; empty for send completions.
    pub data: Vec<u8>,
    pub err: Option<TransportError>,
}

/// A connectionless datagram endpoint the engine can drive.
///
/// All methods are non-blocking. `send` returns `Error::Again` when the
/// submission ring is full; delivery failures (including RNR) surface
/// later as completions carrying the caller's context.
pub trait DatagramTransport {
    /// Maximum frame size accepted by `send`.
    fn mtu(&self) -> usize;

    /// Whether the transport itself delivers frames in submission order
    /// per peer. When true the engine skips the reorder window.
    fn provides_sas(&self) -> bool {
        false
    }

    /// Make one more receive buffer available to the transport.
    fn post_recv(&mut self) -> Result<()>;

    /// Submit a frame; a completion with `ctx` follows.
    fn send(&mut self, addr: Addr, frame: &[u8], ctx: u64) -> Result<()>;

    /// Submit a small frame with no completion.
    fn inject(&mut self, addr: Addr, frame: &[u8]) -> Result<()>;

    /// Drain up to `max` completions into `out`.
    fn poll_cq(&mut self, max: usize, out: &mut Vec<TransportCqe>);
}
