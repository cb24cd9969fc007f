//! # rdmsg - reliable datagram messaging
//!
//! This crate implements a reliable, ordered, tagged message protocol
//! plus emulated remote-memory READ/WRITE on top of an unreliable
//! datagram transport, with an optional shared-memory sibling transport
//! for co-located peers.
//!
//! ## Features
//!
//! - **RTS/CTS bracketed messages**: small messages ride inline in the
//!   RTS; large ones stream data packets under receiver-granted credits
//! - **Credit-based flow control**: per-peer transmit credits and
//!   receiver-side grant windows prevent buffer overrun
//! - **RNR backoff**: receiver-not-ready completions park the peer with
//!   randomized exponential backoff and retransmit later
//! - **Send-after-send ordering**: a per-peer reorder window releases
//!   messages in submission order
//! - **Multi-receive buffers**: one posted buffer absorbs many inbound
//!   messages until its remaining space drops below a threshold
//! - **Emulated RMA**: READ/WRITE layered over the message protocol
//!   against registered regions
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use rdmsg::{Addr, CompletionQueue, Endpoint, RdmConfig};
//!
//! let cq = Arc::new(CompletionQueue::new(8192));
//! let mut ep = Endpoint::new(
//!     RdmConfig::default(),
//!     b"ep-name",
//!     transport, // impl DatagramTransport
//!     None,
//!     cq.clone(),
//!     cq.clone(),
//! )?;
//!
//! ep.recv(Addr::UNSPEC, vec![vec![0u8; 4096]], 1)?;
//! ep.tsend(Addr(2), vec![b"hello".to_vec()], 7, 2)?;
//!
//! // the hosting runtime pumps the engine
//! loop {
//!     ep.progress();
//!     while let Some(comp) = cq.read() {
//!         println!("completed: ctx={} len={}", comp.context, comp.len);
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! The crate is organized as follows:
//!
//! - [`config`]: engine configuration (`RdmConfig`)
//! - [`packet`]: wire packet formats (RTS, CTS, DATA, READRSP, EOR,
//!   CONNACK)
//! - [`pool`]: fixed-capacity packet pools and staging pools
//! - [`entry`]: transmit/receive operation records and slot arenas
//! - [`peer`]: per-peer handshake, credit and backoff state
//! - [`reorder`]: per-peer receive window for send-after-send ordering
//! - [`transport`]: the lower datagram transport abstraction
//! - [`cq`]: application-visible completion queue
//! - [`endpoint`]: endpoint construction and submit paths
//! - [`rx`]: receive-side state machine
//! - [`progress`]: the single-threaded progress engine

pub mod config;
pub mod cq;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod packet;
pub mod peer;
pub mod pool;
pub mod progress;
pub mod reorder;
pub mod rx;
pub mod transport;

// Re-export main types
pub use config::RdmConfig;
pub use cq::{Completion, CompletionFlags, CompletionQueue, ErrCompletion};
pub use endpoint::{Endpoint, RecvArgs, SendArgs};
pub use entry::{RxOp, RxState, TxOp, TxState};
pub use error::{Error, Result};
pub use packet::{PktFlags, PktType, RmaIov, IOV_LIMIT, MAX_NAME_LEN, PROTOCOL_VERSION};
pub use peer::{Addr, PeerState};
pub use transport::{CqeKind, DatagramTransport, TransportCqe, TransportError};
