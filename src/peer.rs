//! Per-peer state: connection handshake, credits and RNR backoff.
//!
//! Peers are created implicitly. The first send to a peer initializes
//! its transmit side and pre-credits `tx_max_credits`; the first RTS
//! received from a peer initializes its receive side, allocates the
//! reorder window and pre-credits `rx_window_size`.

use bitflags::bitflags;
use rand::Rng;

use crate::reorder::RecvWindow;

/// Lower bound of the randomized initial RNR backoff (microseconds).
pub const RAND_MIN_TIMEOUT: u64 = 40;
/// Upper bound of the randomized initial RNR backoff (microseconds).
pub const RAND_MAX_TIMEOUT: u64 = 120;

/// Integer peer handle assigned by the address-vector layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(pub u64);

impl Addr {
    /// Wildcard address accepted by untargeted receives.
    pub const UNSPEC: Addr = Addr(u64::MAX);

    #[inline]
    pub fn is_unspec(self) -> bool {
        self == Addr::UNSPEC
    }

    /// Address match used by receive matching; `self` is the posted side.
    #[inline]
    pub fn matches(self, other: Addr) -> bool {
        self.is_unspec() || self == other
    }
}

/// Tag match used by tagged receive matching.
#[inline]
pub fn match_tag(tag: u64, ignore: u64, msg_tag: u64) -> bool {
    (tag | ignore) == (msg_tag | ignore)
}

/// Connection-management state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No handshake traffic yet.
    #[default]
    Free,
    /// First RTS (carrying our source address) was sent.
    ConnReqSent,
    /// CONNACK received; source-address piggybacking stops.
    Acked,
}

bitflags! {
    /// RNR bookkeeping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PeerFlags: u8 {
        /// Peer is backing off; nothing may be sent to it.
        const IN_BACKOFF = 1 << 0;
        /// Backoff exponent was already raised during this progress pass.
        const BACKED_OFF_THIS_PASS = 1 << 1;
    }
}

/// Per-peer record.
#[derive(Default)]
pub struct Peer {
    pub state: PeerState,
    /// Transmit-side state was initialized (credits granted).
    pub tx_init: bool,
    /// Receive-side state was initialized (reorder window allocated).
    pub rx_init: bool,
    /// Peer is co-located; traffic routes over the shm transport.
    pub is_local: bool,
    /// Source address learned from the peer's first RTS.
    pub name: Option<Vec<u8>>,
    /// A CONNACK could not be sent and must be retried.
    pub conn_ack_pending: bool,
    /// Sender's view of the next message id for this peer.
    pub next_msg_id: u32,
    /// Reorder window tracking the expected inbound message id.
    pub robuf: Option<RecvWindow>,
    /// Available transmit credits.
    pub tx_credits: u16,
    /// Receive credits available to allocate in CTS grants.
    pub rx_credits: u16,
    /// Outstanding transmit packets to this peer.
    pub tx_pending: usize,
    /// Timestamp of the RNR event that started the current backoff.
    pub rnr_ts: u64,
    /// Initial backoff interval for this peer (microseconds).
    pub timeout_interval: u64,
    /// Backoff exponent; doubles the interval per repeated RNR.
    pub rnr_timeout_exp: u32,
    /// Packets queued on entries because of RNR to this peer.
    pub rnr_queued_pkt_cnt: usize,
    pub flags: PeerFlags,
}

impl Peer {
    /// Current backoff duration, capped at `max_timeout`.
    pub fn backoff(&self, max_timeout: u64) -> u64 {
        let scaled = self
            .timeout_interval
            .saturating_mul(1u64 << self.rnr_timeout_exp.min(63));
        scaled.min(max_timeout)
    }

    /// Whether the backoff window has elapsed at time `now`.
    pub fn backoff_expired(&self, now: u64, max_timeout: u64) -> bool {
        now >= self.rnr_ts.saturating_add(self.backoff(max_timeout))
    }

    /// Raise the backoff exponent, keeping the interval under the cap.
    pub fn raise_backoff(&mut self, max_timeout: u64) {
        let next = self
            .timeout_interval
            .saturating_mul(1u64 << (self.rnr_timeout_exp.min(62) + 1));
        if next <= max_timeout {
            self.rnr_timeout_exp += 1;
        }
    }

    /// Assign the next outbound message id.
    pub fn alloc_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }
}

/// Pick the initial RNR backoff interval for a peer.
///
/// A configured value of 0 selects a random interval so that peers
/// RNR-ing in lockstep do not retry in lockstep.
pub fn initial_timeout_interval(configured: u64) -> u64 {
    if configured != 0 {
        configured
    } else {
        rand::thread_rng().gen_range(RAND_MIN_TIMEOUT..=RAND_MAX_TIMEOUT)
    }
}

/// Table of peer records indexed by address handle.
#[derive(Default)]
pub struct PeerTable {
    peers: Vec<Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a peer, creating a fresh record on first use.
    pub fn get_or_create(&mut self, addr: Addr) -> &mut Peer {
        let idx = addr.0 as usize;
        if idx >= self.peers.len() {
            self.peers.resize_with(idx + 1, Peer::default);
        }
        &mut self.peers[idx]
    }

    #[inline]
    pub fn get(&self, addr: Addr) -> Option<&Peer> {
        self.peers.get(addr.0 as usize)
    }

    #[inline]
    pub fn get_mut(&mut self, addr: Addr) -> Option<&mut Peer> {
        self.peers.get_mut(addr.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_matching() {
        assert!(Addr::UNSPEC.matches(Addr(3)));
        assert!(Addr(3).matches(Addr(3)));
        assert!(!Addr(3).matches(Addr(4)));
    }

    #[test]
    fn test_tag_matching() {
        assert!(match_tag(7, 0, 7));
        assert!(!match_tag(7, 0, 5));
        // ignore mask wildcards the low bits
        assert!(match_tag(0x10, 0xf, 0x13));
        assert!(!match_tag(0x10, 0xf, 0x23));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut peer = Peer {
            timeout_interval: 100,
            ..Default::default()
        };
        assert_eq!(peer.backoff(1_000_000), 100);

        peer.raise_backoff(1_000_000);
        assert_eq!(peer.backoff(1_000_000), 200);
        peer.raise_backoff(1_000_000);
        assert_eq!(peer.backoff(1_000_000), 400);

        // exponent stops rising once the cap would be exceeded
        for _ in 0..30 {
            peer.raise_backoff(1_000_000);
        }
        assert!(peer.backoff(1_000_000) <= 1_000_000);
    }

    #[test]
    fn test_backoff_expiry() {
        let peer = Peer {
            timeout_interval: 100,
            rnr_ts: 1000,
            ..Default::default()
        };
        assert!(!peer.backoff_expired(1099, 1_000_000));
        assert!(peer.backoff_expired(1100, 1_000_000));
    }

    #[test]
    fn test_initial_interval_bounds() {
        assert_eq!(initial_timeout_interval(250), 250);
        for _ in 0..32 {
            let t = initial_timeout_interval(0);
            assert!((RAND_MIN_TIMEOUT..=RAND_MAX_TIMEOUT).contains(&t));
        }
    }

    #[test]
    fn test_msg_id_monotone() {
        let mut peer = Peer::default();
        assert_eq!(peer.alloc_msg_id(), 0);
        assert_eq!(peer.alloc_msg_id(), 1);
        assert_eq!(peer.alloc_msg_id(), 2);
    }
}
