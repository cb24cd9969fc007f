//! Wire packet formats.
//!
//! Every packet starts with a four-byte prelude (type, version, flags).
//! The RTS header is followed by optional variable-length sections whose
//! presence is signalled by the flag word: remote CQ data, the sender's
//! source address, and RMA iov descriptors.

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Wire protocol version (major 2, minor 0).
pub const PROTOCOL_VERSION: u8 = 4;

/// Scatter-gather limit per operation.
pub const IOV_LIMIT: usize = 4;

/// Maximum source address length in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Upper bound on the packet payload capacity.
pub const MTU_MAX_LIMIT: usize = 1 << 15;

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Starts a message; may carry inline payload.
    Rts = 1,
    /// Clear-to-send reply carrying the receiver slot id and credit grant.
    Cts = 2,
    /// Payload segment of a large message.
    Data = 3,
    /// Payload segment of an emulated read response.
    ReadRsp = 4,
    /// End-of-read acknowledgement for reads over shared memory.
    Eor = 5,
    /// Connection acknowledgement; moves the peer CM state to acked.
    ConnAck = 6,
}

impl TryFrom<u8> for PktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PktType::Rts),
            2 => Ok(PktType::Cts),
            3 => Ok(PktType::Data),
            4 => Ok(PktType::ReadRsp),
            5 => Ok(PktType::Eor),
            6 => Ok(PktType::ConnAck),
            _ => Err(Error::InvalidPacketType(value)),
        }
    }
}

bitflags! {
    /// Flag word carried in every packet prelude.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PktFlags: u16 {
        /// The message carries a tag.
        const TAGGED          = 1 << 0;
        /// An eight-byte remote CQ data value follows the RTS header.
        const REMOTE_CQ_DATA  = 1 << 1;
        /// The sender's source address follows the RTS header.
        const REMOTE_SRC_ADDR = 1 << 2;
        /// Receive-cancel signal (reserved for discard support).
        const RECV_CANCEL     = 1 << 3;
        /// The RTS describes an emulated RMA write.
        const WRITE           = 1 << 6;
        /// The RTS requests an emulated RMA read.
        const READ_REQ        = 1 << 7;
        /// The packet carries read-response payload.
        const READ_DATA       = 1 << 8;
        /// The credit request field of the RTS is meaningful.
        const CREDIT_REQUEST  = 1 << 9;
        /// The packet was routed over the shared-memory transport.
        const SHM_HDR         = 1 << 10;
        /// Shared-memory packet carrying inline payload.
        const SHM_HDR_DATA    = 1 << 11;
    }
}

/// RMA iov descriptor naming a window in the target's region registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RmaIov {
    /// Region key assigned at registration.
    pub key: u64,
    /// Byte offset into the region.
    pub offset: u64,
    /// Length of the window.
    pub len: u64,
}

/// Size of an encoded RMA iov descriptor.
pub const RMA_IOV_SIZE: usize = 24;

/// RTS header. Starts every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RtsHdr {
    pub pkt_type: u8,
    pub version: u8,
    pub flags: u16,
    /// Number of data-packet credits the sender proposes.
    pub credit_request: u16,
    /// Length of the trailing source address section, 0 when absent.
    pub addr_len: u16,
    /// Number of trailing RMA iov descriptors, 0 when absent.
    pub rma_iov_count: u16,
    /// Sender-side slot id of the transmit entry.
    pub tx_id: u32,
    /// Per-peer monotone message id.
    pub msg_id: u32,
    pub tag: u64,
    /// Total message length in bytes.
    pub data_len: u64,
}

/// Size of the fixed RTS header.
pub const RTS_HDR_SIZE: usize = 34;

/// CTS header. Response to an RTS that needs data streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct CtsHdr {
    pub pkt_type: u8,
    pub version: u8,
    pub flags: u16,
    /// Sender-side slot id copied from the RTS.
    pub tx_id: u32,
    /// Receiver-side slot id for addressing data packets.
    pub rx_id: u32,
    /// Number of data packets granted.
    pub window: u64,
}

/// Size of the CTS header.
pub const CTS_HDR_SIZE: usize = 20;

/// DATA header. One payload segment of a large message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct DataHdr {
    pub pkt_type: u8,
    pub version: u8,
    pub flags: u16,
    /// Receiver-side slot id advertised by the CTS.
    pub rx_id: u32,
    /// Payload bytes in this packet.
    pub seg_size: u32,
    /// Byte offset of this segment within the message.
    pub seg_offset: u64,
}

/// Size of the DATA header.
pub const DATA_HDR_SIZE: usize = 20;

/// READRSP header. One payload segment of an emulated read response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct ReadRspHdr {
    pub pkt_type: u8,
    pub version: u8,
    pub flags: u16,
    /// Initiator-side transmit slot id the response is addressed to.
    pub rx_id: u32,
    /// Responder-side slot id streaming the response.
    pub tx_id: u32,
    /// Payload bytes in this packet.
    pub seg_size: u32,
    /// Byte offset of this segment within the read.
    pub seg_offset: u64,
}

/// Size of the READRSP header.
pub const READRSP_HDR_SIZE: usize = 24;

/// EOR header. Acknowledges a completed read over shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct EorHdr {
    pub pkt_type: u8,
    pub version: u8,
    pub flags: u16,
    /// Responder-side slot id of the read-response entry.
    pub tx_id: u32,
    /// Initiator-side transmit slot id of the read.
    pub rx_id: u32,
}

/// Size of the EOR header.
pub const EOR_HDR_SIZE: usize = 12;

/// CONNACK header. Sent once per peer to acknowledge its source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct ConnAckHdr {
    pub pkt_type: u8,
    pub version: u8,
    pub flags: u16,
}

/// Size of the CONNACK header.
pub const CONNACK_HDR_SIZE: usize = 4;

/// Copy a fixed-size header into the front of `dst`.
///
/// # Safety
/// `T` must be `repr(C, packed)` with no padding or invalid bit patterns.
unsafe fn write_hdr<T: Copy>(hdr: &T, dst: &mut [u8]) {
    debug_assert!(dst.len() >= std::mem::size_of::<T>());
    std::ptr::copy_nonoverlapping(
        hdr as *const T as *const u8,
        dst.as_mut_ptr(),
        std::mem::size_of::<T>(),
    );
}

/// Copy a fixed-size header out of the front of `src`.
///
/// # Safety
/// `T` must be `repr(C, packed)` and every bit pattern of `src` must be a
/// valid `T`; callers validate type and version afterwards.
unsafe fn read_hdr<T: Copy>(src: &[u8]) -> Result<T> {
    if src.len() < std::mem::size_of::<T>() {
        return Err(Error::BufferTooSmall {
            required: std::mem::size_of::<T>(),
            available: src.len(),
        });
    }
    let mut hdr = std::mem::MaybeUninit::<T>::uninit();
    std::ptr::copy_nonoverlapping(
        src.as_ptr(),
        hdr.as_mut_ptr() as *mut u8,
        std::mem::size_of::<T>(),
    );
    Ok(hdr.assume_init())
}

fn check_prelude(frame: &[u8], expected: PktType) -> Result<()> {
    if frame.len() < CONNACK_HDR_SIZE {
        return Err(Error::BufferTooSmall {
            required: CONNACK_HDR_SIZE,
            available: frame.len(),
        });
    }
    if frame[0] != expected as u8 {
        return Err(Error::InvalidPacketType(frame[0]));
    }
    if frame[1] != PROTOCOL_VERSION {
        return Err(Error::InvalidVersion {
            expected: PROTOCOL_VERSION,
            got: frame[1],
        });
    }
    Ok(())
}

/// Read the packet type byte of a raw frame.
pub fn pkt_type_of(frame: &[u8]) -> Result<PktType> {
    if frame.is_empty() {
        return Err(Error::BufferTooSmall {
            required: 1,
            available: 0,
        });
    }
    PktType::try_from(frame[0])
}

impl RtsHdr {
    pub fn new(
        flags: PktFlags,
        credit_request: u16,
        tx_id: u32,
        msg_id: u32,
        tag: u64,
        data_len: u64,
    ) -> Self {
        Self {
            pkt_type: PktType::Rts as u8,
            version: PROTOCOL_VERSION,
            flags: flags.bits(),
            credit_request,
            addr_len: 0,
            rma_iov_count: 0,
            tx_id,
            msg_id,
            tag,
            data_len,
        }
    }

    #[inline]
    pub fn flags(&self) -> PktFlags {
        PktFlags::from_bits_truncate(self.flags)
    }
}

impl CtsHdr {
    pub fn new(flags: PktFlags, tx_id: u32, rx_id: u32, window: u64) -> Self {
        Self {
            pkt_type: PktType::Cts as u8,
            version: PROTOCOL_VERSION,
            flags: flags.bits(),
            tx_id,
            rx_id,
            window,
        }
    }

    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        check_prelude(frame, PktType::Cts)?;
        unsafe { read_hdr(frame) }
    }

    pub fn encode(&self, dst: &mut [u8]) -> usize {
        unsafe { write_hdr(self, dst) };
        CTS_HDR_SIZE
    }

    #[inline]
    pub fn flags(&self) -> PktFlags {
        PktFlags::from_bits_truncate(self.flags)
    }
}

impl DataHdr {
    pub fn new(flags: PktFlags, rx_id: u32, seg_size: u32, seg_offset: u64) -> Self {
        Self {
            pkt_type: PktType::Data as u8,
            version: PROTOCOL_VERSION,
            flags: flags.bits(),
            rx_id,
            seg_size,
            seg_offset,
        }
    }

    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        check_prelude(frame, PktType::Data)?;
        unsafe { read_hdr(frame) }
    }

    pub fn encode(&self, dst: &mut [u8]) -> usize {
        unsafe { write_hdr(self, dst) };
        DATA_HDR_SIZE
    }

    #[inline]
    pub fn flags(&self) -> PktFlags {
        PktFlags::from_bits_truncate(self.flags)
    }
}

impl ReadRspHdr {
    pub fn new(flags: PktFlags, rx_id: u32, tx_id: u32, seg_size: u32, seg_offset: u64) -> Self {
        Self {
            pkt_type: PktType::ReadRsp as u8,
            version: PROTOCOL_VERSION,
            flags: (flags | PktFlags::READ_DATA).bits(),
            rx_id,
            tx_id,
            seg_size,
            seg_offset,
        }
    }

    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        check_prelude(frame, PktType::ReadRsp)?;
        unsafe { read_hdr(frame) }
    }

    pub fn encode(&self, dst: &mut [u8]) -> usize {
        unsafe { write_hdr(self, dst) };
        READRSP_HDR_SIZE
    }

    #[inline]
    pub fn flags(&self) -> PktFlags {
        PktFlags::from_bits_truncate(self.flags)
    }
}

impl EorHdr {
    pub fn new(flags: PktFlags, tx_id: u32, rx_id: u32) -> Self {
        Self {
            pkt_type: PktType::Eor as u8,
            version: PROTOCOL_VERSION,
            flags: flags.bits(),
            tx_id,
            rx_id,
        }
    }

    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        check_prelude(frame, PktType::Eor)?;
        unsafe { read_hdr(frame) }
    }

    pub fn encode(&self, dst: &mut [u8]) -> usize {
        unsafe { write_hdr(self, dst) };
        EOR_HDR_SIZE
    }

    #[inline]
    pub fn flags(&self) -> PktFlags {
        PktFlags::from_bits_truncate(self.flags)
    }
}

impl ConnAckHdr {
    pub fn new() -> Self {
        Self {
            pkt_type: PktType::ConnAck as u8,
            version: PROTOCOL_VERSION,
            flags: 0,
        }
    }

    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        check_prelude(frame, PktType::ConnAck)?;
        unsafe { read_hdr(frame) }
    }

    pub fn encode(&self, dst: &mut [u8]) -> usize {
        unsafe { write_hdr(self, dst) };
        CONNACK_HDR_SIZE
    }
}

impl Default for ConnAckHdr {
    fn default() -> Self {
        Self::new()
    }
}

/// Total header length of an RTS with the given variable sections.
pub fn rts_hdr_len(flags: PktFlags, addr_len: usize, rma_iov_count: usize) -> usize {
    let mut len = RTS_HDR_SIZE;
    if flags.contains(PktFlags::REMOTE_CQ_DATA) {
        len += 8;
    }
    if flags.contains(PktFlags::REMOTE_SRC_ADDR) {
        len += addr_len;
    }
    if flags.intersects(PktFlags::WRITE | PktFlags::READ_REQ) {
        len += rma_iov_count * RMA_IOV_SIZE;
    }
    len
}

/// Encode a full RTS frame into `dst`; returns the frame length.
///
/// `hdr.addr_len` and `hdr.rma_iov_count` are filled in from the
/// arguments. The payload must already be trimmed to fit.
pub fn encode_rts(
    dst: &mut [u8],
    hdr: &RtsHdr,
    cq_data: Option<u64>,
    src_addr: &[u8],
    rma_iov: &[RmaIov],
    payload: &[u8],
) -> usize {
    let mut hdr = *hdr;
    hdr.addr_len = src_addr.len() as u16;
    hdr.rma_iov_count = rma_iov.len() as u16;
    unsafe { write_hdr(&hdr, dst) };
    let mut off = RTS_HDR_SIZE;
    if let Some(data) = cq_data {
        dst[off..off + 8].copy_from_slice(&data.to_le_bytes());
        off += 8;
    }
    if !src_addr.is_empty() {
        dst[off..off + src_addr.len()].copy_from_slice(src_addr);
        off += src_addr.len();
    }
    for iov in rma_iov {
        unsafe { write_hdr(iov, &mut dst[off..]) };
        off += RMA_IOV_SIZE;
    }
    dst[off..off + payload.len()].copy_from_slice(payload);
    off + payload.len()
}

/// Parsed view of an RTS frame.
#[derive(Debug)]
pub struct RtsView<'a> {
    pub hdr: RtsHdr,
    pub cq_data: Option<u64>,
    pub src_addr: &'a [u8],
    pub rma_iov: Vec<RmaIov>,
    pub payload: &'a [u8],
}

/// Parse a full RTS frame, validating type, version and section lengths.
pub fn parse_rts(frame: &[u8]) -> Result<RtsView<'_>> {
    check_prelude(frame, PktType::Rts)?;
    let hdr: RtsHdr = unsafe { read_hdr(frame)? };
    let flags = hdr.flags();
    let addr_len = hdr.addr_len as usize;
    let rma_iov_count = hdr.rma_iov_count as usize;
    if addr_len > MAX_NAME_LEN {
        return Err(Error::Protocol(format!(
            "source address length {} exceeds {}",
            addr_len, MAX_NAME_LEN
        )));
    }
    if rma_iov_count > IOV_LIMIT {
        return Err(Error::IovLimitExceeded {
            count: rma_iov_count,
            limit: IOV_LIMIT,
        });
    }
    let total_hdr = rts_hdr_len(flags, addr_len, rma_iov_count);
    if frame.len() < total_hdr {
        return Err(Error::BufferTooSmall {
            required: total_hdr,
            available: frame.len(),
        });
    }

    let mut off = RTS_HDR_SIZE;
    let cq_data = if flags.contains(PktFlags::REMOTE_CQ_DATA) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&frame[off..off + 8]);
        off += 8;
        Some(u64::from_le_bytes(bytes))
    } else {
        None
    };
    let src_addr = if flags.contains(PktFlags::REMOTE_SRC_ADDR) {
        let addr = &frame[off..off + addr_len];
        off += addr_len;
        addr
    } else {
        &[]
    };
    let mut rma_iov = Vec::new();
    if flags.intersects(PktFlags::WRITE | PktFlags::READ_REQ) {
        for _ in 0..rma_iov_count {
            let iov: RmaIov = unsafe { read_hdr(&frame[off..])? };
            rma_iov.push(iov);
            off += RMA_IOV_SIZE;
        }
    }
    Ok(RtsView {
        hdr,
        cq_data,
        src_addr,
        rma_iov,
        payload: &frame[off..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdr_sizes() {
        assert_eq!(std::mem::size_of::<RtsHdr>(), RTS_HDR_SIZE);
        assert_eq!(std::mem::size_of::<CtsHdr>(), CTS_HDR_SIZE);
        assert_eq!(std::mem::size_of::<DataHdr>(), DATA_HDR_SIZE);
        assert_eq!(std::mem::size_of::<ReadRspHdr>(), READRSP_HDR_SIZE);
        assert_eq!(std::mem::size_of::<EorHdr>(), EOR_HDR_SIZE);
        assert_eq!(std::mem::size_of::<ConnAckHdr>(), CONNACK_HDR_SIZE);
        assert_eq!(std::mem::size_of::<RmaIov>(), RMA_IOV_SIZE);
    }

    #[test]
    fn test_rts_roundtrip_plain() {
        let hdr = RtsHdr::new(
            PktFlags::TAGGED | PktFlags::CREDIT_REQUEST,
            48,
            7,
            42,
            0xfeed,
            1000,
        );
        let mut buf = [0u8; 256];
        let len = encode_rts(&mut buf, &hdr, None, &[], &[], b"hello");
        assert_eq!(len, RTS_HDR_SIZE + 5);

        let view = parse_rts(&buf[..len]).unwrap();
        assert_eq!({ view.hdr.tx_id }, 7);
        assert_eq!({ view.hdr.msg_id }, 42);
        assert_eq!({ view.hdr.tag }, 0xfeed);
        assert_eq!({ view.hdr.data_len }, 1000);
        assert_eq!({ view.hdr.credit_request }, 48);
        assert!(view.hdr.flags().contains(PktFlags::TAGGED));
        assert!(view.cq_data.is_none());
        assert!(view.src_addr.is_empty());
        assert_eq!(view.payload, b"hello");
    }

    #[test]
    fn test_rts_roundtrip_all_sections() {
        let flags = PktFlags::REMOTE_CQ_DATA | PktFlags::REMOTE_SRC_ADDR | PktFlags::WRITE;
        let hdr = RtsHdr::new(flags, 32, 1, 2, 0, 64);
        let src = [0xabu8; 16];
        let iovs = [RmaIov {
            key: 9,
            offset: 128,
            len: 64,
        }];
        let mut buf = [0u8; 256];
        let len = encode_rts(&mut buf, &hdr, Some(0xdddd), &src, &iovs, b"xy");
        assert_eq!(len, RTS_HDR_SIZE + 8 + 16 + RMA_IOV_SIZE + 2);

        let view = parse_rts(&buf[..len]).unwrap();
        assert_eq!(view.cq_data, Some(0xdddd));
        assert_eq!(view.src_addr, &src);
        assert_eq!(view.rma_iov.len(), 1);
        assert_eq!({ view.rma_iov[0].key }, 9);
        assert_eq!({ view.rma_iov[0].offset }, 128);
        assert_eq!(view.payload, b"xy");
    }

    #[test]
    fn test_ctrl_hdr_roundtrips() {
        let mut buf = [0u8; 64];

        let cts = CtsHdr::new(PktFlags::empty(), 3, 4, 16);
        cts.encode(&mut buf);
        assert_eq!(CtsHdr::from_bytes(&buf).unwrap(), cts);

        let data = DataHdr::new(PktFlags::empty(), 4, 4096, 8192);
        data.encode(&mut buf);
        assert_eq!(DataHdr::from_bytes(&buf).unwrap(), data);

        let rsp = ReadRspHdr::new(PktFlags::empty(), 1, 2, 512, 0);
        rsp.encode(&mut buf);
        let parsed = ReadRspHdr::from_bytes(&buf).unwrap();
        assert_eq!(parsed, rsp);
        assert!(parsed.flags().contains(PktFlags::READ_DATA));

        let eor = EorHdr::new(PktFlags::SHM_HDR, 5, 6);
        eor.encode(&mut buf);
        assert_eq!(EorHdr::from_bytes(&buf).unwrap(), eor);

        let ack = ConnAckHdr::new();
        ack.encode(&mut buf);
        assert_eq!(ConnAckHdr::from_bytes(&buf).unwrap(), ack);
    }

    #[test]
    fn test_version_check() {
        let mut buf = [0u8; 64];
        CtsHdr::new(PktFlags::empty(), 0, 0, 0).encode(&mut buf);
        buf[1] = 3;
        assert!(matches!(
            CtsHdr::from_bytes(&buf),
            Err(Error::InvalidVersion { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut buf = [0u8; 64];
        CtsHdr::new(PktFlags::empty(), 0, 0, 0).encode(&mut buf);
        assert!(DataHdr::from_bytes(&buf).is_err());
    }
}
