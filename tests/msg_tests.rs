//! Message path scenarios: inline sends, large-message streaming,
//! unexpected messages, truncation, cancellation and boundaries.

mod common;

use common::{drain, flat, pair, payload, pump, ADDR_A, ADDR_B};
use rdmsg::error::{ECANCELED, EMSGSIZE};
use rdmsg::packet::{DATA_HDR_SIZE, RTS_HDR_SIZE};
use rdmsg::{CompletionFlags, PktType, RdmConfig};

/// Complete the CM handshake so later RTS headers carry no source
/// address and the inline capacity is stable.
fn warmup(pair: &mut common::TestPair) {
    pair.a
        .recv(ADDR_B, vec![vec![0u8; 64]], 9000)
        .expect("warmup recv");
    pair.b
        .send(ADDR_A, vec![b"warmup".to_vec()], 9001)
        .expect("warmup send");
    pump(pair, 5);
    drain(&pair.a_cq);
    drain(&pair.b_cq);
}

#[test]
fn test_inline_tagged_send() {
    let mut p = pair(RdmConfig::default());
    let data = payload(32, 1);

    p.a.trecv(ADDR_B, vec![vec![0u8; 32]], 7, 0, 100)
        .expect("post recv");
    p.b.tsend(ADDR_A, vec![data.clone()], 7, 200).expect("send");
    pump(&mut p, 5);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(a_comps[0].context, 100);
    assert_eq!(a_comps[0].len, 32);
    assert_eq!(a_comps[0].tag, 7);
    assert!(a_comps[0]
        .flags
        .contains(CompletionFlags::RECV | CompletionFlags::TAGGED));
    assert_eq!(flat(&a_comps[0]), data);

    let b_comps = drain(&p.b_cq);
    assert_eq!(b_comps.len(), 1);
    assert_eq!(b_comps[0].context, 200);
    assert_eq!(b_comps[0].len, 32);
    assert!(b_comps[0]
        .flags
        .contains(CompletionFlags::SEND | CompletionFlags::TAGGED));

    // the message rode inline; no clear-to-send was needed
    assert_eq!(p.fabric.delivered(ADDR_A.0, ADDR_B.0, PktType::Cts), 0);
    assert_eq!(p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Rts), 1);
}

#[test]
fn test_zero_length_send() {
    let mut p = pair(RdmConfig::default());

    p.a.recv(ADDR_B, vec![vec![0u8; 16]], 1).expect("post recv");
    p.b.send(ADDR_A, Vec::new(), 2).expect("send");
    pump(&mut p, 5);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(a_comps[0].len, 0);
    let b_comps = drain(&p.b_cq);
    assert_eq!(b_comps.len(), 1);
    assert_eq!(b_comps[0].len, 0);
}

#[test]
fn test_remote_cq_data() {
    let mut p = pair(RdmConfig::default());

    p.a.recv(ADDR_B, vec![vec![0u8; 64]], 1).expect("post recv");
    p.b.sendmsg(rdmsg::SendArgs {
        addr: ADDR_A,
        iov: vec![payload(48, 3)],
        tag: None,
        cq_data: Some(0xfeed_beef),
        context: 2,
    })
    .expect("sendmsg");
    pump(&mut p, 5);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert!(a_comps[0].flags.contains(CompletionFlags::REMOTE_CQ_DATA));
    assert_eq!(a_comps[0].data, 0xfeed_beef);
}

#[test]
fn test_single_rts_boundary() {
    let mtu = 4096;
    let mut p = pair(RdmConfig::default());
    warmup(&mut p);

    // once the peer is acked an untagged RTS is header plus payload
    let inline_cap = mtu - RTS_HDR_SIZE;
    let rts_before = p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Rts);

    p.a.recv(ADDR_B, vec![vec![0u8; inline_cap]], 1)
        .expect("post recv");
    p.b.send(ADDR_A, vec![payload(inline_cap, 7)], 2)
        .expect("send");
    pump(&mut p, 5);

    assert_eq!(drain(&p.a_cq).len(), 1);
    assert_eq!(drain(&p.b_cq).len(), 1);
    assert_eq!(
        p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Rts),
        rts_before + 1
    );
    assert_eq!(p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Data), 0);
    assert_eq!(p.fabric.delivered(ADDR_A.0, ADDR_B.0, PktType::Cts), 0);

    // one byte more forces a CTS round and a single data packet
    p.a.recv(ADDR_B, vec![vec![0u8; inline_cap + 1]], 3)
        .expect("post recv");
    p.b.send(ADDR_A, vec![payload(inline_cap + 1, 8)], 4)
        .expect("send");
    pump(&mut p, 10);

    assert_eq!(drain(&p.a_cq).len(), 1);
    assert_eq!(drain(&p.b_cq).len(), 1);
    assert_eq!(p.fabric.delivered(ADDR_A.0, ADDR_B.0, PktType::Cts), 1);
    assert_eq!(p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Data), 1);
}

#[test]
fn test_large_send() {
    let mtu = 4096;
    let len = 1 << 20;
    let mut p = pair(RdmConfig::default());
    warmup(&mut p);

    let data = payload(len, 5);
    p.a.recv(ADDR_B, vec![vec![0u8; len]], 1).expect("post recv");
    p.b.send(ADDR_A, vec![data.clone()], 2).expect("send");
    pump(&mut p, 200);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(a_comps[0].len, len as u64);
    assert_eq!(flat(&a_comps[0]), data);

    let b_comps = drain(&p.b_cq);
    assert_eq!(b_comps.len(), 1);
    assert_eq!(b_comps[0].len, len as u64);

    let inline = mtu - RTS_HDR_SIZE;
    let data_cap = mtu - DATA_HDR_SIZE;
    let expected_data = (len - inline + data_cap - 1) / data_cap;
    assert_eq!(p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Rts), 2);
    assert_eq!(
        p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Data),
        expected_data
    );
    assert!(p.fabric.delivered(ADDR_A.0, ADDR_B.0, PktType::Cts) >= 1);
}

#[test]
fn test_unexpected_inline() {
    let mut p = pair(RdmConfig::default());
    let data = payload(64, 9);

    // the send arrives before any receive is posted
    p.b.tsend(ADDR_A, vec![data.clone()], 5, 1).expect("send");
    pump(&mut p, 3);
    assert!(drain(&p.a_cq).is_empty());

    // a matching post consumes the staged message immediately
    p.a.trecv(ADDR_B, vec![vec![0u8; 64]], 5, 0, 2)
        .expect("post recv");
    pump(&mut p, 3);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(a_comps[0].tag, 5);
    assert_eq!(flat(&a_comps[0]), data);
    assert_eq!(drain(&p.b_cq).len(), 1);

    // the unexpected slot was released: a second identical recv parks
    p.a.trecv(ADDR_B, vec![vec![0u8; 64]], 5, 0, 3)
        .expect("post recv");
    pump(&mut p, 3);
    assert!(drain(&p.a_cq).is_empty());
}

#[test]
fn test_unexpected_large() {
    let len = 20_000;
    let mut p = pair(RdmConfig::default());
    let data = payload(len, 11);

    p.b.send(ADDR_A, vec![data.clone()], 1).expect("send");
    pump(&mut p, 3);
    assert!(drain(&p.a_cq).is_empty());
    assert!(drain(&p.b_cq).is_empty(), "sender must wait for the grant");

    p.a.recv(ADDR_B, vec![vec![0u8; len]], 2).expect("post recv");
    pump(&mut p, 50);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(flat(&a_comps[0]), data);
    assert_eq!(drain(&p.b_cq).len(), 1);
}

#[test]
fn test_tag_ignore_mask() {
    let mut p = pair(RdmConfig::default());

    // ignore the low byte of the tag
    p.a.trecv(ADDR_B, vec![vec![0u8; 32]], 0x1200, 0xff, 1)
        .expect("post recv");
    p.b.tsend(ADDR_A, vec![payload(8, 2)], 0x1234, 2)
        .expect("send");
    pump(&mut p, 5);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(a_comps[0].tag, 0x1234);
}

#[test]
fn test_scatter_gather_send_recv() {
    let mut p = pair(RdmConfig::default());
    let parts = vec![payload(100, 1), payload(50, 2), payload(200, 3)];
    let joined: Vec<u8> = parts.concat();

    p.a.recv(ADDR_B, vec![vec![0u8; 150], vec![0u8; 200]], 1)
        .expect("post recv");
    p.b.send(ADDR_A, parts, 2).expect("send");
    pump(&mut p, 5);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(a_comps[0].len, 350);
    assert_eq!(flat(&a_comps[0]), joined);
}

#[test]
fn test_iov_limit_enforced() {
    let mut p = pair(RdmConfig::default());
    let iov = vec![vec![0u8; 8]; 5];
    assert!(matches!(
        p.b.send(ADDR_A, iov, 1),
        Err(rdmsg::Error::IovLimitExceeded { count: 5, limit: 4 })
    ));
}

#[test]
fn test_truncated_recv() {
    let mut p = pair(RdmConfig::default());

    p.a.recv(ADDR_B, vec![vec![0u8; 16]], 1).expect("post recv");
    p.b.send(ADDR_A, vec![payload(64, 4)], 2).expect("send");
    pump(&mut p, 5);

    assert!(drain(&p.a_cq).is_empty());
    let err = p.a_cq.read_err().expect("error completion");
    assert_eq!(err.err, EMSGSIZE);
    assert_eq!(err.completion.len, 16);
    // the sender is unaware of the truncation
    assert_eq!(drain(&p.b_cq).len(), 1);
}

#[test]
fn test_cancel_recv() {
    let mut p = pair(RdmConfig::default());

    p.a.recv(ADDR_B, vec![vec![0u8; 64]], 42).expect("post recv");
    p.a.cancel_recv(42).expect("cancel");

    let err = p.a_cq.read_err().expect("cancel completion");
    assert_eq!(err.err, ECANCELED);
    assert_eq!(err.completion.context, 42);

    // cancelling again finds nothing
    assert!(p.a.cancel_recv(42).is_err());
}

#[test]
fn test_ring_full_send_is_queued() {
    let mut p = pair(RdmConfig::default());
    let data = payload(48, 6);

    p.a.recv(ADDR_B, vec![vec![0u8; 64]], 1).expect("post recv");
    // the first submission is refused; the packet must queue and retry
    p.fabric.set_ring_full(ADDR_B.0, 1);
    p.b.send(ADDR_A, vec![data.clone()], 2).expect("send");
    pump(&mut p, 5);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(flat(&a_comps[0]), data);
    assert_eq!(drain(&p.b_cq).len(), 1);
}
