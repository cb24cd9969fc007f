//! Emulated RMA: writes into registered regions, reads streamed back by
//! the responder, and the shared-memory read path with its EOR
//! acknowledgement.

mod common;

use common::{drain, flat, pair, payload, pump, shm_pair, ADDR_A, ADDR_B};
use rdmsg::{CompletionFlags, PktType, RdmConfig, RmaIov};

#[test]
fn test_write_inline() {
    let mut p = pair(RdmConfig::default());
    let key = p.a.register_region(1024);
    let data = payload(300, 1);

    p.b.write(
        ADDR_A,
        vec![data.clone()],
        vec![RmaIov {
            key,
            offset: 100,
            len: 300,
        }],
        Some(0xbeef),
        7,
    )
    .expect("write");
    pump(&mut p, 5);

    let region = p.a.region(key).expect("region");
    assert_eq!(&region[100..400], data.as_slice());
    assert_eq!(&region[..100], vec![0u8; 100].as_slice());

    // remote CQ data surfaces a completion at the target
    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert!(a_comps[0]
        .flags
        .contains(CompletionFlags::REMOTE_WRITE | CompletionFlags::REMOTE_CQ_DATA));
    assert_eq!(a_comps[0].data, 0xbeef);
    assert_eq!(a_comps[0].tag, 0);

    let b_comps = drain(&p.b_cq);
    assert_eq!(b_comps.len(), 1);
    assert!(b_comps[0]
        .flags
        .contains(CompletionFlags::RMA | CompletionFlags::WRITE));
    assert_eq!(b_comps[0].len, 300);
}

#[test]
fn test_write_streaming() {
    let len = 20_000;
    let mut p = pair(RdmConfig::default());
    let key = p.a.register_region(len);
    let data = payload(len, 2);

    p.b.write(
        ADDR_A,
        vec![data.clone()],
        vec![RmaIov {
            key,
            offset: 0,
            len: len as u64,
        }],
        None,
        1,
    )
    .expect("write");
    pump(&mut p, 50);

    assert_eq!(p.a.region(key).expect("region"), data.as_slice());
    assert!(p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Data) >= 1);
    // without remote CQ data the target stays silent
    assert!(drain(&p.a_cq).is_empty());
    assert_eq!(drain(&p.b_cq).len(), 1);
}

#[test]
fn test_write_scattered_windows() {
    let mut p = pair(RdmConfig::default());
    let key_lo = p.a.register_region(256);
    let key_hi = p.a.register_region(256);
    let data = payload(300, 3);

    p.b.write(
        ADDR_A,
        vec![data.clone()],
        vec![
            RmaIov {
                key: key_lo,
                offset: 0,
                len: 200,
            },
            RmaIov {
                key: key_hi,
                offset: 56,
                len: 100,
            },
        ],
        None,
        1,
    )
    .expect("write");
    pump(&mut p, 5);

    assert_eq!(&p.a.region(key_lo).unwrap()[..200], &data[..200]);
    assert_eq!(&p.a.region(key_hi).unwrap()[56..156], &data[200..]);
}

#[test]
fn test_read_small() {
    let mut p = pair(RdmConfig::default());
    let key = p.a.register_region(512);
    let data = payload(512, 4);
    p.a.region_mut(key).expect("region").copy_from_slice(&data);

    p.b.read(
        ADDR_A,
        vec![0u8; 512],
        vec![RmaIov {
            key,
            offset: 0,
            len: 512,
        }],
        9,
    )
    .expect("read");
    pump(&mut p, 10);

    let b_comps = drain(&p.b_cq);
    assert_eq!(b_comps.len(), 1);
    assert!(b_comps[0]
        .flags
        .contains(CompletionFlags::RMA | CompletionFlags::READ));
    assert_eq!(b_comps[0].len, 512);
    assert_eq!(flat(&b_comps[0]), data);
    // the target application sees nothing
    assert!(drain(&p.a_cq).is_empty());
}

#[test]
fn test_read_large_streams_responses() {
    let len = 50_000;
    let mut p = pair(RdmConfig::default());
    let key = p.a.register_region(len);
    let data = payload(len, 5);
    p.a.region_mut(key).expect("region").copy_from_slice(&data);

    p.b.read(
        ADDR_A,
        vec![0u8; len],
        vec![RmaIov {
            key,
            offset: 0,
            len: len as u64,
        }],
        3,
    )
    .expect("read");
    pump(&mut p, 100);

    let b_comps = drain(&p.b_cq);
    assert_eq!(b_comps.len(), 1);
    assert_eq!(flat(&b_comps[0]), data);
    assert!(p.fabric.delivered(ADDR_A.0, ADDR_B.0, PktType::ReadRsp) > 1);
}

#[test]
fn test_read_offset_window() {
    let mut p = pair(RdmConfig::default());
    let key = p.a.register_region(1024);
    let data = payload(1024, 6);
    p.a.region_mut(key).expect("region").copy_from_slice(&data);

    p.b.read(
        ADDR_A,
        vec![0u8; 200],
        vec![RmaIov {
            key,
            offset: 300,
            len: 200,
        }],
        1,
    )
    .expect("read");
    pump(&mut p, 10);

    let b_comps = drain(&p.b_cq);
    assert_eq!(b_comps.len(), 1);
    assert_eq!(flat(&b_comps[0]), &data[300..500]);
}

#[test]
fn test_unknown_region_is_dropped() {
    let mut p = pair(RdmConfig::default());

    p.b.write(
        ADDR_A,
        vec![payload(32, 7)],
        vec![RmaIov {
            key: 99,
            offset: 0,
            len: 32,
        }],
        None,
        1,
    )
    .expect("write");
    pump(&mut p, 5);

    // the target rejects the descriptor; the sender never gets a grant
    assert!(drain(&p.a_cq).is_empty());
    assert!(drain(&p.b_cq).len() <= 1);
}

#[test]
fn test_shm_send_routing() {
    let (mut p, shm) = shm_pair(RdmConfig::default(), 4096, 8192);
    let data = payload(100, 8);

    p.a.recv(ADDR_B, vec![vec![0u8; 128]], 1).expect("post recv");
    p.b.send(ADDR_A, vec![data.clone()], 2).expect("send");
    pump(&mut p, 5);

    let a_comps = drain(&p.a_cq);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(flat(&a_comps[0]), data);
    // the co-located peer was served over shared memory
    assert_eq!(shm.delivered(ADDR_B.0, ADDR_A.0, PktType::Rts), 1);
    assert_eq!(p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Rts), 0);
}

#[test]
fn test_shm_read_finishes_with_eor() {
    let len = 40_000;
    let (mut p, shm) = shm_pair(RdmConfig::default(), 4096, 8192);
    let key = p.a.register_region(len);
    let data = payload(len, 9);
    p.a.region_mut(key).expect("region").copy_from_slice(&data);

    p.b.read(
        ADDR_A,
        vec![0u8; len],
        vec![RmaIov {
            key,
            offset: 0,
            len: len as u64,
        }],
        5,
    )
    .expect("read");
    pump(&mut p, 100);

    let b_comps = drain(&p.b_cq);
    assert_eq!(b_comps.len(), 1);
    assert_eq!(flat(&b_comps[0]), data);

    // the whole exchange ran over shared memory and closed with an EOR
    assert_eq!(shm.delivered(ADDR_B.0, ADDR_A.0, PktType::Rts), 1);
    assert!(shm.delivered(ADDR_A.0, ADDR_B.0, PktType::ReadRsp) > 1);
    assert_eq!(shm.delivered(ADDR_B.0, ADDR_A.0, PktType::Eor), 1);
    assert_eq!(p.fabric.delivered(ADDR_B.0, ADDR_A.0, PktType::Rts), 0);
}
