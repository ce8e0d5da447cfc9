//! Loopback tests for the emulated provider: two endpoints in one process.

use std::time::{Duration, Instant};

use fabric::{
    getinfo, version, AddressVector, CompletionQueue, CqAttr, CqEvent, Domain, Endpoint, EqAttr,
    EventQueue, Fabric, FiAddr, Flags, GetInfoFlags, Hints, IoVec, MsgDesc, RmaIoVec, RmaMsgDesc,
};

struct Peer {
    ep: Endpoint,
    cq: CompletionQueue,
    av: AddressVector,
    domain: Domain,
}

fn make_peer() -> Peer {
    let info = getinfo(
        version(1, 13),
        None,
        None,
        GetInfoFlags::empty(),
        &Hints::default(),
    )
    .unwrap();
    let fabric = Fabric::new(&info).unwrap();
    let domain = fabric.domain(&info).unwrap();
    let cq = CompletionQueue::open(&domain, &CqAttr::default()).unwrap();
    let eq = EventQueue::open(&fabric, &EqAttr::default()).unwrap();
    let av = AddressVector::open();
    let ep = Endpoint::new(&domain, &info).unwrap();
    ep.bind_eq(&eq).unwrap();
    ep.bind_cq(&cq, Flags::SELECTIVE_COMPLETION | Flags::RECV | Flags::TRANSMIT)
        .unwrap();
    ep.bind_av(&av).unwrap();
    ep.enable().unwrap();
    Peer { ep, cq, av, domain }
}

fn connect(a: &Peer, b: &Peer) -> (FiAddr, FiAddr) {
    let a_to_b = a.av.insert(&b.ep.getname().unwrap()).unwrap();
    let b_to_a = b.av.insert(&a.ep.getname().unwrap()).unwrap();
    (a_to_b, b_to_a)
}

fn await_event(cq: &CompletionQueue) -> CqEvent {
    cq.sread(Some(Duration::from_secs(5)))
        .unwrap()
        .expect("timed out waiting for a completion")
}

#[test]
fn test_message_roundtrip() {
    let a = make_peer();
    let b = make_peer();
    let (a_to_b, _) = connect(&a, &b);

    let mut rxbuf = vec![0u8; 64];
    unsafe {
        b.ep.recvmsg(
            &MsgDesc {
                iov: &[IoVec {
                    addr: rxbuf.as_mut_ptr() as u64,
                    len: rxbuf.len(),
                }],
                desc: &[],
                addr: FiAddr::UNSPEC,
                context: 11,
            },
            Flags::COMPLETION,
        )
        .unwrap();
    }

    let payload = b"over the wire";
    unsafe {
        a.ep.sendmsg(
            &MsgDesc {
                iov: &[IoVec {
                    addr: payload.as_ptr() as u64,
                    len: payload.len(),
                }],
                desc: &[],
                addr: a_to_b,
                context: 22,
            },
            Flags::COMPLETION,
        )
        .unwrap();
    }

    match await_event(&a.cq) {
        CqEvent::Data(c) => {
            assert_eq!(c.context, 22);
            assert!(c.flags.contains(Flags::SEND | Flags::MSG));
            assert_eq!(c.len, payload.len());
        }
        CqEvent::Err(e) => panic!("send failed: {}", e.strerror()),
    }

    match await_event(&b.cq) {
        CqEvent::Data(c) => {
            assert_eq!(c.context, 11);
            assert!(c.flags.contains(Flags::RECV | Flags::MSG));
            assert_eq!(c.len, payload.len());
        }
        CqEvent::Err(e) => panic!("recv failed: {}", e.strerror()),
    }
    assert_eq!(&rxbuf[..payload.len()], payload);
}

#[test]
fn test_rma_write_delivery_complete() {
    let a = make_peer();
    let b = make_peer();
    let (a_to_b, _) = connect(&a, &b);

    let mut target = vec![0u8; 64];
    let mr = unsafe {
        b.domain
            .register(
                target.as_mut_ptr(),
                target.len(),
                Flags::RECV | Flags::REMOTE_WRITE,
                0,
            )
            .unwrap()
    };

    let lo = b"split";
    let hi = b" write";
    unsafe {
        a.ep.writemsg(
            &RmaMsgDesc {
                iov: &[
                    IoVec {
                        addr: lo.as_ptr() as u64,
                        len: lo.len(),
                    },
                    IoVec {
                        addr: hi.as_ptr() as u64,
                        len: hi.len(),
                    },
                ],
                desc: &[],
                addr: a_to_b,
                rma_iov: &[
                    RmaIoVec {
                        addr: 0,
                        len: 8,
                        key: mr.key(),
                    },
                    RmaIoVec {
                        addr: 32,
                        len: 8,
                        key: mr.key(),
                    },
                ],
                context: 33,
            },
            Flags::COMPLETION | Flags::DELIVERY_COMPLETE,
        )
        .unwrap();
    }

    // The writer's completion arrives only after the target side made
    // progress (placed the bytes and acknowledged).
    let deadline = Instant::now() + Duration::from_secs(5);
    let completion = loop {
        assert!(Instant::now() < deadline, "write never completed");
        let _ = b.cq.read().unwrap();
        if let Some(ev) = a.cq.read().unwrap() {
            break ev;
        }
        std::thread::yield_now();
    };

    match completion {
        CqEvent::Data(c) => {
            assert_eq!(c.context, 33);
            assert!(c.flags.contains(Flags::RMA | Flags::WRITE));
            assert_eq!(c.len, lo.len() + hi.len());
        }
        CqEvent::Err(e) => panic!("write failed: {}", e.strerror()),
    }

    assert_eq!(&target[..8], b"split wr");
    assert_eq!(&target[32..35], b"ite");
}

#[test]
fn test_write_to_unwritable_region_reports_error() {
    let a = make_peer();
    let b = make_peer();
    let (a_to_b, _) = connect(&a, &b);

    let mut target = vec![0u8; 16];
    let mr = unsafe {
        b.domain
            .register(target.as_mut_ptr(), target.len(), Flags::SEND, 0)
            .unwrap()
    };

    let data = b"nope";
    unsafe {
        a.ep.writemsg(
            &RmaMsgDesc {
                iov: &[IoVec {
                    addr: data.as_ptr() as u64,
                    len: data.len(),
                }],
                desc: &[],
                addr: a_to_b,
                rma_iov: &[RmaIoVec {
                    addr: 0,
                    len: 16,
                    key: mr.key(),
                }],
                context: 44,
            },
            Flags::COMPLETION | Flags::DELIVERY_COMPLETE,
        )
        .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let completion = loop {
        assert!(Instant::now() < deadline, "write never resolved");
        let _ = b.cq.read().unwrap();
        if let Some(ev) = a.cq.read().unwrap() {
            break ev;
        }
        std::thread::yield_now();
    };

    match completion {
        CqEvent::Err(e) => assert_eq!(e.context, 44),
        CqEvent::Data(_) => panic!("write into a send-only region should fail"),
    }
}

#[test]
fn test_cancel_reports_ecanceled() {
    let a = make_peer();

    let mut rxbuf = vec![0u8; 16];
    unsafe {
        a.ep.recvmsg(
            &MsgDesc {
                iov: &[IoVec {
                    addr: rxbuf.as_mut_ptr() as u64,
                    len: rxbuf.len(),
                }],
                desc: &[],
                addr: FiAddr::UNSPEC,
                context: 55,
            },
            Flags::COMPLETION,
        )
        .unwrap();
    }

    a.ep.cancel(55).unwrap();
    match await_event(&a.cq) {
        CqEvent::Err(e) => {
            assert_eq!(e.context, 55);
            assert!(e.is_canceled());
        }
        CqEvent::Data(_) => panic!("expected a cancellation entry"),
    }

    // Cancelling an unknown context is a no-op.
    a.ep.cancel(999).unwrap();
    assert!(a.cq.read().unwrap().is_none());
}
