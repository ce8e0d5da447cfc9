//! Connection bring-up for the two personalities.
//!
//! `fget` (the receiver) listens for a peer's initial message, answers with
//! an ack naming its session endpoint, and hands the session to the worker
//! pool. `fput` (the transmitter) builds its session around the bootstrap
//! peer address; its state machine performs the initial/ack exchange on
//! the first worker pass. Both return the process exit code after joining
//! the pool.

use std::sync::Arc;
use std::time::Duration;

use fabric::av::encode_name;
use fabric::{
    getinfo, version, AddressVector, CompletionQueue, CqAttr, CqEvent, Endpoint, EqAttr,
    EventQueue, Fabric, FiAddr, Flags, GetInfoFlags, Hints, MrMode, MsgDesc,
};
use tracing::debug;

use crate::ctl::DESIRED_RX_FLAGS;
use crate::error::{Error, Result};
use crate::keys::KeySource;
use crate::memreg::{fibonacci_iov_setup, mr_regv_all};
use crate::message::{
    decode_initial, encode_ack, encode_initial, AckMsg, InitialMsg, ACK_MSG_SIZE, INITIAL_MSG_SIZE,
};
use crate::rcvr::Receiver;
use crate::session::{Cxn, CxnCore, Session};
use crate::signal::CancelToken;
use crate::terminal::{Sink, Source, Terminal, DEFAULT_REPEATS};
use crate::worker::WorkerPool;
use crate::xmtr::{Staged, Transmitter};
use crate::{Runtime, SERVICE_NAME};

/// Which end of the transfer this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    Get,
    Put,
}

/// Run options, normally filled from the command line.
pub struct Options {
    /// Address to bind (receiver).
    pub bind: Option<String>,
    /// Peer to connect to (transmitter).
    pub peer: Option<String>,
    /// Service name to rendezvous on.
    pub service: String,
    /// Re-register payload regions on every transfer.
    pub reregister: bool,
    /// Restrict RMA writes to one remote segment (transmitter).
    pub contiguous: bool,
    /// Reference-text repetitions to move.
    pub repeats: usize,
    /// Echo the stream to stdout.
    pub echo: bool,
    /// Bring-up deadline; `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Cancellation flag the run polls.
    pub cancel: CancelToken,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bind: None,
            peer: None,
            service: SERVICE_NAME.to_string(),
            reregister: false,
            contiguous: false,
            repeats: DEFAULT_REPEATS,
            echo: true,
            handshake_timeout: Some(Duration::from_secs(10)),
            cancel: CancelToken::new(),
        }
    }
}

fn transfer_hints() -> Hints {
    Hints {
        caps: Flags::MSG | Flags::RMA | Flags::REMOTE_WRITE | Flags::WRITE,
        mr_mode: MrMode::PROV_KEY,
        dest_name: None,
    }
}

const CQ_DEPTH: usize = 128;
const EQ_DEPTH: usize = 128;

/// Discover the fabric and build the per-run state.
pub fn setup(personality: Personality, opts: Options) -> Result<Arc<Runtime>> {
    let (node, flags) = match personality {
        Personality::Get => (opts.bind.as_deref(), GetInfoFlags::SOURCE),
        Personality::Put => (opts.peer.as_deref(), GetInfoFlags::empty()),
    };

    let info = getinfo(
        version(1, 13),
        node,
        Some(&opts.service),
        flags,
        &transfer_hints(),
    )
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::Unsupported {
            debug!(target: "err", "capabilities not available?");
        }
        Error::Fabric(e)
    })?;

    let fabric = Fabric::new(&info).map_err(Error::Fabric)?;
    let domain = fabric.domain(&info).map_err(Error::Fabric)?;

    debug!(
        target: "params",
        provider = info.provider_name,
        mr_iov_limit = info.domain_attr.mr_iov_limit,
        "memory-registration I/O vector limit"
    );
    debug!(
        target: "params",
        rx = info.rx_attr.iov_limit,
        tx = info.tx_attr.iov_limit,
        rma = info.tx_attr.rma_iov_limit,
        "I/O vector limits"
    );

    if info.domain_attr.mr_mode.contains(MrMode::VIRT_ADDR) {
        debug!(
            target: "params",
            "provider RDMA uses virtual addresses instead of offsets, quitting"
        );
        return Err(Error::Protocol(
            "provider RDMA uses virtual addresses instead of offsets",
        ));
    }

    // One segment everywhere except RMA, which follows the provider limit
    // unless contiguous mode pins it to 1.
    let rma_maxsegs = if opts.contiguous {
        1
    } else {
        info.tx_attr.rma_iov_limit
    };

    Ok(Arc::new(Runtime {
        fabric,
        domain,
        mr_maxsegs: 1,
        rx_maxsegs: 1,
        tx_maxsegs: 1,
        rma_maxsegs,
        info,
        reregister: opts.reregister,
        contiguous: opts.contiguous,
        repeats: opts.repeats,
        echo: opts.echo,
        handshake_timeout: opts.handshake_timeout,
        cancel: opts.cancel,
    }))
}

/// Receiver personality: listen, handshake, hand off, join.
pub fn run_get(rt: &Arc<Runtime>) -> Result<i32> {
    let av = AddressVector::open();
    let cq_attr = CqAttr { size: CQ_DEPTH };
    let eq_attr = EqAttr { size: EQ_DEPTH };
    let mut keys = KeySource::new();

    let listen_eq = EventQueue::open(&rt.fabric, &eq_attr).map_err(Error::Fabric)?;
    let listen_cq = CompletionQueue::open(&rt.domain, &cq_attr).map_err(Error::Fabric)?;
    let listen_ep = Endpoint::new(&rt.domain, &rt.info).map_err(Error::Fabric)?;
    listen_ep
        .bind_cq(
            &listen_cq,
            Flags::SELECTIVE_COMPLETION | Flags::RECV | Flags::TRANSMIT,
        )
        .map_err(Error::Fabric)?;
    listen_ep.bind_eq(&listen_eq).map_err(Error::Fabric)?;
    listen_ep.bind_av(&av).map_err(Error::Fabric)?;
    listen_ep.enable().map_err(Error::Fabric)?;

    // Stage and post the initial-message receive.
    let mut initial_buf = Box::new([0u8; INITIAL_MSG_SIZE]);
    let initial_iovs =
        fibonacci_iov_setup(initial_buf.as_mut_ptr(), INITIAL_MSG_SIZE, rt.rx_maxsegs);
    if initial_iovs.is_empty() {
        return Err(Error::Exhausted("unexpected I/O vector length"));
    }
    // Safety: the staging buffer outlives the posted receive.
    let initial_reg = unsafe {
        mr_regv_all(
            &rt.domain,
            &initial_iovs,
            2.min(rt.mr_maxsegs),
            Flags::RECV,
            &mut keys,
        )
    }
    .map_err(Error::Fabric)?;
    unsafe {
        listen_ep
            .recvmsg(
                &MsgDesc {
                    iov: &initial_iovs,
                    desc: &initial_reg.descs,
                    addr: FiAddr::UNSPEC,
                    context: 0,
                },
                Flags::COMPLETION,
            )
            .map_err(Error::Fabric)?;
    }

    // Await the initial message for as long as it takes; only a signal (or
    // a cancelled run) lifts the wait.
    let ev = loop {
        match listen_cq.sread(Some(Duration::from_millis(100))) {
            Ok(Some(ev)) => break ev,
            Ok(None) => {
                if rt.cancel.is_set() {
                    debug!(target: "signal", "caught a signal, exiting");
                    return Err(Error::Cancelled);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                debug!(target: "signal", "completion wait interrupted");
                if rt.cancel.is_set() {
                    debug!(target: "signal", "caught a signal, exiting");
                    return Err(Error::Cancelled);
                }
            }
            Err(e) => return Err(Error::Fabric(e)),
        }
    };

    let cmpl = match ev {
        CqEvent::Data(c) => c,
        CqEvent::Err(_) => return Err(Error::Protocol("initial message reception failed")),
    };
    if !cmpl.flags.contains(DESIRED_RX_FLAGS) {
        return Err(Error::Protocol("unexpected completion flags on the initial message"));
    }
    if cmpl.len != INITIAL_MSG_SIZE {
        return Err(Error::Protocol("initial message has the wrong size"));
    }
    let initial = decode_initial(&initial_buf[..])?;
    if initial.nsources != 1 || initial.id != 0 {
        return Err(Error::Protocol("unsupported nsources/id in the initial message"));
    }

    let peer = av.insert(&initial.addr).map_err(Error::Fabric)?;

    // Session endpoint toward the peer the initial message named.
    let ep_hints = Hints {
        dest_name: Some(initial.addr[..initial.addrlen as usize].to_vec()),
        ..transfer_hints()
    };
    let ep_info = getinfo(version(1, 13), None, None, GetInfoFlags::empty(), &ep_hints)
        .map_err(Error::Fabric)?;
    let cxn_eq = EventQueue::open(&rt.fabric, &eq_attr).map_err(Error::Fabric)?;
    let cxn_cq = CompletionQueue::open(&rt.domain, &cq_attr).map_err(Error::Fabric)?;
    let ep = Endpoint::new(&rt.domain, &ep_info).map_err(Error::Fabric)?;
    ep.bind_eq(&cxn_eq).map_err(Error::Fabric)?;
    ep.bind_cq(
        &cxn_cq,
        Flags::SELECTIVE_COMPLETION | Flags::RECV | Flags::TRANSMIT,
    )
    .map_err(Error::Fabric)?;
    ep.bind_av(&av).map_err(Error::Fabric)?;
    ep.enable().map_err(Error::Fabric)?;

    // Answer with an ack naming the session endpoint.
    let name = ep.getname().map_err(Error::Fabric)?;
    let mut ack_buf = Box::new([0u8; ACK_MSG_SIZE]);
    encode_ack(&AckMsg::new(&name), &mut ack_buf);
    let ack_iovs = fibonacci_iov_setup(ack_buf.as_mut_ptr(), ACK_MSG_SIZE, rt.rx_maxsegs);
    if ack_iovs.is_empty() {
        return Err(Error::Exhausted("unexpected I/O vector length"));
    }
    // Safety: the staging buffer outlives the send.
    let ack_reg = unsafe {
        mr_regv_all(
            &rt.domain,
            &ack_iovs,
            2.min(rt.mr_maxsegs),
            Flags::SEND,
            &mut keys,
        )
    }
    .map_err(Error::Fabric)?;
    loop {
        let rc = unsafe {
            ep.sendmsg(
                &MsgDesc {
                    iov: &ack_iovs,
                    desc: &ack_reg.descs,
                    addr: peer,
                    context: 0,
                },
                Flags::empty(),
            )
        };
        match rc {
            Ok(()) => break,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                match cxn_cq.read().map_err(Error::Fabric)? {
                    None => continue,
                    Some(_) => {
                        return Err(Error::Protocol("completion arrived before the ack went out"))
                    }
                }
            }
            Err(e) => return Err(Error::Fabric(e)),
        }
    }

    let core = CxnCore::new(ep, cxn_eq, cxn_cq, av, peer);
    let rcvr = Receiver::new(rt.clone(), core);
    let sink = Sink::new(rt.repeats, rt.echo);
    let session = Session::new(Cxn::Rcvr(Box::new(rcvr)), Terminal::Sink(sink));

    let pool = WorkerPool::new(rt.clone());
    if pool.assign_session(session).is_err() {
        return Err(Error::Exhausted("could not assign the receiver to a worker"));
    }
    Ok(if pool.join_all() { 0 } else { 1 })
}

/// Transmitter personality: build the bootstrap connection, hand off, join.
/// The handshake itself runs on the worker's first pass.
pub fn run_put(rt: &Arc<Runtime>) -> Result<i32> {
    let av = AddressVector::open();
    let cq = CompletionQueue::open(&rt.domain, &CqAttr { size: CQ_DEPTH }).map_err(Error::Fabric)?;
    let eq = EventQueue::open(&rt.fabric, &EqAttr { size: EQ_DEPTH }).map_err(Error::Fabric)?;
    let ep = Endpoint::new(&rt.domain, &rt.info).map_err(Error::Fabric)?;
    ep.bind_eq(&eq).map_err(Error::Fabric)?;
    ep.bind_cq(
        &cq,
        Flags::SELECTIVE_COMPLETION | Flags::RECV | Flags::TRANSMIT,
    )
    .map_err(Error::Fabric)?;
    ep.bind_av(&av).map_err(Error::Fabric)?;
    ep.enable().map_err(Error::Fabric)?;

    let dest = rt
        .info
        .dest_addr
        .ok_or(Error::Protocol("no destination address resolved"))?;
    let peer = av.insert(&encode_name(dest)).map_err(Error::Fabric)?;

    let mut keys = KeySource::new();

    let name = ep.getname().map_err(Error::Fabric)?;
    let mut initial_buf = vec![0u8; INITIAL_MSG_SIZE].into_boxed_slice();
    {
        let arr: &mut [u8; INITIAL_MSG_SIZE] = (&mut *initial_buf).try_into().unwrap();
        encode_initial(&InitialMsg::new(&name), arr);
    }
    let initial = Staged::new(&rt.domain, initial_buf, Flags::SEND, keys.next())
        .map_err(Error::Fabric)?;
    let ack = Staged::new(
        &rt.domain,
        vec![0u8; ACK_MSG_SIZE].into_boxed_slice(),
        Flags::RECV,
        keys.next(),
    )
    .map_err(Error::Fabric)?;

    let core = CxnCore::new(ep, eq, cq, av, peer);
    let xmtr = Transmitter::new(rt.clone(), core, initial, ack);
    let source = Source::new(rt.repeats, rt.echo);
    let session = Session::new(Cxn::Xmtr(Box::new(xmtr)), Terminal::Source(source));

    let pool = WorkerPool::new(rt.clone());
    if pool.assign_session(session).is_err() {
        return Err(Error::Exhausted(
            "could not assign the transmitter to a worker",
        ));
    }
    Ok(if pool.join_all() { 0 } else { 1 })
}
