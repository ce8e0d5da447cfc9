//! Worker pool.
//!
//! A bounded pool of threads multiplexes sessions onto completion-queue
//! polling. Each worker owns two independent halves — a try-locked mutex, a
//! poll set, and 32 session slots — so a non-worker thread can assign a new
//! session to one half while the worker drains the other. Idle workers park
//! on a condition variable; the pool grows on demand up to
//! [`WORKERS_MAX`].

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use fabric::{Flags, PollSet};
use tracing::{trace, warn};

use crate::buffer::{next_payload_len, Buf, BufList};
use crate::keys::KeySource;
use crate::session::{LoopControl, Session};
use crate::signal::with_signals_blocked;
use crate::Runtime;

/// Session slots per worker.
pub const WORKER_SESSIONS_MAX: usize = 64;
/// Workers per pool.
pub const WORKERS_MAX: usize = 128;
/// Sessions per pool.
pub const SESSIONS_MAX: usize = WORKER_SESSIONS_MAX * WORKERS_MAX;

const HALF_SESSIONS: usize = WORKER_SESSIONS_MAX / 2;
const PAYBUF_POOL_SIZE: usize = 16;

/// Access rights for payload buffers that receive RDMA writes.
pub const PAYLOAD_RX_ACCESS: Flags = Flags::RECV.union(Flags::REMOTE_WRITE);
/// Access rights for payload buffers RDMA writes are read from.
pub const PAYLOAD_TX_ACCESS: Flags = Flags::SEND;

/// Q8.8 fixed-point exponentially-weighted average of completion queues
/// serviced per pass. Computed for scheduling hints; the assignment policy
/// does not consult it yet.
struct LoadAvg {
    average: AtomicU16,
}

#[derive(Default)]
struct LoadCounters {
    loops_since_mark: u16,
    ctxs_serviced: u32,
}

impl LoadAvg {
    fn new() -> Self {
        Self {
            average: AtomicU16::new(0),
        }
    }

    /// Fold one pass into the average. When `loops_since_mark` saturates,
    /// `average := (average + 256·ctxs/(UINT16_MAX+1)) / 2` and the
    /// counters reset.
    fn mark(&self, c: &mut LoadCounters, serviced: usize) {
        if c.loops_since_mark == u16::MAX {
            let avg = self.average.load(Ordering::Relaxed) as u32;
            let update = (avg + 256 * c.ctxs_serviced / (u16::MAX as u32 + 1)) / 2;
            self.average.store(update as u16, Ordering::Relaxed);
            c.loops_since_mark = 0;
            c.ctxs_serviced = 0;
        } else {
            c.loops_since_mark += 1;
            c.ctxs_serviced = c.ctxs_serviced.saturating_add(serviced as u32);
        }
    }
}

struct HalfState {
    pollset: PollSet,
    slots: [Option<Session>; HALF_SESSIONS],
}

struct WorkerHalf {
    mtx: Mutex<HalfState>,
    nsessions: AtomicUsize,
}

/// Reservoirs of free payload buffers, refilled lazily in the
/// deterministic size cycle.
struct PayBufs {
    tx: BufList,
    rx: BufList,
    keys: KeySource,
    last_tx_len: usize,
    last_rx_len: usize,
}

/// One pool worker.
pub struct Worker {
    idx: usize,
    halves: [WorkerHalf; 2],
    sleep: Condvar,
    cancelled: AtomicBool,
    failed: AtomicBool,
    avg: LoadAvg,
    paybufs: Mutex<PayBufs>,
    rt: Arc<Runtime>,
}

impl Worker {
    fn new(idx: usize, rt: Arc<Runtime>) -> Self {
        let halves = std::array::from_fn(|_| WorkerHalf {
            mtx: Mutex::new(HalfState {
                pollset: PollSet::open(&rt.domain).expect("poll set open failed"),
                slots: std::array::from_fn(|_| None),
            }),
            nsessions: AtomicUsize::new(0),
        });
        Self {
            idx,
            halves,
            sleep: Condvar::new(),
            cancelled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            avg: LoadAvg::new(),
            paybufs: Mutex::new(PayBufs {
                tx: BufList::new(PAYBUF_POOL_SIZE),
                rx: BufList::new(PAYBUF_POOL_SIZE),
                keys: KeySource::new(),
                last_tx_len: 0,
                last_rx_len: 0,
            }),
            rt,
        }
    }

    /// Load average in Q8.8 fixed point.
    pub fn load_average(&self) -> u16 {
        self.avg.average.load(Ordering::Relaxed)
    }

    /// Top the free list back up to half capacity, cycling payload sizes.
    /// In static-registration mode each new buffer is registered here.
    fn replenish(
        rt: &Runtime,
        keys: &mut KeySource,
        last_len: &mut usize,
        access: Flags,
        bl: &mut BufList,
    ) -> bool {
        if bl.len() >= bl.capacity() / 2 {
            return true;
        }
        while bl.len() < bl.capacity() / 2 {
            *last_len = next_payload_len(*last_len);
            let mut buf = Buf::alloc_bytes(*last_len);
            if !rt.reregister {
                let base = buf.data_base() as *mut u8;
                let nalloc = buf.hdr().nallocated;
                // Safety: payload bytes live inside the boxed buffer, which
                // outlives the registration it carries.
                let mr = match unsafe { rt.domain.register(base, nalloc, access, keys.next()) } {
                    Ok(mr) => mr,
                    Err(e) => {
                        warn!(target: "paybuflist", error = %e, "payload registration failed");
                        break;
                    }
                };
                let hdr = buf.hdr_mut();
                hdr.desc = mr.desc();
                hdr.mr = Some(mr);
            }
            trace!(target: "paybuflist", len = *last_len, "pushing payload buffer");
            bl.put(buf).ok().expect("replenish overfilled the free list");
        }
        !bl.is_empty()
    }

    /// A free payload buffer for the transmit direction.
    pub fn payload_txbuf_get(&self) -> Option<Box<Buf>> {
        let mut pb = self.paybufs.lock().unwrap();
        let PayBufs {
            tx,
            keys,
            last_tx_len,
            ..
        } = &mut *pb;
        loop {
            if let Some(b) = tx.get() {
                trace!(target: "paybuf", len = b.hdr().nallocated, "tx payload buffer");
                return Some(b);
            }
            if !Self::replenish(&self.rt, keys, last_tx_len, PAYLOAD_TX_ACCESS, tx) {
                return None;
            }
        }
    }

    /// A free payload buffer for the receive direction.
    pub fn payload_rxbuf_get(&self) -> Option<Box<Buf>> {
        let mut pb = self.paybufs.lock().unwrap();
        let PayBufs {
            rx,
            keys,
            last_rx_len,
            ..
        } = &mut *pb;
        loop {
            if let Some(b) = rx.get() {
                trace!(target: "paybuf", len = b.hdr().nallocated, "rx payload buffer");
                return Some(b);
            }
            if !Self::replenish(&self.rt, keys, last_rx_len, PAYLOAD_RX_ACCESS, rx) {
                return None;
            }
        }
    }

    /// Place a session into the first free slot of an uncontended half.
    fn assign_session(&self, s: Session) -> std::result::Result<(), Session> {
        let mut s = Some(s);
        for half in &self.halves {
            let Ok(mut hs) = half.mtx.try_lock() else {
                continue;
            };
            let hs = &mut *hs;
            for slot in hs.slots.iter_mut() {
                if slot.is_some() {
                    continue;
                }
                let sess = s.take().expect("session consumed twice");
                if let Err(e) = hs.pollset.add(sess.cq()) {
                    warn!(target: "err", error = %e, "poll set add failed");
                    s = Some(sess);
                    continue;
                }
                half.nsessions.fetch_add(1, Ordering::Relaxed);
                *slot = Some(sess);
                return Ok(());
            }
        }
        Err(s.take().expect("session consumed twice"))
    }

    /// One pass: for each uncontended half, poll its completion queues and
    /// step every session once. After the loop call, continue at the next
    /// session slot unless the session ended or failed, in which case it is
    /// removed (and a failure recorded).
    fn run_loop(&self, counters: &mut LoadCounters) {
        let mut serviced = 0usize;

        for half in &self.halves {
            let Ok(mut hs) = half.mtx.try_lock() else {
                continue;
            };
            let hs = &mut *hs;

            match hs.pollset.poll() {
                Ok(n) => serviced += n,
                Err(e) => panic!("poll set poll failed: {}", e),
            }

            for slot in hs.slots.iter_mut() {
                let Some(sess) = slot.as_mut() else {
                    continue;
                };
                let ctl = sess.step(self);
                if ctl == LoopControl::Continue {
                    continue;
                }
                if ctl == LoopControl::Error {
                    self.failed.store(true, Ordering::Relaxed);
                }
                let s = slot.take().expect("stepped session vanished");
                if let Err(e) = hs.pollset.del(s.cq()) {
                    warn!(target: "err", error = %e, "poll set del failed");
                }
                half.nsessions.fetch_sub(1, Ordering::Relaxed);
            }
        }

        self.avg.mark(counters, serviced);
    }

    /// Whether this worker has no sessions and is the last running worker.
    /// On success the worker has already left the running set.
    fn is_idle(&self, pool: &WorkerPool) -> bool {
        if self.halves[0].nsessions.load(Ordering::Relaxed) != 0
            || self.halves[1].nsessions.load(Ordering::Relaxed) != 0
        {
            return false;
        }

        let Ok(mut st) = pool.mtx.try_lock() else {
            return false;
        };
        if self.idx + 1 != st.nrunning {
            return false;
        }
        let Ok(_h0) = self.halves[0].mtx.try_lock() else {
            return false;
        };
        let Ok(_h1) = self.halves[1].mtx.try_lock() else {
            return false;
        };

        let idle = self.halves[0].nsessions.load(Ordering::Relaxed) == 0
            && self.halves[1].nsessions.load(Ordering::Relaxed) == 0
            && self.idx + 1 == st.nrunning;
        if idle {
            st.nrunning -= 1;
            pool.nworkers_cond.notify_one();
        }
        idle
    }
}

fn worker_main(pool: Arc<WorkerPool>, me: Arc<Worker>) {
    let mut counters = LoadCounters::default();

    while !me.cancelled.load(Ordering::Relaxed) {
        {
            let mut st = pool.mtx.lock().unwrap();
            while st.nrunning <= me.idx && !me.cancelled.load(Ordering::Relaxed) {
                st = me.sleep.wait(st).unwrap();
            }
        }
        loop {
            me.run_loop(&mut counters);
            if me.is_idle(&pool) || me.cancelled.load(Ordering::Relaxed) {
                break;
            }
        }
    }
}

struct PoolState {
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
    nrunning: usize,
    suspended: bool,
}

/// The pool of workers serving one process.
pub struct WorkerPool {
    mtx: Mutex<PoolState>,
    nworkers_cond: Condvar,
    rt: Arc<Runtime>,
}

impl WorkerPool {
    pub fn new(rt: Arc<Runtime>) -> Arc<Self> {
        Arc::new(Self {
            mtx: Mutex::new(PoolState {
                workers: Vec::new(),
                handles: Vec::new(),
                nrunning: 0,
                suspended: false,
            }),
            nworkers_cond: Condvar::new(),
            rt,
        })
    }

    /// Hand a session to a worker: first every running worker from the
    /// most-recently-started backward (later workers are assumed least
    /// loaded), then the first idle worker (waking it), then a freshly
    /// created worker. Refuses when assignment is suspended or the pool is
    /// full, handing the session back.
    pub fn assign_session(self: &Arc<Self>, s: Session) -> std::result::Result<(), Session> {
        let mut s = s;
        loop {
            {
                let mut st = self.mtx.lock().unwrap();
                if st.suspended {
                    return Err(s);
                }

                let mut iplus1 = st.nrunning;
                while iplus1 > 0 {
                    iplus1 -= 1;
                    s = match st.workers[iplus1].assign_session(s) {
                        Ok(()) => return Ok(()),
                        Err(back) => back,
                    };
                }

                if st.nrunning < st.workers.len() {
                    let w = st.workers[st.nrunning].clone();
                    s = match w.assign_session(s) {
                        Ok(()) => {
                            st.nrunning += 1;
                            w.sleep.notify_one();
                            return Ok(());
                        }
                        Err(back) => back,
                    };
                }
            }

            if !self.create_worker() {
                return Err(s);
            }
        }
    }

    /// Allocate and launch one more worker; false when the pool is full.
    /// The new worker starts idle and is picked up by the next assignment
    /// pass. The launch inherits a mask with the cancellation signals
    /// blocked, so they are only delivered to the main thread.
    fn create_worker(self: &Arc<Self>) -> bool {
        let w = {
            let mut st = self.mtx.lock().unwrap();
            if st.workers.len() >= WORKERS_MAX {
                return false;
            }
            let w = Arc::new(Worker::new(st.workers.len(), self.rt.clone()));
            st.workers.push(w.clone());
            w
        };

        let pool = self.clone();
        let handle = with_signals_blocked(|| {
            std::thread::Builder::new()
                .name(format!("worker-{}", w.idx))
                .spawn(move || worker_main(pool, w))
                .expect("worker thread spawn failed")
        });
        self.mtx.lock().unwrap().handles.push(handle);
        true
    }

    /// Suspend assignment, wait for every worker to go idle, cancel and
    /// join them all. True when no worker recorded a failure.
    pub fn join_all(&self) -> bool {
        {
            let mut st = self.mtx.lock().unwrap();
            st.suspended = true;
            while st.nrunning > 0 {
                st = self.nworkers_cond.wait(st).unwrap();
            }
            for w in &st.workers {
                w.cancelled.store(true, Ordering::Relaxed);
                w.sleep.notify_one();
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut st = self.mtx.lock().unwrap();
            st.handles.drain(..).collect()
        };

        let mut ok = true;
        for h in handles {
            if h.join().is_err() {
                ok = false;
            }
        }

        let st = self.mtx.lock().unwrap();
        for w in &st.workers {
            if w.failed.load(Ordering::Relaxed) {
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::CancelToken;
    use fabric::{getinfo, version, Fabric, GetInfoFlags, Hints};

    fn test_runtime(reregister: bool) -> Arc<Runtime> {
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
        Arc::new(Runtime {
            fabric,
            domain,
            mr_maxsegs: 1,
            rx_maxsegs: 1,
            tx_maxsegs: 1,
            rma_maxsegs: info.tx_attr.rma_iov_limit,
            info,
            reregister,
            contiguous: false,
            repeats: 1,
            echo: false,
            handshake_timeout: None,
            cancel: CancelToken::new(),
        })
    }

    #[test]
    fn test_join_all_with_no_sessions() {
        let pool = WorkerPool::new(test_runtime(false));
        assert!(pool.join_all());
    }

    #[test]
    fn test_paybuf_size_cycle_and_registration() {
        let w = Worker::new(0, test_runtime(false));
        let lens: Vec<usize> = (0..5)
            .map(|_| {
                let b = w.payload_rxbuf_get().expect("no rx buffer");
                assert!(b.hdr().mr.is_some(), "static mode registers up front");
                b.hdr().nallocated
            })
            .collect();
        assert_eq!(lens, vec![37, 31, 29, 23, 37]);
    }

    #[test]
    fn test_paybuf_reregister_mode_defers_registration() {
        let w = Worker::new(0, test_runtime(true));
        let b = w.payload_txbuf_get().expect("no tx buffer");
        assert!(b.hdr().mr.is_none());
    }

    #[test]
    fn test_load_average_update() {
        let avg = LoadAvg::new();
        let mut c = LoadCounters {
            loops_since_mark: u16::MAX,
            ctxs_serviced: 2 * (u16::MAX as u32 + 1),
        };
        // average := (0 + 256·ctxs/65536) / 2 = 256
        avg.mark(&mut c, 0);
        assert_eq!(avg.average.load(Ordering::Relaxed), 256);
        assert_eq!(c.loops_since_mark, 0);
        assert_eq!(c.ctxs_serviced, 0);

        // below the mark, counters just accumulate
        avg.mark(&mut c, 3);
        assert_eq!(c.loops_since_mark, 1);
        assert_eq!(c.ctxs_serviced, 3);
        assert_eq!(avg.average.load(Ordering::Relaxed), 256);
    }
}
