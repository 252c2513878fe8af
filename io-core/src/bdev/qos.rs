//! Per-bdev QoS: four independent token buckets refilled on a fixed
//! timeslice by a poller on the owner thread. Quota accounting uses
//! relaxed atomics; an I/O may overrun a slice by at most its own cost,
//! and the overrun is carried into the next slice.

use std::convert::TryInto;
use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
    Weak,
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::{
    bdev::Bdev,
    channel::BdevChannel,
    io::{BdevIo, IoType},
};
use crate::core::{poller, CoreError, PollStatus, Runtime, Thread};

/// Accounting window; quotas refill on these boundaries.
pub const QOS_TIMESLICE_US: u64 = 1_000;
/// Smallest configurable IOPS rate; rates round up to a multiple.
pub const IOPS_RATE_MIN: u64 = 1_000;
/// Smallest configurable bandwidth rate in bytes/s.
pub const BPS_RATE_MIN: u64 = 1024 * 1024;
const MIN_IO_PER_TIMESLICE: u64 = 1;
const MIN_BYTES_PER_TIMESLICE: u64 = 512;

/// The four bucket kinds, in gate order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateLimitKind {
    /// Operations per second, reads and writes alike.
    RwIos,
    /// Bytes per second, reads and writes alike.
    RwBytes,
    /// Bytes per second, reads only.
    ReadBytes,
    /// Bytes per second, writes only.
    WriteBytes,
}

pub const RATE_LIMIT_KINDS: [RateLimitKind; 4] = [
    RateLimitKind::RwIos,
    RateLimitKind::RwBytes,
    RateLimitKind::ReadBytes,
    RateLimitKind::WriteBytes,
];

/// One token bucket.
pub struct QosLimit {
    kind: RateLimitKind,
    /// Configured rate; zero disables the bucket.
    limit_per_sec: u64,
    remaining_this_timeslice: AtomicI64,
    max_per_timeslice: u64,
}

impl QosLimit {
    fn new(kind: RateLimitKind, limit_per_sec: u64) -> Self {
        let min = match kind {
            RateLimitKind::RwIos => MIN_IO_PER_TIMESLICE,
            _ => MIN_BYTES_PER_TIMESLICE,
        };
        let max_per_timeslice = if limit_per_sec == 0 {
            0
        } else {
            (limit_per_sec * QOS_TIMESLICE_US / 1_000_000).max(min)
        };

        Self {
            kind,
            limit_per_sec,
            remaining_this_timeslice: AtomicI64::new(max_per_timeslice as i64),
            max_per_timeslice,
        }
    }

    pub fn enabled(&self) -> bool {
        self.limit_per_sec > 0
    }

    pub fn limit_per_sec(&self) -> u64 {
        self.limit_per_sec
    }

    /// Cost of an I/O against this bucket, or None when the I/O does not
    /// count here.
    fn cost(&self, io: &Arc<BdevIo>) -> Option<i64> {
        let io_type = io.io_type();
        let bytes = io.byte_count() as i64;

        // Zcopy is metered in its start phase only.
        let (counts_read, counts_write) = match io_type {
            IoType::Read => (true, false),
            IoType::Write => (false, true),
            IoType::Zcopy => {
                let ctx = io.ctx.lock();
                if !ctx.zcopy_start {
                    return None;
                }
                (ctx.zcopy_populate, !ctx.zcopy_populate)
            }
            IoType::NvmeIo | IoType::NvmeIoMd => (true, true),
            _ => return None,
        };

        match self.kind {
            RateLimitKind::RwIos => Some(1),
            RateLimitKind::RwBytes => Some(bytes),
            RateLimitKind::ReadBytes if counts_read && !counts_write => {
                Some(bytes)
            }
            RateLimitKind::WriteBytes if counts_write && !counts_read => {
                Some(bytes)
            }
            _ => None,
        }
    }

    /// Returns true when the I/O must be queued. The decrement happens
    /// optimistically with relaxed ordering and is rewound on rejection;
    /// the pre-value is what decides.
    fn queue_io(&self, cost: i64) -> bool {
        let old = self
            .remaining_this_timeslice
            .fetch_sub(cost, Ordering::Relaxed);
        if old > 0 {
            false
        } else {
            self.remaining_this_timeslice.fetch_add(cost, Ordering::Relaxed);
            true
        }
    }

    /// Give back quota a later bucket in the chain refused.
    fn rewind(&self, cost: i64) {
        self.remaining_this_timeslice.fetch_add(cost, Ordering::Relaxed);
    }

    /// Timeslice rollover: capture and zero the balance, carrying any
    /// overrun (negative balance) into the new slice.
    fn roll_timeslice(&self) {
        let old = self.remaining_this_timeslice.swap(0, Ordering::Relaxed);
        if old < 0 {
            self.remaining_this_timeslice.fetch_add(old, Ordering::Relaxed);
        }
    }

    fn refill(&self) {
        self.remaining_this_timeslice
            .fetch_add(self.max_per_timeslice as i64, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> i64 {
        self.remaining_this_timeslice.load(Ordering::Relaxed)
    }
}

struct QosOwner {
    thread: Option<Arc<Thread>>,
    poller: Option<poller::Poller>,
}

/// QoS state for one bdev.
pub struct Qos {
    bdev: Weak<Bdev>,
    limits: [QosLimit; 4],
    timeslice_ticks: u64,
    last_timeslice: AtomicU64,
    owner: Mutex<QosOwner>,
}

impl Qos {
    /// Build from user rates: IOPS as given, bandwidth in MB/s. Zero
    /// disables a kind; sub-minimum rates round up.
    pub fn build(
        rt: &Arc<Runtime>,
        bdev: &Arc<Bdev>,
        rates: [u64; 4],
    ) -> Arc<Qos> {
        let mut limits = Vec::with_capacity(4);
        for (i, kind) in RATE_LIMIT_KINDS.iter().enumerate() {
            let rate = match kind {
                RateLimitKind::RwIos => {
                    if rates[i] == 0 {
                        0
                    } else {
                        // Round up to a multiple of the minimum.
                        rates[i].div_ceil(IOPS_RATE_MIN) * IOPS_RATE_MIN
                    }
                }
                _ => {
                    // User units are megabytes per second.
                    let bytes = rates[i] * 1024 * 1024;
                    if bytes == 0 {
                        0
                    } else {
                        bytes.max(BPS_RATE_MIN)
                    }
                }
            };
            limits.push(QosLimit::new(*kind, rate));
        }
        let limits: [QosLimit; 4] = match limits.try_into() {
            Ok(l) => l,
            Err(_) => unreachable!(),
        };

        Arc::new(Qos {
            bdev: Arc::downgrade(bdev),
            limits,
            timeslice_ticks: rt.clock().us_to_ticks(QOS_TIMESLICE_US),
            last_timeslice: AtomicU64::new(rt.ticks()),
            owner: Mutex::new(QosOwner {
                thread: None,
                poller: None,
            }),
        })
    }

    pub fn limits(&self) -> &[QosLimit; 4] {
        &self.limits
    }

    pub fn enabled(&self) -> bool {
        self.limits.iter().any(|l| l.enabled())
    }

    /// The poller runs on whichever thread first touches the bdev after
    /// QoS was enabled.
    pub(crate) fn adopt_owner(self: &Arc<Self>, thread: &Arc<Thread>) {
        let mut owner = self.owner.lock();
        if owner.thread.is_some() {
            return;
        }
        owner.thread = Some(thread.clone());

        let qos = self.clone();
        owner.poller = Some(
            poller::Builder::new()
                .with_name("bdev_qos")
                .with_interval_us(QOS_TIMESLICE_US)
                .with_poll_fn(move || qos.poll_timeslice())
                .build(thread),
        );
        debug!(thread = thread.name(), "qos owner adopted");
    }

    pub(crate) fn owner_thread(&self) -> Option<Arc<Thread>> {
        self.owner.lock().thread.clone()
    }

    /// Run the gate chain in fixed order. On the first rejection, rewind
    /// everything already admitted and tell the caller to queue.
    pub(crate) fn try_admit(&self, io: &Arc<BdevIo>) -> bool {
        let mut admitted: [Option<i64>; 4] = [None; 4];

        for (i, limit) in self.limits.iter().enumerate() {
            if !limit.enabled() {
                continue;
            }
            let Some(cost) = limit.cost(io) else {
                continue;
            };
            if limit.queue_io(cost) {
                for (j, c) in admitted.iter().enumerate() {
                    if let Some(c) = c {
                        self.limits[j].rewind(*c);
                    }
                }
                return false;
            }
            admitted[i] = Some(cost);
        }
        true
    }

    /// Timeslice poller body: roll the buckets forward and drain queued
    /// I/O as far as the fresh quota allows.
    fn poll_timeslice(self: &Arc<Self>) -> PollStatus {
        let Some(bdev) = self.bdev.upgrade() else {
            return PollStatus::Idle;
        };
        let rt = bdev.runtime();
        let now = rt.ticks();
        let last = self.last_timeslice.load(Ordering::Relaxed);

        if now < last + self.timeslice_ticks {
            return PollStatus::Idle;
        }

        for limit in &self.limits {
            if limit.enabled() {
                limit.roll_timeslice();
            }
        }

        let mut new_last = last;
        while now >= new_last + self.timeslice_ticks {
            new_last += self.timeslice_ticks;
            for limit in &self.limits {
                if limit.enabled() {
                    limit.refill();
                }
            }
        }
        self.last_timeslice.store(new_last, Ordering::Relaxed);

        let mut busy = false;
        for (thread, chan) in bdev.channels() {
            busy |= self.drain_channel(&thread, &chan);
        }
        if busy {
            PollStatus::Busy
        } else {
            PollStatus::Idle
        }
    }

    /// Admit as many queued I/Os from one channel as quota permits,
    /// resuming each on its owning thread. Stops at the first refusal to
    /// preserve arrival order.
    fn drain_channel(
        &self,
        thread: &Arc<Thread>,
        chan: &Arc<BdevChannel>,
    ) -> bool {
        let mut any = false;
        loop {
            let Some(io) = chan.peek_qos_queue() else {
                break;
            };
            if !self.try_admit(&io) {
                break;
            }
            chan.pop_qos_queue();
            any = true;

            let chan2 = chan.clone();
            thread.send_msg(move || {
                super::channel::resume_past_qos(&chan2, &io);
            });
        }
        any
    }

    /// Tear down the poller on the owner thread and release queued I/O to
    /// the given continuation.
    pub(crate) fn quiesce(self: &Arc<Self>, done: impl FnOnce() + Send + 'static) {
        let owner = {
            let mut owner = self.owner.lock();
            owner.poller = None;
            owner.thread.take()
        };
        match owner {
            Some(t) => t.send_msg(done),
            None => done(),
        }
    }
}

/// Public entry: set or change the four rate limits. Passing all zeros
/// disables QoS. The completion runs once every channel observes the new
/// configuration.
pub fn set_qos_rate_limits(
    rt: &Arc<Runtime>,
    bdev: &Arc<Bdev>,
    rates: [u64; 4],
    cb: impl FnOnce(Result<(), CoreError>) + Send + 'static,
) {
    let enable = rates.iter().any(|r| *r > 0);
    let new_qos = if enable {
        Some(Qos::build(rt, bdev, rates))
    } else {
        None
    };

    // Swap under the bdev lock; the old instance is quiesced on its owner
    // thread after the channels have moved on.
    let old = {
        let mut inner = bdev.inner.lock();
        std::mem::replace(&mut inner.qos, new_qos.clone())
    };

    info!(bdev = bdev.name(), enable, "qos reconfigured");

    let origin = match Thread::current() {
        Some(t) => t,
        None => {
            // Configuration from outside the engine: apply lazily via
            // channel creation only.
            if let Some(old) = old {
                old.quiesce(|| {});
            }
            cb(Ok(()));
            return;
        }
    };

    let bdev2 = bdev.clone();
    let new2 = new_qos.clone();
    crate::core::thread::for_each(
        origin,
        bdev.channels(),
        move |chan, cont| {
            chan.set_qos(new2.clone());
            cont.done(0);
        },
        move |_| {
            // Adopt an owner for the new instance if channels exist.
            if let Some(qos) = &new_qos {
                if let Some((thread, _)) = bdev2.channels().first() {
                    qos.adopt_owner(thread);
                }
            }
            match old {
                Some(old) => {
                    let released = drain_all_queued(&bdev2, &old);
                    old.quiesce(move || {
                        for (thread, chan, io) in released {
                            let chan2 = chan.clone();
                            thread.send_msg(move || {
                                super::channel::resume_past_qos(&chan2, &io);
                            });
                        }
                        cb(Ok(()));
                    });
                }
                None => cb(Ok(())),
            }
        },
    );
}

type Queued = Vec<(Arc<Thread>, Arc<BdevChannel>, Arc<BdevIo>)>;

/// Strip every channel's QoS queue for requeueing after a swap.
fn drain_all_queued(bdev: &Arc<Bdev>, _old: &Arc<Qos>) -> Queued {
    let mut out = Vec::new();
    for (thread, chan) in bdev.channels() {
        while let Some(io) = chan.pop_qos_queue() {
            out.push((thread.clone(), chan.clone(), io));
        }
    }
    out
}
