//! LBA range locks. A master range lives on the bdev; each channel holds
//! a local copy and parks conflicting I/O on its locked list until the
//! range is released. Quiescing ranges additionally block reads.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::{bdev::Bdev, channel::BdevChannel};
use crate::core::{poller, thread::for_each, PollStatus, Thread};

type LockCb = Box<dyn FnOnce(i32) + Send>;

/// A locked LBA range.
pub struct LbaRange {
    pub offset: u64,
    pub length: u64,
    pub(crate) owner_thread_id: u64,
    pub(crate) owner_channel: Weak<BdevChannel>,
    /// Token identifying the lock holder; I/O submitted with the same
    /// context on the owner channel bypasses the lock.
    pub(crate) ctx: u64,
    pub(crate) quiesce: bool,
    /// Armed while the range waits behind a conflicting holder.
    pending: Mutex<Option<(LockCb, Arc<Thread>)>>,
}

impl std::fmt::Debug for LbaRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LbaRange")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("quiesce", &self.quiesce)
            .finish()
    }
}

/// Half-open interval intersection.
pub(crate) fn ranges_overlap(o1: u64, l1: u64, o2: u64, l2: u64) -> bool {
    o1 < o2 + l2 && o2 < o1 + l1
}

impl LbaRange {
    pub(crate) fn overlaps(&self, offset: u64, length: u64) -> bool {
        ranges_overlap(self.offset, self.length, offset, length)
    }
}

/// Acquire a range lock. The callback fires once every channel holds a
/// local copy and has no conflicting I/O outstanding. Overlapping
/// acquisitions queue behind the current holder and start automatically
/// on unlock.
pub fn lock_lba_range(
    bdev: &Arc<Bdev>,
    channel: Option<&Arc<BdevChannel>>,
    offset: u64,
    length: u64,
    ctx: u64,
    cb: impl FnOnce(i32) + Send + 'static,
) {
    lock_range_inner(bdev, channel, offset, length, ctx, false, cb)
}

/// Pause a range entirely: like a lock but reads are held back too.
pub fn quiesce_range(
    bdev: &Arc<Bdev>,
    offset: u64,
    length: u64,
    ctx: u64,
    cb: impl FnOnce(i32) + Send + 'static,
) {
    lock_range_inner(bdev, None, offset, length, ctx, true, cb)
}

fn lock_range_inner(
    bdev: &Arc<Bdev>,
    channel: Option<&Arc<BdevChannel>>,
    offset: u64,
    length: u64,
    ctx: u64,
    quiesce: bool,
    cb: impl FnOnce(i32) + Send + 'static,
) {
    let origin =
        Thread::current().expect("range locks are taken on engine threads");

    let range = Arc::new(LbaRange {
        offset,
        length,
        owner_thread_id: origin.id(),
        owner_channel: channel.map(Arc::downgrade).unwrap_or_default(),
        ctx,
        quiesce,
        pending: Mutex::new(None),
    });

    let start_now = {
        let mut inner = bdev.inner.lock();
        let conflict = inner
            .locked_ranges
            .iter()
            .any(|r| r.overlaps(offset, length));
        if conflict {
            inner.pending_locked_ranges.push(range.clone());
            false
        } else {
            inner.locked_ranges.push(range.clone());
            true
        }
    };

    if start_now {
        propagate_lock(bdev, &range, origin, cb);
    } else {
        debug!(?range, "range lock queued behind holder");
        *range.pending.lock() = Some((Box::new(cb), origin));
    }
}

/// Fan the range out to every channel; each inserts its copy, then polls
/// until no conflicting I/O remains outstanding on that channel.
fn propagate_lock(
    bdev: &Arc<Bdev>,
    range: &Arc<LbaRange>,
    origin: Arc<Thread>,
    cb: impl FnOnce(i32) + Send + 'static,
) {
    let range2 = range.clone();

    for_each(
        origin,
        bdev.channels(),
        move |chan, cont| {
            chan.add_locked_range(&range2);

            if !chan.has_conflicting_outstanding(&range2) {
                cont.done(0);
                return;
            }

            // Park the iterator behind a drain poller.
            let chan2 = chan.clone();
            let range3 = range2.clone();
            let thread = chan.thread();
            let cont_cell = Arc::new(Mutex::new(Some(cont)));
            let poller_cell: Arc<Mutex<Option<poller::Poller>>> =
                Arc::new(Mutex::new(None));
            let poller_cell2 = poller_cell.clone();

            let p = poller::Builder::new()
                .with_name("lock_range_drain")
                .with_interval_us(100)
                .with_poll_fn(move || {
                    if chan2.has_conflicting_outstanding(&range3) {
                        return PollStatus::Idle;
                    }
                    if let Some(cont) = cont_cell.lock().take() {
                        cont.done(0);
                    }
                    if let Some(p) = poller_cell2.lock().take() {
                        p.stop();
                    }
                    PollStatus::Busy
                })
                .build(&thread);
            *poller_cell.lock() = Some(p);
        },
        cb,
    );
}

/// Release a range lock. Channels drop their local copies and feed their
/// locked I/O back into the submit path; pending overlapping locks whose
/// conflicts cleared are promoted.
pub fn unlock_lba_range(
    bdev: &Arc<Bdev>,
    offset: u64,
    length: u64,
    ctx: u64,
    cb: impl FnOnce(i32) + Send + 'static,
) {
    let origin =
        Thread::current().expect("range locks are taken on engine threads");

    let removed = {
        let mut inner = bdev.inner.lock();
        let pos = inner.locked_ranges.iter().position(|r| {
            r.offset == offset && r.length == length && r.ctx == ctx
        });
        pos.map(|p| inner.locked_ranges.remove(p))
    };

    let Some(range) = removed else {
        cb(-(nix::errno::Errno::ENOENT as i32));
        return;
    };

    let bdev2 = bdev.clone();
    let range2 = range.clone();

    for_each(
        origin,
        bdev.channels(),
        move |chan, cont| {
            chan.remove_locked_range(&range2);
            chan.drain_locked_ios(&range2);
            cont.done(0);
        },
        move |status| {
            promote_pending(&bdev2);
            cb(status);
        },
    );
}

/// Move pending ranges whose conflicts are gone into the locked set and
/// kick their propagation on the owner thread.
fn promote_pending(bdev: &Arc<Bdev>) {
    let promoted: Vec<Arc<LbaRange>> = {
        let mut inner = bdev.inner.lock();
        let mut promoted = Vec::new();
        let mut i = 0;
        while i < inner.pending_locked_ranges.len() {
            let r = &inner.pending_locked_ranges[i];
            let conflict = inner
                .locked_ranges
                .iter()
                .any(|held| held.overlaps(r.offset, r.length));
            if conflict {
                i += 1;
            } else {
                let r = inner.pending_locked_ranges.remove(i);
                inner.locked_ranges.push(r.clone());
                promoted.push(r);
            }
        }
        promoted
    };

    for range in promoted {
        let Some((cb, origin)) = range.pending.lock().take() else {
            continue;
        };
        let bdev = bdev.clone();
        let origin2 = origin.clone();
        origin.send_msg(move || {
            propagate_lock(&bdev, &range, origin2, cb);
        });
    }
}
