//! Open descriptors: the handle through which users reach a bdev. Close
//! is deferred until every I/O created through the descriptor has
//! completed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
    Weak,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    bdev::{Bdev, BdevStatus},
    claim::ClaimType,
    io::BdevIo,
};
use crate::core::{
    poller,
    thread::for_each,
    CoreError,
    PollStatus,
    Runtime,
    Thread,
};

/// Events delivered to a descriptor's event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BdevEvent {
    Remove,
    Resize,
    MediaManagement,
}

pub type EventCb = Arc<dyn Fn(BdevEvent, &Arc<Bdev>) + Send + Sync>;

/// What to do with an I/O that exceeded the descriptor timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutAction {
    #[default]
    None,
    Reset,
    /// Abort the late I/O; falls back to reset when the abort cannot be
    /// dispatched.
    Abort,
}

struct DescInner {
    claimed: Option<ClaimType>,
    closing: bool,
    closed: bool,
    io_refs: u64,
    timeout_sec: u64,
    timeout_action: TimeoutAction,
    timeout_poller: Option<poller::Poller>,
    timeout_cb: Option<Arc<dyn Fn(&Arc<BdevIo>) + Send + Sync>>,
}

/// An open handle onto a bdev.
pub struct BdevDesc {
    bdev: Arc<Bdev>,
    write: AtomicBool,
    event_cb: EventCb,
    inner: Mutex<DescInner>,
}

impl std::fmt::Debug for BdevDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdevDesc")
            .field("bdev", &self.bdev.name())
            .field("write", &self.write.load(Ordering::Relaxed))
            .finish()
    }
}

impl BdevDesc {
    /// Open a bdev by name or alias.
    pub fn open_ext(
        rt: &Arc<Runtime>,
        name: &str,
        write: bool,
        event_cb: EventCb,
    ) -> Result<Arc<BdevDesc>, CoreError> {
        let bdev =
            Bdev::lookup(rt, name).ok_or_else(|| CoreError::BdevNotFound {
                name: name.to_string(),
            })?;

        let desc = {
            let mut inner = bdev.inner.lock();

            if inner.status != BdevStatus::Ready {
                return Err(CoreError::BdevNotFound {
                    name: name.to_string(),
                });
            }

            if write && !bdev.write_open_allowed(&inner) {
                return Err(CoreError::OpenBdev {
                    source: nix::errno::Errno::EPERM,
                    name: name.to_string(),
                });
            }

            let desc = Arc::new(BdevDesc {
                bdev: bdev.clone(),
                write: AtomicBool::new(write),
                event_cb,
                inner: Mutex::new(DescInner {
                    claimed: None,
                    closing: false,
                    closed: false,
                    io_refs: 0,
                    timeout_sec: 0,
                    timeout_action: TimeoutAction::None,
                    timeout_poller: None,
                    timeout_cb: None,
                }),
            });
            inner.open_descs.push(desc.clone());
            desc
        };

        debug!(bdev = bdev.name(), write, "descriptor opened");
        Ok(desc)
    }

    pub fn bdev(&self) -> &Arc<Bdev> {
        &self.bdev
    }

    pub fn is_writable(&self) -> bool {
        self.write.load(Ordering::Relaxed)
    }

    /// A v2 claim with writer semantics may promote a read-only
    /// descriptor.
    pub(crate) fn promote_writable(&self) {
        self.write.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_claimed(&self, ty: ClaimType) {
        self.inner.lock().claimed = Some(ty);
    }

    pub(crate) fn claimed(&self) -> bool {
        self.inner.lock().claimed.is_some()
    }

    pub(crate) fn dispatch_event(&self, ev: BdevEvent, bdev: &Arc<Bdev>) {
        (self.event_cb)(ev, bdev);
    }

    /// The calling thread's channel for this descriptor's bdev.
    pub fn get_channel(self: &Arc<Self>) -> Arc<super::channel::BdevChannel> {
        let thread =
            Thread::current().expect("channels belong to engine threads");
        self.bdev.get_channel(&thread)
    }

    pub(crate) fn io_ref_get(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.io_refs += 1;
        true
    }

    pub(crate) fn io_ref_put(self: &Arc<Self>) {
        let finish = {
            let mut inner = self.inner.lock();
            inner.io_refs -= 1;
            inner.closing && !inner.closed && inner.io_refs == 0
        };
        if finish {
            self.finish_close();
        }
    }

    /// Close the descriptor. Deferred until the last outstanding I/O
    /// created through it completes.
    pub fn close(self: &Arc<Self>) {
        let finish_now = {
            let mut inner = self.inner.lock();
            if inner.closing || inner.closed {
                warn!(bdev = self.bdev.name(), "descriptor already closed");
                return;
            }
            inner.closing = true;
            inner.timeout_poller = None;
            inner.io_refs == 0
        };

        if finish_now {
            self.finish_close();
        }
    }

    fn finish_close(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }

        self.bdev.release_claim(self);
        {
            let mut inner = self.bdev.inner.lock();
            inner.open_descs.retain(|d| !Arc::ptr_eq(d, self));
            inner.claim.prune();
        }

        debug!(bdev = self.bdev.name(), "descriptor closed");
        self.bdev.maybe_finish_unregister();
    }

    /// Arm the per-descriptor I/O timeout. The poller scans the submitted
    /// lists once a second; split children are skipped. The callback runs
    /// for every late I/O, then the configured action is applied.
    pub fn set_timeout(
        self: &Arc<Self>,
        seconds: u64,
        action: TimeoutAction,
        cb: impl Fn(&Arc<BdevIo>) + Send + Sync + 'static,
    ) {
        let thread = Thread::current()
            .expect("set_timeout must run on an engine thread");

        let mut inner = self.inner.lock();
        inner.timeout_sec = seconds;
        inner.timeout_action = action;
        inner.timeout_cb = Some(Arc::new(cb));

        if seconds == 0 {
            inner.timeout_poller = None;
            return;
        }

        let weak = Arc::downgrade(self);
        inner.timeout_poller = Some(
            poller::Builder::new()
                .with_name("desc_timeout")
                .with_interval_us(1_000_000)
                .with_poll_fn(move || match weak.upgrade() {
                    Some(desc) => {
                        desc.scan_for_timeouts();
                        PollStatus::Idle
                    }
                    None => PollStatus::Idle,
                })
                .build(&thread),
        );
    }

    /// Fan out over the bdev channels collecting late I/Os, then apply
    /// the timeout action from the origin thread.
    fn scan_for_timeouts(self: &Arc<Self>) {
        let (timeout_sec, action, cb) = {
            let inner = self.inner.lock();
            match inner.timeout_cb.clone() {
                Some(cb) => (inner.timeout_sec, inner.timeout_action, cb),
                None => return,
            }
        };

        let rt = self.bdev.runtime();
        let deadline = rt
            .ticks()
            .saturating_sub(rt.clock().sec_to_ticks(timeout_sec));
        let origin = Thread::current().expect("poller runs on a thread");
        let late: Arc<Mutex<Vec<Arc<BdevIo>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let late2 = late.clone();
        let desc = self.clone();

        for_each(
            origin,
            self.bdev.channels(),
            move |chan, cont| {
                late.lock().extend(chan.timed_out_ios(&desc, deadline));
                cont.done(0);
            },
            move |_| {
                let ios = std::mem::take(&mut *late2.lock());
                if ios.is_empty() {
                    return;
                }
                for io in &ios {
                    cb(io);
                }
                // One corrective action per sweep is enough.
                // Abort falls back to reset when it cannot target the I/O.
                match action {
                    TimeoutAction::None => {}
                    TimeoutAction::Reset | TimeoutAction::Abort => {
                        warn!("I/O timeout, issuing reset");
                        super::channel::reset_bdev(&ios[0].bdev().clone());
                    }
                }
            },
        );
    }
}

/// A pending asynchronous open waiting for its bdev to appear.
pub struct OpenWaiter {
    id: u64,
    name: String,
    write: bool,
    event_cb: EventCb,
    thread: Arc<Thread>,
    cb: Option<Box<dyn FnOnce(Result<Arc<BdevDesc>, CoreError>) + Send>>,
    _timeout_poller: Option<poller::Poller>,
}

static WAITER_ID: std::sync::atomic::AtomicU64 =
    std::sync::atomic::AtomicU64::new(1);

/// Open a bdev that may not exist yet. When `timeout_ms` elapses first the
/// callback fires with `OpenTimedOut`.
pub fn open_async(
    rt: &Arc<Runtime>,
    name: &str,
    write: bool,
    event_cb: EventCb,
    timeout_ms: Option<u64>,
    cb: impl FnOnce(Result<Arc<BdevDesc>, CoreError>) + Send + 'static,
) {
    if Bdev::lookup(rt, name).is_some() {
        cb(BdevDesc::open_ext(rt, name, write, event_cb));
        return;
    }

    let thread =
        Thread::current().expect("open_async must run on an engine thread");
    let id = WAITER_ID.fetch_add(1, Ordering::Relaxed);

    let timeout_poller = timeout_ms.map(|ms| {
        let rt2 = rt.clone();
        let name = name.to_string();
        poller::Builder::new()
            .with_name("bdev_open_async")
            .with_interval_us(ms * 1_000)
            .with_poll_fn(move || {
                let waiter = {
                    let mut mgr = rt2.bdev_mgr.lock();
                    let pos =
                        mgr.open_waiters.iter().position(|w| w.id == id);
                    pos.map(|p| mgr.open_waiters.remove(p))
                };
                if let Some(mut w) = waiter {
                    if let Some(cb) = w.cb.take() {
                        cb(Err(CoreError::OpenTimedOut {
                            name: name.clone(),
                        }));
                    }
                }
                PollStatus::Idle
            })
            .build(&thread)
    });

    rt.bdev_mgr.lock().open_waiters.push(OpenWaiter {
        id,
        name: name.to_string(),
        write,
        event_cb,
        thread,
        cb: Some(Box::new(cb)),
        _timeout_poller: timeout_poller,
    });
}

/// Called on bdev registration: complete any waiter for this name on its
/// own thread.
pub(crate) fn resolve_open_waiters(rt: &Arc<Runtime>, bdev: &Arc<Bdev>) {
    let matched: Vec<OpenWaiter> = {
        let mut mgr = rt.bdev_mgr.lock();
        let (matched, rest) = mgr
            .open_waiters
            .drain(..)
            .partition(|w| w.name == bdev.name());
        mgr.open_waiters = rest;
        matched
    };

    for mut w in matched {
        let rt = rt.clone();
        let thread = w.thread.clone();
        let cb = w.cb.take();
        let name = w.name.clone();
        let write = w.write;
        let event_cb = w.event_cb.clone();
        thread.send_msg(move || {
            if let Some(cb) = cb {
                cb(BdevDesc::open_ext(&rt, &name, write, event_cb));
            }
        });
    }
}
