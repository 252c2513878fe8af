//! NVMe controller lifecycle: attach, the reset/failover state machine,
//! delayed reconnect, loss and fast-io-fail timers, enable/disable,
//! destruct and asynchronous ANA log-page processing.
//!
//! Everything here runs on the controller's owner thread; external
//! entry points bounce through its message queue.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    namespace::NvmeNs,
    path::{NvmePathId, TransportId},
    qpair::NvmeCtrlrChannel,
    transport::{AsyncEvent, CtrlrData, CtrlrHandle, NvmeTransport},
};
use crate::core::{poller, thread::for_each, CoreError, PollStatus, Runtime, Thread};

/// Per-controller behaviour options.
#[derive(Debug, Clone)]
pub struct NvmeCtrlrOpts {
    /// Seconds a controller may stay unreachable before being torn down;
    /// -1 retries forever, 0 forbids retrying at all.
    pub ctrlr_loss_timeout_sec: i32,
    /// Delay between reconnect attempts; 0 disables reconnecting.
    pub reconnect_delay_sec: u32,
    /// After this many seconds of failed reconnects, I/O fails fast
    /// instead of queueing for retry.
    pub fast_io_fail_timeout_sec: u32,
    pub prchk_flags: u32,
    pub multipath: bool,
}

impl Default for NvmeCtrlrOpts {
    fn default() -> Self {
        Self {
            ctrlr_loss_timeout_sec: 0,
            reconnect_delay_sec: 0,
            fast_io_fail_timeout_sec: 0,
            prchk_flags: 0,
            multipath: true,
        }
    }
}

/// The mutual constraints between the three recovery timers.
pub fn check_io_error_resiliency_params(
    ctrlr_loss_timeout_sec: i32,
    reconnect_delay_sec: u32,
    fast_io_fail_timeout_sec: u32,
) -> bool {
    if ctrlr_loss_timeout_sec < -1 {
        return false;
    }
    if ctrlr_loss_timeout_sec == -1 {
        if reconnect_delay_sec == 0 {
            return false;
        }
        if fast_io_fail_timeout_sec != 0
            && fast_io_fail_timeout_sec < reconnect_delay_sec
        {
            return false;
        }
    } else if ctrlr_loss_timeout_sec != 0 {
        if reconnect_delay_sec == 0 {
            return false;
        }
        if reconnect_delay_sec > ctrlr_loss_timeout_sec as u32 {
            return false;
        }
        if fast_io_fail_timeout_sec != 0 {
            if fast_io_fail_timeout_sec < reconnect_delay_sec {
                return false;
            }
            if (ctrlr_loss_timeout_sec as u32) < fast_io_fail_timeout_sec {
                return false;
            }
        }
    } else if reconnect_delay_sec != 0 || fast_io_fail_timeout_sec != 0 {
        return false;
    }
    true
}

/// What to do once a reset sequence finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpAfterReset {
    None,
    CompletePendingDestruct,
    Destruct,
    DelayedReconnect,
    Failover,
}

pub(crate) type CtrlrOpCb = Box<dyn FnOnce(i32) + Send>;
pub(crate) type ResetWaiter = Box<dyn FnOnce(bool) + Send>;
pub(crate) type NsChangeSink = Arc<dyn Fn(&Arc<NvmeCtrlr>) + Send + Sync>;
pub(crate) type DestructSink = Box<dyn FnOnce(&Arc<NvmeCtrlr>) + Send>;

pub(crate) struct CtrlrInner {
    pub handle: Option<Arc<dyn CtrlrHandle>>,
    /// Head is always the active path.
    pub trids: Vec<NvmePathId>,
    pub destruct: bool,
    pub resetting: bool,
    pub in_failover: bool,
    pub pending_failover: bool,
    pub dont_retry: bool,
    pub disabled: bool,
    pub reconnect_is_delayed: bool,
    pub fast_io_fail_timedout: bool,
    pub reset_start_tsc: u64,
    pub namespaces: BTreeMap<u32, Arc<NvmeNs>>,
    pub pending_resets: Vec<ResetWaiter>,
    pub op_cb: Option<CtrlrOpCb>,
    pub channels: Vec<(u64, Arc<Thread>, Arc<NvmeCtrlrChannel>)>,
    pub reconnect_delay_timer: Option<poller::Poller>,
    pub reset_poller: Option<poller::Poller>,
    pub disconnected_cb: Option<Box<dyn FnOnce(&Arc<NvmeCtrlr>) + Send>>,
    pub ana_log_updating: bool,
    pub ns_change_sink: Option<NsChangeSink>,
    pub destruct_sink: Option<DestructSink>,
}

/// One attached NVMe controller.
pub struct NvmeCtrlr {
    name: String,
    thread: Arc<Thread>,
    rt: Weak<Runtime>,
    transport: Arc<dyn NvmeTransport>,
    opts: NvmeCtrlrOpts,
    pub(crate) inner: Mutex<CtrlrInner>,
    adminq_poller: Mutex<Option<poller::Poller>>,
}

impl std::fmt::Debug for NvmeCtrlr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NvmeCtrlr")
            .field("name", &self.name)
            .field("resetting", &inner.resetting)
            .field("in_failover", &inner.in_failover)
            .field("dont_retry", &inner.dont_retry)
            .field("disabled", &inner.disabled)
            .finish()
    }
}

/// Admin queue poll period, and the faster one used while waiting for a
/// disconnect to land.
const ADMINQ_POLL_PERIOD_US: u64 = 10_000;
const ADMINQ_POLL_PERIOD_FAST_US: u64 = 0;

impl NvmeCtrlr {
    /// Attach a controller over the given transport. Runs on (and pins
    /// the controller to) the calling thread.
    pub fn connect(
        rt: &Arc<Runtime>,
        transport: Arc<dyn NvmeTransport>,
        name: &str,
        trid: TransportId,
        opts: NvmeCtrlrOpts,
    ) -> Result<Arc<NvmeCtrlr>, CoreError> {
        if !check_io_error_resiliency_params(
            opts.ctrlr_loss_timeout_sec,
            opts.reconnect_delay_sec,
            opts.fast_io_fail_timeout_sec,
        ) {
            return Err(CoreError::InvalidOpts {
                reason: "invalid retry/timeout parameters".into(),
            });
        }

        let thread = Thread::current()
            .expect("controller attach runs on an engine thread");

        let handle = transport.connect(&trid).map_err(|source| {
            CoreError::OpenBdev {
                source,
                name: name.to_string(),
            }
        })?;

        let ctrlr = Arc::new(NvmeCtrlr {
            name: name.to_string(),
            thread: thread.clone(),
            rt: Arc::downgrade(rt),
            transport,
            opts,
            inner: Mutex::new(CtrlrInner {
                handle: Some(handle.clone()),
                trids: vec![NvmePathId::new(trid)],
                destruct: false,
                resetting: false,
                in_failover: false,
                pending_failover: false,
                dont_retry: false,
                disabled: false,
                reconnect_is_delayed: false,
                fast_io_fail_timedout: false,
                reset_start_tsc: 0,
                namespaces: BTreeMap::new(),
                pending_resets: Vec::new(),
                op_cb: None,
                channels: Vec::new(),
                reconnect_delay_timer: None,
                reset_poller: None,
                disconnected_cb: None,
                ana_log_updating: false,
                ns_change_sink: None,
                destruct_sink: None,
            }),
            adminq_poller: Mutex::new(None),
        });

        // AERs land on the owner thread.
        {
            let weak = Arc::downgrade(&ctrlr);
            handle.set_event_sink(Box::new(move |ev| {
                if let Some(c) = weak.upgrade() {
                    let c2 = c.clone();
                    c.thread.send_msg(move || c2.handle_async_event(ev));
                }
            }));
        }

        ctrlr.sync_namespaces();
        ctrlr.start_adminq_poller();
        info!(ctrlr = name, "attached");
        Ok(ctrlr)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread(&self) -> Arc<Thread> {
        self.thread.clone()
    }

    pub fn opts(&self) -> &NvmeCtrlrOpts {
        &self.opts
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.rt.upgrade().expect("runtime torn down with live ctrlr")
    }

    pub fn data(&self) -> CtrlrData {
        self.inner
            .lock()
            .handle
            .as_ref()
            .map(|h| h.data())
            .unwrap_or_default()
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn CtrlrHandle>> {
        self.inner.lock().handle.clone()
    }

    pub fn active_trid(&self) -> Option<TransportId> {
        self.inner.lock().trids.first().map(|p| p.trid.clone())
    }

    pub fn trid_count(&self) -> usize {
        self.inner.lock().trids.len()
    }

    /// Append an alternate endpoint to the failover list.
    pub fn add_trid(&self, trid: TransportId) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        if inner.trids.iter().any(|p| p.trid == trid) {
            return Err(CoreError::BdevExists {
                name: trid.to_string(),
            });
        }
        inner.trids.push(NvmePathId::new(trid));
        Ok(())
    }

    pub(crate) fn set_ns_change_sink(&self, sink: NsChangeSink) {
        self.inner.lock().ns_change_sink = Some(sink);
    }

    pub(crate) fn set_destruct_sink(&self, sink: DestructSink) {
        self.inner.lock().destruct_sink = Some(sink);
    }

    pub fn namespaces(&self) -> Vec<Arc<NvmeNs>> {
        self.inner.lock().namespaces.values().cloned().collect()
    }

    pub fn namespace(&self, nsid: u32) -> Option<Arc<NvmeNs>> {
        self.inner.lock().namespaces.get(&nsid).cloned()
    }

    // Availability predicates.

    /// A failed controller offers no hope for queued I/O.
    pub fn is_failed(&self) -> bool {
        let inner = self.inner.lock();
        if inner.destruct || inner.fast_io_fail_timedout {
            return true;
        }
        if inner.resetting {
            return self.opts.reconnect_delay_sec == 0;
        }
        if inner.reconnect_is_delayed {
            return false;
        }
        if inner.disabled {
            return true;
        }
        inner
            .handle
            .as_ref()
            .map(|h| h.is_failed())
            .unwrap_or(true)
    }

    /// Available right now for admin-type submissions.
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        if inner.destruct
            || inner.resetting
            || inner.reconnect_is_delayed
            || inner.disabled
        {
            return false;
        }
        inner
            .handle
            .as_ref()
            .map(|h| !h.is_failed())
            .unwrap_or(false)
    }

    // Channels.

    /// Get or create this thread's channel (and qpair).
    pub fn get_channel(
        self: &Arc<Self>,
        thread: &Arc<Thread>,
    ) -> Arc<NvmeCtrlrChannel> {
        if let Some(ch) = {
            let inner = self.inner.lock();
            inner
                .channels
                .iter()
                .find(|(tid, _, _)| *tid == thread.id())
                .map(|(_, _, c)| c.clone())
        } {
            return ch;
        }

        let ch = NvmeCtrlrChannel::new(self, thread);
        if let Some(handle) = self.handle() {
            if let Err(e) = ch.qpair.create(&handle) {
                warn!(ctrlr = %self.name, ?e, "qpair allocation failed");
            } else {
                ch.qpair.check_connected();
            }
        }
        self.inner
            .lock()
            .channels
            .push((thread.id(), thread.clone(), ch.clone()));
        ch
    }

    pub(crate) fn channels(
        &self,
    ) -> Vec<(Arc<Thread>, Arc<NvmeCtrlrChannel>)> {
        self.inner
            .lock()
            .channels
            .iter()
            .map(|(_, t, c)| (t.clone(), c.clone()))
            .collect()
    }

    fn start_adminq_poller(self: &Arc<Self>) {
        let ctrlr = self.clone();
        *self.adminq_poller.lock() = Some(
            poller::Builder::new()
                .with_name("nvme_poll_adminq")
                .with_interval_us(ADMINQ_POLL_PERIOD_US)
                .with_poll_fn(move || ctrlr.poll_adminq())
                .build(&self.thread),
        );
    }

    fn poll_adminq(self: &Arc<Self>) -> PollStatus {
        let handle = self.handle();
        let Some(handle) = handle else {
            return PollStatus::Idle;
        };

        let rc = handle.process_admin_completions();

        // A parked disconnect completes here.
        let cb = {
            let mut inner = self.inner.lock();
            if inner.disconnected_cb.is_some() && handle.disconnect_complete()
            {
                inner.disconnected_cb.take()
            } else {
                None
            }
        };
        if let Some(cb) = cb {
            if let Some(p) = self.adminq_poller.lock().as_ref() {
                p.set_period_us(ADMINQ_POLL_PERIOD_US);
            }
            cb(self);
            return PollStatus::Busy;
        }

        if rc > 0 {
            PollStatus::Busy
        } else {
            PollStatus::Idle
        }
    }

    // Timers.

    fn check_ctrlr_loss_timeout(&self) -> bool {
        let loss = self.opts.ctrlr_loss_timeout_sec;
        if loss == 0 || loss == -1 {
            return false;
        }
        let rt = self.runtime();
        let start = self.inner.lock().reset_start_tsc;
        let elapsed = rt.ticks().saturating_sub(start) / rt.ticks_hz();
        elapsed >= loss as u64
    }

    fn check_fast_io_fail_timeout(&self) -> bool {
        let fast = self.opts.fast_io_fail_timeout_sec;
        if fast == 0 {
            return false;
        }
        let rt = self.runtime();
        let start = self.inner.lock().reset_start_tsc;
        let elapsed = rt.ticks().saturating_sub(start) / rt.ticks_hz();
        elapsed >= fast as u64
    }

    // Reset state machine.

    /// Request a full controller reset. `-ENXIO` when destructing,
    /// `-EBUSY` while one is running, `-EALREADY` when disabled.
    pub fn reset_ctrlr(
        self: &Arc<Self>,
        cb: impl FnOnce(i32) + Send + 'static,
    ) -> Result<(), CoreError> {
        let reconnect_now = {
            let mut inner = self.inner.lock();
            if inner.destruct {
                return Err(CoreError::CtrlrDestruct {
                    name: self.name.clone(),
                });
            }
            if inner.resetting {
                info!(ctrlr = %self.name, "reset already in progress");
                return Err(CoreError::CtrlrResetting {
                    name: self.name.clone(),
                });
            }
            if inner.disabled {
                return Err(CoreError::CtrlrAlreadySo {
                    name: self.name.clone(),
                });
            }

            inner.resetting = true;
            inner.dont_retry = true;
            if inner.reset_start_tsc == 0 {
                inner.reset_start_tsc = self.runtime().ticks();
            }
            inner.op_cb = Some(Box::new(cb));

            if inner.reconnect_is_delayed {
                info!(ctrlr = %self.name, "reconnect already scheduled");
                inner.reconnect_is_delayed = false;
                inner.reconnect_delay_timer = None;
                true
            } else {
                false
            }
        };

        let ctrlr = self.clone();
        self.thread.send_msg(move || {
            if reconnect_now {
                ctrlr.reconnect_ctrlr();
            } else {
                ctrlr.reset_destroy_qpairs();
            }
        });
        Ok(())
    }

    /// Park a reset-I/O continuation behind the reset in flight.
    pub(crate) fn park_pending_reset(&self, waiter: ResetWaiter) -> bool {
        let mut inner = self.inner.lock();
        if inner.resetting {
            inner.pending_resets.push(waiter);
            true
        } else {
            false
        }
    }

    /// Disconnect every channel's qpair, parking the fan-out until each
    /// transport qpair settles.
    fn reset_destroy_qpairs(self: &Arc<Self>) {
        info!(ctrlr = %self.name, "delete qpairs for reset");
        let ctrlr = self.clone();

        for_each(
            self.thread.clone(),
            self.channels(),
            |ch, cont| {
                ch.qpair.disconnect();
                clear_io_path_cache(&ch.qpair);

                if ch.qpair.disconnect_settled() {
                    cont.done(0);
                    return;
                }
                *ch.reset_cont.lock() = Some(cont);

                let ch2 = ch.clone();
                let thread = ch.qpair.thread();
                *ch.connect_poller.lock() = Some(
                    poller::Builder::new()
                        .with_name("qpair_disconnect_wait")
                        .with_interval_us(0)
                        .with_poll_fn(move || {
                            if !ch2.qpair.disconnect_settled() {
                                return PollStatus::Idle;
                            }
                            if let Some(cont) = ch2.reset_cont.lock().take() {
                                cont.done(0);
                            }
                            if let Some(p) =
                                ch2.connect_poller.lock().take()
                            {
                                p.stop();
                            }
                            PollStatus::Busy
                        })
                        .build(&thread),
                );
            },
            move |_| {
                ctrlr.disconnect_ctrlr();
            },
        );
    }

    /// Disconnect the controller itself, then reconnect when the admin
    /// queue reports the disconnect done.
    fn disconnect_ctrlr(self: &Arc<Self>) {
        info!(ctrlr = %self.name, "start disconnecting ctrlr");
        let handle = self.handle();
        let rc = handle.map(|h| h.disconnect()).unwrap_or(Err(Errno::ENXIO));

        if rc.is_err() {
            warn!(ctrlr = %self.name, "disconnecting ctrlr failed");
            self.reset_ctrlr_complete(false);
            return;
        }

        self.inner.lock().disconnected_cb =
            Some(Box::new(|c: &Arc<NvmeCtrlr>| c.clone().reconnect_ctrlr()));

        // Poll the admin queue aggressively while the disconnect drains.
        if let Some(p) = self.adminq_poller.lock().as_ref() {
            p.set_period_us(ADMINQ_POLL_PERIOD_FAST_US);
        }
    }

    /// Kick the asynchronous reconnect and poll it to completion.
    fn reconnect_ctrlr(self: &Arc<Self>) {
        info!(ctrlr = %self.name, "start reconnecting ctrlr");

        let Some(handle) = self.handle() else {
            self.reset_ctrlr_complete(false);
            return;
        };
        let Some(trid) = self.active_trid() else {
            self.reset_ctrlr_complete(false);
            return;
        };
        handle.reconnect_async(&trid);

        let ctrlr = self.clone();
        let poller = poller::Builder::new()
            .with_name("bdev_nvme_reconnect")
            .with_interval_us(0)
            .with_poll_fn(move || ctrlr.reconnect_poll())
            .build(&self.thread);
        self.inner.lock().reset_poller = Some(poller);
    }

    fn reconnect_poll(self: &Arc<Self>) -> PollStatus {
        if self.check_ctrlr_loss_timeout() {
            // Make the next poll observe a terminal failure.
            if let Some(h) = self.handle() {
                h.fail();
            }
        }

        let rc = self.handle().map(|h| h.reconnect_poll()).unwrap_or(-1);
        if rc == -(Errno::EAGAIN as i32) {
            return PollStatus::Busy;
        }

        self.inner.lock().reset_poller = None;

        if rc == 0 {
            info!(ctrlr = %self.name, "ctrlr was connected, create qpairs");
            self.check_namespaces();
            self.reset_create_qpairs();
        } else {
            info!(ctrlr = %self.name, "ctrlr could not be connected");
            self.reset_ctrlr_complete(false);
        }
        PollStatus::Busy
    }

    /// Recreate every channel's qpair, waiting per channel until the
    /// transport reports it connected.
    fn reset_create_qpairs(self: &Arc<Self>) {
        let ctrlr = self.clone();
        let handle = self.handle();

        for_each(
            self.thread.clone(),
            self.channels(),
            move |ch, cont| {
                let Some(handle) = handle.clone() else {
                    cont.done(-1);
                    return;
                };
                if let Err(e) = ch.qpair.create(&handle) {
                    cont.done(-(e as i32));
                    return;
                }

                let ch2 = ch.clone();
                let thread = ch.qpair.thread();
                *ch.reset_cont.lock() = Some(cont);
                *ch.connect_poller.lock() = Some(
                    poller::Builder::new()
                        .with_name("bdev_nvme_reset_check_qpair_connected")
                        .with_interval_us(0)
                        .with_poll_fn(move || {
                            if !ch2.qpair.check_connected() {
                                return PollStatus::Idle;
                            }
                            ch2.qpair.clear_resetting();
                            clear_io_path_cache(&ch2.qpair);
                            if let Some(cont) = ch2.reset_cont.lock().take() {
                                cont.done(0);
                            }
                            if let Some(p) = ch2.connect_poller.lock().take()
                            {
                                p.stop();
                            }
                            PollStatus::Busy
                        })
                        .build(&thread),
                );
            },
            move |status| {
                if status == 0 {
                    info!(ctrlr = %ctrlr.name, "qpairs were created after ctrlr reset");
                    ctrlr.reset_ctrlr_complete(true);
                } else {
                    info!(ctrlr = %ctrlr.name, "qpairs failed to create after ctrlr reset");
                    ctrlr.reset_ctrlr_complete(false);
                }
            },
        );
    }

    /// Mark the active trid failed and rotate to the next one, if it is
    /// worth trying now. Returns true when the caller should reconnect
    /// to the new head immediately.
    fn failover_trid(&self, remove: bool, start: bool) -> bool {
        let rt = self.runtime();
        let now = rt.ticks();
        let mut inner = self.inner.lock();

        let Some(head) = inner.trids.first_mut() else {
            return false;
        };
        head.last_failed_tsc = now;

        if inner.trids.len() < 2 {
            return false;
        }
        if !start && self.opts.reconnect_delay_sec == 0 {
            // Connect is not retried inside a reset sequence; the next
            // failover call will pick the new head up.
            return false;
        }

        let old = inner.trids.remove(0);
        info!(
            ctrlr = %self.name,
            from = %old.trid,
            to = %inner.trids[0].trid,
            "start failover"
        );
        if let Some(h) = inner.handle.as_ref() {
            h.fail();
        }
        if !remove {
            // Rotate for round robin across endpoints.
            inner.trids.push(old);
        }

        let next = &inner.trids[0];
        if start || next.last_failed_tsc == 0 {
            return true;
        }
        let backoff =
            rt.clock().sec_to_ticks(self.opts.reconnect_delay_sec as u64);
        now > next.last_failed_tsc + backoff
    }

    fn check_op_after_reset(
        &self,
        success: bool,
        pending_failover: bool,
    ) -> OpAfterReset {
        let inner = self.inner.lock();
        if inner.destruct {
            return OpAfterReset::CompletePendingDestruct;
        }
        drop(inner);

        if success || self.opts.reconnect_delay_sec == 0 {
            if pending_failover {
                OpAfterReset::Failover
            } else {
                OpAfterReset::None
            }
        } else if self.check_ctrlr_loss_timeout() {
            OpAfterReset::Destruct
        } else {
            OpAfterReset::DelayedReconnect
        }
    }

    fn reset_ctrlr_complete(self: &Arc<Self>, success: bool) {
        let pending_failover = {
            let mut inner = self.inner.lock();
            let p = inner.pending_failover;
            inner.pending_failover = false;
            p
        };

        if !success {
            if self.failover_trid(false, false) {
                // The next alternate trid is ready; try it right away.
                info!(ctrlr = %self.name, "try the next alternate trid now");
                self.disconnect_ctrlr();
                return;
            }
        } else {
            let mut inner = self.inner.lock();
            if let Some(head) = inner.trids.first_mut() {
                head.last_failed_tsc = 0;
            }
        }

        // Everything parked behind the reset shares its outcome.
        let waiters: Vec<ResetWaiter> =
            self.inner.lock().pending_resets.drain(..).collect();
        for w in waiters {
            w(success);
        }

        if !success {
            warn!(ctrlr = %self.name, "resetting controller failed");
            if self.check_fast_io_fail_timeout() {
                self.inner.lock().fast_io_fail_timedout = true;
            }
        } else {
            info!(ctrlr = %self.name, "resetting controller successful");
            self.inner.lock().reset_start_tsc = 0;
        }

        let op_cb = {
            let mut inner = self.inner.lock();
            inner.resetting = false;
            inner.dont_retry = false;
            inner.in_failover = false;
            inner.op_cb.take()
        };

        let op = self.check_op_after_reset(success, pending_failover);

        if let Some(cb) = op_cb {
            if op == OpAfterReset::Failover {
                self.inner.lock().op_cb = Some(cb);
            } else {
                cb(if success { 0 } else { -1 });
            }
        }

        match op {
            OpAfterReset::CompletePendingDestruct => self.unregister(),
            OpAfterReset::Destruct => {
                warn!(ctrlr = %self.name, "ctrlr loss timeout expired, destructing");
                self.destruct();
            }
            OpAfterReset::DelayedReconnect => {
                self.start_reconnect_delay_timer()
            }
            OpAfterReset::Failover => {
                let _ = self.failover_ctrlr();
            }
            OpAfterReset::None => {}
        }
    }

    fn start_reconnect_delay_timer(self: &Arc<Self>) {
        debug!(ctrlr = %self.name, delay = self.opts.reconnect_delay_sec, "delaying reconnect");
        let ctrlr = self.clone();
        let mut inner = self.inner.lock();
        inner.reconnect_is_delayed = true;
        inner.reconnect_delay_timer = Some(
            poller::Builder::new()
                .with_name("bdev_nvme_reconnect_delay")
                .with_interval_us(
                    self.opts.reconnect_delay_sec as u64 * 1_000_000,
                )
                .with_poll_fn(move || {
                    ctrlr.reconnect_delay_expired();
                    PollStatus::Busy
                })
                .build(&self.thread),
        );
    }

    fn reconnect_delay_expired(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.reconnect_delay_timer = None;
            if !inner.reconnect_is_delayed {
                return;
            }
            inner.reconnect_is_delayed = false;
            if inner.destruct {
                return;
            }
            inner.resetting = true;
        }
        self.reconnect_ctrlr();
    }

    /// Manual failover request. While a reset runs it is remembered and
    /// executed on completion.
    pub fn failover_ctrlr(self: &Arc<Self>) -> Result<(), CoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.destruct {
                return Err(CoreError::CtrlrDestruct {
                    name: self.name.clone(),
                });
            }
            if inner.resetting {
                inner.pending_failover = true;
                return Err(CoreError::CtrlrResetting {
                    name: self.name.clone(),
                });
            }
            if inner.disabled {
                return Err(CoreError::CtrlrAlreadySo {
                    name: self.name.clone(),
                });
            }

            inner.resetting = true;
            inner.in_failover = true;
            inner.dont_retry = true;
            if inner.reset_start_tsc == 0 {
                inner.reset_start_tsc = self.runtime().ticks();
            }
        }

        self.failover_trid(false, true);
        let ctrlr = self.clone();
        self.thread.send_msg(move || ctrlr.reset_destroy_qpairs());
        Ok(())
    }

    // Enable / disable.

    pub fn disable_ctrlr(self: &Arc<Self>) -> Result<(), CoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.destruct {
                return Err(CoreError::CtrlrDestruct {
                    name: self.name.clone(),
                });
            }
            if inner.resetting {
                return Err(CoreError::CtrlrResetting {
                    name: self.name.clone(),
                });
            }
            if inner.disabled {
                return Err(CoreError::CtrlrAlreadySo {
                    name: self.name.clone(),
                });
            }
            inner.resetting = true;
            inner.dont_retry = true;
        }

        let ctrlr = self.clone();
        self.thread.send_msg(move || {
            let c2 = ctrlr.clone();
            for_each(
                ctrlr.thread.clone(),
                ctrlr.channels(),
                |ch, cont| {
                    ch.qpair.disconnect();
                    clear_io_path_cache(&ch.qpair);
                    cont.done(0);
                },
                move |_| c2.disable_ctrlr_complete(),
            );
        });
        Ok(())
    }

    fn disable_ctrlr_complete(self: &Arc<Self>) {
        let waiters: Vec<ResetWaiter> = {
            let mut inner = self.inner.lock();
            inner.resetting = false;
            inner.dont_retry = false;
            inner.pending_failover = false;
            inner.disabled = true;
            inner.pending_resets.drain(..).collect()
        };
        for w in waiters {
            w(true);
        }

        if let Some(p) = self.adminq_poller.lock().as_ref() {
            p.pause();
        }
        info!(ctrlr = %self.name, "disabled");

        if self.inner.lock().destruct {
            self.unregister();
        }
    }

    pub fn enable_ctrlr(self: &Arc<Self>) -> Result<(), CoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.destruct {
                return Err(CoreError::CtrlrDestruct {
                    name: self.name.clone(),
                });
            }
            if inner.resetting {
                return Err(CoreError::CtrlrResetting {
                    name: self.name.clone(),
                });
            }
            if !inner.disabled {
                return Err(CoreError::CtrlrAlreadySo {
                    name: self.name.clone(),
                });
            }
            inner.disabled = false;
            inner.resetting = true;
            inner.reset_start_tsc = self.runtime().ticks();
        }

        if let Some(p) = self.adminq_poller.lock().as_ref() {
            p.resume();
        }
        let ctrlr = self.clone();
        self.thread.send_msg(move || ctrlr.reconnect_ctrlr());
        Ok(())
    }

    // Destruct.

    /// Begin tearing the controller down; deferred while a reset runs.
    pub fn destruct(self: &Arc<Self>) {
        let defer = {
            let mut inner = self.inner.lock();
            inner.destruct = true;
            inner.resetting
        };
        if !defer {
            self.unregister();
        }
    }

    fn unregister(self: &Arc<Self>) {
        info!(ctrlr = %self.name, "unregistering");
        *self.adminq_poller.lock() = None;

        let sink = {
            let mut inner = self.inner.lock();
            inner.reset_poller = None;
            inner.reconnect_delay_timer = None;
            for ns in inner.namespaces.values() {
                ns.deactivate();
            }
            inner.handle = None;
            inner.channels.clear();
            inner.destruct_sink.take()
        };
        if let Some(sink) = sink {
            sink(self);
        }
    }

    // Namespaces and ANA.

    /// Align the namespace map with the transport's active list; new ids
    /// get fresh `NvmeNs` objects, vanished ids are deactivated.
    pub(crate) fn sync_namespaces(self: &Arc<Self>) {
        let Some(handle) = self.handle() else {
            return;
        };
        let active = handle.active_ns_list();

        let mut changed = false;
        {
            let mut inner = self.inner.lock();
            for data in &active {
                match inner.namespaces.get(&data.nsid) {
                    Some(ns) => {
                        if ns.data().is_none() {
                            ns.reactivate(data.clone());
                            changed = true;
                        }
                    }
                    None => {
                        let ns = NvmeNs::new(data.nsid, self, data.clone());
                        inner.namespaces.insert(data.nsid, ns);
                        changed = true;
                    }
                }
            }
            let active_ids: std::collections::BTreeSet<u32> =
                active.iter().map(|d| d.nsid).collect();
            for (nsid, ns) in inner.namespaces.iter() {
                if !active_ids.contains(nsid) && ns.data().is_some() {
                    ns.deactivate();
                    changed = true;
                }
            }
        }

        if self.data().ana_supported {
            self.read_ana_log_page();
        }

        if changed {
            let sink = self.inner.lock().ns_change_sink.clone();
            if let Some(sink) = sink {
                let ctrlr = self.clone();
                self.thread.send_msg(move || sink(&ctrlr));
            }
        }
    }

    /// Namespaces that vanished during a reset are deactivated; they may
    /// be re-added later.
    fn check_namespaces(&self) {
        let Some(handle) = self.handle() else {
            return;
        };
        let inner = self.inner.lock();
        for (nsid, ns) in inner.namespaces.iter() {
            if ns.data().is_some() && !handle.is_active_ns(*nsid) {
                debug!(nsid, "namespace was removed during reset");
                ns.deactivate();
            }
        }
    }

    /// Kick an asynchronous ANA log-page read; at most one in flight.
    pub fn read_ana_log_page(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.ana_log_updating {
                return false;
            }
            if inner.handle.is_none() {
                return false;
            }
            inner.ana_log_updating = true;
        }
        let Some(handle) = self.handle() else {
            return false;
        };
        if !handle.data().ana_supported {
            self.inner.lock().ana_log_updating = false;
            return false;
        }

        let ctrlr = self.clone();
        handle.read_ana_log_page(Box::new(move |result| {
            let c2 = ctrlr.clone();
            ctrlr.thread.send_msg(move || {
                c2.inner.lock().ana_log_updating = false;
                match result {
                    Ok(page) => c2.apply_ana_log_page(&page),
                    Err(e) => warn!(?e, "ana log page read failed"),
                }
            });
        }));
        true
    }

    fn apply_ana_log_page(self: &Arc<Self>, page: &super::ana::AnaLogPage) {
        let anatt = self.data().anatt;
        let namespaces = self.namespaces();

        page.for_each_nsid(|group_id, state, nsid| {
            if let Some(ns) =
                namespaces.iter().find(|n| n.id() == nsid)
            {
                ns.set_ana_state(&self.thread, group_id, state, anatt);
            }
        });

        // ANA changes invalidate cached io paths everywhere.
        for (_, ch) in self.channels() {
            clear_io_path_cache(&ch.qpair);
        }
    }

    fn handle_async_event(self: &Arc<Self>, ev: AsyncEvent) {
        debug!(ctrlr = %self.name, ?ev, "async event");
        match ev {
            AsyncEvent::NsAttrChanged => self.sync_namespaces(),
            AsyncEvent::AnaChange => {
                self.read_ana_log_page();
            }
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn NvmeTransport> {
        &self.transport
    }
}

/// Clear the cached io path of every multipath channel fed by this
/// qpair.
pub(crate) fn clear_io_path_cache(qpair: &Arc<super::qpair::NvmeQpair>) {
    super::channel::clear_caches_for_qpair(qpair);
}
