//! The per-thread bdev channel and the submit/completion pipeline that
//! runs on it: reset freeze, range-lock gating, splitting, QoS, buffer
//! staging, NOMEM back-pressure and statistics.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Weak,
    },
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    bdev::Bdev,
    io::{BdevIo, IoBuffer, IoStatus, IoType, RetryState},
    lock::LbaRange,
    module::{BdevOps, ModuleChannel},
    qos::Qos,
    split,
    stats::{BdevIoStats, StatReset},
};
use crate::core::{poller, thread::for_each, PollStatus, Runtime, Thread};

/// Retry poller period for the queue-depth-one case where no completion
/// will otherwise trigger a NOMEM retry.
const NOMEM_RETRY_POLL_US: u64 = 10_000;

/// PRACT bit in the dif check flags; mutually exclusive with separate
/// metadata handling by this layer.
pub const DIF_CHECK_PRACT: u32 = 0x08;

/// NOMEM back-pressure state shared by every channel (on one thread)
/// whose module channel resolves to the same underlying device.
pub struct SharedResource {
    thread: Weak<Thread>,
    pub(crate) inner: Mutex<SharedInner>,
}

pub(crate) struct SharedInner {
    pub io_outstanding: u64,
    pub nomem_threshold: u64,
    pub nomem_io: VecDeque<Arc<BdevIo>>,
    pub retry_poller: Option<poller::Poller>,
}

impl SharedResource {
    fn get(
        rt: &Arc<Runtime>,
        thread: &Arc<Thread>,
        key: usize,
    ) -> Arc<SharedResource> {
        let mut map = rt.shared_resources.lock();
        let k = (thread.id(), key);
        if let Some(sr) = map.get(&k).and_then(|w| w.upgrade()) {
            return sr;
        }
        let sr = Arc::new(SharedResource {
            thread: Arc::downgrade(thread),
            inner: Mutex::new(SharedInner {
                io_outstanding: 0,
                nomem_threshold: 0,
                nomem_io: VecDeque::new(),
                retry_poller: None,
            }),
        });
        map.insert(k, Arc::downgrade(&sr));
        sr
    }

    pub(crate) fn io_outstanding(&self) -> u64 {
        self.inner.lock().io_outstanding
    }
}

pub(crate) struct ChanInner {
    pub reset_in_progress: bool,
    pub qos: Option<Arc<Qos>>,
    pub qos_queue: VecDeque<Arc<BdevIo>>,
    pub io_submitted: Vec<Arc<BdevIo>>,
    pub io_locked: VecDeque<Arc<BdevIo>>,
    pub local_ranges: Vec<Arc<LbaRange>>,
    pub stats: BdevIoStats,
    pub histogram: Option<super::stats::LatencyHistogram>,
    pub io_outstanding: u64,
}

/// Per-thread state for one bdev.
pub struct BdevChannel {
    bdev: Arc<Bdev>,
    thread: Arc<Thread>,
    module_channel: ModuleChannel,
    shared: Arc<SharedResource>,
    refs: AtomicU32,
    pub(crate) inner: Mutex<ChanInner>,
}

impl std::fmt::Debug for BdevChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdevChannel")
            .field("bdev", &self.bdev.name())
            .field("thread", &self.thread.name())
            .finish()
    }
}

impl BdevChannel {
    pub(crate) fn new(
        bdev: &Arc<Bdev>,
        thread: &Arc<Thread>,
    ) -> Arc<BdevChannel> {
        let rt = bdev.runtime();
        let module_channel = bdev.ops().get_io_channel(thread);
        let key = bdev.ops().shared_resource_key(&module_channel);
        let shared = SharedResource::get(&rt, thread, key);

        let qos = bdev.inner.lock().qos.clone();
        if let Some(q) = &qos {
            // First channel to touch the bdev after QoS enable owns the
            // refill poller.
            q.adopt_owner(thread);
        }

        let stats = BdevIoStats {
            tick_rate: rt.ticks_hz(),
            ..Default::default()
        };
        let histogram = bdev
            .inner
            .lock()
            .histogram_enabled
            .then(super::stats::LatencyHistogram::default);

        Arc::new(BdevChannel {
            bdev: bdev.clone(),
            thread: thread.clone(),
            module_channel,
            shared,
            refs: AtomicU32::new(1),
            inner: Mutex::new(ChanInner {
                reset_in_progress: false,
                qos,
                qos_queue: VecDeque::new(),
                io_submitted: Vec::new(),
                io_locked: VecDeque::new(),
                local_ranges: Vec::new(),
                stats,
                histogram,
                io_outstanding: 0,
            }),
        })
    }

    pub fn bdev(&self) -> &Arc<Bdev> {
        &self.bdev
    }

    pub fn thread(&self) -> Arc<Thread> {
        self.thread.clone()
    }

    pub(crate) fn module_channel(&self) -> &ModuleChannel {
        &self.module_channel
    }

    pub(crate) fn get_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; the channel disappears from the bdev when the
    /// last one goes.
    pub fn put(self: &Arc<Self>) {
        if self.refs.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.bdev.forget_channel(self.thread.id());
            let inner = self.inner.lock();
            if !inner.qos_queue.is_empty()
                || !inner.io_locked.is_empty()
                || inner.io_outstanding != 0
            {
                warn!(
                    bdev = self.bdev.name(),
                    "channel destroyed with queued I/O"
                );
            }
        }
    }

    pub fn io_outstanding(&self) -> u64 {
        self.inner.lock().io_outstanding
    }

    pub(crate) fn shared(&self) -> &Arc<SharedResource> {
        &self.shared
    }

    pub(crate) fn set_qos(&self, qos: Option<Arc<Qos>>) {
        self.inner.lock().qos = qos;
    }

    pub(crate) fn peek_qos_queue(&self) -> Option<Arc<BdevIo>> {
        self.inner.lock().qos_queue.front().cloned()
    }

    pub(crate) fn pop_qos_queue(&self) -> Option<Arc<BdevIo>> {
        self.inner.lock().qos_queue.pop_front()
    }

    /// Collect and optionally reset this channel's stats block.
    pub(crate) fn collect_stats(&self, reset: StatReset) -> BdevIoStats {
        let mut inner = self.inner.lock();
        let out = inner.stats;
        inner.stats.reset(reset);
        out
    }

    /// This channel's latency histogram, when enabled on the bdev.
    pub fn histogram(&self) -> Option<super::stats::LatencyHistogram> {
        self.inner.lock().histogram.clone()
    }

    pub(crate) fn add_locked_range(&self, range: &Arc<LbaRange>) {
        self.inner.lock().local_ranges.push(range.clone());
    }

    pub(crate) fn remove_locked_range(&self, range: &Arc<LbaRange>) {
        self.inner
            .lock()
            .local_ranges
            .retain(|r| !Arc::ptr_eq(r, range));
    }

    /// Whether any submitted I/O on this channel still overlaps the
    /// range (lock-holder traffic excluded).
    pub(crate) fn has_conflicting_outstanding(
        self: &Arc<Self>,
        range: &Arc<LbaRange>,
    ) -> bool {
        let inner = self.inner.lock();
        inner.io_submitted.iter().any(|io| {
            let (off, len) = io.lba_range();
            range.overlaps(off, len) && !self.io_holds_lock(io, range)
        })
    }

    fn io_holds_lock(
        self: &Arc<Self>,
        io: &Arc<BdevIo>,
        range: &Arc<LbaRange>,
    ) -> bool {
        io.ctx.lock().caller_ctx == range.ctx
            && range
                .owner_channel
                .upgrade()
                .map(|c| Arc::ptr_eq(&c, self))
                .unwrap_or(false)
    }

    /// Feed I/O parked behind a released range back into the submit path.
    pub(crate) fn drain_locked_ios(self: &Arc<Self>, range: &Arc<LbaRange>) {
        let drained: Vec<Arc<BdevIo>> = {
            let mut inner = self.inner.lock();
            let mut rest = VecDeque::new();
            let mut out = Vec::new();
            while let Some(io) = inner.io_locked.pop_front() {
                let (off, len) = io.lba_range();
                if range.overlaps(off, len) {
                    out.push(io);
                } else {
                    rest.push_back(io);
                }
            }
            inner.io_locked = rest;
            out
        };

        for io in drained {
            submit(self, &io);
        }
    }

    /// I/Os submitted through `desc` that are older than `deadline`.
    /// Split children are excluded.
    pub(crate) fn timed_out_ios(
        &self,
        desc: &Arc<super::desc::BdevDesc>,
        deadline: u64,
    ) -> Vec<Arc<BdevIo>> {
        let inner = self.inner.lock();
        inner
            .io_submitted
            .iter()
            .filter(|io| {
                let ctx = io.ctx.lock();
                ctx.parent.is_none()
                    && ctx.submit_tsc <= deadline
                    && ctx
                        .desc
                        .as_ref()
                        .map(|d| Arc::ptr_eq(d, desc))
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// Gate 2: would a local range hold this I/O back?
fn blocked_by_range(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) -> bool {
    let (off, len) = io.lba_range();
    let io_type = io.io_type();
    let caller_ctx = io.ctx.lock().caller_ctx;

    let inner = chan.inner.lock();
    inner.local_ranges.iter().any(|range| {
        if !range.overlaps(off, len) {
            return false;
        }
        // The lock holder's own traffic passes.
        let holder = caller_ctx == range.ctx
            && range
                .owner_channel
                .upgrade()
                .map(|c| Arc::ptr_eq(&c, chan))
                .unwrap_or(false);
        if holder {
            return false;
        }
        if range.quiesce {
            // Quiesce blocks everything, reads included.
            io_type.is_lockable() || io_type.is_read()
        } else {
            io_type.is_lockable()
        }
    })
}

/// Submit one I/O on its channel's thread, walking the gates in order.
pub(crate) fn submit(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    {
        let mut ctx = io.ctx.lock();
        if ctx.channel.is_none() {
            ctx.channel = Some(chan.clone());
        }
        if ctx.submit_tsc == 0 {
            ctx.submit_tsc = chan.bdev.runtime().ticks();
        }
    }

    // 1. Reset in progress freezes the channel.
    if chan.inner.lock().reset_in_progress {
        defer_complete(io, IoStatus::Aborted);
        return;
    }

    // 2. LBA range locks.
    if blocked_by_range(chan, io) {
        debug!(io = ?io, "held by range lock");
        chan.inner.lock().io_locked.push_back(io.clone());
        return;
    }

    // 3. Splitting.
    if split::should_split(io) {
        split::split_io(chan, io);
        return;
    }

    submit_past_split(chan, io);
}

/// Entry for split children and lock-released I/O: QoS onwards.
pub(crate) fn submit_past_split(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    // 4. QoS gate.
    let queued = {
        let mut inner = chan.inner.lock();
        match inner.qos.clone() {
            Some(qos) if qos.enabled() => {
                if !inner.qos_queue.is_empty() {
                    // Keep arrival order behind already queued I/O.
                    inner.qos_queue.push_back(io.clone());
                    true
                } else if !qos.try_admit(io) {
                    inner.qos_queue.push_back(io.clone());
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    };
    if queued {
        return;
    }

    resume_past_qos(chan, io);
}

/// Entry for QoS-admitted I/O: staging and module dispatch.
pub(crate) fn resume_past_qos(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    // 5. Buffer staging and metadata validation.
    if !stage_buffers(chan, io) {
        return;
    }

    // 6. NOMEM back-pressure: anything queued on the shared resource goes
    // ahead of us.
    {
        let mut shared = chan.shared.inner.lock();
        if !shared.nomem_io.is_empty() {
            io.ctx.lock().retry_state = RetryState::Submit;
            shared.nomem_io.push_back(io.clone());
            return;
        }
    }

    submit_to_module(chan, io);
}

/// Gate 5 body. Returns false when the I/O completed with an error.
fn stage_buffers(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) -> bool {
    let bdev = chan.bdev();
    let props = bdev.props().clone();
    let ops = bdev.ops().clone();

    let (needs_bounce, pract, has_md) = {
        let ctx = io.ctx.lock();
        (
            ctx.ext.memory_domain && ops.get_memory_domains() == 0,
            props.dif_check_flags & DIF_CHECK_PRACT != 0
                && io.io_type() == IoType::Write,
            ctx.md_buf.is_some(),
        )
    };

    // Separate metadata cannot be combined with PRACT generation.
    if pract && has_md && !props.md_interleave {
        defer_complete(io, IoStatus::Failed);
        return false;
    }

    // Accel sequences the module cannot run are executed by this layer
    // before dispatch; modelled as a synchronous step.
    {
        let mut ctx = io.ctx.lock();
        if ctx.ext.accel_sequence
            && !ops.accel_sequence_supported(io.io_type())
        {
            ctx.ext.accel_sequence = false;
        }
    }

    if needs_bounce {
        // Pull the payload into a locally addressable bounce buffer.
        let mut ctx = io.ctx.lock();
        if ctx.bounce.is_none() {
            let len: u64 = ctx.iovs.iter().map(|v| v.len).sum();
            ctx.bounce = Some(IoBuffer::alloc(len as usize));
            ctx.retry_state = RetryState::Pull;
        }
    }

    true
}

/// Gate 7: hand the I/O to the module, counting it outstanding first.
fn submit_to_module(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    {
        let mut inner = chan.inner.lock();
        inner.io_outstanding += 1;
        inner.io_submitted.push(io.clone());
    }
    chan.shared.inner.lock().io_outstanding += 1;

    io.ctx.lock().in_submit = true;
    chan.bdev.ops().submit_request(&chan.module_channel, io);
    io.ctx.lock().in_submit = false;
}

/// Complete an I/O that never reached the module (gate failures). The
/// callback is deferred through the channel's thread so no completion
/// ever runs in the caller's stack frame.
pub(crate) fn defer_complete(io: &Arc<BdevIo>, status: IoStatus) {
    let io = io.clone();
    let thread = io
        .channel()
        .map(|c| c.thread())
        .or_else(Thread::current)
        .expect("completion requires a thread");
    thread.send_msg(move || {
        finish_io(&io, status);
    });
}

/// Module-facing completion entry point (`BdevIo::complete`).
pub(crate) fn io_complete(io: &Arc<BdevIo>, status: IoStatus) {
    if io.io_type() == IoType::Reset {
        reset_io_done(io, status);
        return;
    }

    let Some(chan) = io.channel() else {
        finish_io(io, status);
        return;
    };

    // Remove from the submitted list and drop the outstanding counts.
    let was_submitted = {
        let mut inner = chan.inner.lock();
        let before = inner.io_submitted.len();
        inner.io_submitted.retain(|s| !Arc::ptr_eq(s, io));
        let removed = before != inner.io_submitted.len();
        if removed {
            inner.io_outstanding -= 1;
        }
        removed
    };

    let (outstanding, threshold, has_nomem) = {
        let mut shared = chan.shared.inner.lock();
        if was_submitted {
            shared.io_outstanding -= 1;
        }
        (
            shared.io_outstanding,
            shared.nomem_threshold,
            !shared.nomem_io.is_empty(),
        )
    };

    if status == IoStatus::NoMemory {
        nomem_defer(&chan, io);
        return;
    }

    // Post-processing for bounced payloads: push data back to the origin
    // buffer on reads.
    {
        let mut ctx = io.ctx.lock();
        if ctx.bounce.is_some() && io.io_type() == IoType::Read {
            ctx.retry_state = RetryState::Push;
        }
        ctx.bounce = None;
        ctx.retry_state = RetryState::Invalid;
    }

    // Stats and error counters before the callback.
    if status.is_success() {
        let rt = chan.bdev.runtime();
        let latency = rt.ticks().saturating_sub(io.submit_tsc());
        let (populate, start) = {
            let ctx = io.ctx.lock();
            (ctx.zcopy_populate, ctx.zcopy_start)
        };
        let mut inner = chan.inner.lock();
        inner.stats.account(
            io.io_type(),
            io.byte_count(),
            latency,
            populate,
            start,
        );
        if let Some(h) = inner.histogram.as_mut() {
            h.record(latency);
        }
    } else if let IoStatus::NvmeError(st) = status {
        chan.bdev.count_error(st.sct, st.sc);
    }

    if has_nomem && outstanding <= threshold {
        retry_nomem_queue(&chan);
    }

    // A completion that arrives while submit is still on the stack is
    // deferred to the channel's thread.
    if io.ctx.lock().in_submit {
        let io2 = io.clone();
        chan.thread().send_msg(move || finish_io(&io2, status));
    } else {
        finish_io(io, status);
    }
}

/// Park a NOMEM rejection at the head of the shared retry queue.
fn nomem_defer(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    {
        let mut ctx = io.ctx.lock();
        ctx.status = IoStatus::Pending;
        if ctx.retry_state == RetryState::Invalid {
            ctx.retry_state = RetryState::Submit;
        }
    }

    let mut shared = chan.shared.inner.lock();
    shared.nomem_io.push_front(io.clone());
    shared.nomem_threshold = (shared.io_outstanding / 2)
        .max(shared.io_outstanding.saturating_sub(8));

    if shared.io_outstanding == 0 && shared.retry_poller.is_none() {
        // Queue depth one: no completion will ever trigger the retry.
        let thread = chan
            .shared
            .thread
            .upgrade()
            .expect("shared resource outlived its thread");
        let chan2 = chan.clone();
        shared.retry_poller = Some(
            poller::Builder::new()
                .with_name("bdev_nomem_retry")
                .with_interval_us(NOMEM_RETRY_POLL_US)
                .with_poll_fn(move || {
                    let stop = {
                        let shared = chan2.shared.inner.lock();
                        shared.nomem_io.is_empty()
                    };
                    if stop {
                        let mut shared = chan2.shared.inner.lock();
                        shared.retry_poller = None;
                        return PollStatus::Idle;
                    }
                    retry_nomem_queue(&chan2);
                    PollStatus::Busy
                })
                .build(&thread),
        );
    }
}

/// Walk the shared NOMEM queue in order, resuming each I/O at its
/// recorded step.
fn retry_nomem_queue(chan: &Arc<BdevChannel>) {
    loop {
        let io = {
            let mut shared = chan.shared.inner.lock();
            match shared.nomem_io.pop_front() {
                Some(io) => io,
                None => break,
            }
        };

        let (state, io_chan) = {
            let ctx = io.ctx.lock();
            (ctx.retry_state, ctx.channel.clone())
        };
        let io_chan = io_chan.unwrap_or_else(|| chan.clone());

        match state {
            RetryState::Submit => submit_to_module(&io_chan, &io),
            // Staging steps resume from the top of the staging gate.
            RetryState::Pull
            | RetryState::PullMd
            | RetryState::Push
            | RetryState::PushMd
            | RetryState::GetAccelBuf => resume_past_qos(&io_chan, &io),
            RetryState::Invalid => submit_to_module(&io_chan, &io),
        }

        // If the module rejected it again on the spot, it is back at the
        // head of the queue; stop to preserve ordering.
        let bounced = {
            let shared = chan.shared.inner.lock();
            shared
                .nomem_io
                .front()
                .map(|f| Arc::ptr_eq(f, &io))
                .unwrap_or(false)
        };
        if bounced {
            break;
        }
    }
}

/// Final completion: stats are done, run the callback and release the
/// descriptor reference and pool credit.
fn finish_io(io: &Arc<BdevIo>, status: IoStatus) {
    let (cb, desc) = {
        let mut ctx = io.ctx.lock();
        ctx.status = status;
        (ctx.cb.take(), ctx.desc.take())
    };

    if let Some(cb) = cb {
        cb(io, status);
    }

    if let Some(desc) = desc {
        let rt = desc.bdev().runtime();
        if let Some(chan) = io.channel() {
            rt.io_pool.put(chan.thread().id());
        }
        desc.io_ref_put();
    }

    io.ctx.lock().channel = None;
}

/// Split-parent completion: bypasses the submitted-list bookkeeping, the
/// parent never reached the module itself.
pub(crate) fn complete_parent(io: &Arc<BdevIo>, status: IoStatus) {
    if io.ctx.lock().in_submit {
        defer_complete(io, status);
    } else {
        finish_io(io, status);
    }
}

// Reset handling.

/// Submit a reset I/O: freeze every channel, abort queued work, then hand
/// the reset to the module once the freeze is global.
pub(crate) fn submit_reset(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    let bdev = chan.bdev().clone();

    {
        let mut inner = bdev.inner.lock();
        if inner.reset_in_progress.is_some() {
            // One reset at a time; later ones share its completion.
            inner.pending_resets.push_back(io.clone());
            return;
        }
        inner.reset_in_progress = Some(io.clone());
    }

    let origin = chan.thread();
    let chan2 = chan.clone();
    let io2 = io.clone();

    for_each(
        origin,
        bdev.channels(),
        move |c, cont| {
            freeze_channel(c);
            cont.done(0);
        },
        move |_| {
            submit_to_module(&chan2, &io2);
        },
    );
}

/// Set the freeze flag and abort everything queued on this channel.
fn freeze_channel(chan: &Arc<BdevChannel>) {
    let (qos_queued, locked, nomem): (
        Vec<Arc<BdevIo>>,
        Vec<Arc<BdevIo>>,
        Vec<Arc<BdevIo>>,
    ) = {
        let mut inner = chan.inner.lock();
        inner.reset_in_progress = true;
        let qos_queued = inner.qos_queue.drain(..).collect();
        let locked = inner.io_locked.drain(..).collect();

        let mut shared = chan.shared.inner.lock();
        let mut nomem = Vec::new();
        let mut keep = VecDeque::new();
        while let Some(io) = shared.nomem_io.pop_front() {
            let same = io
                .channel()
                .map(|c| Arc::ptr_eq(&c, chan))
                .unwrap_or(false);
            if same {
                nomem.push(io);
            } else {
                keep.push_back(io);
            }
        }
        shared.nomem_io = keep;
        (qos_queued, locked, nomem)
    };

    for io in qos_queued.into_iter().chain(locked).chain(nomem) {
        defer_complete(&io, IoStatus::Aborted);
    }
}

/// Reset completion from the module: thaw all channels, then finish the
/// reset and everything queued behind it with the same status.
fn reset_io_done(io: &Arc<BdevIo>, status: IoStatus) {
    let Some(chan) = io.channel() else {
        finish_io(io, status);
        return;
    };
    let bdev = chan.bdev().clone();

    // The reset was counted outstanding like any other module I/O.
    {
        let mut inner = chan.inner.lock();
        let before = inner.io_submitted.len();
        inner.io_submitted.retain(|s| !Arc::ptr_eq(s, io));
        if before != inner.io_submitted.len() {
            inner.io_outstanding -= 1;
            chan.shared.inner.lock().io_outstanding -= 1;
        }
    }

    let origin = chan.thread();
    let io2 = io.clone();

    for_each(
        origin,
        bdev.channels(),
        move |c, cont| {
            c.inner.lock().reset_in_progress = false;
            cont.done(0);
        },
        move |_| {
            let pending: Vec<Arc<BdevIo>> = {
                let mut inner = bdev.inner.lock();
                inner.reset_in_progress = None;
                inner.pending_resets.drain(..).collect()
            };
            for p in pending {
                finish_io(&p, status);
            }
            finish_io(&io2, status);
        },
    );
}

/// Issue a bdev-level reset outside the descriptor API (timeout action).
pub(crate) fn reset_bdev(bdev: &Arc<Bdev>) {
    let Some(thread) = Thread::current() else {
        return;
    };
    let chan = bdev.get_channel(&thread);
    let io = BdevIo::new(bdev.clone(), IoType::Reset);
    io.ctx.lock().channel = Some(chan.clone());
    submit_reset(&chan, &io);
}

// Abort handling.

/// Abort every queued or submitted I/O carrying `target_ctx`. Queued ones
/// finish immediately; submitted ones are handed to the module's abort
/// primitive. The abort parent completes once every match resolves.
pub(crate) fn submit_abort(
    chan: &Arc<BdevChannel>,
    abort_io: &Arc<BdevIo>,
    target_ctx: u64,
) {
    let abort_tsc = abort_io.submit_tsc();

    // Collect queued matches first.
    let mut queued: Vec<Arc<BdevIo>> = Vec::new();
    {
        let mut inner = chan.inner.lock();
        let mut keep = VecDeque::new();
        while let Some(io) = inner.io_locked.pop_front() {
            if io_matches(&io, target_ctx, abort_tsc) {
                queued.push(io);
            } else {
                keep.push_back(io);
            }
        }
        inner.io_locked = keep;

        let mut keep = VecDeque::new();
        while let Some(io) = inner.qos_queue.pop_front() {
            if io_matches(&io, target_ctx, abort_tsc) {
                queued.push(io);
            } else {
                keep.push_back(io);
            }
        }
        inner.qos_queue = keep;
    }
    {
        let mut shared = chan.shared.inner.lock();
        let mut keep = VecDeque::new();
        while let Some(io) = shared.nomem_io.pop_front() {
            if io_matches(&io, target_ctx, abort_tsc) {
                queued.push(io);
            } else {
                keep.push_back(io);
            }
        }
        shared.nomem_io = keep;
    }

    // Submitted matches go to the module, unless they are mid buffer
    // staging and cannot be touched.
    let submitted: Vec<Arc<BdevIo>> = chan
        .inner
        .lock()
        .io_submitted
        .iter()
        .filter(|io| io_matches(io, target_ctx, abort_tsc))
        .cloned()
        .collect();

    let unabortable = submitted.iter().any(|io| {
        matches!(
            io.ctx.lock().retry_state,
            RetryState::Pull
                | RetryState::PullMd
                | RetryState::Push
                | RetryState::PushMd
                | RetryState::GetAccelBuf
        )
    });

    let matched_any = !queued.is_empty() || !submitted.is_empty();
    for io in queued {
        defer_complete(&io, IoStatus::Aborted);
    }

    if unabortable {
        defer_complete(abort_io, IoStatus::Failed);
        return;
    }

    if submitted.is_empty() {
        let status = if matched_any {
            IoStatus::Success
        } else {
            IoStatus::Failed
        };
        defer_complete(abort_io, status);
        return;
    }

    // Fan one module abort out per submitted match and gather their
    // completions on the parent.
    let total = submitted.len() as u32;
    let state = Arc::new(Mutex::new((total, true)));
    for target in submitted {
        let child = BdevIo::new(chan.bdev().clone(), IoType::Abort);
        {
            let mut ctx = child.ctx.lock();
            ctx.channel = Some(chan.clone());
            ctx.abort_target = Some(target);
        }
        let parent = abort_io.clone();
        let state2 = state.clone();
        child.ctx.lock().cb = Some(Box::new(move |_io, status| {
            let done = {
                let mut s = state2.lock();
                s.0 -= 1;
                if !status.is_success() {
                    s.1 = false;
                }
                s.0 == 0
            };
            if done {
                let ok = state2.lock().1;
                defer_complete(
                    &parent,
                    if ok {
                        IoStatus::Success
                    } else {
                        IoStatus::Failed
                    },
                );
            }
        }));
        submit_to_module(chan, &child);
    }
}

fn io_matches(io: &Arc<BdevIo>, target_ctx: u64, abort_tsc: u64) -> bool {
    let ctx = io.ctx.lock();
    ctx.caller_ctx == target_ctx
        && ctx.caller_ctx != 0
        && ctx.submit_tsc <= abort_tsc
}
