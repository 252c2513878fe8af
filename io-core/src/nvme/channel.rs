//! The multipath channel: the per-thread io-path set of one NVMe bdev,
//! path selection, and the time-ordered retry queue.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{namespace::NvmeNs, qpair::NvmeQpair};
use crate::{
    bdev::{io::BdevIo, stats::BdevIoStats},
    core::{poller, PollStatus, Thread},
};

/// How I/O spreads over the available paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultipathPolicy {
    ActivePassive,
    ActiveActive,
}

/// Path selector used by the active/active policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultipathSelector {
    RoundRobin,
    QueueDepth,
}

/// One (namespace, qpair) pairing an I/O can be dispatched on.
pub struct NvmeIoPath {
    pub(crate) ns: Arc<NvmeNs>,
    pub(crate) qpair: Arc<NvmeQpair>,
    /// Per-path statistics, present when the io_path_stat option is on.
    pub(crate) stat: Option<Mutex<BdevIoStats>>,
}

impl std::fmt::Debug for NvmeIoPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeIoPath")
            .field("ns", &self.ns)
            .field("qpair", &self.qpair)
            .finish()
    }
}

impl NvmeIoPath {
    pub fn is_available(&self) -> bool {
        self.qpair.is_connected() && self.ns.is_accessible()
    }

    pub fn ns(&self) -> &Arc<NvmeNs> {
        &self.ns
    }

    pub fn qpair(&self) -> &Arc<NvmeQpair> {
        &self.qpair
    }

    pub fn stats(&self) -> Option<BdevIoStats> {
        self.stat.as_ref().map(|s| *s.lock())
    }
}

pub(crate) struct MpInner {
    pub io_paths: Vec<Arc<NvmeIoPath>>,
    /// Cached selection for active/passive and round robin.
    pub current: Option<usize>,
    pub policy: MultipathPolicy,
    pub selector: MultipathSelector,
    pub rr_counter: u32,
    pub rr_min_io: u32,
    pub retry_queue: VecDeque<Arc<BdevIo>>,
    pub retry_poller: Option<poller::Poller>,
    /// Frozen by a reset I/O walking the paths.
    pub resetting: bool,
}

/// Per-thread channel of one NVMe multipath bdev. This is the module
/// channel object handed back to the generic layer.
pub struct NvmeBdevChannel {
    pub(crate) bdev: Weak<super::bdev::NvmeBdev>,
    pub(crate) thread: Arc<Thread>,
    pub(crate) inner: Mutex<MpInner>,
}

impl NvmeBdevChannel {
    pub(crate) fn new(
        nbdev: &Arc<super::bdev::NvmeBdev>,
        thread: &Arc<Thread>,
    ) -> Arc<Self> {
        let (policy, selector, rr_min_io) = nbdev.mp_policy();
        let io_path_stat = nbdev.opts().io_path_stat;

        let mut io_paths = Vec::new();
        for ns in nbdev.namespaces() {
            let Some(ctrlr) = ns.ctrlr() else {
                continue;
            };
            let ch = ctrlr.get_channel(thread);
            io_paths.push(Arc::new(NvmeIoPath {
                ns,
                qpair: ch.qpair().clone(),
                stat: io_path_stat
                    .then(|| Mutex::new(BdevIoStats::default())),
            }));
        }

        let chan = Arc::new(Self {
            bdev: Arc::downgrade(nbdev),
            thread: thread.clone(),
            inner: Mutex::new(MpInner {
                io_paths,
                current: None,
                policy,
                selector,
                rr_counter: 0,
                rr_min_io,
                retry_queue: VecDeque::new(),
                retry_poller: None,
                resetting: false,
            }),
        });

        for path in chan.inner.lock().io_paths.iter() {
            path.qpair
                .mp_channels
                .lock()
                .push(Arc::downgrade(&chan));
        }
        chan
    }

    pub fn thread(&self) -> Arc<Thread> {
        self.thread.clone()
    }

    pub fn io_paths(&self) -> Vec<Arc<NvmeIoPath>> {
        self.inner.lock().io_paths.clone()
    }

    pub(crate) fn clear_current_path(&self) {
        let mut inner = self.inner.lock();
        inner.current = None;
        inner.rr_counter = 0;
    }

    /// Grow the path set when a namespace joins the bdev.
    pub(crate) fn add_io_path(self: &Arc<Self>, ns: &Arc<NvmeNs>) {
        let Some(nbdev) = self.bdev.upgrade() else {
            return;
        };
        let Some(ctrlr) = ns.ctrlr() else {
            return;
        };
        let ch = ctrlr.get_channel(&self.thread);
        let path = Arc::new(NvmeIoPath {
            ns: ns.clone(),
            qpair: ch.qpair().clone(),
            stat: nbdev
                .opts()
                .io_path_stat
                .then(|| Mutex::new(BdevIoStats::default())),
        });
        path.qpair.mp_channels.lock().push(Arc::downgrade(self));

        let mut inner = self.inner.lock();
        inner.io_paths.push(path);
        inner.current = None;
    }

    /// Drop the path built on a removed namespace.
    pub(crate) fn remove_io_path(&self, ns: &Arc<NvmeNs>) {
        let mut inner = self.inner.lock();
        inner.io_paths.retain(|p| !Arc::ptr_eq(&p.ns, ns));
        inner.current = None;
    }

    pub(crate) fn set_policy(
        &self,
        policy: MultipathPolicy,
        selector: MultipathSelector,
        rr_min_io: u32,
    ) {
        let mut inner = self.inner.lock();
        inner.policy = policy;
        inner.selector = selector;
        inner.rr_min_io = rr_min_io;
        inner.current = None;
        inner.rr_counter = 0;
    }

    /// Reorder the path set so the namespace served by `cntlid` comes
    /// first (preferred path).
    pub(crate) fn set_preferred(&self, cntlid: u16) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.io_paths.iter().position(|p| {
            p.ns
                .ctrlr()
                .map(|c| c.data().cntlid == cntlid)
                .unwrap_or(false)
        }) {
            let p = inner.io_paths.remove(pos);
            inner.io_paths.insert(0, p);
            inner.current = None;
        }
    }

    /// Select the io path for one I/O, honouring the policy.
    pub fn find_io_path(&self) -> Option<Arc<NvmeIoPath>> {
        let mut inner = self.inner.lock();

        let cached = inner.current.filter(|c| *c < inner.io_paths.len());
        if let Some(cur) = cached {
            match inner.policy {
                MultipathPolicy::ActivePassive => {
                    let path = inner.io_paths[cur].clone();
                    if path.is_available() {
                        return Some(path);
                    }
                }
                MultipathPolicy::ActiveActive
                    if inner.selector == MultipathSelector::RoundRobin =>
                {
                    inner.rr_counter += 1;
                    if inner.rr_counter < inner.rr_min_io {
                        let path = inner.io_paths[cur].clone();
                        if path.is_available() {
                            return Some(path);
                        }
                    }
                    inner.rr_counter = 0;
                }
                _ => {}
            }
        }

        match (inner.policy, inner.selector) {
            (MultipathPolicy::ActiveActive, MultipathSelector::QueueDepth) => {
                Self::find_min_qd(&mut inner)
            }
            _ => Self::find_circular(&mut inner),
        }
    }

    /// Circular scan from the cached path: first optimized wins, first
    /// non-optimized is remembered as fallback. The fallback is cached
    /// too; an ANA event clears the cache.
    fn find_circular(inner: &mut MpInner) -> Option<Arc<NvmeIoPath>> {
        let n = inner.io_paths.len();
        if n == 0 {
            return None;
        }
        let start = inner.current.map(|c| (c + 1) % n).unwrap_or(0);

        let mut non_optimized: Option<usize> = None;
        for step in 0 .. n {
            let idx = (start + step) % n;
            let path = &inner.io_paths[idx];
            if !path.is_available() {
                continue;
            }
            match path.ns.ana_state() {
                super::ana::AnaState::Optimized => {
                    inner.current = Some(idx);
                    return Some(path.clone());
                }
                super::ana::AnaState::NonOptimized => {
                    if non_optimized.is_none() {
                        non_optimized = Some(idx);
                    }
                }
                _ => {}
            }
        }

        inner.current = non_optimized;
        non_optimized.map(|i| inner.io_paths[i].clone())
    }

    /// Queue-depth selector: no caching, pick the connected path with
    /// the fewest outstanding requests, optimized before non-optimized.
    fn find_min_qd(inner: &mut MpInner) -> Option<Arc<NvmeIoPath>> {
        let mut optimized: Option<(u32, usize)> = None;
        let mut non_optimized: Option<(u32, usize)> = None;

        for (idx, path) in inner.io_paths.iter().enumerate() {
            if !path.qpair.is_connected() || !path.ns.is_active() {
                continue;
            }
            let qd = path.qpair.outstanding_requests();
            match path.ns.ana_state() {
                super::ana::AnaState::Optimized => {
                    if optimized.map(|(m, _)| qd < m).unwrap_or(true) {
                        optimized = Some((qd, idx));
                    }
                }
                super::ana::AnaState::NonOptimized => {
                    if non_optimized.map(|(m, _)| qd < m).unwrap_or(true) {
                        non_optimized = Some((qd, idx));
                    }
                }
                _ => {}
            }
        }

        optimized
            .or(non_optimized)
            .map(|(_, i)| inner.io_paths[i].clone())
    }

    /// Whether queueing for retry makes sense: some path either has a
    /// live qpair or an unfailed controller, and its ANA transition has
    /// not timed out.
    pub fn any_io_path_may_become_available(&self) -> bool {
        let inner = self.inner.lock();
        if inner.resetting {
            return false;
        }
        inner.io_paths.iter().any(|path| {
            if path.ns.ana_transition_timedout() {
                return false;
            }
            if path.qpair.is_connected() {
                return true;
            }
            path.ns
                .ctrlr()
                .map(|c| !c.is_failed())
                .unwrap_or(false)
        })
    }

    /// Queue an I/O for retry after `delay_ms`, keeping the queue sorted
    /// by firing time, and (re)arm the poller for the earliest entry.
    pub(crate) fn queue_retry_io(
        self: &Arc<Self>,
        io: &Arc<BdevIo>,
        delay_ms: u64,
    ) {
        let rt = io.bdev().runtime();
        let ticks = rt.ticks() + rt.clock().ms_to_ticks(delay_ms);
        super::io::set_retry_ticks(io, ticks);

        let mut inner = self.inner.lock();
        let pos = inner
            .retry_queue
            .iter()
            .rposition(|q| super::io::retry_ticks(q) <= ticks)
            .map(|p| p + 1)
            .unwrap_or(0);
        inner.retry_queue.insert(pos, io.clone());
        debug!(delay_ms, "queued I/O for retry");

        self.arm_retry_poller(&mut inner, delay_ms * 1_000);
    }

    fn arm_retry_poller(
        self: &Arc<Self>,
        inner: &mut MpInner,
        delay_us: u64,
    ) {
        let chan = Arc::downgrade(self);
        inner.retry_poller = Some(
            poller::Builder::new()
                .with_name("bdev_nvme_retry_ios")
                .with_interval_us(delay_us)
                .with_poll_fn(move || {
                    if let Some(chan) = chan.upgrade() {
                        chan.run_retries();
                    }
                    PollStatus::Busy
                })
                .build(&self.thread),
        );
    }

    /// Fire due retries; re-arm for the next pending entry.
    pub(crate) fn run_retries(self: &Arc<Self>) {
        let rt = match self.bdev.upgrade() {
            Some(b) => b.runtime(),
            None => return,
        };
        let now = rt.ticks();

        loop {
            let io = {
                let mut inner = self.inner.lock();
                match inner.retry_queue.front() {
                    Some(io) if super::io::retry_ticks(io) <= now => {
                        inner.retry_queue.pop_front()
                    }
                    _ => break,
                }
            };
            if let Some(io) = io {
                super::io::retry_io(self, &io);
            }
        }

        let mut inner = self.inner.lock();
        inner.retry_poller = None;
        if let Some(io) = inner.retry_queue.front().cloned() {
            let delay_ticks =
                super::io::retry_ticks(&io).saturating_sub(now);
            let hz = rt.ticks_hz();
            let delay_us = delay_ticks.saturating_mul(1_000_000) / hz;
            self.arm_retry_poller(&mut inner, delay_us);
        }
    }

    /// Abort everything parked for retry.
    pub(crate) fn abort_retry_ios(&self) {
        let drained: Vec<Arc<BdevIo>> = {
            let mut inner = self.inner.lock();
            inner.retry_poller = None;
            inner.retry_queue.drain(..).collect()
        };
        for io in drained {
            crate::bdev::channel::defer_complete(
                &io,
                crate::bdev::io::IoStatus::Aborted,
            );
        }
    }

    /// Remove one I/O from the retry queue (abort by handle).
    pub(crate) fn abort_retry_io(&self, target: &Arc<BdevIo>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.retry_queue.len();
        inner.retry_queue.retain(|io| !Arc::ptr_eq(io, target));
        before != inner.retry_queue.len()
    }

    pub(crate) fn set_resetting(&self, resetting: bool) {
        self.inner.lock().resetting = resetting;
    }
}

/// Invalidate the cached path of every channel fed by this qpair.
pub(crate) fn clear_caches_for_qpair(qpair: &Arc<NvmeQpair>) {
    let channels: Vec<Arc<NvmeBdevChannel>> = {
        let mut list = qpair.mp_channels.lock();
        list.retain(|w| w.strong_count() > 0);
        list.iter().filter_map(|w| w.upgrade()).collect()
    };
    for ch in channels {
        ch.clear_current_path();
    }
}
