//! The process-wide engine state: logical threads, the tick clock, the
//! bdev name tables, the shared `BdevIo` pool and the registered bdev
//! modules. Built once by [`Runtime::init`] and passed by handle into
//! every API that needs it; nothing in the crate reaches for a hidden
//! global.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{thread::Thread, ticks::TickSource};
use crate::bdev::{module::BdevModule, pool::IoPool, Bdev};

/// Global bdev layer options, configured before `Runtime::init`.
#[derive(Debug, Clone)]
pub struct BdevOpts {
    /// Size of the shared `BdevIo` pool.
    pub bdev_io_pool_size: u32,
    /// Per-thread `BdevIo` cache size.
    pub bdev_io_cache_size: u32,
    /// When false, newly registered bdevs are examined only if named in
    /// the examine allow-list.
    pub bdev_auto_examine: bool,
    /// Per-thread small data buffer cache.
    pub iobuf_small_cache_size: u32,
    /// Per-thread large data buffer cache.
    pub iobuf_large_cache_size: u32,
}

impl Default for BdevOpts {
    fn default() -> Self {
        Self {
            bdev_io_pool_size: 65_535,
            bdev_io_cache_size: 256,
            bdev_auto_examine: true,
            iobuf_small_cache_size: 128,
            iobuf_large_cache_size: 16,
        }
    }
}

/// Name tables guarded by the manager lock. Aliases map onto primary bdev
/// names; both namespaces must stay collision free.
#[derive(Default)]
pub(crate) struct BdevMgr {
    pub bdevs: BTreeMap<String, Arc<Bdev>>,
    pub aliases: BTreeMap<String, String>,
    pub examine_allowlist: HashSet<String>,
    pub open_waiters: Vec<crate::bdev::desc::OpenWaiter>,
}

pub struct Runtime {
    opts: BdevOpts,
    clock: TickSource,
    threads: Mutex<Vec<Arc<Thread>>>,
    next_thread_id: AtomicU64,
    pub(crate) bdev_mgr: Mutex<BdevMgr>,
    pub(crate) io_pool: IoPool,
    pub(crate) modules: Mutex<Vec<Arc<dyn BdevModule>>>,
    /// Shared NOMEM back-pressure state keyed by (thread, underlying
    /// channel identity).
    pub(crate) shared_resources: Mutex<
        std::collections::HashMap<
            (u64, usize),
            std::sync::Weak<crate::bdev::channel::SharedResource>,
        >,
    >,
}

impl Runtime {
    /// Build the runtime with the given options and tick source.
    pub fn init(opts: BdevOpts, clock: TickSource) -> Arc<Self> {
        info!(?opts, "initializing bdev runtime");

        let io_pool =
            IoPool::new(opts.bdev_io_pool_size, opts.bdev_io_cache_size);

        Arc::new(Self {
            opts,
            clock,
            threads: Mutex::new(Vec::new()),
            next_thread_id: AtomicU64::new(1),
            bdev_mgr: Mutex::new(BdevMgr::default()),
            io_pool,
            modules: Mutex::new(Vec::new()),
            shared_resources: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Convenience constructor with default options and the system clock.
    pub fn init_default() -> Arc<Self> {
        Self::init(BdevOpts::default(), TickSource::system())
    }

    pub fn opts(&self) -> &BdevOpts {
        &self.opts
    }

    pub fn clock(&self) -> &TickSource {
        &self.clock
    }

    pub fn ticks(&self) -> u64 {
        self.clock.ticks()
    }

    pub fn ticks_hz(&self) -> u64 {
        self.clock.ticks_hz()
    }

    /// Advance a manual tick source; no effect on the system source.
    pub fn advance_ticks(&self, ticks: u64) {
        self.clock.advance(ticks);
    }

    /// Create and register a new logical thread.
    pub fn spawn_thread(self: &Arc<Self>, name: &str) -> Arc<Thread> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = Thread::new(self, id, name);

        let mut threads = self.threads.lock();
        threads.push(thread.clone());

        // The io pool must be able to back every per-thread cache plus one
        // transient management channel.
        let needed =
            self.opts.bdev_io_cache_size as u64 * (threads.len() as u64 + 1);
        if (self.opts.bdev_io_pool_size as u64) < needed {
            warn!(
                pool = self.opts.bdev_io_pool_size,
                needed, "bdev io pool too small for per-thread caches"
            );
        }

        thread
    }

    /// Snapshot of all registered threads.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    /// Look up a thread by id.
    pub fn thread_by_id(&self, id: u64) -> Option<Arc<Thread>> {
        self.threads.lock().iter().find(|t| t.id() == id).cloned()
    }

    /// Poll every thread once; returns the total work done.
    pub fn poll_once(&self) -> usize {
        let threads = self.threads();
        threads.iter().map(|t| t.poll()).sum()
    }

    /// Poll all threads until a full sweep does no work. Returns false if
    /// the iteration cap was hit, which indicates a livelock (a poller
    /// reporting busy forever without a clock advance).
    pub fn drain(&self) -> bool {
        for _ in 0 .. 10_000 {
            if self.poll_once() == 0 {
                return true;
            }
        }
        false
    }

    /// Register a bdev module. Modules participate in examine and claim
    /// arbitration.
    pub fn register_module(&self, module: Arc<dyn BdevModule>) {
        self.modules.lock().push(module);
    }

    /// Add a bdev name to the examine allow-list used when auto examine is
    /// off.
    pub fn examine_allow(&self, name: &str) {
        self.bdev_mgr.lock().examine_allowlist.insert(name.to_string());
    }

    /// Tear the runtime down: drain outstanding work and drop the name
    /// tables. Bdevs should have been unregistered by their owners first.
    pub fn fini(&self) {
        self.drain();

        let mut mgr = self.bdev_mgr.lock();
        if !mgr.bdevs.is_empty() {
            warn!(
                remaining = mgr.bdevs.len(),
                "runtime finishing with registered bdevs"
            );
        }
        mgr.bdevs.clear();
        mgr.aliases.clear();

        self.threads.lock().clear();
        info!("bdev runtime finished");
    }
}
