//! The logical block device: registration, identity, geometry and limits,
//! the per-bdev lock and everything it guards (descriptors, claims, range
//! locks, QoS) plus channel management.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Weak,
    },
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    channel::BdevChannel,
    claim::{ClaimOpts, ClaimRecord, ClaimState, ClaimType},
    desc::{BdevDesc, BdevEvent},
    io::BdevIo,
    lock::LbaRange,
    module::{BdevModule, BdevOps},
    qos::Qos,
    stats::{BdevIoStats, ErrorStat, StatReset},
};
use crate::core::{thread::for_each, CoreError, Runtime, Thread};

/// Registration state of a bdev.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BdevStatus {
    Ready,
    Unregistering,
    Removed,
}

/// Zoned device geometry; all zero for conventional devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneInfo {
    pub zoned: bool,
    pub zone_size: u64,
    pub num_zones: u64,
    pub max_zone_append_size: u32,
    pub max_open_zones: u32,
    pub max_active_zones: u32,
    pub optimal_open_zones: u32,
}

/// End-to-end data protection configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DifType {
    #[default]
    None,
    Type1,
    Type2,
    Type3,
}

/// Immutable identity and limits, set by the module at build time.
#[derive(Debug, Clone)]
pub struct BdevProps {
    pub name: String,
    pub product_name: String,
    pub uuid: Uuid,
    pub block_len: u64,
    pub write_unit_size: u64,
    pub optimal_io_boundary: u64,
    /// Largest single read/write in blocks; zero means unlimited.
    pub max_rw_size: u64,
    /// Largest payload segment in bytes; zero means unlimited.
    pub max_segment_size: u64,
    /// Most segments per I/O; zero means unlimited.
    pub max_num_segments: u32,
    pub max_unmap: u64,
    pub max_unmap_segments: u64,
    pub max_write_zeroes: u64,
    pub max_copy: u64,
    pub md_len: u32,
    pub md_interleave: bool,
    pub dif_type: DifType,
    pub dif_check_flags: u32,
    pub write_cache: bool,
    pub zone_info: ZoneInfo,
    pub ctratt: u32,
}

impl Default for BdevProps {
    fn default() -> Self {
        Self {
            name: String::new(),
            product_name: String::new(),
            uuid: Uuid::nil(),
            block_len: 512,
            write_unit_size: 1,
            optimal_io_boundary: 0,
            max_rw_size: 0,
            max_segment_size: 0,
            max_num_segments: 0,
            max_unmap: 0,
            max_unmap_segments: 0,
            max_write_zeroes: 0,
            max_copy: 0,
            md_len: 0,
            md_interleave: false,
            dif_type: DifType::None,
            dif_check_flags: 0,
            write_cache: false,
            zone_info: ZoneInfo::default(),
            ctratt: 0,
        }
    }
}

pub(crate) struct BdevInner {
    pub status: BdevStatus,
    pub open_descs: Vec<Arc<BdevDesc>>,
    pub claim: ClaimState,
    pub locked_ranges: Vec<Arc<LbaRange>>,
    pub pending_locked_ranges: Vec<Arc<LbaRange>>,
    pub qos: Option<Arc<Qos>>,
    pub channels: Vec<(u64, Weak<BdevChannel>)>,
    /// Resets queued behind the one in flight; they complete with the
    /// in-flight reset's status.
    pub pending_resets: VecDeque<Arc<BdevIo>>,
    pub reset_in_progress: Option<Arc<BdevIo>>,
    pub err_stat: Option<ErrorStat>,
    pub histogram_enabled: bool,
    pub unregister_cb: Option<Box<dyn FnOnce() + Send>>,
}

/// A logical block device.
pub struct Bdev {
    props: BdevProps,
    aliases: Mutex<Vec<String>>,
    num_blocks: AtomicU64,
    ops: Arc<dyn BdevOps>,
    module_name: String,
    rt: Weak<Runtime>,
    pub(crate) inner: Mutex<BdevInner>,
}

impl std::fmt::Debug for Bdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bdev")
            .field("name", &self.props.name)
            .field("block_len", &self.props.block_len)
            .field("num_blocks", &self.num_blocks.load(Ordering::Relaxed))
            .finish()
    }
}

/// Builder used by modules to describe a new bdev.
pub struct BdevBuilder {
    props: BdevProps,
    num_blocks: u64,
    ops: Option<Arc<dyn BdevOps>>,
    module_name: String,
}

impl BdevBuilder {
    pub fn new() -> Self {
        Self {
            props: BdevProps::default(),
            num_blocks: 0,
            ops: None,
            module_name: String::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.props.name = name.to_string();
        self
    }

    pub fn with_product_name(mut self, name: &str) -> Self {
        self.props.product_name = name.to_string();
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.props.uuid = uuid;
        self
    }

    pub fn with_block_length(mut self, len: u64) -> Self {
        self.props.block_len = len;
        self
    }

    pub fn with_block_count(mut self, count: u64) -> Self {
        self.num_blocks = count;
        self
    }

    pub fn with_module(mut self, name: &str) -> Self {
        self.module_name = name.to_string();
        self
    }

    pub fn with_ops(mut self, ops: Arc<dyn BdevOps>) -> Self {
        self.ops = Some(ops);
        self
    }

    pub fn with_props(mut self, f: impl FnOnce(&mut BdevProps)) -> Self {
        f(&mut self.props);
        self
    }

    pub fn build(self, rt: &Arc<Runtime>) -> Arc<Bdev> {
        let mut props = self.props;
        if props.uuid.is_nil() {
            props.uuid = Uuid::new_v4();
        }
        if props.product_name.is_empty() {
            props.product_name = self.module_name.clone();
        }

        Arc::new(Bdev {
            props,
            aliases: Mutex::new(Vec::new()),
            num_blocks: AtomicU64::new(self.num_blocks),
            ops: self.ops.expect("bdev requires ops"),
            module_name: self.module_name,
            rt: Arc::downgrade(rt),
            inner: Mutex::new(BdevInner {
                status: BdevStatus::Ready,
                open_descs: Vec::new(),
                claim: ClaimState::default(),
                locked_ranges: Vec::new(),
                pending_locked_ranges: Vec::new(),
                qos: None,
                channels: Vec::new(),
                pending_resets: VecDeque::new(),
                reset_in_progress: None,
                err_stat: None,
                histogram_enabled: false,
                unregister_cb: None,
            }),
        })
    }
}

impl Default for BdevBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Bdev {
    pub fn name(&self) -> &str {
        &self.props.name
    }

    pub fn uuid(&self) -> Uuid {
        self.props.uuid
    }

    pub fn block_len(&self) -> u64 {
        self.props.block_len
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks.load(Ordering::Relaxed)
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.num_blocks() * self.block_len()
    }

    pub fn props(&self) -> &BdevProps {
        &self.props
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn aliases(&self) -> Vec<String> {
        self.aliases.lock().clone()
    }

    pub(crate) fn ops(&self) -> &Arc<dyn BdevOps> {
        &self.ops
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.rt.upgrade().expect("runtime torn down with live bdevs")
    }

    pub fn io_type_supported(&self, t: super::io::IoType) -> bool {
        self.ops.io_type_supported(t)
    }

    /// Whether a given LBA range lies within the device.
    pub fn io_range_valid(&self, offset: u64, num_blocks: u64) -> bool {
        offset
            .checked_add(num_blocks)
            .map(|end| end <= self.num_blocks())
            .unwrap_or(false)
    }

    /// Register the bdev: claim its name and aliases in the runtime's
    /// tables and give every module an examine pass.
    pub fn register(self: &Arc<Self>, rt: &Arc<Runtime>) -> Result<(), CoreError> {
        {
            let mut mgr = rt.bdev_mgr.lock();
            let name = self.name().to_string();
            if mgr.bdevs.contains_key(&name) || mgr.aliases.contains_key(&name)
            {
                return Err(CoreError::BdevExists {
                    name,
                });
            }
            mgr.bdevs.insert(name, self.clone());
        }

        info!(bdev = self.name(), module = %self.module_name, "registered");
        self.examine(rt);
        super::desc::resolve_open_waiters(rt, self);
        Ok(())
    }

    /// Run module examine passes, honouring the auto-examine setting and
    /// the allow-list, and purge vestigial claim records afterwards.
    fn examine(self: &Arc<Self>, rt: &Arc<Runtime>) {
        let allowed = rt.opts().bdev_auto_examine
            || rt.bdev_mgr.lock().examine_allowlist.contains(self.name());
        if !allowed {
            debug!(bdev = self.name(), "examine skipped");
            return;
        }

        let modules: Vec<_> = rt.modules.lock().clone();
        for m in modules {
            m.examine(self);
        }

        self.inner.lock().claim.purge_vestigial();
    }

    /// Add a unique alias for this bdev.
    pub fn alias_add(self: &Arc<Self>, alias: &str) -> Result<(), CoreError> {
        let rt = self.runtime();
        let mut mgr = rt.bdev_mgr.lock();
        if mgr.bdevs.contains_key(alias) || mgr.aliases.contains_key(alias) {
            return Err(CoreError::AliasExists {
                alias: alias.to_string(),
            });
        }
        mgr.aliases.insert(alias.to_string(), self.name().to_string());
        self.aliases.lock().push(alias.to_string());
        Ok(())
    }

    pub fn alias_del(self: &Arc<Self>, alias: &str) -> Result<(), CoreError> {
        let rt = self.runtime();
        let mut mgr = rt.bdev_mgr.lock();
        match mgr.aliases.get(alias) {
            Some(owner) if owner == self.name() => {
                mgr.aliases.remove(alias);
                self.aliases.lock().retain(|a| a != alias);
                Ok(())
            }
            _ => Err(CoreError::BdevNotFound {
                name: alias.to_string(),
            }),
        }
    }

    /// Look a bdev up by name or alias.
    pub fn lookup(rt: &Arc<Runtime>, name: &str) -> Option<Arc<Bdev>> {
        let mgr = rt.bdev_mgr.lock();
        if let Some(b) = mgr.bdevs.get(name) {
            return Some(b.clone());
        }
        mgr.aliases.get(name).and_then(|n| mgr.bdevs.get(n)).cloned()
    }

    /// Grow or shrink the device. Shrinking below any open descriptor's
    /// view is refused.
    pub fn notify_blockcnt_change(
        self: &Arc<Self>,
        new_count: u64,
    ) -> Result<(), CoreError> {
        let descs: Vec<_> = {
            let inner = self.inner.lock();
            if new_count < self.num_blocks() && !inner.open_descs.is_empty() {
                return Err(CoreError::NotSupported {
                    source: nix::errno::Errno::EBUSY,
                });
            }
            inner.open_descs.clone()
        };

        self.num_blocks.store(new_count, Ordering::Relaxed);
        for d in descs {
            d.dispatch_event(BdevEvent::Resize, self);
        }
        Ok(())
    }

    /// Start unregistration: new opens fail immediately, every open
    /// descriptor gets a remove event, and the bdev is torn down once the
    /// last descriptor closes.
    pub fn unregister(self: &Arc<Self>, cb: impl FnOnce() + Send + 'static) {
        let descs: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.status != BdevStatus::Ready {
                warn!(bdev = self.name(), "already unregistering");
                return;
            }
            inner.status = BdevStatus::Unregistering;
            inner.unregister_cb = Some(Box::new(cb));
            inner.open_descs.clone()
        };

        for d in &descs {
            d.dispatch_event(BdevEvent::Remove, self);
        }

        self.maybe_finish_unregister();
    }

    /// Complete unregistration when the last descriptor is gone.
    pub(crate) fn maybe_finish_unregister(self: &Arc<Self>) {
        let cb = {
            let mut inner = self.inner.lock();
            if inner.status != BdevStatus::Unregistering
                || !inner.open_descs.is_empty()
            {
                return;
            }
            inner.status = BdevStatus::Removed;
            inner.unregister_cb.take()
        };

        let rt = self.runtime();
        {
            let mut mgr = rt.bdev_mgr.lock();
            mgr.bdevs.remove(self.name());
            let aliases = self.aliases.lock().clone();
            for a in aliases {
                mgr.aliases.remove(&a);
            }
        }

        self.ops.destruct();
        info!(bdev = self.name(), "unregistered");
        if let Some(cb) = cb {
            cb();
        }
    }

    pub(crate) fn status(&self) -> BdevStatus {
        self.inner.lock().status
    }

    /// Number of descriptors currently open.
    pub fn open_desc_count(&self) -> usize {
        self.inner.lock().open_descs.len()
    }

    /// The active QoS configuration, if any.
    pub fn qos(&self) -> Option<Arc<Qos>> {
        self.inner.lock().qos.clone()
    }

    /// Get (or create) this thread's channel for the bdev.
    pub fn get_channel(
        self: &Arc<Self>,
        thread: &Arc<Thread>,
    ) -> Arc<BdevChannel> {
        if let Some(ch) = {
            let inner = self.inner.lock();
            inner
                .channels
                .iter()
                .find(|(tid, _)| *tid == thread.id())
                .and_then(|(_, w)| w.upgrade())
        } {
            ch.get_ref();
            return ch;
        }

        let ch = BdevChannel::new(self, thread);
        self.inner
            .lock()
            .channels
            .push((thread.id(), Arc::downgrade(&ch)));
        ch
    }

    /// Remove a dead channel slot.
    pub(crate) fn forget_channel(&self, thread_id: u64) {
        let mut inner = self.inner.lock();
        inner
            .channels
            .retain(|(tid, w)| *tid != thread_id && w.strong_count() > 0);
    }

    /// Live channels with their owning threads, for fan-outs.
    pub(crate) fn channels(&self) -> Vec<(Arc<Thread>, Arc<BdevChannel>)> {
        self.inner
            .lock()
            .channels
            .iter()
            .filter_map(|(_, w)| w.upgrade())
            .map(|c| (c.thread(), c))
            .collect()
    }

    /// Enable or disable the per-sct/sc error counter table.
    pub fn enable_error_stat(&self, enable: bool) {
        let mut inner = self.inner.lock();
        inner.err_stat = if enable {
            Some(ErrorStat::default())
        } else {
            None
        };
    }

    pub(crate) fn count_error(&self, sct: u8, sc: u8) {
        if let Some(es) = self.inner.lock().err_stat.as_mut() {
            es.count(sct, sc);
        }
    }

    pub fn error_stat(&self) -> Option<ErrorStat> {
        self.inner.lock().err_stat.clone()
    }

    pub fn enable_histogram(&self, enable: bool) {
        self.inner.lock().histogram_enabled = enable;
    }

    /// Aggregate per-channel statistics, optionally resetting each
    /// channel's block as it is visited. The result is delivered on the
    /// calling thread.
    pub fn get_device_stat(
        self: &Arc<Self>,
        reset_mode: StatReset,
        cb: impl FnOnce(BdevIoStats) + Send + 'static,
    ) {
        let origin = Thread::current()
            .expect("get_device_stat must run on an engine thread");
        let acc = Arc::new(Mutex::new(BdevIoStats {
            tick_rate: self.runtime().ticks_hz(),
            ..Default::default()
        }));
        let acc2 = acc.clone();

        for_each(
            origin,
            self.channels(),
            move |chan, cont| {
                use merge::Merge;
                let stats = chan.collect_stats(reset_mode);
                acc.lock().merge(stats);
                cont.done(0);
            },
            move |_status| {
                let stats = *acc2.lock();
                cb(stats);
            },
        );
    }

    pub fn reset_device_stat(self: &Arc<Self>, cb: impl FnOnce() + Send + 'static) {
        self.ops.reset_device_stat();
        self.get_device_stat(StatReset::All, move |_| cb());
    }

    /// Take a claim on behalf of a module. `ExclWrite` is the v1 claim and
    /// needs no descriptor; v2 claims record the descriptor and may
    /// promote it to writable.
    pub fn claim(
        self: &Arc<Self>,
        desc: Option<&Arc<BdevDesc>>,
        ty: ClaimType,
        opts: ClaimOpts,
        module: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        inner.claim.prune();
        let name = self.name().to_string();
        let current = inner.claim.claim_type();

        if current == ClaimType::ExclWrite {
            return Err(CoreError::ClaimConflict {
                name,
                claim: current,
            });
        }

        let open_writers = inner
            .open_descs
            .iter()
            .filter(|d| d.is_writable())
            .filter(|d| {
                desc.map(|c| !Arc::ptr_eq(c, d)).unwrap_or(true)
            })
            .count();

        match ty {
            ClaimType::None => {
                return Err(CoreError::InvalidOpts {
                    reason: "cannot claim with type None".into(),
                })
            }
            ClaimType::ExclWrite => {
                if current != ClaimType::None {
                    return Err(CoreError::ClaimConflict {
                        name,
                        claim: current,
                    });
                }
                if open_writers > 0 {
                    return Err(CoreError::ClaimConflict {
                        name,
                        claim: ClaimType::None,
                    });
                }
            }
            v2 => {
                if current != ClaimType::None && current != v2 {
                    return Err(CoreError::ClaimConflict {
                        name,
                        claim: current,
                    });
                }

                let desc = desc.ok_or_else(|| CoreError::InvalidOpts {
                    reason: "v2 claims require a descriptor".into(),
                })?;

                if desc.claimed() {
                    return Err(CoreError::ClaimExists {
                        name,
                    });
                }

                match v2 {
                    ClaimType::ReadManyWriteOne => {
                        if !inner.claim.records.is_empty()
                            || open_writers > 0
                        {
                            return Err(CoreError::ClaimConflict {
                                name,
                                claim: v2,
                            });
                        }
                    }
                    ClaimType::ReadManyWriteNone => {
                        if open_writers > 0 || desc.is_writable() {
                            return Err(CoreError::ClaimConflict {
                                name,
                                claim: v2,
                            });
                        }
                    }
                    ClaimType::ReadManyWriteShared => {
                        if opts.shared_claim_key == 0 {
                            return Err(CoreError::ClaimBadKey {
                                name,
                            });
                        }
                        if inner
                            .claim
                            .records
                            .iter()
                            .any(|r| r.key != opts.shared_claim_key)
                        {
                            return Err(CoreError::ClaimConflict {
                                name,
                                claim: v2,
                            });
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }

        inner.claim.claim_type = Some(ty);
        inner.claim.records.push(ClaimRecord {
            module: module.map(|m| m.to_string()),
            desc: desc.map(Arc::downgrade).unwrap_or_default(),
            key: opts.shared_claim_key,
            name: opts.name,
        });
        drop(inner);

        if let Some(desc) = desc {
            if ty.implies_writer() {
                desc.promote_writable();
            }
            desc.set_claimed(ty);
        }

        debug!(bdev = self.name(), ?ty, "claimed");
        Ok(())
    }

    /// Release the claim held by a descriptor.
    pub(crate) fn release_claim(&self, desc: &Arc<BdevDesc>) {
        let mut inner = self.inner.lock();
        inner
            .claim
            .records
            .retain(|r| !r.desc.ptr_eq(&Arc::downgrade(desc)));
        if inner.claim.records.is_empty() {
            inner.claim.claim_type = None;
        }
    }

    pub fn claim_type(&self) -> ClaimType {
        self.inner.lock().claim.claim_type()
    }

    /// Whether a write open is currently permitted.
    pub(crate) fn write_open_allowed(&self, inner: &BdevInner) -> bool {
        match inner.claim.claim_type() {
            ClaimType::None => true,
            ClaimType::ExclWrite | ClaimType::ReadManyWriteNone => false,
            ClaimType::ReadManyWriteOne | ClaimType::ReadManyWriteShared => {
                // Writers must come in through the claim path.
                false
            }
        }
    }

    /// Sum of outstanding I/O across all channels.
    pub fn io_outstanding(&self) -> u64 {
        self.inner
            .lock()
            .channels
            .iter()
            .filter_map(|(_, w)| w.upgrade())
            .map(|c| c.io_outstanding())
            .sum()
    }

    pub fn dump_info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "aliases": self.aliases(),
            "uuid": self.uuid().to_string(),
            "block_size": self.block_len(),
            "num_blocks": self.num_blocks(),
            "claimed": self.claim_type() != ClaimType::None,
            "zoned": self.props.zone_info.zoned,
            "driver_specific": self.ops.dump_info_json(),
        })
    }
}
