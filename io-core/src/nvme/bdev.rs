//! The multipath NVMe bdev: one generic bdev aggregating every namespace
//! (across controllers) that shares identity, plus the policy plumbing
//! that fans configuration out to its channels.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    channel::{MultipathPolicy, MultipathSelector, NvmeBdevChannel},
    namespace::NvmeNs,
    transport::NsData,
    NvmeBdevOpts,
};
use crate::{
    bdev::{
        bdev::{Bdev, BdevBuilder, DifType},
        io::{BdevIo, IoType},
        module::{BdevOps, ModuleChannel},
    },
    core::{thread::for_each, CoreError, Runtime, Thread},
};

pub const MODULE_NAME: &str = "nvme";

/// Namespaces aggregate into the same bdev only when their identity
/// matches: NGUID, else EUI64, else UUID, plus the command set.
pub(crate) fn ns_identity_eq(a: &NsData, b: &NsData) -> bool {
    if a.csi != b.csi {
        return false;
    }
    if a.nguid != [0; 16] || b.nguid != [0; 16] {
        return a.nguid == b.nguid;
    }
    if a.eui64 != [0; 8] || b.eui64 != [0; 8] {
        return a.eui64 == b.eui64;
    }
    match (&a.uuid, &b.uuid) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

struct NbInner {
    ns_list: Vec<Arc<NvmeNs>>,
    policy: MultipathPolicy,
    selector: MultipathSelector,
    rr_min_io: u32,
    bdev: Weak<Bdev>,
}

/// The module-side object behind one multipath bdev.
pub struct NvmeBdev {
    name: String,
    nsid: u32,
    opts: Arc<NvmeBdevOpts>,
    rt: Weak<Runtime>,
    self_ref: Mutex<Weak<NvmeBdev>>,
    inner: Mutex<NbInner>,
}

impl std::fmt::Debug for NvmeBdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeBdev")
            .field("name", &self.name)
            .field("paths", &self.inner.lock().ns_list.len())
            .finish()
    }
}

impl NvmeBdev {
    /// Build the module object and its generic bdev from the first
    /// namespace, and register it.
    pub(crate) fn create(
        rt: &Arc<Runtime>,
        opts: &Arc<NvmeBdevOpts>,
        name: &str,
        ns: &Arc<NvmeNs>,
    ) -> Result<Arc<NvmeBdev>, CoreError> {
        let data = ns.data().ok_or_else(|| CoreError::BdevNotFound {
            name: name.to_string(),
        })?;

        let nbdev = Arc::new(NvmeBdev {
            name: name.to_string(),
            nsid: ns.id(),
            opts: opts.clone(),
            rt: Arc::downgrade(rt),
            self_ref: Mutex::new(Weak::new()),
            inner: Mutex::new(NbInner {
                ns_list: vec![ns.clone()],
                policy: MultipathPolicy::ActivePassive,
                selector: MultipathSelector::RoundRobin,
                rr_min_io: 1,
                bdev: Weak::new(),
            }),
        });
        *nbdev.self_ref.lock() = Arc::downgrade(&nbdev);

        let uuid = match data.uuid {
            Some(u) => u,
            None if opts.generate_uuids => Uuid::new_v4(),
            None => Uuid::nil(),
        };

        let bdev = BdevBuilder::new()
            .with_name(name)
            .with_product_name("NVMe disk")
            .with_uuid(uuid)
            .with_block_length(data.block_len)
            .with_block_count(data.num_blocks)
            .with_module(MODULE_NAME)
            .with_ops(nbdev.clone())
            .with_props(|p| {
                p.md_len = data.md_len;
                p.md_interleave = data.md_interleave;
                p.dif_type = match data.dif_type {
                    1 => DifType::Type1,
                    2 => DifType::Type2,
                    3 => DifType::Type3,
                    _ => DifType::None,
                };
                // WRITE ZEROES carries a 16-bit NLB; anything larger is
                // split above us.
                p.max_write_zeroes = 65_536;
                // DSM: 2^32-1 blocks per range, 256 ranges per command.
                p.max_unmap = u32::MAX as u64;
                p.max_unmap_segments = 256;
                p.write_cache = true;
                p.zone_info.zoned = data.zoned;
            })
            .build(rt);

        nbdev.inner.lock().bdev = Arc::downgrade(&bdev);
        ns.attach_bdev(&nbdev);
        bdev.register(rt)?;

        if opts.nvme_error_stat {
            bdev.enable_error_stat(true);
        }

        info!(bdev = name, "nvme bdev created");
        Ok(nbdev)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn opts(&self) -> &Arc<NvmeBdevOpts> {
        &self.opts
    }

    pub fn bdev(&self) -> Option<Arc<Bdev>> {
        self.inner.lock().bdev.upgrade()
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.rt.upgrade().expect("runtime torn down with live nvme bdev")
    }

    pub fn namespaces(&self) -> Vec<Arc<NvmeNs>> {
        self.inner.lock().ns_list.clone()
    }

    pub fn mp_policy(&self) -> (MultipathPolicy, MultipathSelector, u32) {
        let inner = self.inner.lock();
        (inner.policy, inner.selector, inner.rr_min_io)
    }

    fn arc_self(&self) -> Arc<NvmeBdev> {
        self.self_ref
            .lock()
            .upgrade()
            .expect("self reference always valid after create")
    }

    /// Does the identity of `data` match this bdev's namespaces?
    pub(crate) fn matches_identity(&self, data: &NsData) -> bool {
        self.inner
            .lock()
            .ns_list
            .iter()
            .filter_map(|ns| ns.data())
            .any(|d| ns_identity_eq(&d, data))
    }

    /// Add another controller's view of the same namespace and grow every
    /// existing channel's io-path set.
    pub(crate) fn add_namespace(
        self: &Arc<Self>,
        ns: &Arc<NvmeNs>,
    ) -> Result<(), CoreError> {
        {
            let mut inner = self.inner.lock();
            if inner
                .ns_list
                .iter()
                .any(|existing| Arc::ptr_eq(existing, ns))
            {
                return Err(CoreError::BdevExists {
                    name: self.name.clone(),
                });
            }
            inner.ns_list.push(ns.clone());
        }
        ns.attach_bdev(self);

        if let Some(bdev) = self.bdev() {
            let ns2 = ns.clone();
            if let Some(origin) = Thread::current() {
                for_each(
                    origin,
                    bdev.channels(),
                    move |chan, cont| {
                        if let Ok(mp) = chan
                            .module_channel()
                            .clone()
                            .downcast::<NvmeBdevChannel>()
                        {
                            mp.add_io_path(&ns2);
                        }
                        cont.done(0);
                    },
                    |_| {},
                );
            }
        }
        Ok(())
    }

    /// Drop a controller's namespace from the set; unregister the bdev
    /// when the last path disappears.
    pub(crate) fn remove_namespace(self: &Arc<Self>, ns: &Arc<NvmeNs>) {
        let empty = {
            let mut inner = self.inner.lock();
            inner.ns_list.retain(|n| !Arc::ptr_eq(n, ns));
            inner.ns_list.is_empty()
        };

        if let Some(bdev) = self.bdev() {
            if empty {
                bdev.unregister(|| {});
            } else if let Some(origin) = Thread::current() {
                let ns2 = ns.clone();
                for_each(
                    origin,
                    bdev.channels(),
                    move |chan, cont| {
                        if let Ok(mp) = chan
                            .module_channel()
                            .clone()
                            .downcast::<NvmeBdevChannel>()
                        {
                            mp.remove_io_path(&ns2);
                        }
                        cont.done(0);
                    },
                    |_| {},
                );
            }
        }
    }

    /// Change the multipath policy and fan it out to every channel.
    pub fn set_multipath_policy(
        self: &Arc<Self>,
        policy: MultipathPolicy,
        selector: MultipathSelector,
        rr_min_io: u32,
        cb: impl FnOnce(Result<(), CoreError>) + Send + 'static,
    ) {
        if policy == MultipathPolicy::ActiveActive
            && selector == MultipathSelector::RoundRobin
            && rr_min_io == 0
        {
            cb(Err(CoreError::InvalidOpts {
                reason: "rr_min_io must be positive".into(),
            }));
            return;
        }

        {
            let mut inner = self.inner.lock();
            inner.policy = policy;
            inner.selector = selector;
            inner.rr_min_io = rr_min_io;
        }

        let Some(bdev) = self.bdev() else {
            cb(Ok(()));
            return;
        };
        let Some(origin) = Thread::current() else {
            cb(Ok(()));
            return;
        };

        for_each(
            origin,
            bdev.channels(),
            move |chan, cont| {
                if let Ok(mp) = chan
                    .module_channel()
                    .clone()
                    .downcast::<NvmeBdevChannel>()
                {
                    mp.set_policy(policy, selector, rr_min_io);
                }
                cont.done(0);
            },
            move |_| cb(Ok(())),
        );
    }

    /// Make the namespace served by `cntlid` the preferred (first) path
    /// on every channel. Only meaningful for active/passive.
    pub fn set_preferred_path(
        self: &Arc<Self>,
        cntlid: u16,
        cb: impl FnOnce(Result<(), CoreError>) + Send + 'static,
    ) {
        // Reorder the master list too so new channels inherit it.
        {
            let mut inner = self.inner.lock();
            if let Some(pos) = inner.ns_list.iter().position(|ns| {
                ns.ctrlr()
                    .map(|c| c.data().cntlid == cntlid)
                    .unwrap_or(false)
            }) {
                let ns = inner.ns_list.remove(pos);
                inner.ns_list.insert(0, ns);
            } else {
                cb(Err(CoreError::BdevNotFound {
                    name: format!("cntlid {}", cntlid),
                }));
                return;
            }
        }

        let Some(bdev) = self.bdev() else {
            cb(Ok(()));
            return;
        };
        let Some(origin) = Thread::current() else {
            cb(Ok(()));
            return;
        };

        for_each(
            origin,
            bdev.channels(),
            move |chan, cont| {
                if let Ok(mp) = chan
                    .module_channel()
                    .clone()
                    .downcast::<NvmeBdevChannel>()
                {
                    mp.set_preferred(cntlid);
                }
                cont.done(0);
            },
            move |_| cb(Ok(())),
        );
    }

    /// Clear every channel's cached io path.
    pub(crate) fn clear_io_path_caches(&self) {
        let Some(bdev) = self.bdev() else {
            return;
        };
        for (_, chan) in bdev.channels() {
            if let Ok(mp) = chan
                .module_channel()
                .clone()
                .downcast::<NvmeBdevChannel>()
            {
                mp.clear_current_path();
            }
        }
    }

    /// Controller data of the first live path, for capability checks.
    fn any_ctrlr_data(&self) -> Option<super::transport::CtrlrData> {
        self.inner
            .lock()
            .ns_list
            .iter()
            .filter_map(|ns| ns.ctrlr())
            .map(|c| c.data())
            .next()
    }
}

impl BdevOps for NvmeBdev {
    fn submit_request(&self, chan: &ModuleChannel, io: &Arc<BdevIo>) {
        let mp = match chan.clone().downcast::<NvmeBdevChannel>() {
            Ok(mp) => mp,
            Err(_) => {
                warn!("wrong channel type for nvme bdev");
                io.complete(crate::bdev::io::IoStatus::Failed);
                return;
            }
        };
        super::io::submit_request(&self.arc_self(), &mp, io);
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        let oncs = self
            .any_ctrlr_data()
            .map(|d| d.oncs)
            .unwrap_or_default();
        let zoned = self
            .inner
            .lock()
            .ns_list
            .first()
            .and_then(|ns| ns.data())
            .map(|d| d.zoned)
            .unwrap_or(false);

        match io_type {
            IoType::Read
            | IoType::Write
            | IoType::Reset
            | IoType::Flush
            | IoType::NvmeAdmin
            | IoType::NvmeIo
            | IoType::Abort => true,
            IoType::NvmeIoMd => self
                .inner
                .lock()
                .ns_list
                .first()
                .and_then(|ns| ns.data())
                .map(|d| d.md_len > 0)
                .unwrap_or(false),
            IoType::Unmap => oncs.dsm,
            IoType::WriteZeroes => oncs.write_zeroes,
            IoType::Compare => oncs.compare,
            IoType::CompareAndWrite => oncs.compare && oncs.fused,
            IoType::Copy => oncs.copy,
            IoType::ZoneAppend
            | IoType::ZoneInfo
            | IoType::ZoneManagement => zoned,
            _ => false,
        }
    }

    fn get_io_channel(&self, thread: &Arc<Thread>) -> ModuleChannel {
        NvmeBdevChannel::new(&self.arc_self(), thread)
    }

    fn accel_sequence_supported(&self, io_type: IoType) -> bool {
        self.opts.allow_accel_sequence
            && matches!(io_type, IoType::Read | IoType::Write)
    }

    fn dump_info_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        serde_json::json!({
            "mp_policy": inner.policy,
            "selector": inner.selector,
            "rr_min_io": inner.rr_min_io,
            "num_paths": inner.ns_list.len(),
        })
    }
}
