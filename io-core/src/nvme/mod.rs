//!
//! The NVMe multipath engine: controller lifecycle with failover and
//! reconnect timers, namespaces with ANA state, per-channel io-path
//! selection and generic-to-NVMe translation. Concrete transports plug
//! in through the traits in [`transport`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Weak,
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use ana::{AnaLogPage, AnaState};
pub use channel::{
    MultipathPolicy,
    MultipathSelector,
    NvmeBdevChannel,
    NvmeIoPath,
};
pub use controller::{
    check_io_error_resiliency_params,
    NvmeCtrlr,
    NvmeCtrlrOpts,
};
pub use bdev::NvmeBdev;
pub use namespace::NvmeNs;
pub use path::{NvmePathId, TransportId};
pub use qpair::{NvmeCtrlrChannel, NvmeQpair, QpairState};
pub use status::NvmeStatus;

pub mod ana;
#[allow(clippy::module_inception)]
pub mod bdev;
pub mod channel;
pub mod controller;
pub mod io;
pub mod namespace;
pub mod path;
pub mod qpair;
pub mod status;
pub mod transport;

use crate::{
    bdev::desc::TimeoutAction,
    core::{poller, CoreError, PollStatus, Runtime, Thread},
};

/// Behaviour options shared by every NVMe bdev.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvmeBdevOpts {
    pub action_on_timeout: TimeoutActionOpt,
    pub timeout_us: u64,
    pub timeout_admin_us: u64,
    pub keep_alive_timeout_ms: u32,
    /// -1 retries forever, 0 never retries.
    pub bdev_retry_count: i32,
    pub ctrlr_loss_timeout_sec: i32,
    pub reconnect_delay_sec: u32,
    pub fast_io_fail_timeout_sec: u32,
    pub disable_auto_failback: bool,
    pub generate_uuids: bool,
    pub allow_accel_sequence: bool,
    pub nvme_error_stat: bool,
    pub io_path_stat: bool,
    pub enable_flush: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutActionOpt {
    None,
    Reset,
    Abort,
}

impl From<TimeoutActionOpt> for TimeoutAction {
    fn from(v: TimeoutActionOpt) -> Self {
        match v {
            TimeoutActionOpt::None => TimeoutAction::None,
            TimeoutActionOpt::Reset => TimeoutAction::Reset,
            TimeoutActionOpt::Abort => TimeoutAction::Abort,
        }
    }
}

impl Default for NvmeBdevOpts {
    fn default() -> Self {
        Self {
            action_on_timeout: TimeoutActionOpt::None,
            timeout_us: 0,
            timeout_admin_us: 0,
            keep_alive_timeout_ms: 10_000,
            bdev_retry_count: 3,
            ctrlr_loss_timeout_sec: 0,
            reconnect_delay_sec: 0,
            fast_io_fail_timeout_sec: 0,
            disable_auto_failback: false,
            generate_uuids: false,
            allow_accel_sequence: false,
            nvme_error_stat: false,
            io_path_stat: false,
            enable_flush: false,
        }
    }
}

impl NvmeBdevOpts {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !check_io_error_resiliency_params(
            self.ctrlr_loss_timeout_sec,
            self.reconnect_delay_sec,
            self.fast_io_fail_timeout_sec,
        ) {
            return Err(CoreError::InvalidOpts {
                reason: "invalid retry/timeout parameters".into(),
            });
        }
        Ok(())
    }
}

/// A named group of controllers reaching the same subsystem; its bdevs
/// aggregate namespaces across them.
pub struct NvmeBdevCtrlr {
    name: String,
    pub(crate) ctrlrs: Mutex<Vec<Arc<NvmeCtrlr>>>,
    pub(crate) bdevs: Mutex<Vec<Arc<NvmeBdev>>>,
}

impl NvmeBdevCtrlr {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ctrlrs(&self) -> Vec<Arc<NvmeCtrlr>> {
        self.ctrlrs.lock().clone()
    }

    pub fn bdevs(&self) -> Vec<Arc<NvmeBdev>> {
        self.bdevs.lock().clone()
    }

    pub fn ctrlr_by_trid(&self, trid: &TransportId) -> Option<Arc<NvmeCtrlr>> {
        self.ctrlrs
            .lock()
            .iter()
            .find(|c| c.active_trid().as_ref() == Some(trid))
            .cloned()
    }
}

/// Entry point for the NVMe side: attaches controllers, aggregates
/// namespaces into multipath bdevs and runs the hot-plug probe.
pub struct NvmeManager {
    rt: Arc<Runtime>,
    transport: Arc<dyn transport::NvmeTransport>,
    opts: Arc<NvmeBdevOpts>,
    groups: Mutex<HashMap<String, Arc<NvmeBdevCtrlr>>>,
    hotplug_poller: Mutex<Option<poller::Poller>>,
    hotplug_index: AtomicU32,
}

impl NvmeManager {
    pub fn new(
        rt: &Arc<Runtime>,
        transport: Arc<dyn transport::NvmeTransport>,
        opts: NvmeBdevOpts,
    ) -> Result<Arc<Self>, CoreError> {
        opts.validate()?;
        Ok(Arc::new(Self {
            rt: rt.clone(),
            transport,
            opts: Arc::new(opts),
            groups: Mutex::new(HashMap::new()),
            hotplug_poller: Mutex::new(None),
            hotplug_index: AtomicU32::new(0),
        }))
    }

    pub fn opts(&self) -> &Arc<NvmeBdevOpts> {
        &self.opts
    }

    pub fn group(&self, name: &str) -> Option<Arc<NvmeBdevCtrlr>> {
        self.groups.lock().get(name).cloned()
    }

    /// Attach one controller under a group name. Attaching a second
    /// controller to the same name is the multipath case: namespaces
    /// with matching identity join the existing bdevs.
    pub fn create_ctrlr(
        self: &Arc<Self>,
        name: &str,
        trid: TransportId,
        ctrlr_opts: NvmeCtrlrOpts,
    ) -> Result<Arc<NvmeCtrlr>, CoreError> {
        let group = {
            let mut groups = self.groups.lock();
            groups
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(NvmeBdevCtrlr {
                        name: name.to_string(),
                        ctrlrs: Mutex::new(Vec::new()),
                        bdevs: Mutex::new(Vec::new()),
                    })
                })
                .clone()
        };

        if !ctrlr_opts.multipath && !group.ctrlrs.lock().is_empty() {
            return Err(CoreError::BdevExists {
                name: name.to_string(),
            });
        }
        if group
            .ctrlrs
            .lock()
            .iter()
            .any(|c| c.active_trid().as_ref() == Some(&trid))
        {
            return Err(CoreError::BdevExists {
                name: trid.to_string(),
            });
        }

        let ctrlr_name = format!(
            "{}-{}",
            name,
            group.ctrlrs.lock().len()
        );
        let ctrlr = NvmeCtrlr::connect(
            &self.rt,
            self.transport.clone(),
            &ctrlr_name,
            trid,
            ctrlr_opts,
        )?;

        group.ctrlrs.lock().push(ctrlr.clone());

        // Namespace changes re-run aggregation; destruct removes the
        // controller from its group.
        {
            let mgr = Arc::downgrade(self);
            let group2 = group.clone();
            ctrlr.set_ns_change_sink(Arc::new(move |c| {
                if let Some(mgr) = mgr.upgrade() {
                    mgr.aggregate_namespaces(&group2, c);
                }
            }));
        }
        {
            let mgr = Arc::downgrade(self);
            let group2 = group.clone();
            ctrlr.set_destruct_sink(Box::new(move |c| {
                if let Some(mgr) = mgr.upgrade() {
                    mgr.forget_ctrlr(&group2, c);
                }
            }));
        }

        self.aggregate_namespaces(&group, &ctrlr);
        Ok(ctrlr)
    }

    /// Fold a controller's namespaces into the group's bdevs: identity
    /// matches join an existing bdev as another path, everything else
    /// becomes a new bdev named `{group}n{nsid}`.
    fn aggregate_namespaces(
        self: &Arc<Self>,
        group: &Arc<NvmeBdevCtrlr>,
        ctrlr: &Arc<NvmeCtrlr>,
    ) {
        for ns in ctrlr.namespaces() {
            let Some(data) = ns.data() else {
                continue;
            };
            if ns.bdev().is_some() {
                continue;
            }

            let existing = group
                .bdevs
                .lock()
                .iter()
                .find(|b| b.matches_identity(&data))
                .cloned();

            match existing {
                Some(nbdev) => {
                    if let Err(e) = nbdev.add_namespace(&ns) {
                        warn!(?e, "failed to add multipath namespace");
                    } else {
                        info!(
                            bdev = nbdev.name(),
                            ctrlr = ctrlr.name(),
                            "namespace joined as additional path"
                        );
                    }
                }
                None => {
                    let bdev_name =
                        format!("{}n{}", group.name, data.nsid);
                    match NvmeBdev::create(
                        &self.rt,
                        &self.opts,
                        &bdev_name,
                        &ns,
                    ) {
                        Ok(nbdev) => group.bdevs.lock().push(nbdev),
                        Err(e) => {
                            warn!(?e, "failed to create nvme bdev")
                        }
                    }
                }
            }
        }
    }

    fn forget_ctrlr(&self, group: &Arc<NvmeBdevCtrlr>, ctrlr: &Arc<NvmeCtrlr>) {
        for ns in ctrlr.namespaces() {
            if let Some(nbdev) = ns.bdev() {
                nbdev.remove_namespace(&ns);
            }
        }
        group
            .ctrlrs
            .lock()
            .retain(|c| !Arc::ptr_eq(c, ctrlr));
        group.bdevs.lock().retain(|b| !b.namespaces().is_empty());

        let empty = group.ctrlrs.lock().is_empty();
        if empty {
            self.groups.lock().remove(&group.name);
            info!(group = %group.name, "last controller gone");
        }
    }

    /// Detach a whole group (all its controllers).
    pub fn delete_ctrlr(&self, name: &str) -> Result<(), CoreError> {
        let group = self.group(name).ok_or_else(|| CoreError::BdevNotFound {
            name: name.to_string(),
        })?;
        for ctrlr in group.ctrlrs() {
            ctrlr.destruct();
        }
        Ok(())
    }

    /// Start the hot-plug probe loop: newly appearing transport ids are
    /// attached under generated names.
    pub fn start_hotplug(self: &Arc<Self>, period_us: u64) {
        let thread = Thread::current()
            .expect("hotplug starts on an engine thread");
        let mgr = Arc::downgrade(self);

        *self.hotplug_poller.lock() = Some(
            poller::Builder::new()
                .with_name("nvme_hotplug")
                .with_interval_us(period_us)
                .with_poll_fn(move || {
                    let Some(mgr) = mgr.upgrade() else {
                        return PollStatus::Idle;
                    };
                    let found = mgr.transport.probe();
                    if found.is_empty() {
                        return PollStatus::Idle;
                    }
                    for trid in found {
                        let idx = mgr
                            .hotplug_index
                            .fetch_add(1, Ordering::Relaxed);
                        let name = format!("HotInNvme{}", idx);
                        info!(%trid, name, "hot inserted controller");
                        if let Err(e) = mgr.create_ctrlr(
                            &name,
                            trid,
                            NvmeCtrlrOpts {
                                ctrlr_loss_timeout_sec: mgr
                                    .opts
                                    .ctrlr_loss_timeout_sec,
                                reconnect_delay_sec: mgr
                                    .opts
                                    .reconnect_delay_sec,
                                fast_io_fail_timeout_sec: mgr
                                    .opts
                                    .fast_io_fail_timeout_sec,
                                ..Default::default()
                            },
                        ) {
                            warn!(?e, "hotplug attach failed");
                        }
                    }
                    PollStatus::Busy
                })
                .build(&thread),
        );
    }

    pub fn stop_hotplug(&self) {
        *self.hotplug_poller.lock() = None;
    }
}

/// Weak-handle helper used by callers that hold manager references in
/// callbacks.
pub type NvmeManagerRef = Weak<NvmeManager>;
