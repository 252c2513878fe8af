//! One namespace as seen through one controller, with its ANA state and
//! transition timer.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::{ana::AnaState, bdev::NvmeBdev, transport::NsData};
use crate::core::{poller, PollStatus, Thread};

pub(crate) struct NsInner {
    /// Identify data; None while the namespace is depopulated (removed
    /// during a reset, may come back).
    pub data: Option<NsData>,
    pub ana_state: AnaState,
    pub ana_group_id: u32,
    /// A log page read is in flight for this namespace.
    pub ana_state_updating: bool,
    /// The anatt timer fired; this path no longer counts as "may become
    /// available".
    pub ana_transition_timedout: bool,
    pub anatt_timer: Option<poller::Poller>,
    pub bdev: Weak<NvmeBdev>,
}

/// Namespace state per contributing controller.
pub struct NvmeNs {
    id: u32,
    ctrlr_name: String,
    ctrlr: Weak<super::controller::NvmeCtrlr>,
    pub(crate) inner: Mutex<NsInner>,
}

impl std::fmt::Debug for NvmeNs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NvmeNs")
            .field("id", &self.id)
            .field("ctrlr", &self.ctrlr_name)
            .field("ana_state", &inner.ana_state)
            .field("ana_group", &inner.ana_group_id)
            .finish()
    }
}

impl NvmeNs {
    pub(crate) fn new(
        id: u32,
        ctrlr: &Arc<super::controller::NvmeCtrlr>,
        data: NsData,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            ctrlr_name: ctrlr.name().to_string(),
            ctrlr: Arc::downgrade(ctrlr),
            inner: Mutex::new(NsInner {
                data: Some(data),
                ana_state: AnaState::Optimized,
                ana_group_id: 0,
                ana_state_updating: false,
                ana_transition_timedout: false,
                anatt_timer: None,
                bdev: Weak::new(),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ctrlr(&self) -> Option<Arc<super::controller::NvmeCtrlr>> {
        self.ctrlr.upgrade()
    }

    pub fn data(&self) -> Option<NsData> {
        self.inner.lock().data.clone()
    }

    pub fn ana_state(&self) -> AnaState {
        self.inner.lock().ana_state
    }

    pub(crate) fn bdev(&self) -> Option<Arc<NvmeBdev>> {
        self.inner.lock().bdev.upgrade()
    }

    pub(crate) fn attach_bdev(&self, bdev: &Arc<NvmeBdev>) {
        self.inner.lock().bdev = Arc::downgrade(bdev);
    }

    /// Active: the handle exists and no log-page refresh is pending.
    pub fn is_active(&self) -> bool {
        let inner = self.inner.lock();
        inner.data.is_some() && !inner.ana_state_updating
    }

    /// Accessible: active and in a served ANA state.
    pub fn is_accessible(&self) -> bool {
        let inner = self.inner.lock();
        inner.data.is_some()
            && !inner.ana_state_updating
            && inner.ana_state.is_accessible()
    }

    pub fn ana_transition_timedout(&self) -> bool {
        self.inner.lock().ana_transition_timedout
    }

    pub(crate) fn set_updating(&self, updating: bool) {
        self.inner.lock().ana_state_updating = updating;
    }

    /// Depopulate on removal; the bdev stays, the handle may return.
    pub(crate) fn deactivate(&self) {
        self.inner.lock().data = None;
    }

    pub(crate) fn reactivate(&self, data: NsData) {
        self.inner.lock().data = Some(data);
    }

    /// Apply one ANA descriptor. Accessible states clear the transition
    /// timer; transitional states arm it with the controller's anatt.
    pub(crate) fn set_ana_state(
        self: &Arc<Self>,
        thread: &Arc<Thread>,
        group_id: u32,
        state: AnaState,
        anatt_sec: u32,
    ) {
        let mut inner = self.inner.lock();
        inner.ana_group_id = group_id;
        inner.ana_state = state;
        inner.ana_state_updating = false;

        if state.in_transition() {
            if inner.anatt_timer.is_none() {
                let ns = self.clone();
                inner.anatt_timer = Some(
                    poller::Builder::new()
                        .with_name("anatt_timeout")
                        .with_interval_us(anatt_sec as u64 * 1_000_000)
                        .with_poll_fn(move || {
                            let mut inner = ns.inner.lock();
                            inner.ana_transition_timedout = true;
                            inner.anatt_timer = None;
                            debug!(nsid = ns.id, "ana transition timed out");
                            PollStatus::Busy
                        })
                        .build(thread),
                );
            }
        } else {
            inner.ana_transition_timedout = false;
            inner.anatt_timer = None;
        }
    }
}
