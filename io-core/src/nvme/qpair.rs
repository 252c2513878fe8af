//! Per-thread qpair wrapper and the controller channel that owns it.
//! A qpair never leaves its thread; reset fan-outs park on the channel
//! until the transport reports the qpair disconnected or reconnected.

use std::sync::{Arc, Weak};

use crossbeam::atomic::AtomicCell;
use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    controller::NvmeCtrlr,
    transport::{CtrlrHandle, NvmeSubmission, NvmeCompletionCb, QpairHandle},
};
use crate::core::{thread::Cont, Thread};

/// I/O QPair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpairState {
    Disconnected,
    Connecting,
    Connected,
    Dropped,
}

pub(crate) struct QpairInner {
    pub handle: Option<Arc<dyn QpairHandle>>,
}

/// The engine-side qpair object. State flags sit outside the handle lock
/// so the hot-path availability check stays contention free.
pub struct NvmeQpair {
    ctrlr: Weak<NvmeCtrlr>,
    thread: Arc<Thread>,
    state: AtomicCell<QpairState>,
    /// Set while a controller reset is tearing this qpair down.
    resetting: AtomicCell<bool>,
    pub(crate) inner: Mutex<QpairInner>,
    /// Multipath channels whose io paths ride on this qpair; their
    /// cached path selection is invalidated on qpair state changes.
    pub(crate) mp_channels:
        Mutex<Vec<Weak<super::channel::NvmeBdevChannel>>>,
}

impl std::fmt::Debug for NvmeQpair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeQpair")
            .field("state", &self.state.load())
            .finish()
    }
}

impl NvmeQpair {
    pub(crate) fn new(
        ctrlr: &Arc<NvmeCtrlr>,
        thread: &Arc<Thread>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctrlr: Arc::downgrade(ctrlr),
            thread: thread.clone(),
            state: AtomicCell::new(QpairState::Disconnected),
            resetting: AtomicCell::new(false),
            inner: Mutex::new(QpairInner {
                handle: None,
            }),
            mp_channels: Mutex::new(Vec::new()),
        })
    }

    pub fn thread(&self) -> Arc<Thread> {
        self.thread.clone()
    }

    pub fn ctrlr(&self) -> Option<Arc<NvmeCtrlr>> {
        self.ctrlr.upgrade()
    }

    pub fn state(&self) -> QpairState {
        self.state.load()
    }

    /// Allocate and begin connecting a transport qpair.
    pub(crate) fn create(&self, ctrlr: &Arc<dyn CtrlrHandle>) -> Result<(), Errno> {
        let handle = ctrlr.alloc_qpair()?;
        let rc = handle.connect();
        if rc != 0 {
            warn!("qpair connect failed: {}", rc);
            return Err(Errno::from_i32(-rc));
        }
        self.inner.lock().handle = Some(handle);
        self.state.store(QpairState::Connecting);
        debug!("I/O qpair created for controller");
        Ok(())
    }

    /// Promote to connected once the transport reports so.
    pub(crate) fn check_connected(&self) -> bool {
        let handle = self.inner.lock().handle.clone();
        match handle {
            Some(h) if h.is_connected() => {
                self.state.store(QpairState::Connected);
                true
            }
            _ => false,
        }
    }

    /// Availability in the io-path sense: a transport qpair exists, has
    /// no failure recorded and is not mid-reset.
    pub fn is_connected(&self) -> bool {
        if self.resetting.load() {
            return false;
        }
        if self.state.load() != QpairState::Connected {
            return false;
        }
        match self.inner.lock().handle.as_ref() {
            Some(h) => h.is_connected() && h.failure_reason().is_none(),
            None => false,
        }
    }

    pub fn outstanding_requests(&self) -> u32 {
        self.inner
            .lock()
            .handle
            .as_ref()
            .map(|h| h.outstanding_requests())
            .unwrap_or(0)
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn QpairHandle>> {
        self.inner.lock().handle.clone()
    }

    /// Submit one command; the CID comes back for abort targeting.
    pub(crate) fn submit(
        &self,
        submission: NvmeSubmission,
        cb: NvmeCompletionCb,
    ) -> Result<u16, Errno> {
        if self.resetting.load() {
            return Err(Errno::ENXIO);
        }
        let handle = match self.inner.lock().handle.clone() {
            Some(h) => h,
            None => return Err(Errno::ENXIO),
        };
        handle.submit(submission, cb)
    }

    /// Tear the transport qpair down (reset path). The wrapper survives,
    /// keeps the handle so disconnection can be observed, and is
    /// reconnected afterwards.
    pub(crate) fn disconnect(&self) {
        self.resetting.store(true);
        self.state.store(QpairState::Disconnected);
        let handle = self.inner.lock().handle.clone();
        if let Some(h) = handle {
            h.disconnect();
        }
    }

    /// True once the transport has finished tearing the qpair down.
    pub(crate) fn disconnect_settled(&self) -> bool {
        match self.inner.lock().handle.as_ref() {
            Some(h) => !h.is_connected(),
            None => true,
        }
    }

    pub(crate) fn clear_resetting(&self) {
        self.resetting.store(false);
    }

    /// Drain I/O completions; called from the poll loop.
    pub fn process_completions(&self) -> i32 {
        let handle = self.inner.lock().handle.clone();
        handle.map(|h| h.process_completions()).unwrap_or(0)
    }
}

/// Per-thread channel of one controller: owns the qpair used by every
/// io-path of that (controller, thread) pair.
pub struct NvmeCtrlrChannel {
    pub(crate) qpair: Arc<NvmeQpair>,
    /// Reset fan-out parked here until the qpair state settles.
    pub(crate) reset_cont: Mutex<Option<Cont<Arc<NvmeCtrlrChannel>>>>,
    pub(crate) connect_poller: Mutex<Option<crate::core::poller::Poller>>,
}

impl NvmeCtrlrChannel {
    pub(crate) fn new(
        ctrlr: &Arc<NvmeCtrlr>,
        thread: &Arc<Thread>,
    ) -> Arc<Self> {
        Arc::new(Self {
            qpair: NvmeQpair::new(ctrlr, thread),
            reset_cont: Mutex::new(None),
            connect_poller: Mutex::new(None),
        })
    }

    pub fn qpair(&self) -> &Arc<NvmeQpair> {
        &self.qpair
    }
}
