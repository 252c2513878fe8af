//! The driver seam: traits a concrete NVMe transport implements. The
//! engine only ever talks to controllers and qpairs through these
//! handles; tests plug in fakes, production plugs in a real initiator.

use std::sync::Arc;

use nix::errno::Errno;
use uuid::Uuid;

use super::{ana::AnaLogPage, path::TransportId, status::NvmeStatus};
use crate::bdev::io::{IoBuffer, IoVec, NvmePassthruCmd};

/// Optional NVM command support bits from identify data.
#[derive(Debug, Clone, Copy, Default)]
pub struct Oncs {
    pub compare: bool,
    pub write_zeroes: bool,
    pub dsm: bool,
    pub copy: bool,
    pub fused: bool,
}

/// The slice of controller identify data the engine consumes.
#[derive(Debug, Clone)]
pub struct CtrlrData {
    pub cntlid: u16,
    /// Command retry delay times, 100 ms units, indexed directly by the
    /// 2-bit CRD field of a completion; index 0 is unused (CRD 0 means
    /// no delay).
    pub crdt: [u16; 4],
    /// ANA transition time in seconds.
    pub anatt: u32,
    pub nn: u32,
    /// Max data transfer size in bytes; passthru payloads are validated
    /// against it.
    pub mdts: u64,
    pub oncs: Oncs,
    pub ana_supported: bool,
    /// Volatile write cache present.
    pub vwc: bool,
}

impl Default for CtrlrData {
    fn default() -> Self {
        Self {
            cntlid: 0,
            crdt: [0; 4],
            anatt: 10,
            nn: 0,
            mdts: 0,
            oncs: Oncs {
                compare: true,
                write_zeroes: true,
                dsm: true,
                copy: true,
                fused: true,
            },
            ana_supported: true,
            vwc: false,
        }
    }
}

/// Namespace identify data.
#[derive(Debug, Clone)]
pub struct NsData {
    pub nsid: u32,
    pub num_blocks: u64,
    pub block_len: u64,
    pub md_len: u32,
    pub md_interleave: bool,
    pub dif_type: u8,
    pub nguid: [u8; 16],
    pub eui64: [u8; 8],
    pub uuid: Option<Uuid>,
    /// Command set identifier; namespaces aggregate into one bdev only
    /// when identity and CSI both match.
    pub csi: u8,
    pub zoned: bool,
}

/// Asynchronous events surfaced by the admin queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    NsAttrChanged,
    AnaChange,
}

/// One semantic I/O handed to a qpair. The translation layer builds these
/// from generic bdev operations; limits (DSM range counts, write-zeroes
/// NLB) are enforced before construction.
#[derive(Debug)]
pub enum NvmeSubmission {
    Read {
        offset_blocks: u64,
        num_blocks: u64,
        buffer: IoBuffer,
        iovs: Vec<IoVec>,
        md: Option<IoBuffer>,
        io_flags: u32,
        cdw13: u32,
    },
    Write {
        offset_blocks: u64,
        num_blocks: u64,
        buffer: IoBuffer,
        iovs: Vec<IoVec>,
        md: Option<IoBuffer>,
        io_flags: u32,
        cdw13: u32,
    },
    Compare {
        offset_blocks: u64,
        num_blocks: u64,
        buffer: IoBuffer,
        iovs: Vec<IoVec>,
        /// First half of a fused compare-and-write.
        fused_first: bool,
    },
    /// Second half of a fused compare-and-write.
    FusedWrite {
        offset_blocks: u64,
        num_blocks: u64,
        buffer: IoBuffer,
        iovs: Vec<IoVec>,
    },
    /// Dataset management deallocate.
    Dsm {
        ranges: Vec<(u64, u32)>,
    },
    WriteZeroes {
        offset_blocks: u64,
        num_blocks: u64,
    },
    Flush,
    ZoneAppend {
        zone_id: u64,
        num_blocks: u64,
        buffer: IoBuffer,
        iovs: Vec<IoVec>,
    },
    ZoneMgmtSend {
        zone_id: u64,
        action: u8,
    },
    ZoneMgmtRecv {
        zone_id: u64,
        num_zones: u32,
        buffer: IoBuffer,
    },
    Passthru {
        cmd: NvmePassthruCmd,
        buffer: Option<IoBuffer>,
    },
}

pub type NvmeCompletionCb = Box<dyn FnOnce(NvmeStatus) + Send>;
pub type AnaLogCb = Box<dyn FnOnce(Result<AnaLogPage, Errno>) + Send>;
pub type EventSink = Box<dyn Fn(AsyncEvent) + Send + Sync>;
pub type AbortCb = Box<dyn FnOnce(NvmeStatus) + Send>;

/// A connected controller.
pub trait CtrlrHandle: Send + Sync {
    fn data(&self) -> CtrlrData;

    fn is_failed(&self) -> bool;

    /// Mark the controller failed (gives up in-flight reconnects).
    fn fail(&self);

    /// Begin an asynchronous disconnect; completion is observed through
    /// `disconnect_complete` from the admin poller.
    fn disconnect(&self) -> Result<(), Errno>;

    fn disconnect_complete(&self) -> bool;

    /// Begin an asynchronous reconnect against the given trid.
    fn reconnect_async(&self, trid: &TransportId);

    /// Poll the reconnect: `-EAGAIN` while in progress, 0 on success,
    /// any other negative errno on failure.
    fn reconnect_poll(&self) -> i32;

    /// Drain admin completions (AERs, disconnects). Returns the number
    /// of completions processed or a negative errno.
    fn process_admin_completions(&self) -> i32;

    fn set_event_sink(&self, sink: EventSink);

    fn active_ns_list(&self) -> Vec<NsData>;

    fn is_active_ns(&self, nsid: u32) -> bool;

    /// Issue a get-log-page for the ANA log; delivered via callback.
    fn read_ana_log_page(&self, cb: AnaLogCb);

    fn alloc_qpair(&self) -> Result<Arc<dyn QpairHandle>, Errno>;

    /// NVMe ABORT admin command for a command on one of this
    /// controller's qpairs.
    fn abort_cmd(&self, qpair: &Arc<dyn QpairHandle>, cid: u16, cb: AbortCb);

    /// Admin command passthru.
    fn admin_passthru(
        &self,
        cmd: &NvmePassthruCmd,
        buffer: Option<IoBuffer>,
        cb: NvmeCompletionCb,
    );
}

/// One I/O queue pair, pinned to a single thread.
pub trait QpairHandle: Send + Sync {
    /// Begin connecting; progress observed via `is_connected`.
    fn connect(&self) -> i32;

    fn is_connected(&self) -> bool;

    fn failure_reason(&self) -> Option<Errno>;

    fn disconnect(&self);

    fn outstanding_requests(&self) -> u32;

    /// Submit one command. The returned CID identifies it for aborts.
    /// `ENOMEM` means the submission queue is full; `ENXIO` means the
    /// qpair is unusable.
    fn submit(
        &self,
        submission: NvmeSubmission,
        cb: NvmeCompletionCb,
    ) -> Result<u16, Errno>;

    /// Drain I/O completions.
    fn process_completions(&self) -> i32;
}

/// The transport factory: synchronous initial connect plus an optional
/// hot-plug probe.
pub trait NvmeTransport: Send + Sync {
    fn connect(
        &self,
        trid: &TransportId,
    ) -> Result<Arc<dyn CtrlrHandle>, Errno>;

    /// Transport ids that appeared since the last probe.
    fn probe(&self) -> Vec<TransportId> {
        Vec::new()
    }
}
