//! The I/O descriptor: one outstanding operation against a bdev, from
//! submission through (possibly split, queued, retried) completion.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{bdev::Bdev, channel::BdevChannel};
use crate::nvme::status::NvmeStatus;

/// All operations the generic layer can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoType {
    Invalid,
    Read,
    Write,
    Unmap,
    Flush,
    Reset,
    NvmeAdmin,
    NvmeIo,
    NvmeIoMd,
    WriteZeroes,
    Zcopy,
    ZoneInfo,
    ZoneManagement,
    ZoneAppend,
    Compare,
    CompareAndWrite,
    Abort,
    SeekHole,
    SeekData,
    Copy,
}

impl IoType {
    /// Reads are only blocked by quiescing range locks; everything that
    /// can mutate or bypass the block layer is blocked by any lock.
    pub fn is_read(&self) -> bool {
        matches!(self, IoType::Read)
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            IoType::Write
                | IoType::WriteZeroes
                | IoType::ZoneAppend
                | IoType::CompareAndWrite
                | IoType::Copy
        )
    }

    /// Operations a range lock holds back (worst case for passthru, which
    /// the layer cannot inspect).
    pub fn is_lockable(&self) -> bool {
        matches!(
            self,
            IoType::Write
                | IoType::Unmap
                | IoType::WriteZeroes
                | IoType::Zcopy
                | IoType::Copy
                | IoType::NvmeIo
                | IoType::NvmeIoMd
                | IoType::ZoneAppend
                | IoType::CompareAndWrite
        )
    }
}

/// User visible completion state of an I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Still owned by the layer: queued, split or retrying.
    Pending,
    Success,
    Aborted,
    Failed,
    /// Module ran out of resources; absorbed by the retry queue.
    NoMemory,
    /// Memory never became available and retries were given up.
    NomemExhausted,
    Miscompare,
    /// The compare half of a fused compare-and-write failed.
    FirstFusedFailed,
    NvmeError(NvmeStatus),
    ScsiError {
        sc: u8,
        sk: u8,
        asc: u8,
        ascq: u8,
    },
    AioError {
        errno: i32,
    },
}

impl IoStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, IoStatus::Success)
    }
}

/// Where a NOMEM-deferred I/O resumes once resources free up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Invalid,
    Submit,
    Pull,
    PullMd,
    Push,
    PushMd,
    GetAccelBuf,
}

/// A contiguous segment of the I/O payload, expressed as an offset into
/// the shared data buffer. Splitting carves children out of the parent's
/// segments without copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub base: u64,
    pub len: u64,
}

impl IoVec {
    pub fn new(base: u64, len: u64) -> Self {
        Self {
            base,
            len,
        }
    }
}

/// Shared payload backing an I/O and all of its split children.
#[derive(Debug, Clone, Default)]
pub struct IoBuffer(pub Arc<Mutex<Vec<u8>>>);

impl IoBuffer {
    pub fn alloc(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(data)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy a segment out of the buffer.
    pub fn read(&self, base: u64, len: u64) -> Vec<u8> {
        let data = self.0.lock();
        data[base as usize .. (base + len) as usize].to_vec()
    }

    /// Copy a segment into the buffer.
    pub fn write(&self, base: u64, bytes: &[u8]) {
        let mut data = self.0.lock();
        data[base as usize .. base as usize + bytes.len()]
            .copy_from_slice(bytes);
    }
}

/// Completion callback crossing the API boundary. The I/O is passed so
/// callers can read back results (seek offsets, passthru completion
/// words, zone reports).
pub type IoCompletion = Box<dyn FnOnce(&Arc<BdevIo>, IoStatus) + Send>;

/// Split bookkeeping on a parent I/O.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SplitTrack {
    pub current_offset_blocks: u64,
    pub remaining_blocks: u64,
    pub outstanding: u32,
    /// Cursor into the parent iov list for read/write splitting.
    pub iov_idx: usize,
    pub iov_offset: u64,
    pub failed: bool,
}

/// Extended submit options carried through to the module untouched.
#[derive(Debug, Default, Clone)]
pub struct ExtIoOpts {
    /// Payload lives in a foreign memory domain and must be pulled before
    /// a module that cannot address it sees the buffer.
    pub memory_domain: bool,
    /// An accel sequence is attached; only modules that advertise support
    /// may execute it.
    pub accel_sequence: bool,
    pub metadata: bool,
    pub nvme_cdw12: u32,
    pub nvme_cdw13: u32,
    pub dif_check_flags_exclude_mask: u32,
}

/// A raw NVMe command for admin/IO passthru.
#[derive(Debug, Clone, Default)]
pub struct NvmePassthruCmd {
    pub opc: u8,
    pub nsid: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub buffer_len: u64,
}

/// Zone management/report arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneArgs {
    pub zone_id: u64,
    pub num_zones: u32,
    pub action: u8,
}

pub(crate) struct IoCtx {
    pub channel: Option<Arc<BdevChannel>>,
    pub desc: Option<Arc<super::desc::BdevDesc>>,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    pub iovs: Vec<IoVec>,
    pub buffer: Option<IoBuffer>,
    pub md_buf: Option<IoBuffer>,
    /// Write payload of a fused compare-and-write.
    pub second_iovs: Vec<IoVec>,
    pub status: IoStatus,
    pub retry_state: RetryState,
    pub submit_tsc: u64,
    pub caller_ctx: u64,
    pub cb: Option<IoCompletion>,
    /// Completion happened while submit was still on the stack; defer the
    /// callback through a message to avoid unbounded recursion.
    pub in_submit: bool,
    pub split: Option<SplitTrack>,
    pub parent: Option<Arc<BdevIo>>,
    pub abort_target: Option<Arc<BdevIo>>,
    pub ext: ExtIoOpts,
    pub bounce: Option<IoBuffer>,
    pub copy_src_offset: u64,
    pub zcopy_populate: bool,
    pub zcopy_commit: bool,
    pub zcopy_start: bool,
    pub zone: Option<ZoneArgs>,
    pub nvme_cmd: Option<NvmePassthruCmd>,
    /// Offset result of a seek operation.
    pub seek_offset: u64,
    /// Module private per-I/O state.
    pub driver_ctx: Option<Box<dyn std::any::Any + Send>>,
}

impl Default for IoCtx {
    fn default() -> Self {
        Self {
            channel: None,
            desc: None,
            offset_blocks: 0,
            num_blocks: 0,
            iovs: Vec::new(),
            buffer: None,
            md_buf: None,
            second_iovs: Vec::new(),
            status: IoStatus::Pending,
            retry_state: RetryState::Invalid,
            submit_tsc: 0,
            caller_ctx: 0,
            cb: None,
            in_submit: false,
            split: None,
            parent: None,
            abort_target: None,
            ext: ExtIoOpts::default(),
            bounce: None,
            copy_src_offset: 0,
            zcopy_populate: false,
            zcopy_commit: false,
            zcopy_start: false,
            zone: None,
            nvme_cmd: None,
            seek_offset: 0,
            driver_ctx: None,
        }
    }
}

/// One outstanding I/O. Shared by the submitting channel, the retry and
/// lock queues, and the module; the context lock is held only for brief
/// field updates.
pub struct BdevIo {
    bdev: Arc<Bdev>,
    io_type: IoType,
    pub(crate) ctx: Mutex<IoCtx>,
}

impl std::fmt::Debug for BdevIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ctx = self.ctx.lock();
        f.debug_struct("BdevIo")
            .field("bdev", &self.bdev.name())
            .field("type", &self.io_type)
            .field("offset", &ctx.offset_blocks)
            .field("num_blocks", &ctx.num_blocks)
            .field("status", &ctx.status)
            .finish()
    }
}

impl BdevIo {
    pub(crate) fn new(bdev: Arc<Bdev>, io_type: IoType) -> Arc<Self> {
        Arc::new(Self {
            bdev,
            io_type,
            ctx: Mutex::new(IoCtx::default()),
        })
    }

    pub fn bdev(&self) -> &Arc<Bdev> {
        &self.bdev
    }

    pub fn io_type(&self) -> IoType {
        self.io_type
    }

    pub fn offset_blocks(&self) -> u64 {
        self.ctx.lock().offset_blocks
    }

    pub fn num_blocks(&self) -> u64 {
        self.ctx.lock().num_blocks
    }

    pub fn status(&self) -> IoStatus {
        self.ctx.lock().status
    }

    pub fn iovs(&self) -> Vec<IoVec> {
        self.ctx.lock().iovs.clone()
    }

    pub fn buffer(&self) -> Option<IoBuffer> {
        self.ctx.lock().buffer.clone()
    }

    pub fn md_buf(&self) -> Option<IoBuffer> {
        self.ctx.lock().md_buf.clone()
    }

    pub fn second_iovs(&self) -> Vec<IoVec> {
        self.ctx.lock().second_iovs.clone()
    }

    pub fn zone_args(&self) -> Option<ZoneArgs> {
        self.ctx.lock().zone
    }

    pub fn nvme_cmd(&self) -> Option<NvmePassthruCmd> {
        self.ctx.lock().nvme_cmd.clone()
    }

    pub fn ext_opts(&self) -> ExtIoOpts {
        self.ctx.lock().ext.clone()
    }

    pub fn copy_src_offset(&self) -> u64 {
        self.ctx.lock().copy_src_offset
    }

    pub fn abort_target(&self) -> Option<Arc<BdevIo>> {
        self.ctx.lock().abort_target.clone()
    }

    pub fn submit_tsc(&self) -> u64 {
        self.ctx.lock().submit_tsc
    }

    pub fn seek_offset(&self) -> u64 {
        self.ctx.lock().seek_offset
    }

    /// Used by modules to report a seek result.
    pub fn set_seek_offset(&self, offset: u64) {
        self.ctx.lock().seek_offset = offset;
    }

    pub(crate) fn channel(&self) -> Option<Arc<BdevChannel>> {
        self.ctx.lock().channel.clone()
    }

    /// Payload size in bytes, derived from the block range.
    pub fn byte_count(&self) -> u64 {
        self.num_blocks() * self.bdev.block_len()
    }

    /// The effective range of the operation for lock overlap checks.
    pub(crate) fn lba_range(&self) -> (u64, u64) {
        let ctx = self.ctx.lock();
        (ctx.offset_blocks, ctx.num_blocks)
    }

    /// Module-facing completion entry point.
    pub fn complete(self: &Arc<Self>, status: IoStatus) {
        super::channel::io_complete(self, status);
    }

    /// Take the user callback out, if still armed.
    pub(crate) fn take_cb(&self) -> Option<IoCompletion> {
        self.ctx.lock().cb.take()
    }

    /// Store typed driver context, replacing any previous one.
    pub fn set_driver_ctx<T: std::any::Any + Send>(&self, v: T) {
        self.ctx.lock().driver_ctx = Some(Box::new(v));
    }

    /// Run a closure over the typed driver context.
    pub fn with_driver_ctx<T: std::any::Any + Send, R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut ctx = self.ctx.lock();
        ctx.driver_ctx
            .as_mut()
            .and_then(|b| b.downcast_mut::<T>())
            .map(f)
    }
}
