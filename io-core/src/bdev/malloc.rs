//! RAM-backed bdev module. Backs the whole generic pipeline in tests and
//! doubles as the reference for what a module must implement. Completions
//! are synchronous by default; manual mode holds them so in-flight states
//! (locks, aborts, timeouts) can be exercised.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    bdev::{Bdev, BdevBuilder, BdevProps},
    io::{BdevIo, IoStatus, IoType},
    module::{BdevModule, BdevOps, ModuleChannel},
};
use crate::core::{Runtime, Thread};

pub const MODULE_NAME: &str = "malloc";

/// Module registration object; examine hook is a no-op, malloc bdevs are
/// created explicitly.
pub struct MallocModule;

impl BdevModule for MallocModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }
}

struct Injection {
    /// Statuses forced onto upcoming completions, in order.
    forced: VecDeque<IoStatus>,
    /// Hold completions for the test to release.
    manual: bool,
    pending: VecDeque<Arc<BdevIo>>,
}

/// Per-bdev ops and backing store.
pub struct MallocBdev {
    block_len: u64,
    data: Mutex<Vec<u8>>,
    channels: Mutex<HashMap<u64, ModuleChannel>>,
    inject: Mutex<Injection>,
}

impl MallocBdev {
    /// Create and register a RAM bdev. `tweak` adjusts limits before the
    /// build (split boundaries, metadata, etc.).
    pub fn create(
        rt: &Arc<Runtime>,
        name: &str,
        num_blocks: u64,
        block_len: u64,
        tweak: impl FnOnce(&mut BdevProps),
    ) -> Result<(Arc<Bdev>, Arc<MallocBdev>), crate::core::CoreError> {
        let ops = Arc::new(MallocBdev {
            block_len,
            data: Mutex::new(vec![0; (num_blocks * block_len) as usize]),
            channels: Mutex::new(HashMap::new()),
            inject: Mutex::new(Injection {
                forced: VecDeque::new(),
                manual: false,
                pending: VecDeque::new(),
            }),
        });

        let bdev = BdevBuilder::new()
            .with_name(name)
            .with_product_name("Malloc disk")
            .with_block_length(block_len)
            .with_block_count(num_blocks)
            .with_module(MODULE_NAME)
            .with_ops(ops.clone())
            .with_props(tweak)
            .build(rt);

        bdev.register(rt)?;
        Ok((bdev, ops))
    }

    /// Force the next completions to the given status.
    pub fn inject_status(&self, status: IoStatus, count: usize) {
        let mut inj = self.inject.lock();
        for _ in 0 .. count {
            inj.forced.push_back(status);
        }
    }

    /// Hold completions until released by `complete_next`/`complete_all`.
    pub fn set_manual_completions(&self, manual: bool) {
        self.inject.lock().manual = manual;
    }

    pub fn pending_count(&self) -> usize {
        self.inject.lock().pending.len()
    }

    /// Snapshot of held I/Os, oldest first.
    pub fn pending(&self) -> Vec<Arc<BdevIo>> {
        self.inject.lock().pending.iter().cloned().collect()
    }

    /// Release the oldest held I/O with the given status (data is moved
    /// first on success).
    pub fn complete_next(&self, status: IoStatus) -> bool {
        let io = self.inject.lock().pending.pop_front();
        match io {
            Some(io) => {
                let status = if status.is_success() {
                    self.execute(&io)
                } else {
                    status
                };
                io.complete(status);
                true
            }
            None => false,
        }
    }

    pub fn complete_all(&self, status: IoStatus) {
        while self.complete_next(status) {}
    }

    /// Drop a held I/O without completing it (lost-command simulation).
    pub fn drop_next(&self) -> Option<Arc<BdevIo>> {
        self.inject.lock().pending.pop_front()
    }

    /// Direct view of the device bytes.
    pub fn read_raw(&self, offset_blocks: u64, num_blocks: u64) -> Vec<u8> {
        let data = self.data.lock();
        let start = (offset_blocks * self.block_len) as usize;
        let end = start + (num_blocks * self.block_len) as usize;
        data[start .. end].to_vec()
    }

    fn execute(&self, io: &Arc<BdevIo>) -> IoStatus {
        let block_len = self.block_len;
        let offset_bytes = io.offset_blocks() * block_len;

        match io.io_type() {
            IoType::Read => {
                let Some(buf) = io.buffer() else {
                    return IoStatus::Failed;
                };
                let data = self.data.lock();
                let mut cursor = offset_bytes as usize;
                for iov in io.iovs() {
                    let src = &data[cursor .. cursor + iov.len as usize];
                    buf.write(iov.base, src);
                    cursor += iov.len as usize;
                }
                IoStatus::Success
            }
            IoType::Write => {
                let Some(buf) = io.buffer() else {
                    return IoStatus::Failed;
                };
                let mut data = self.data.lock();
                let mut cursor = offset_bytes as usize;
                for iov in io.iovs() {
                    let bytes = buf.read(iov.base, iov.len);
                    data[cursor .. cursor + iov.len as usize]
                        .copy_from_slice(&bytes);
                    cursor += iov.len as usize;
                }
                IoStatus::Success
            }
            IoType::Compare => {
                let Some(buf) = io.buffer() else {
                    return IoStatus::Failed;
                };
                let data = self.data.lock();
                let mut cursor = offset_bytes as usize;
                for iov in io.iovs() {
                    let expect = buf.read(iov.base, iov.len);
                    let actual = &data[cursor .. cursor + iov.len as usize];
                    if expect != actual {
                        return IoStatus::Miscompare;
                    }
                    cursor += iov.len as usize;
                }
                IoStatus::Success
            }
            IoType::CompareAndWrite => {
                let Some(buf) = io.buffer() else {
                    return IoStatus::Failed;
                };
                {
                    let data = self.data.lock();
                    let mut cursor = offset_bytes as usize;
                    for iov in io.iovs() {
                        let expect = buf.read(iov.base, iov.len);
                        let actual =
                            &data[cursor .. cursor + iov.len as usize];
                        if expect != actual {
                            return IoStatus::Miscompare;
                        }
                        cursor += iov.len as usize;
                    }
                }
                let mut data = self.data.lock();
                let mut cursor = offset_bytes as usize;
                for iov in io.second_iovs() {
                    let bytes = buf.read(iov.base, iov.len);
                    data[cursor .. cursor + iov.len as usize]
                        .copy_from_slice(&bytes);
                    cursor += iov.len as usize;
                }
                IoStatus::Success
            }
            IoType::Unmap | IoType::WriteZeroes => {
                let mut data = self.data.lock();
                let start = offset_bytes as usize;
                let end =
                    start + (io.num_blocks() * block_len) as usize;
                data[start .. end].fill(0);
                IoStatus::Success
            }
            IoType::Copy => {
                let mut data = self.data.lock();
                let src = (io.copy_src_offset() * block_len) as usize;
                let dst = offset_bytes as usize;
                let len = (io.num_blocks() * block_len) as usize;
                let tmp = data[src .. src + len].to_vec();
                data[dst .. dst + len].copy_from_slice(&tmp);
                IoStatus::Success
            }
            IoType::SeekData => {
                let data = self.data.lock();
                let total = data.len() as u64 / block_len;
                let mut blk = io.offset_blocks();
                while blk < total {
                    let s = (blk * block_len) as usize;
                    let e = s + block_len as usize;
                    if data[s .. e].iter().any(|b| *b != 0) {
                        break;
                    }
                    blk += 1;
                }
                io.set_seek_offset(blk);
                IoStatus::Success
            }
            IoType::SeekHole => {
                let data = self.data.lock();
                let total = data.len() as u64 / block_len;
                let mut blk = io.offset_blocks();
                while blk < total {
                    let s = (blk * block_len) as usize;
                    let e = s + block_len as usize;
                    if data[s .. e].iter().all(|b| *b == 0) {
                        break;
                    }
                    blk += 1;
                }
                io.set_seek_offset(blk);
                IoStatus::Success
            }
            IoType::Flush | IoType::Zcopy | IoType::Reset => IoStatus::Success,
            IoType::Abort => {
                // Held I/O can be aborted out of the pending queue.
                let target = io.abort_target();
                let Some(target) = target else {
                    return IoStatus::Failed;
                };
                let held = {
                    let mut inj = self.inject.lock();
                    let before = inj.pending.len();
                    inj.pending.retain(|p| !Arc::ptr_eq(p, &target));
                    before != inj.pending.len()
                };
                if held {
                    target.complete(IoStatus::Aborted);
                    IoStatus::Success
                } else {
                    IoStatus::Failed
                }
            }
            _ => IoStatus::Failed,
        }
    }
}

impl BdevOps for MallocBdev {
    fn submit_request(&self, _chan: &ModuleChannel, io: &Arc<BdevIo>) {
        if let Some(forced) = self.inject.lock().forced.pop_front() {
            debug!(?forced, "malloc forcing completion status");
            io.complete(forced);
            return;
        }

        // Aborts act on the pending queue even in manual mode.
        if io.io_type() != IoType::Abort && self.inject.lock().manual {
            self.inject.lock().pending.push_back(io.clone());
            return;
        }

        let status = self.execute(io);
        io.complete(status);
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(
            io_type,
            IoType::Read
                | IoType::Write
                | IoType::Unmap
                | IoType::Flush
                | IoType::Reset
                | IoType::WriteZeroes
                | IoType::Compare
                | IoType::CompareAndWrite
                | IoType::Zcopy
                | IoType::Copy
                | IoType::SeekData
                | IoType::SeekHole
                | IoType::Abort
        )
    }

    fn get_io_channel(&self, thread: &Arc<Thread>) -> ModuleChannel {
        let mut channels = self.channels.lock();
        channels
            .entry(thread.id())
            .or_insert_with(|| Arc::new(()) as ModuleChannel)
            .clone()
    }
}
