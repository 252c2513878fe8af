//! Generic-to-NVMe I/O translation and the completion/retry policy: CRD
//! delays, path error handling, ANA refresh scheduling, PI error
//! re-reads and fused compare-and-write.

use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    bdev::NvmeBdev,
    channel::{NvmeBdevChannel, NvmeIoPath},
    status::NvmeStatus,
    transport::{CtrlrHandle, NvmeSubmission},
};
use crate::bdev::io::{BdevIo, IoBuffer, IoStatus, IoType, IoVec};

/// DSM limits: blocks per range and ranges per command.
const DSM_RANGE_MAX_BLOCKS: u64 = u32::MAX as u64;
const DSM_MAX_RANGES: usize = 256;
/// WRITE ZEROES carries a 16-bit NLB field.
const WRITE_ZEROES_MAX_BLOCKS: u64 = 65_536;

/// Per-I/O driver context living on the `BdevIo`.
#[derive(Default)]
pub(crate) struct NvmeIoCtx {
    pub io_path: Option<Arc<NvmeIoPath>>,
    pub cid: u16,
    pub retry_count: u32,
    pub retry_ticks: u64,
    /// A PI error triggered a re-read with checks disabled; the original
    /// status is surfaced when the re-read lands.
    pub pi_status: Option<NvmeStatus>,
    /// Fused compare-and-write bookkeeping: completions outstanding and
    /// the first (compare) half's failure.
    pub fused_outstanding: u8,
    pub fused_first_status: Option<NvmeStatus>,
    pub fused_second_status: Option<NvmeStatus>,
}

fn with_ctx<R>(io: &Arc<BdevIo>, f: impl FnOnce(&mut NvmeIoCtx) -> R) -> R {
    if io.with_driver_ctx::<NvmeIoCtx, ()>(|_| ()).is_none() {
        io.set_driver_ctx(NvmeIoCtx::default());
    }
    io.with_driver_ctx(f).expect("driver ctx just installed")
}

pub(crate) fn retry_ticks(io: &Arc<BdevIo>) -> u64 {
    with_ctx(io, |c| c.retry_ticks)
}

pub(crate) fn set_retry_ticks(io: &Arc<BdevIo>, ticks: u64) {
    with_ctx(io, |c| c.retry_ticks = ticks);
}

/// Module entry point: dispatch one generic I/O.
pub(crate) fn submit_request(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
) {
    match io.io_type() {
        IoType::Reset => reset_io(nbdev, chan, io),
        IoType::NvmeAdmin => admin_passthru(nbdev, io),
        IoType::Abort => abort_io(nbdev, chan, io),
        _ => submit_data_io(nbdev, chan, io),
    }
}

fn submit_data_io(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
) {
    // Flush is skipped entirely without a volatile write cache or when
    // disabled by option.
    if io.io_type() == IoType::Flush {
        let vwc = chan
            .io_paths()
            .first()
            .and_then(|p| p.ns().ctrlr())
            .map(|c| c.data().vwc)
            .unwrap_or(false);
        if !nbdev.opts().enable_flush || !vwc {
            io.complete(IoStatus::Success);
            return;
        }
    }

    let Some(path) = chan.find_io_path() else {
        io_complete_errno(nbdev, chan, io, Errno::ENXIO);
        return;
    };

    submit_on_path(nbdev, chan, io, &path);
}

fn submit_on_path(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
    path: &Arc<NvmeIoPath>,
) {
    with_ctx(io, |c| c.io_path = Some(path.clone()));

    if io.io_type() == IoType::CompareAndWrite {
        submit_fused(nbdev, chan, io, path);
        return;
    }

    // Compare without device support is emulated by read + memcmp.
    if io.io_type() == IoType::Compare {
        let supported = path
            .ns()
            .ctrlr()
            .map(|c| c.data().oncs.compare)
            .unwrap_or(false);
        if !supported {
            submit_emulated_compare(nbdev, chan, io, path);
            return;
        }
    }

    let submission = match build_submission(nbdev, io, false) {
        Ok(s) => s,
        Err(status) => {
            io.complete(status);
            return;
        }
    };

    let nbdev2 = nbdev.clone();
    let chan2 = chan.clone();
    let io2 = io.clone();
    match path.qpair().submit(
        submission,
        Box::new(move |status| {
            io_complete_nvme_status(&nbdev2, &chan2, &io2, status);
        }),
    ) {
        Ok(cid) => {
            with_ctx(io, |c| c.cid = cid);
        }
        Err(e) => io_complete_errno(nbdev, chan, io, e),
    }
}

/// Build the semantic command for one I/O. Limits are enforced here;
/// violations surface as validation failures, never as malformed
/// commands.
fn build_submission(
    nbdev: &Arc<NvmeBdev>,
    io: &Arc<BdevIo>,
    no_pi: bool,
) -> Result<NvmeSubmission, IoStatus> {
    let ext = io.ext_opts();
    let prchk_flags = nbdev
        .namespaces()
        .first()
        .and_then(|ns| ns.ctrlr())
        .map(|c| c.opts().prchk_flags)
        .unwrap_or(0);
    let io_flags = if no_pi {
        0
    } else {
        prchk_flags & !ext.dif_check_flags_exclude_mask
    };
    let buffer = io.buffer().unwrap_or_default();

    match io.io_type() {
        IoType::Read => Ok(NvmeSubmission::Read {
            offset_blocks: io.offset_blocks(),
            num_blocks: io.num_blocks(),
            buffer,
            iovs: io.iovs(),
            md: io.md_buf(),
            io_flags,
            cdw13: ext.nvme_cdw13,
        }),
        IoType::Write | IoType::NvmeIoMd => Ok(NvmeSubmission::Write {
            offset_blocks: io.offset_blocks(),
            num_blocks: io.num_blocks(),
            buffer,
            iovs: io.iovs(),
            md: io.md_buf(),
            io_flags,
            cdw13: ext.nvme_cdw13,
        }),
        IoType::Compare => Ok(NvmeSubmission::Compare {
            offset_blocks: io.offset_blocks(),
            num_blocks: io.num_blocks(),
            buffer,
            iovs: io.iovs(),
            fused_first: false,
        }),
        IoType::Unmap => {
            let mut ranges = Vec::new();
            let mut offset = io.offset_blocks();
            let mut remaining = io.num_blocks();
            while remaining > 0 {
                if ranges.len() == DSM_MAX_RANGES {
                    return Err(IoStatus::Failed);
                }
                let count = remaining.min(DSM_RANGE_MAX_BLOCKS);
                ranges.push((offset, count as u32));
                offset += count;
                remaining -= count;
            }
            Ok(NvmeSubmission::Dsm {
                ranges,
            })
        }
        IoType::WriteZeroes => {
            if io.num_blocks() > WRITE_ZEROES_MAX_BLOCKS {
                // The bdev advertises the limit; arriving here means the
                // upper layer failed to split.
                return Err(IoStatus::Failed);
            }
            Ok(NvmeSubmission::WriteZeroes {
                offset_blocks: io.offset_blocks(),
                num_blocks: io.num_blocks(),
            })
        }
        IoType::Flush => Ok(NvmeSubmission::Flush),
        IoType::ZoneAppend => Ok(NvmeSubmission::ZoneAppend {
            zone_id: io.offset_blocks(),
            num_blocks: io.num_blocks(),
            buffer,
            iovs: io.iovs(),
        }),
        IoType::ZoneManagement => {
            let args = io.zone_args().unwrap_or_default();
            Ok(NvmeSubmission::ZoneMgmtSend {
                zone_id: args.zone_id,
                action: args.action,
            })
        }
        IoType::ZoneInfo => {
            let args = io.zone_args().unwrap_or_default();
            Ok(NvmeSubmission::ZoneMgmtRecv {
                zone_id: args.zone_id,
                num_zones: args.num_zones,
                buffer,
            })
        }
        IoType::NvmeIo => {
            let cmd = io.nvme_cmd().unwrap_or_default();
            let mdts = nbdev
                .namespaces()
                .first()
                .and_then(|ns| ns.ctrlr())
                .map(|c| c.data().mdts)
                .unwrap_or(0);
            if mdts > 0 && cmd.buffer_len > mdts {
                return Err(IoStatus::Failed);
            }
            Ok(NvmeSubmission::Passthru {
                cmd,
                buffer: io.buffer(),
            })
        }
        other => {
            warn!(?other, "unsupported I/O type reached translation");
            Err(IoStatus::Failed)
        }
    }
}

/// Fused compare-and-write: the compare is submitted first-fused, the
/// write second-fused; the pair completes as one I/O.
fn submit_fused(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
    path: &Arc<NvmeIoPath>,
) {
    let buffer = io.buffer().unwrap_or_default();
    with_ctx(io, |c| {
        c.fused_outstanding = 2;
        c.fused_first_status = None;
        c.fused_second_status = None;
    });

    let first = NvmeSubmission::Compare {
        offset_blocks: io.offset_blocks(),
        num_blocks: io.num_blocks(),
        buffer: buffer.clone(),
        iovs: io.iovs(),
        fused_first: true,
    };
    let second = NvmeSubmission::FusedWrite {
        offset_blocks: io.offset_blocks(),
        num_blocks: io.num_blocks(),
        buffer,
        iovs: io.second_iovs(),
    };

    let mk_cb = |first_half: bool| {
        let nbdev = nbdev.clone();
        let chan = chan.clone();
        let io = io.clone();
        Box::new(move |status: NvmeStatus| {
            let done = with_ctx(&io, |c| {
                if first_half {
                    c.fused_first_status = Some(status);
                } else {
                    c.fused_second_status = Some(status);
                }
                c.fused_outstanding -= 1;
                c.fused_outstanding == 0
            });
            if done {
                fused_complete(&nbdev, &chan, &io);
            }
        })
    };

    let rc1 = path.qpair().submit(first, mk_cb(true));
    let rc2 = path.qpair().submit(second, mk_cb(false));

    match (rc1, rc2) {
        (Ok(_), Ok(_)) => {}
        _ => io_complete_errno(nbdev, chan, io, Errno::ENXIO),
    }
}

fn fused_complete(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
) {
    let (first, second) = with_ctx(io, |c| {
        (c.fused_first_status, c.fused_second_status)
    });
    let first = first.unwrap_or(NvmeStatus::SUCCESS);
    let second = second.unwrap_or(NvmeStatus::SUCCESS);

    if first.is_compare_failure() {
        io.complete(IoStatus::Miscompare);
    } else if !first.is_success() {
        io.complete(IoStatus::FirstFusedFailed);
    } else if !second.is_success() {
        io_complete_nvme_status(nbdev, chan, io, second);
    } else {
        io.complete(IoStatus::Success);
    }
}

/// Compare emulation: read the range and memcmp against the caller's
/// payload.
fn submit_emulated_compare(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
    path: &Arc<NvmeIoPath>,
) {
    let len = io.byte_count();
    let scratch = IoBuffer::alloc(len as usize);
    let read = NvmeSubmission::Read {
        offset_blocks: io.offset_blocks(),
        num_blocks: io.num_blocks(),
        buffer: scratch.clone(),
        iovs: vec![IoVec::new(0, len)],
        md: None,
        io_flags: 0,
        cdw13: 0,
    };

    let nbdev2 = nbdev.clone();
    let chan2 = chan.clone();
    let io2 = io.clone();
    let rc = path.qpair().submit(
        read,
        Box::new(move |status| {
            if !status.is_success() {
                io_complete_nvme_status(&nbdev2, &chan2, &io2, status);
                return;
            }
            let expect = io2.buffer().unwrap_or_default();
            let mut cursor = 0u64;
            for iov in io2.iovs() {
                let want = expect.read(iov.base, iov.len);
                let have = scratch.read(cursor, iov.len);
                if want != have {
                    io2.complete(IoStatus::Miscompare);
                    return;
                }
                cursor += iov.len;
            }
            io2.complete(IoStatus::Success);
        }),
    );
    if let Err(e) = rc {
        io_complete_errno(nbdev, chan, io, e);
    }
}

// Completion and retry policy.

/// Should this failed I/O be retried, and with what delay?
fn check_retry_io(
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
    status: NvmeStatus,
) -> Option<u64> {
    let path = with_ctx(io, |c| c.io_path.clone());

    let (path_ok, ctrlr) = match &path {
        Some(p) => (p.is_available(), p.ns().ctrlr()),
        None => (false, None),
    };
    let ctrlr_ok = ctrlr.as_ref().map(|c| c.is_available()).unwrap_or(false);

    if status.is_path_error()
        || status.is_aborted_sq_deletion()
        || !path_ok
        || !ctrlr_ok
    {
        chan.clear_current_path();
        with_ctx(io, |c| c.io_path = None);

        if status.is_ana_error() {
            if let Some(ctrlr) = &ctrlr {
                if ctrlr.read_ana_log_page() {
                    if let Some(p) = &path {
                        p.ns().set_updating(true);
                    }
                }
            }
        }

        if !chan.any_io_path_may_become_available() {
            return None;
        }
        return Some(0);
    }

    with_ctx(io, |c| c.retry_count += 1);

    // Honour the controller's command retry delay table.
    let delay_ms = if status.crd != 0 {
        ctrlr
            .map(|c| {
                c.data()
                    .crdt
                    .get(status.crd as usize)
                    .copied()
                    .unwrap_or(0) as u64
                    * 100
            })
            .unwrap_or(0)
    } else {
        0
    };
    Some(delay_ms)
}

/// NVMe completion for a data I/O.
pub(crate) fn io_complete_nvme_status(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
    status: NvmeStatus,
) {
    if status.is_success() {
        // A successful re-read after a PI error still reports the
        // original integrity failure, now with the data available for
        // inspection.
        let pi = with_ctx(io, |c| c.pi_status.take());
        if let Some(pi) = pi {
            io.complete(IoStatus::NvmeError(pi));
            return;
        }

        update_io_path_stat(io);
        io.complete(IoStatus::Success);
        return;
    }

    // On a read PI failure, re-issue the same read with checking
    // disabled to surface the precise failing block.
    if status.is_pi_error()
        && io.io_type() == IoType::Read
        && with_ctx(io, |c| c.pi_status.is_none())
    {
        let path = with_ctx(io, |c| c.io_path.clone());
        if let Some(path) = path {
            with_ctx(io, |c| c.pi_status = Some(status));
            debug!("re-reading with PI checks disabled");
            if resubmit_no_pi(nbdev, chan, io, &path) {
                return;
            }
            with_ctx(io, |c| c.pi_status = None);
        }
    }

    let retry_limit = nbdev.opts().bdev_retry_count;
    let retries_left = retry_limit == -1
        || with_ctx(io, |c| c.retry_count) < retry_limit as u32;

    if status.dnr
        || status.is_aborted_by_request()
        || !retries_left
        || io.ext_opts().accel_sequence
    {
        io.complete(IoStatus::NvmeError(status));
        return;
    }

    match check_retry_io(chan, io, status) {
        Some(delay_ms) => {
            // Count the error even though the I/O will be retried.
            if let Some(bdev) = nbdev.bdev() {
                bdev.count_error(status.sct, status.sc);
            }
            chan.queue_retry_io(io, delay_ms);
        }
        None => io.complete(IoStatus::NvmeError(status)),
    }
}

fn resubmit_no_pi(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
    path: &Arc<NvmeIoPath>,
) -> bool {
    let submission = match build_submission(nbdev, io, true) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let nbdev2 = nbdev.clone();
    let chan2 = chan.clone();
    let io2 = io.clone();
    path.qpair()
        .submit(
            submission,
            Box::new(move |status| {
                io_complete_nvme_status(&nbdev2, &chan2, &io2, status);
            }),
        )
        .is_ok()
}

/// Submission-path errno handling.
pub(crate) fn io_complete_errno(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
    errno: Errno,
) {
    match errno {
        Errno::ENOMEM => io.complete(IoStatus::NoMemory),
        Errno::ENXIO => {
            let retry_limit = nbdev.opts().bdev_retry_count;
            let retries_left = retry_limit == -1
                || with_ctx(io, |c| c.retry_count) < retry_limit as u32;

            if retries_left {
                chan.clear_current_path();
                with_ctx(io, |c| c.io_path = None);
                if chan.any_io_path_may_become_available() {
                    chan.queue_retry_io(io, 1_000);
                    return;
                }
            }
            io.complete(IoStatus::Failed);
        }
        _ => io.complete(IoStatus::Failed),
    }
}

/// Retry entry: reuse the recorded path when it is still usable,
/// otherwise run the full submit path again.
pub(crate) fn retry_io(chan: &Arc<NvmeBdevChannel>, io: &Arc<BdevIo>) {
    let path = with_ctx(io, |c| c.io_path.clone());
    let Some(nbdev) = chan.bdev.upgrade() else {
        io.complete(IoStatus::Failed);
        return;
    };

    match path {
        Some(p) if p.is_available() => submit_on_path(&nbdev, chan, io, &p),
        _ => submit_request(&nbdev, chan, io),
    }
}

fn update_io_path_stat(io: &Arc<BdevIo>) {
    let path = with_ctx(io, |c| c.io_path.clone());
    let Some(path) = path else {
        return;
    };
    if path.stat.is_none() {
        return;
    }

    let rt = io.bdev().runtime();
    let latency = rt.ticks().saturating_sub(io.submit_tsc());
    let (populate, start) = {
        let ctx = io.ctx.lock();
        (ctx.zcopy_populate, ctx.zcopy_start)
    };
    if let Some(stat) = &path.stat {
        stat.lock().account(
            io.io_type(),
            io.byte_count(),
            latency,
            populate,
            start,
        );
    }
}

// Admin-type operations.

/// Admin passthru goes to any controller that is not failed.
fn admin_passthru(nbdev: &Arc<NvmeBdev>, io: &Arc<BdevIo>) {
    let ctrlr = nbdev
        .namespaces()
        .iter()
        .filter_map(|ns| ns.ctrlr())
        .find(|c| c.is_available());

    let Some(ctrlr) = ctrlr else {
        io.complete(IoStatus::Failed);
        return;
    };
    let Some(handle) = ctrlr.handle() else {
        io.complete(IoStatus::Failed);
        return;
    };

    let cmd = io.nvme_cmd().unwrap_or_default();
    let io2 = io.clone();
    handle.admin_passthru(
        &cmd,
        io.buffer(),
        Box::new(move |status| {
            if status.is_success() {
                io2.complete(IoStatus::Success);
            } else {
                io2.complete(IoStatus::NvmeError(status));
            }
        }),
    );
}

/// Abort: take the target out of the retry queue if it is parked there,
/// else send an NVMe ABORT for its CID on the path it went down.
fn abort_io(
    _nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
) {
    let Some(target) = io.abort_target() else {
        io.complete(IoStatus::Failed);
        return;
    };

    if chan.abort_retry_io(&target) {
        crate::bdev::channel::defer_complete(&target, IoStatus::Aborted);
        io.complete(IoStatus::Success);
        return;
    }

    let (path, cid) = with_ctx(&target, |c| (c.io_path.clone(), c.cid));
    if let Some(path) = path {
        if let Some(ctrlr) = path.ns().ctrlr() {
            if let (Some(handle), Some(qp)) =
                (ctrlr.handle(), path.qpair().handle())
            {
                let io2 = io.clone();
                handle.abort_cmd(
                    &qp,
                    cid,
                    Box::new(move |status| {
                        if status.is_success() {
                            io2.complete(IoStatus::Success);
                        } else {
                            io2.complete(IoStatus::NvmeError(status));
                        }
                    }),
                );
                return;
            }
        }
    }

    // Unknown path: broadcast the abort down every io path of this
    // channel, each on its own controller and qpair.
    let targets: Vec<_> = chan
        .io_paths()
        .iter()
        .filter_map(|path| {
            let ctrlr = path.ns().ctrlr()?;
            if ctrlr.is_failed() {
                return None;
            }
            Some((ctrlr.handle()?, path.qpair().handle()?))
        })
        .collect();
    if targets.is_empty() {
        io.complete(IoStatus::Failed);
        return;
    }

    let remaining = Arc::new(Mutex::new((targets.len(), false)));
    for (handle, qp) in targets {
        let io2 = io.clone();
        let remaining2 = remaining.clone();
        handle.abort_cmd(
            &qp,
            cid,
            Box::new(move |status| {
                let mut r = remaining2.lock();
                if status.is_success() && !r.1 {
                    r.1 = true;
                    io2.complete(IoStatus::Success);
                }
                r.0 -= 1;
                if r.0 == 0 && !r.1 {
                    io2.complete(IoStatus::Failed);
                }
            }),
        );
    }
}

// Reset chaining.

/// A reset bdev-I/O: freeze the multipath channels, then walk the path
/// set resetting one controller at a time. Controllers already resetting
/// park the I/O and feed it their own outcome.
fn reset_io(
    nbdev: &Arc<NvmeBdev>,
    chan: &Arc<NvmeBdevChannel>,
    io: &Arc<BdevIo>,
) {
    let Some(bdev) = nbdev.bdev() else {
        io.complete(IoStatus::Failed);
        return;
    };

    let chan2 = chan.clone();
    let io2 = io.clone();
    let nbdev2 = nbdev.clone();

    crate::core::thread::for_each(
        chan.thread(),
        bdev.channels(),
        |bchan, cont| {
            if let Ok(mp) = bchan
                .module_channel()
                .clone()
                .downcast::<NvmeBdevChannel>()
            {
                mp.set_resetting(true);
                mp.abort_retry_ios();
            }
            cont.done(0);
        },
        move |_| {
            let paths = chan2.io_paths();
            reset_next_path(nbdev2, chan2, io2, paths, 0, true);
        },
    );
}

fn reset_next_path(
    nbdev: Arc<NvmeBdev>,
    chan: Arc<NvmeBdevChannel>,
    io: Arc<BdevIo>,
    paths: Vec<Arc<NvmeIoPath>>,
    idx: usize,
    success: bool,
) {
    if idx >= paths.len() {
        reset_io_done(nbdev, io, success);
        return;
    }

    let Some(ctrlr) = paths[idx].ns().ctrlr() else {
        reset_next_path(nbdev, chan, io, paths, idx + 1, success);
        return;
    };

    let thread = chan.thread();
    let nbdev2 = nbdev.clone();
    let chan2 = chan.clone();
    let io2 = io.clone();
    let paths2 = paths.clone();

    let continue_chain = move |ok: bool| {
        let nbdev = nbdev2;
        let chan = chan2;
        let io = io2;
        let paths = paths2;
        thread.send_msg(move || {
            reset_next_path(nbdev, chan, io, paths, idx + 1, ok && success);
        });
    };

    // A reset already in flight adopts this I/O.
    if ctrlr.park_pending_reset(Box::new(continue_chain.clone())) {
        debug!(ctrlr = ctrlr.name(), "reset I/O parked behind active reset");
        return;
    }

    match ctrlr.reset_ctrlr(move |rc| continue_chain(rc == 0)) {
        Ok(()) => {}
        Err(_) => {
            let thread2 = chan.thread();
            let nbdev3 = nbdev.clone();
            let chan3 = chan.clone();
            let io3 = io.clone();
            thread2.send_msg(move || {
                reset_next_path(nbdev3, chan3, io3, paths, idx + 1, false);
            });
        }
    }
}

fn reset_io_done(nbdev: Arc<NvmeBdev>, io: Arc<BdevIo>, success: bool) {
    let Some(bdev) = nbdev.bdev() else {
        io.complete(if success {
            IoStatus::Success
        } else {
            IoStatus::Failed
        });
        return;
    };

    let origin = io
        .channel()
        .map(|c| c.thread())
        .or_else(crate::core::Thread::current)
        .expect("reset completes on an engine thread");

    crate::core::thread::for_each(
        origin,
        bdev.channels(),
        |bchan, cont| {
            if let Ok(mp) = bchan
                .module_channel()
                .clone()
                .downcast::<NvmeBdevChannel>()
            {
                mp.set_resetting(false);
            }
            cont.done(0);
        },
        move |_| {
            io.complete(if success {
                IoStatus::Success
            } else {
                IoStatus::Failed
            });
        },
    );
}
