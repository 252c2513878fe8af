//! The user-facing I/O API: every operation the bdev layer accepts,
//! expressed over an open descriptor. Each call builds one `BdevIo`
//! (consuming a pool credit) and feeds it to the submit pipeline on the
//! calling thread's channel.

use std::sync::Arc;

use crate::{
    bdev::{
        channel,
        desc::BdevDesc,
        io::{
            BdevIo,
            ExtIoOpts,
            IoBuffer,
            IoCompletion,
            IoCtx,
            IoStatus,
            IoType,
            IoVec,
            NvmePassthruCmd,
            ZoneArgs,
        },
    },
    core::{CoreError, Thread},
};

/// Extended options for `writev_blocks_ext`/`readv_blocks_ext`.
#[derive(Debug, Default, Clone)]
pub struct ExtOpts {
    pub memory_domain: bool,
    pub accel_sequence: bool,
    pub metadata: Option<IoBuffer>,
    pub nvme_cdw12: u32,
    pub nvme_cdw13: u32,
    pub dif_check_flags_exclude_mask: u32,
}

fn build_and_submit(
    desc: &Arc<BdevDesc>,
    io_type: IoType,
    check_range: bool,
    needs_write: bool,
    fill: impl FnOnce(&mut IoCtx),
    cb: IoCompletion,
) -> Result<(), CoreError> {
    let bdev = desc.bdev().clone();
    let name = bdev.name().to_string();

    if needs_write && !desc.is_writable() {
        return Err(CoreError::NotWritable {
            name,
        });
    }

    // Read/write are mandatory; everything else is capability gated.
    if !matches!(io_type, IoType::Read | IoType::Write)
        && !bdev.io_type_supported(io_type)
    {
        return Err(CoreError::IoTypeNotSupported {
            io_type,
            name,
        });
    }

    let io = BdevIo::new(bdev.clone(), io_type);
    {
        let mut ctx = io.ctx.lock();
        fill(&mut ctx);

        if check_range && !bdev.io_range_valid(ctx.offset_blocks, ctx.num_blocks)
        {
            return Err(CoreError::InvalidLbaRange {
                offset: ctx.offset_blocks,
                num_blocks: ctx.num_blocks,
            });
        }
        ctx.cb = Some(cb);
    }

    let rt = bdev.runtime();
    let thread =
        Thread::current().expect("I/O must be submitted on an engine thread");

    if !rt.io_pool.get(thread.id()) {
        return Err(CoreError::NoIoDescriptors {});
    }
    if !desc.io_ref_get() {
        rt.io_pool.put(thread.id());
        return Err(CoreError::BdevNotFound {
            name: bdev.name().to_string(),
        });
    }

    let chan = desc.get_channel();
    {
        let mut ctx = io.ctx.lock();
        ctx.desc = Some(desc.clone());
        ctx.channel = Some(chan.clone());
        ctx.submit_tsc = rt.ticks();
    }

    match io_type {
        IoType::Reset => channel::submit_reset(&chan, &io),
        IoType::Abort => {
            let target = io.ctx.lock().caller_ctx;
            channel::submit_abort(&chan, &io, target)
        }
        _ => channel::submit(&chan, &io),
    }
    Ok(())
}

/// Park a callback until this thread frees an I/O descriptor; the pool
/// returned `NoIoDescriptors` to the caller.
pub fn queue_io_wait(
    desc: &Arc<BdevDesc>,
    cb: impl FnOnce() + Send + 'static,
) {
    let rt = desc.bdev().runtime();
    let thread =
        Thread::current().expect("io wait must run on an engine thread");
    rt.io_pool.wait(thread.id(), Box::new(cb));
}

pub fn read_blocks(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    let len = num_blocks * desc.bdev().block_len();
    readv_blocks(
        desc,
        buffer,
        vec![IoVec::new(0, len)],
        offset_blocks,
        num_blocks,
        cb,
    )
}

pub fn readv_blocks(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    iovs: Vec<IoVec>,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    readv_blocks_ext(
        desc,
        buffer,
        iovs,
        offset_blocks,
        num_blocks,
        ExtOpts::default(),
        cb,
    )
}

pub fn readv_blocks_with_md(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    iovs: Vec<IoVec>,
    md_buf: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    readv_blocks_ext(
        desc,
        buffer,
        iovs,
        offset_blocks,
        num_blocks,
        ExtOpts {
            metadata: Some(md_buf),
            ..Default::default()
        },
        cb,
    )
}

pub fn readv_blocks_ext(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    iovs: Vec<IoVec>,
    offset_blocks: u64,
    num_blocks: u64,
    opts: ExtOpts,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::Read,
        true,
        false,
        |ctx| fill_rw(ctx, buffer, iovs, offset_blocks, num_blocks, opts),
        cb,
    )
}

fn fill_rw(
    ctx: &mut IoCtx,
    buffer: IoBuffer,
    iovs: Vec<IoVec>,
    offset_blocks: u64,
    num_blocks: u64,
    opts: ExtOpts,
) {
    ctx.buffer = Some(buffer);
    ctx.iovs = iovs;
    ctx.offset_blocks = offset_blocks;
    ctx.num_blocks = num_blocks;
    ctx.md_buf = opts.metadata.clone();
    ctx.ext = ExtIoOpts {
        memory_domain: opts.memory_domain,
        accel_sequence: opts.accel_sequence,
        metadata: opts.metadata.is_some(),
        nvme_cdw12: opts.nvme_cdw12,
        nvme_cdw13: opts.nvme_cdw13,
        dif_check_flags_exclude_mask: opts.dif_check_flags_exclude_mask,
    };
}

pub fn write_blocks(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    let len = num_blocks * desc.bdev().block_len();
    writev_blocks(
        desc,
        buffer,
        vec![IoVec::new(0, len)],
        offset_blocks,
        num_blocks,
        cb,
    )
}

pub fn writev_blocks(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    iovs: Vec<IoVec>,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    writev_blocks_ext(
        desc,
        buffer,
        iovs,
        offset_blocks,
        num_blocks,
        ExtOpts::default(),
        cb,
    )
}

pub fn writev_blocks_with_md(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    iovs: Vec<IoVec>,
    md_buf: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    writev_blocks_ext(
        desc,
        buffer,
        iovs,
        offset_blocks,
        num_blocks,
        ExtOpts {
            metadata: Some(md_buf),
            ..Default::default()
        },
        cb,
    )
}

pub fn writev_blocks_ext(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    iovs: Vec<IoVec>,
    offset_blocks: u64,
    num_blocks: u64,
    opts: ExtOpts,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::Write,
        true,
        true,
        |ctx| fill_rw(ctx, buffer, iovs, offset_blocks, num_blocks, opts),
        cb,
    )
}

/// Zero-length trims are a no-op completed with success before the device
/// is touched.
pub fn unmap_blocks(
    desc: &Arc<BdevDesc>,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    if num_blocks == 0 {
        complete_noop(desc, IoType::Unmap, cb);
        return Ok(());
    }
    build_and_submit(
        desc,
        IoType::Unmap,
        true,
        true,
        |ctx| {
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
        },
        cb,
    )
}

pub fn write_zeroes_blocks(
    desc: &Arc<BdevDesc>,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    if num_blocks == 0 {
        complete_noop(desc, IoType::WriteZeroes, cb);
        return Ok(());
    }
    build_and_submit(
        desc,
        IoType::WriteZeroes,
        true,
        true,
        |ctx| {
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
        },
        cb,
    )
}

fn complete_noop(desc: &Arc<BdevDesc>, io_type: IoType, cb: IoCompletion) {
    let io = BdevIo::new(desc.bdev().clone(), io_type);
    io.ctx.lock().cb = Some(cb);
    channel::defer_complete(&io, IoStatus::Success);
}

pub fn flush_blocks(
    desc: &Arc<BdevDesc>,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::Flush,
        true,
        true,
        |ctx| {
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
        },
        cb,
    )
}

pub fn compare_blocks(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    let len = num_blocks * desc.bdev().block_len();
    comparev_blocks(
        desc,
        buffer,
        vec![IoVec::new(0, len)],
        offset_blocks,
        num_blocks,
        cb,
    )
}

pub fn comparev_blocks(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    iovs: Vec<IoVec>,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::Compare,
        true,
        false,
        |ctx| {
            ctx.buffer = Some(buffer);
            ctx.iovs = iovs;
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
        },
        cb,
    )
}

pub fn compare_blocks_with_md(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    md_buf: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    let len = num_blocks * desc.bdev().block_len();
    build_and_submit(
        desc,
        IoType::Compare,
        true,
        false,
        |ctx| {
            ctx.buffer = Some(buffer);
            ctx.iovs = vec![IoVec::new(0, len)];
            ctx.md_buf = Some(md_buf);
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
        },
        cb,
    )
}

/// Fused compare-and-write: `cmp_iovs` is matched against the media and
/// `write_iovs` lands only when the compare passes.
pub fn comparev_and_writev_blocks(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    cmp_iovs: Vec<IoVec>,
    write_iovs: Vec<IoVec>,
    offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::CompareAndWrite,
        true,
        true,
        |ctx| {
            ctx.buffer = Some(buffer);
            ctx.iovs = cmp_iovs;
            ctx.second_iovs = write_iovs;
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
        },
        cb,
    )
}

pub fn zcopy_start(
    desc: &Arc<BdevDesc>,
    offset_blocks: u64,
    num_blocks: u64,
    populate: bool,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::Zcopy,
        true,
        false,
        |ctx| {
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
            ctx.zcopy_start = true;
            ctx.zcopy_populate = populate;
        },
        cb,
    )
}

pub fn zcopy_end(
    desc: &Arc<BdevDesc>,
    offset_blocks: u64,
    num_blocks: u64,
    commit: bool,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::Zcopy,
        true,
        false,
        |ctx| {
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
            ctx.zcopy_start = false;
            ctx.zcopy_commit = commit;
        },
        cb,
    )
}

pub fn copy_blocks(
    desc: &Arc<BdevDesc>,
    dst_offset_blocks: u64,
    src_offset_blocks: u64,
    num_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::Copy,
        true,
        true,
        |ctx| {
            ctx.offset_blocks = dst_offset_blocks;
            ctx.num_blocks = num_blocks;
            ctx.copy_src_offset = src_offset_blocks;
        },
        cb,
    )
}

pub fn seek_data(
    desc: &Arc<BdevDesc>,
    offset_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::SeekData,
        false,
        false,
        |ctx| {
            ctx.offset_blocks = offset_blocks;
        },
        cb,
    )
}

pub fn seek_hole(
    desc: &Arc<BdevDesc>,
    offset_blocks: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::SeekHole,
        false,
        false,
        |ctx| {
            ctx.offset_blocks = offset_blocks;
        },
        cb,
    )
}

pub fn get_zone_info(
    desc: &Arc<BdevDesc>,
    zone_id: u64,
    num_zones: u32,
    buffer: IoBuffer,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::ZoneInfo,
        false,
        false,
        |ctx| {
            ctx.buffer = Some(buffer);
            ctx.zone = Some(ZoneArgs {
                zone_id,
                num_zones,
                action: 0,
            });
        },
        cb,
    )
}

pub fn zone_management(
    desc: &Arc<BdevDesc>,
    zone_id: u64,
    action: u8,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::ZoneManagement,
        false,
        true,
        |ctx| {
            ctx.zone = Some(ZoneArgs {
                zone_id,
                num_zones: 0,
                action,
            });
        },
        cb,
    )
}

pub fn nvme_admin_passthru(
    desc: &Arc<BdevDesc>,
    cmd: NvmePassthruCmd,
    buffer: Option<IoBuffer>,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::NvmeAdmin,
        false,
        false,
        |ctx| {
            ctx.nvme_cmd = Some(cmd);
            ctx.buffer = buffer;
        },
        cb,
    )
}

pub fn nvme_io_passthru(
    desc: &Arc<BdevDesc>,
    cmd: NvmePassthruCmd,
    buffer: Option<IoBuffer>,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::NvmeIo,
        false,
        false,
        |ctx| {
            ctx.nvme_cmd = Some(cmd);
            ctx.buffer = buffer;
        },
        cb,
    )
}

/// Abort every I/O previously submitted with `caller_ctx`.
pub fn abort(
    desc: &Arc<BdevDesc>,
    caller_ctx: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    build_and_submit(
        desc,
        IoType::Abort,
        false,
        false,
        |ctx| {
            ctx.caller_ctx = caller_ctx;
        },
        cb,
    )
}

pub fn reset(desc: &Arc<BdevDesc>, cb: IoCompletion) -> Result<(), CoreError> {
    build_and_submit(desc, IoType::Reset, false, false, |_| {}, cb)
}

fn oneshot_cb(
) -> (IoCompletion, futures::channel::oneshot::Receiver<IoStatus>) {
    let (s, r) = futures::channel::oneshot::channel::<IoStatus>();
    (
        Box::new(move |_io, status| {
            let _ = s.send(status);
        }),
        r,
    )
}

/// Reads the given number of blocks into the buffer from the device,
/// starting at the given offset.
///
/// Operation is performed asynchronously; the non-success completion
/// status is returned as the error.
pub async fn read_blocks_async(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
) -> Result<(), IoStatus> {
    let (cb, r) = oneshot_cb();
    read_blocks(desc, buffer, offset_blocks, num_blocks, cb)
        .map_err(|_| IoStatus::Failed)?;

    match r.await.expect("Failed awaiting at read_blocks()") {
        IoStatus::Success => Ok(()),
        status => Err(status),
    }
}

/// Writes the given number of blocks from the buffer to the device,
/// starting at the given offset.
///
/// Operation is performed asynchronously; the non-success completion
/// status is returned as the error.
pub async fn write_blocks_async(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
) -> Result<(), IoStatus> {
    let (cb, r) = oneshot_cb();
    write_blocks(desc, buffer, offset_blocks, num_blocks, cb)
        .map_err(|_| IoStatus::Failed)?;

    match r.await.expect("Failed awaiting at write_blocks()") {
        IoStatus::Success => Ok(()),
        status => Err(status),
    }
}

/// Submit a read tagged with an abort context token.
pub fn read_blocks_tagged(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
    caller_ctx: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    let len = num_blocks * desc.bdev().block_len();
    build_and_submit(
        desc,
        IoType::Read,
        true,
        false,
        |ctx| {
            ctx.buffer = Some(buffer);
            ctx.iovs = vec![IoVec::new(0, len)];
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
            ctx.caller_ctx = caller_ctx;
        },
        cb,
    )
}

/// Submit a write tagged with an abort context token.
pub fn write_blocks_tagged(
    desc: &Arc<BdevDesc>,
    buffer: IoBuffer,
    offset_blocks: u64,
    num_blocks: u64,
    caller_ctx: u64,
    cb: IoCompletion,
) -> Result<(), CoreError> {
    let len = num_blocks * desc.bdev().block_len();
    build_and_submit(
        desc,
        IoType::Write,
        true,
        true,
        |ctx| {
            ctx.buffer = Some(buffer);
            ctx.iovs = vec![IoVec::new(0, len)];
            ctx.offset_blocks = offset_blocks;
            ctx.num_blocks = num_blocks;
            ctx.caller_ctx = caller_ctx;
        },
        cb,
    )
}
