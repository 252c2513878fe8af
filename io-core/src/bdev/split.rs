//! Splitting of oversized I/Os into children that respect the device
//! limits. Read/write children are carved along the iovec list; when a
//! segment-count or segment-size limit would end a child mid-block, the
//! tail is retracted to a block multiple and the bytes carry into the
//! next child.

use std::sync::Arc;

use tracing::debug;

use super::{
    channel::{self, BdevChannel},
    io::{BdevIo, IoStatus, IoType, IoVec, SplitTrack},
};

/// Most children in flight for unmap/write-zeroes/copy splitting.
const MAX_CHUNK_CHILDREN: u32 = 8;

/// Whether this I/O violates any limit and needs the split path.
pub(crate) fn should_split(io: &Arc<BdevIo>) -> bool {
    let bdev = io.bdev();
    let p = bdev.props();
    let (offset, num_blocks) = io.lba_range();
    if num_blocks == 0 {
        return false;
    }

    match io.io_type() {
        IoType::Read | IoType::Write => {
            if p.max_rw_size > 0 && num_blocks > p.max_rw_size {
                return true;
            }
            let iovs = io.iovs();
            if p.max_num_segments > 0
                && iovs.len() > p.max_num_segments as usize
            {
                return true;
            }
            if p.max_segment_size > 0
                && iovs.iter().any(|v| v.len > p.max_segment_size)
            {
                return true;
            }
            if p.optimal_io_boundary > 0
                && crosses_boundary(offset, num_blocks, p.optimal_io_boundary)
            {
                return true;
            }
            if io.io_type() == IoType::Write
                && p.write_unit_size > 1
                && crosses_boundary(offset, num_blocks, p.write_unit_size)
            {
                return true;
            }
            false
        }
        IoType::Unmap => {
            let max = p.max_unmap * p.max_unmap_segments;
            max > 0 && num_blocks > max
        }
        IoType::WriteZeroes => {
            p.max_write_zeroes > 0 && num_blocks > p.max_write_zeroes
        }
        IoType::Copy => p.max_copy > 0 && num_blocks > p.max_copy,
        _ => false,
    }
}

fn crosses_boundary(offset: u64, num_blocks: u64, boundary: u64) -> bool {
    let start = offset / boundary;
    let end = (offset + num_blocks - 1) / boundary;
    start != end
}

/// Enter the split path: initialize the bookkeeping and emit the first
/// round of children.
pub(crate) fn split_io(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    {
        let mut ctx = io.ctx.lock();
        let offset = ctx.offset_blocks;
        let num = ctx.num_blocks;
        ctx.status = IoStatus::Pending;
        ctx.split = Some(SplitTrack {
            current_offset_blocks: offset,
            remaining_blocks: num,
            outstanding: 0,
            iov_idx: 0,
            iov_offset: 0,
            failed: false,
        });
    }

    debug!(io = ?io, "splitting");
    emit_children(chan, io);
}

fn emit_children(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    match io.io_type() {
        IoType::Read | IoType::Write => emit_rw_children(chan, io),
        IoType::Unmap | IoType::WriteZeroes | IoType::Copy => {
            emit_chunk_children(chan, io)
        }
        _ => unreachable!("split of non-splittable type"),
    }
}

/// Largest child starting at `offset`: bounded by the remaining blocks,
/// the distance to the next boundary and the transfer size cap.
fn max_child_blocks(
    io_type: IoType,
    p: &super::bdev::BdevProps,
    offset: u64,
    remaining: u64,
) -> u64 {
    let mut max = remaining;

    if p.max_rw_size > 0 {
        max = max.min(p.max_rw_size);
    }
    let mut boundary = p.optimal_io_boundary;
    if io_type == IoType::Write && p.write_unit_size > 1 {
        boundary = if boundary == 0 {
            p.write_unit_size
        } else {
            boundary.min(p.write_unit_size)
        };
    }
    if boundary > 0 {
        max = max.min(boundary - offset % boundary);
    }
    max
}

/// Carve one read/write child out of the parent's iov list. Returns None
/// when the segment limits retract the child to nothing.
fn build_rw_child(
    io_type: IoType,
    block_len: u64,
    p: &super::bdev::BdevProps,
    parent_iovs: &[IoVec],
    track: &mut SplitTrack,
) -> Option<(u64, u64, Vec<IoVec>)> {
    let child_offset = track.current_offset_blocks;
    let target_blocks =
        max_child_blocks(io_type, p, child_offset, track.remaining_blocks);
    let mut target_bytes = target_blocks * block_len;

    let max_segs = if p.max_num_segments == 0 {
        usize::MAX
    } else {
        p.max_num_segments as usize
    };
    let max_seg_size = if p.max_segment_size == 0 {
        u64::MAX
    } else {
        p.max_segment_size
    };

    let mut child_iovs: Vec<IoVec> = Vec::new();
    let mut gathered: u64 = 0;
    let mut iov_idx = track.iov_idx;
    let mut iov_off = track.iov_offset;

    while gathered < target_bytes
        && child_iovs.len() < max_segs
        && iov_idx < parent_iovs.len()
    {
        let iov = parent_iovs[iov_idx];
        let avail = iov.len - iov_off;
        let take = avail.min(max_seg_size).min(target_bytes - gathered);

        child_iovs.push(IoVec::new(iov.base + iov_off, take));
        gathered += take;
        iov_off += take;
        if iov_off == iov.len {
            iov_idx += 1;
            iov_off = 0;
        }
    }

    if gathered < target_bytes {
        // Segment limits cut the child short. Retract trailing bytes down
        // to a block multiple, shrinking from the tail.
        let mut retract = gathered % block_len;
        target_bytes = gathered - retract;

        while retract > 0 {
            let last = child_iovs.last_mut().expect("non-empty child");
            let cut = retract.min(last.len);
            last.len -= cut;
            retract -= cut;

            // Give the bytes back to the parent cursor.
            if iov_off >= cut {
                iov_off -= cut;
            } else {
                iov_idx -= 1;
                iov_off = parent_iovs[iov_idx].len - (cut - iov_off);
            }
            if last.len == 0 {
                child_iovs.pop();
            }
        }

        if target_bytes == 0 {
            return None;
        }
    }

    let child_blocks = target_bytes / block_len;
    track.current_offset_blocks += child_blocks;
    track.remaining_blocks -= child_blocks;
    track.iov_idx = iov_idx;
    track.iov_offset = iov_off;

    Some((child_offset, child_blocks, child_iovs))
}

fn emit_rw_children(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    let bdev = io.bdev().clone();
    let props = bdev.props().clone();
    let block_len = bdev.block_len();
    let io_type = io.io_type();
    let parent_iovs = io.iovs();

    loop {
        let child = {
            let mut ctx = io.ctx.lock();
            let mut track = ctx.split.expect("split state");
            if track.failed || track.remaining_blocks == 0 {
                break;
            }

            let built = build_rw_child(
                io_type,
                block_len,
                &props,
                &parent_iovs,
                &mut track,
            );
            match built {
                Some(c) => {
                    track.outstanding += 1;
                    ctx.split = Some(track);
                    c
                }
                None => {
                    // Nothing submittable. Fail the parent if no child
                    // made it out yet, else finish with what is pending.
                    track.failed = true;
                    ctx.split = Some(track);
                    break;
                }
            }
        };

        spawn_child(chan, io, child.0, child.1, child.2);
    }

    finish_parent_if_done(io);
}

fn emit_chunk_children(chan: &Arc<BdevChannel>, io: &Arc<BdevIo>) {
    let p = io.bdev().props();
    let max_blocks = match io.io_type() {
        IoType::Unmap => p.max_unmap * p.max_unmap_segments,
        IoType::WriteZeroes => p.max_write_zeroes,
        IoType::Copy => p.max_copy,
        _ => unreachable!(),
    }
    .max(1);

    loop {
        let child = {
            let mut ctx = io.ctx.lock();
            let mut track = ctx.split.expect("split state");
            if track.failed
                || track.remaining_blocks == 0
                || track.outstanding >= MAX_CHUNK_CHILDREN
            {
                break;
            }

            let blocks = track.remaining_blocks.min(max_blocks);
            let offset = track.current_offset_blocks;
            track.current_offset_blocks += blocks;
            track.remaining_blocks -= blocks;
            track.outstanding += 1;
            ctx.split = Some(track);
            (offset, blocks)
        };

        spawn_child(chan, io, child.0, child.1, Vec::new());
    }

    finish_parent_if_done(io);
}

/// Build and submit one child past the split gate.
fn spawn_child(
    chan: &Arc<BdevChannel>,
    parent: &Arc<BdevIo>,
    offset: u64,
    num_blocks: u64,
    iovs: Vec<IoVec>,
) {
    let child = BdevIo::new(parent.bdev().clone(), parent.io_type());
    {
        let parent_ctx = parent.ctx.lock();
        let mut ctx = child.ctx.lock();
        ctx.offset_blocks = offset;
        ctx.num_blocks = num_blocks;
        ctx.iovs = iovs;
        ctx.buffer = parent_ctx.buffer.clone();
        ctx.md_buf = parent_ctx.md_buf.clone();
        ctx.caller_ctx = parent_ctx.caller_ctx;
        ctx.submit_tsc = parent_ctx.submit_tsc;
        ctx.ext = parent_ctx.ext.clone();
        ctx.parent = Some(parent.clone());
        ctx.channel = Some(chan.clone());
    }

    let parent2 = parent.clone();
    let chan2 = chan.clone();
    child.ctx.lock().cb = Some(Box::new(move |_io, status| {
        child_complete(&chan2, &parent2, status);
    }));

    channel::submit_past_split(chan, &child);
}

fn child_complete(
    chan: &Arc<BdevChannel>,
    parent: &Arc<BdevIo>,
    status: IoStatus,
) {
    let emit_more = {
        let mut ctx = parent.ctx.lock();
        let mut track = ctx.split.expect("split state");
        track.outstanding -= 1;

        if !status.is_success() {
            // First failure wins; drop the remainder of the range.
            if !track.failed {
                track.failed = true;
                ctx.status = status;
            }
        }
        let emit = !track.failed && track.remaining_blocks > 0;
        ctx.split = Some(track);
        emit
    };

    if emit_more {
        emit_children(chan, parent);
    } else {
        finish_parent_if_done(parent);
    }
}

fn finish_parent_if_done(io: &Arc<BdevIo>) {
    let done_status = {
        let mut ctx = io.ctx.lock();
        let track = ctx.split.expect("split state");
        if track.outstanding > 0 {
            None
        } else if track.failed {
            let status = if ctx.status == IoStatus::Pending {
                IoStatus::Failed
            } else {
                ctx.status
            };
            ctx.split = None;
            Some(status)
        } else if track.remaining_blocks == 0 {
            ctx.split = None;
            Some(IoStatus::Success)
        } else {
            None
        }
    };

    if let Some(status) = done_status {
        channel::complete_parent(io, status);
    }
}
