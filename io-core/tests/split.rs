//! Splitting of oversized I/Os: transfer-size children, segment limits
//! with tail retraction, boundary alignment and chunked trims.

mod common;

use std::sync::Arc;

use io_core::{
    bdev::{malloc::MallocBdev, BdevDesc, IoBuffer, IoStatus, IoVec},
    bdev_api,
};

use common::{capture, setup};

fn noop_event() -> io_core::bdev::desc::EventCb {
    Arc::new(|_ev, _bdev| {})
}

#[test]
fn write_splits_on_max_transfer_size() {
    let env = setup(1);
    let (_bdev, ops) = MallocBdev::create(&env.rt, "m0", 128, 512, |p| {
        p.max_rw_size = 8;
        p.max_num_segments = 2;
        p.max_segment_size = 4096;
    })
    .unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();

        ops.set_manual_completions(true);
        let payload: Vec<u8> =
            (0 .. 10240).map(|i| (i % 251) as u8).collect();
        let buf = IoBuffer::from_vec(payload.clone());
        let (cb, done) = capture();
        bdev_api::writev_blocks(
            &desc,
            buf,
            vec![IoVec::new(0, 10240)],
            0,
            20,
            cb,
        )
        .unwrap();
        env.pump();

        // 20 blocks at max 8 per child: (0,8) (8,8) (16,4).
        assert_eq!(ops.pending_count(), 3);
        let children: Vec<(u64, u64, Vec<IoVec>)> = ops
            .pending()
            .iter()
            .map(|io| (io.offset_blocks(), io.num_blocks(), io.iovs()))
            .collect();
        ops.complete_all(IoStatus::Success);
        env.pump();

        assert_eq!(children[0].0, 0);
        assert_eq!(children[0].1, 8);
        assert_eq!(children[0].2, vec![IoVec::new(0, 4096)]);
        assert_eq!(children[1].0, 8);
        assert_eq!(children[1].1, 8);
        assert_eq!(children[1].2, vec![IoVec::new(4096, 4096)]);
        assert_eq!(children[2].0, 16);
        assert_eq!(children[2].1, 4);
        assert_eq!(children[2].2, vec![IoVec::new(8192, 2048)]);

        done.expect(IoStatus::Success);
        assert_eq!(ops.read_raw(0, 20), payload);
        desc.close();
    });
    env.pump();
}

#[test]
fn segment_size_limit_splits_each_child_into_two_iovs() {
    let env = setup(1);
    let (_bdev, ops) = MallocBdev::create(&env.rt, "m0", 128, 512, |p| {
        p.max_rw_size = 8;
        p.max_num_segments = 2;
        p.max_segment_size = 2048;
    })
    .unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        ops.set_manual_completions(true);

        let buf = IoBuffer::alloc(8192);
        let (cb, done) = capture();
        bdev_api::writev_blocks(
            &desc,
            buf,
            vec![IoVec::new(0, 8192)],
            0,
            16,
            cb,
        )
        .unwrap();
        env.pump();

        // Each child: 8 blocks = 4096 bytes = two 2048-byte segments.
        assert_eq!(ops.pending_count(), 2);
        let first = ops.drop_next().unwrap();
        assert_eq!(
            first.iovs(),
            vec![IoVec::new(0, 2048), IoVec::new(2048, 2048)]
        );
        first.complete(IoStatus::Success);
        ops.complete_all(IoStatus::Success);
        env.pump();
        done.expect(IoStatus::Success);
        desc.close();
    });
    env.pump();
}

#[test]
fn tail_retraction_keeps_children_block_aligned() {
    let env = setup(1);
    let (_bdev, ops) = MallocBdev::create(&env.rt, "m0", 128, 512, |p| {
        p.max_num_segments = 2;
    })
    .unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        ops.set_manual_completions(true);

        // 2 blocks over 3 odd-sized segments; the first child can only
        // gather 600 bytes in two segments, retracts to 512, and the 88
        // bytes roll into the next child.
        let buf = IoBuffer::alloc(1024);
        let iovs = vec![
            IoVec::new(0, 300),
            IoVec::new(300, 300),
            IoVec::new(600, 424),
        ];
        let (cb, done) = capture();
        bdev_api::writev_blocks(&desc, buf, iovs, 0, 2, cb).unwrap();
        env.pump();

        let first = ops.drop_next().unwrap();
        assert_eq!(first.num_blocks(), 1);
        assert_eq!(
            first.iovs(),
            vec![IoVec::new(0, 300), IoVec::new(300, 212)]
        );
        let total: u64 = first.iovs().iter().map(|v| v.len).sum();
        assert_eq!(total % 512, 0);
        first.complete(IoStatus::Success);
        env.pump();

        let second = ops.drop_next().unwrap();
        assert_eq!(second.offset_blocks(), 1);
        assert_eq!(second.num_blocks(), 1);
        assert_eq!(
            second.iovs(),
            vec![IoVec::new(512, 88), IoVec::new(600, 424)]
        );
        second.complete(IoStatus::Success);
        env.pump();

        done.expect(IoStatus::Success);
        desc.close();
    });
    env.pump();
}

#[test]
fn optimal_boundary_forces_aligned_children() {
    let env = setup(1);
    let (_bdev, ops) = MallocBdev::create(&env.rt, "m0", 128, 512, |p| {
        p.optimal_io_boundary = 8;
    })
    .unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        ops.set_manual_completions(true);

        // 4..12 crosses the boundary at 8: children (4,4) and (8,4).
        let buf = IoBuffer::alloc(4096);
        let (cb, done) = capture();
        bdev_api::writev_blocks(
            &desc,
            buf,
            vec![IoVec::new(0, 4096)],
            4,
            8,
            cb,
        )
        .unwrap();
        env.pump();

        assert_eq!(ops.pending_count(), 2);
        let a = ops.drop_next().unwrap();
        let b = ops.drop_next().unwrap();
        assert_eq!((a.offset_blocks(), a.num_blocks()), (4, 4));
        assert_eq!((b.offset_blocks(), b.num_blocks()), (8, 4));
        a.complete(IoStatus::Success);
        b.complete(IoStatus::Success);
        env.pump();
        done.expect(IoStatus::Success);
        desc.close();
    });
    env.pump();
}

#[test]
fn unmap_children_are_bounded_and_batched() {
    let env = setup(1);
    let (_bdev, ops) = MallocBdev::create(&env.rt, "m0", 4096, 512, |p| {
        p.max_unmap = 64;
        p.max_unmap_segments = 2;
    })
    .unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        ops.set_manual_completions(true);

        // 4096 blocks / 128 per child = 32 children, at most 8 at a time.
        let (cb, done) = capture();
        bdev_api::unmap_blocks(&desc, 0, 4096, cb).unwrap();
        env.pump();
        assert_eq!(ops.pending_count(), 8);

        while ops.pending_count() > 0 {
            ops.complete_next(IoStatus::Success);
            env.pump();
            assert!(ops.pending_count() <= 8);
        }
        done.expect(IoStatus::Success);
        desc.close();
    });
    env.pump();
}

#[test]
fn child_failure_fails_the_parent_and_stops_emission() {
    let env = setup(1);
    let (_bdev, ops) = MallocBdev::create(&env.rt, "m0", 128, 512, |p| {
        p.max_rw_size = 4;
    })
    .unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        ops.set_manual_completions(true);

        let buf = IoBuffer::alloc(8192);
        let (cb, done) = capture();
        bdev_api::writev_blocks(
            &desc,
            buf,
            vec![IoVec::new(0, 8192)],
            0,
            16,
            cb,
        )
        .unwrap();
        env.pump();
        assert_eq!(ops.pending_count(), 4);

        ops.complete_next(IoStatus::Success);
        ops.complete_next(IoStatus::Failed);
        ops.complete_all(IoStatus::Success);
        env.pump();

        done.expect(IoStatus::Failed);
        desc.close();
    });
    env.pump();
}
