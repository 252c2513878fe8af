//! Reset fan-out and abort matching at the generic bdev layer.

mod common;

use std::sync::Arc;

use io_core::{
    bdev::{malloc::MallocBdev, BdevDesc, IoBuffer, IoStatus, TimeoutAction},
    bdev_api,
};
use parking_lot::Mutex;

use common::{capture, setup};

fn noop_event() -> io_core::bdev::desc::EventCb {
    Arc::new(|_ev, _bdev| {})
}

#[test]
fn reset_freezes_channels_and_aborts_queued_io() {
    let env = setup(1);
    let (_bdev, ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();

        ops.set_manual_completions(true);

        // One I/O reaches the module and stays in flight.
        let (cb, inflight) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 0, 1, cb)
            .unwrap();
        env.pump();
        assert_eq!(ops.pending_count(), 1);

        // Reset: the channel freezes, the reset lands on the module.
        let (cb, reset_done) = capture();
        bdev_api::reset(&desc, cb).unwrap();
        env.pump();
        assert_eq!(ops.pending_count(), 2);

        // New submissions during the freeze abort immediately.
        let (cb, frozen) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 1, 1, cb)
            .unwrap();
        env.pump();
        frozen.expect(IoStatus::Aborted);

        // The in-flight write completes naturally, then the reset.
        ops.complete_next(IoStatus::Success);
        env.pump();
        inflight.expect(IoStatus::Success);

        ops.complete_next(IoStatus::Success);
        env.pump();
        reset_done.expect(IoStatus::Success);

        // Thawed: I/O flows again.
        ops.set_manual_completions(false);
        let (cb, after) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 1, 1, cb)
            .unwrap();
        env.pump();
        after.expect(IoStatus::Success);

        desc.close();
    });
    env.pump();
}

#[test]
fn pending_resets_share_the_first_resets_status() {
    let env = setup(1);
    let (_bdev, ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();

        ops.set_manual_completions(true);

        let (cb, first) = capture();
        bdev_api::reset(&desc, cb).unwrap();
        env.pump();

        let (cb, second) = capture();
        bdev_api::reset(&desc, cb).unwrap();
        env.pump();
        // Only the first reset reached the module.
        assert_eq!(ops.pending_count(), 1);

        ops.complete_next(IoStatus::Failed);
        env.pump();

        first.expect(IoStatus::Failed);
        second.expect(IoStatus::Failed);

        desc.close();
    });
    env.pump();
}

#[test]
fn abort_matches_by_caller_context() {
    let env = setup(1);
    let (_bdev, ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();

        ops.set_manual_completions(true);

        let (cb, victim) = capture();
        bdev_api::write_blocks_tagged(
            &desc,
            IoBuffer::alloc(512),
            0,
            1,
            0xAA,
            cb,
        )
        .unwrap();
        let (cb, survivor) = capture();
        bdev_api::write_blocks_tagged(
            &desc,
            IoBuffer::alloc(512),
            1,
            1,
            0xBB,
            cb,
        )
        .unwrap();
        env.pump();
        assert_eq!(ops.pending_count(), 2);

        let (cb, abort_done) = capture();
        bdev_api::abort(&desc, 0xAA, cb).unwrap();
        env.pump();

        victim.expect(IoStatus::Aborted);
        abort_done.expect(IoStatus::Success);
        assert!(survivor.is_pending());

        ops.complete_next(IoStatus::Success);
        env.pump();
        survivor.expect(IoStatus::Success);

        desc.close();
    });
    env.pump();
}

#[test]
fn abort_without_match_fails() {
    let env = setup(1);
    let (_bdev, _ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();

        let (cb, abort_done) = capture();
        bdev_api::abort(&desc, 0xDEAD, cb).unwrap();
        env.pump();
        abort_done.expect(IoStatus::Failed);

        desc.close();
    });
    env.pump();
}

#[test]
fn descriptor_timeout_fires_for_late_io() {
    let env = setup(1);
    let (_bdev, ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();

        let late = Arc::new(Mutex::new(0u32));
        let l2 = late.clone();
        desc.set_timeout(1, TimeoutAction::None, move |_io| {
            *l2.lock() += 1;
        });

        ops.set_manual_completions(true);
        let (cb, _done) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 0, 1, cb)
            .unwrap();
        env.pump();

        // Not yet late.
        env.advance_ms(500);
        assert_eq!(*late.lock(), 0);

        // Two more seconds: well past the 1 s budget.
        env.advance_sec(2);
        assert!(*late.lock() >= 1);

        ops.complete_all(IoStatus::Success);
        env.pump();
        desc.close();
    });
    env.pump();
}
