//! LBA range locking: holder bypass, write gating, pending promotion and
//! quiesce.

mod common;

use std::sync::Arc;

use io_core::{
    bdev::{
        lock_lba_range,
        malloc::MallocBdev,
        quiesce_range,
        unlock_lba_range,
        BdevDesc,
        IoBuffer,
        IoStatus,
    },
    bdev_api,
};
use parking_lot::Mutex;

use common::{capture, setup};

fn noop_event() -> io_core::bdev::desc::EventCb {
    Arc::new(|_ev, _bdev| {})
}

#[test]
fn lock_blocks_writes_allows_reads() {
    let env = setup(1);
    let (bdev, _ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        let ch = desc.get_channel();

        let locked = Arc::new(Mutex::new(false));
        let l2 = locked.clone();
        lock_lba_range(&bdev, Some(&ch), 0, 16, 0xBEEF, move |rc| {
            assert_eq!(rc, 0);
            *l2.lock() = true;
        });
        env.pump();
        assert!(*locked.lock());

        // A foreign write into the range parks on the locked list.
        let (cb, blocked) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 4, 1, cb)
            .unwrap();
        env.pump();
        assert!(blocked.is_pending());

        // Reads are not blocked by a plain lock.
        let (cb, read_done) = capture();
        bdev_api::read_blocks(&desc, IoBuffer::alloc(512), 4, 1, cb)
            .unwrap();
        env.pump();
        read_done.expect(IoStatus::Success);

        // A write outside the range passes.
        let (cb, outside) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 32, 1, cb)
            .unwrap();
        env.pump();
        outside.expect(IoStatus::Success);

        // The holder's own traffic bypasses the lock.
        let (cb, own) = capture();
        bdev_api::write_blocks_tagged(
            &desc,
            IoBuffer::alloc(512),
            4,
            1,
            0xBEEF,
            cb,
        )
        .unwrap();
        env.pump();
        own.expect(IoStatus::Success);

        // Unlock releases the parked write.
        unlock_lba_range(&bdev, 0, 16, 0xBEEF, |rc| {
            assert_eq!(rc, 0);
        });
        env.pump();
        blocked.expect(IoStatus::Success);

        desc.close();
    });
    env.pump();
}

#[test]
fn lock_waits_for_overlapping_inflight_io() {
    let env = setup(1);
    let (bdev, ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        let ch = desc.get_channel();

        ops.set_manual_completions(true);
        let (cb, wdone) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 2, 1, cb)
            .unwrap();
        env.pump();
        assert_eq!(ops.pending_count(), 1);

        let locked = Arc::new(Mutex::new(false));
        let l2 = locked.clone();
        lock_lba_range(&bdev, Some(&ch), 0, 8, 1, move |rc| {
            assert_eq!(rc, 0);
            *l2.lock() = true;
        });
        env.pump();
        // The overlapping write is still outstanding.
        assert!(!*locked.lock());

        ops.complete_next(IoStatus::Success);
        // The drain poller runs on a 100 us cadence.
        env.advance_ms(1);
        assert!(*locked.lock());
        wdone.expect(IoStatus::Success);

        unlock_lba_range(&bdev, 0, 8, 1, |_| {});
        desc.close();
    });
    env.pump();
}

#[test]
fn overlapping_lock_queues_until_first_unlocks() {
    let env = setup(1);
    let (bdev, _ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        let ch = desc.get_channel();

        lock_lba_range(&bdev, Some(&ch), 0, 16, 1, |rc| {
            assert_eq!(rc, 0);
        });
        env.pump();

        let second = Arc::new(Mutex::new(false));
        let s2 = second.clone();
        lock_lba_range(&bdev, Some(&ch), 8, 16, 2, move |rc| {
            assert_eq!(rc, 0);
            *s2.lock() = true;
        });
        env.pump();
        assert!(!*second.lock());

        unlock_lba_range(&bdev, 0, 16, 1, |rc| {
            assert_eq!(rc, 0);
        });
        env.pump();
        assert!(*second.lock());

        unlock_lba_range(&bdev, 8, 16, 2, |_| {});
        desc.close();
    });
    env.pump();
}

#[test]
fn quiesce_blocks_reads_too() {
    let env = setup(1);
    let (bdev, _ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        let _ch = desc.get_channel();

        quiesce_range(&bdev, 0, 64, 9, |rc| {
            assert_eq!(rc, 0);
        });
        env.pump();

        let (cb, read_blocked) = capture();
        bdev_api::read_blocks(&desc, IoBuffer::alloc(512), 0, 1, cb)
            .unwrap();
        env.pump();
        assert!(read_blocked.is_pending());

        unlock_lba_range(&bdev, 0, 64, 9, |rc| {
            assert_eq!(rc, 0);
        });
        env.pump();
        read_blocked.expect(IoStatus::Success);

        desc.close();
    });
    env.pump();
}
