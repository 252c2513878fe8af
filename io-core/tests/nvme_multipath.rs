//! Multipath: path selection policies, failover to the surviving path,
//! ANA gating and retry queueing.

mod common;

use std::sync::Arc;

use io_core::{
    bdev::{BdevDesc, IoBuffer, IoStatus},
    bdev_api,
    nvme::{
        ana::AnaState,
        path::TransportId,
        MultipathPolicy,
        MultipathSelector,
        NvmeBdevOpts,
        NvmeCtrlrOpts,
        NvmeManager,
    },
};
use parking_lot::Mutex;

use common::{capture, setup, Counter, FakeTransport, TestEnv};

fn noop_event() -> io_core::bdev::desc::EventCb {
    Arc::new(|_ev, _bdev| {})
}

struct MpFixture {
    env: TestEnv,
    transport: Arc<FakeTransport>,
    mgr: Arc<NvmeManager>,
    ep_a: Arc<common::Endpoint>,
    ep_b: Arc<common::Endpoint>,
}

/// Two controllers to the same namespace, aggregated into one bdev.
fn two_path_fixture(opts: NvmeBdevOpts) -> MpFixture {
    let env = setup(1);
    let transport = FakeTransport::new(256, 512);
    let trid_a = TransportId::tcp("10.0.0.1", "4420", "nqn.test:sub0");
    let trid_b = TransportId::tcp("10.0.0.2", "4420", "nqn.test:sub0");
    let ep_a = transport.add_endpoint(trid_a.clone());
    let ep_b = transport.add_endpoint(trid_b.clone());

    let mgr =
        NvmeManager::new(&env.rt, transport.clone(), opts).unwrap();

    env.thread().clone().with(|| {
        mgr.create_ctrlr("nvme0", trid_a, NvmeCtrlrOpts::default())
            .unwrap();
        mgr.create_ctrlr("nvme0", trid_b, NvmeCtrlrOpts::default())
            .unwrap();
    });
    env.pump();

    MpFixture {
        env,
        transport,
        mgr,
        ep_a,
        ep_b,
    }
}

#[test]
fn namespaces_aggregate_into_one_bdev() {
    let f = two_path_fixture(NvmeBdevOpts::default());

    let group = f.mgr.group("nvme0").unwrap();
    assert_eq!(group.ctrlrs().len(), 2);
    assert_eq!(group.bdevs().len(), 1);

    let bdev =
        io_core::bdev::Bdev::lookup(&f.env.rt, "nvme0n1").unwrap();
    assert_eq!(bdev.num_blocks(), 256);
    assert_eq!(bdev.block_len(), 512);
}

#[test]
fn active_passive_sticks_to_one_path_and_fails_over() {
    let f = two_path_fixture(NvmeBdevOpts::default());

    f.env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        let counter = Counter::new();
        for i in 0 .. 4 {
            bdev_api::write_blocks(
                &desc,
                IoBuffer::alloc(512),
                i,
                1,
                counter.cb(),
            )
            .unwrap();
        }
        f.env.pump();
        assert_eq!(counter.successes(), 4);

        // Everything went down one path.
        let a = f.ep_a.io_count.load(std::sync::atomic::Ordering::Relaxed);
        let b = f.ep_b.io_count.load(std::sync::atomic::Ordering::Relaxed);
        assert!(a == 4 || b == 4, "a={} b={}", a, b);

        // Break the active path; the next I/O lands on the other one.
        let (active, standby) = if a == 4 {
            (&f.ep_a, &f.ep_b)
        } else {
            (&f.ep_b, &f.ep_a)
        };
        active.break_qpair(true);

        let (cb, done) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 9, 1, cb)
            .unwrap();
        f.env.pump();
        done.expect(IoStatus::Success);
        assert_eq!(
            standby.io_count.load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        desc.close();
    });
    f.env.pump();
}

#[test]
fn round_robin_spreads_evenly() {
    let f = two_path_fixture(NvmeBdevOpts::default());

    let group = f.mgr.group("nvme0").unwrap();
    let nbdev = group.bdevs()[0].clone();

    f.env.thread().clone().with(|| {
        let applied = Arc::new(Mutex::new(false));
        let a2 = applied.clone();
        nbdev.set_multipath_policy(
            MultipathPolicy::ActiveActive,
            MultipathSelector::RoundRobin,
            2,
            move |r| {
                assert!(r.is_ok());
                *a2.lock() = true;
            },
        );
        f.env.pump();
        assert!(*applied.lock());

        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        let counter = Counter::new();
        for i in 0 .. 8 {
            bdev_api::write_blocks(
                &desc,
                IoBuffer::alloc(512),
                i,
                1,
                counter.cb(),
            )
            .unwrap();
        }
        f.env.pump();
        assert_eq!(counter.successes(), 8);

        // rr_min_io = 2 over 8 I/Os and two optimized paths: 4 each.
        let a = f.ep_a.io_count.load(std::sync::atomic::Ordering::Relaxed);
        let b = f.ep_b.io_count.load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(a, 4, "a={} b={}", a, b);
        assert_eq!(b, 4, "a={} b={}", a, b);

        desc.close();
    });
    f.env.pump();
}

#[test]
fn queue_depth_selector_prefers_idle_path() {
    let f = two_path_fixture(NvmeBdevOpts::default());

    let group = f.mgr.group("nvme0").unwrap();
    let nbdev = group.bdevs()[0].clone();

    f.env.thread().clone().with(|| {
        nbdev.set_multipath_policy(
            MultipathPolicy::ActiveActive,
            MultipathSelector::QueueDepth,
            1,
            |r| assert!(r.is_ok()),
        );
        f.env.pump();

        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        // Hold completions on A so its queue depth climbs, making B the
        // obvious choice for subsequent I/O.
        f.ep_a.set_manual(true);
        f.ep_b.set_manual(true);

        let counter = Counter::new();
        for i in 0 .. 6 {
            bdev_api::write_blocks(
                &desc,
                IoBuffer::alloc(512),
                i,
                1,
                counter.cb(),
            )
            .unwrap();
        }
        f.env.pump();

        // Min queue depth alternates perfectly between two idle paths.
        assert_eq!(f.ep_a.held_count(), 3);
        assert_eq!(f.ep_b.held_count(), 3);

        while f.ep_a.held_count() > 0 {
            f.ep_a.complete_next(
                &f.transport.storage,
                io_core::nvme::NvmeStatus::SUCCESS,
            );
        }
        while f.ep_b.held_count() > 0 {
            f.ep_b.complete_next(
                &f.transport.storage,
                io_core::nvme::NvmeStatus::SUCCESS,
            );
        }
        f.env.pump();
        assert_eq!(counter.successes(), 6);

        desc.close();
    });
    f.env.pump();
}

#[test]
fn inaccessible_ana_state_avoids_the_path() {
    let f = two_path_fixture(NvmeBdevOpts::default());

    // Path B reports inaccessible via the ANA log page.
    f.ep_b.set_ana(AnaState::Inaccessible);
    let group = f.mgr.group("nvme0").unwrap();
    let ctrlr_b = group.ctrlrs()[1].clone();

    f.env.thread().clone().with(|| {
        assert!(ctrlr_b.read_ana_log_page());
        f.env.pump();

        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        let counter = Counter::new();
        for i in 0 .. 4 {
            bdev_api::write_blocks(
                &desc,
                IoBuffer::alloc(512),
                i,
                1,
                counter.cb(),
            )
            .unwrap();
        }
        f.env.pump();
        assert_eq!(counter.successes(), 4);
        assert_eq!(
            f.ep_b.io_count.load(std::sync::atomic::Ordering::Relaxed),
            0
        );

        desc.close();
    });
    f.env.pump();
}

#[test]
fn no_path_queues_for_retry_until_one_returns() {
    let f = two_path_fixture(NvmeBdevOpts::default());

    f.env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        // Create the channel while healthy, then break both paths.
        let (cb, warmup) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 0, 1, cb)
            .unwrap();
        f.env.pump();
        warmup.expect(IoStatus::Success);

        f.ep_a.break_qpair(true);
        f.ep_b.break_qpair(true);

        let (cb, held) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 1, 1, cb)
            .unwrap();
        f.env.pump();
        // Queued for retry: the controllers are unfailed, a path may
        // come back.
        assert!(held.is_pending());

        // Heal one path; the 1 s retry delay elapses and the I/O lands.
        f.ep_b.break_qpair(false);
        f.env.advance_sec(2);
        held.expect(IoStatus::Success);

        desc.close();
    });
    f.env.pump();
}

#[test]
fn crd_delays_the_retry_by_the_crdt_table() {
    use io_core::nvme::status::{self, NvmeStatus};

    let f = two_path_fixture(NvmeBdevOpts::default());

    f.env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        // Warm the channel so the active path is cached.
        let (cb, warm) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 0, 1, cb)
            .unwrap();
        f.env.pump();
        warm.expect(IoStatus::Success);

        // One transient failure carrying the highest legal CRD value;
        // the fake's crdt[3] is 10, so the retry waits a full second.
        let transient = NvmeStatus::new(
            status::sct::GENERIC,
            status::generic::INTERNAL_DEVICE_ERROR,
        )
        .with_crd(3);
        f.ep_a.forced_status.lock().push(transient);
        f.ep_b.forced_status.lock().push(transient);

        let (cb, delayed) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 1, 1, cb)
            .unwrap();
        f.env.pump();
        assert!(delayed.is_pending());

        // Well before the delay expires nothing moves.
        f.env.advance_ms(500);
        assert!(delayed.is_pending());

        f.env.advance_ms(600);
        delayed.expect(IoStatus::Success);

        desc.close();
    });
    f.env.pump();
}

#[test]
fn abort_reaches_the_command_on_its_path() {
    let f = two_path_fixture(NvmeBdevOpts::default());

    f.env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        // Hold completions so the tagged write stays in flight.
        f.ep_a.set_manual(true);
        f.ep_b.set_manual(true);

        let (cb, victim) = capture();
        bdev_api::write_blocks_tagged(
            &desc,
            IoBuffer::alloc(512),
            0,
            1,
            0xAB,
            cb,
        )
        .unwrap();
        f.env.pump();
        assert_eq!(f.ep_a.held_count() + f.ep_b.held_count(), 1);

        let (cb, abort_done) = capture();
        bdev_api::abort(&desc, 0xAB, cb).unwrap();
        f.env.pump();

        abort_done.expect(IoStatus::Success);
        match victim.get() {
            Some(IoStatus::NvmeError(st)) => {
                assert!(st.is_aborted_by_request())
            }
            other => panic!("unexpected completion: {:?}", other),
        }
        assert_eq!(f.ep_a.held_count() + f.ep_b.held_count(), 0);

        desc.close();
    });
    f.env.pump();
}

#[test]
fn bdev_reset_walks_every_controller() {
    let f = two_path_fixture(NvmeBdevOpts::default());
    let group = f.mgr.group("nvme0").unwrap();
    let ctrlrs = group.ctrlrs();

    f.env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();
        // Materialize the channel and its io paths.
        let (cb, warm) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 0, 1, cb)
            .unwrap();
        f.env.pump();
        warm.expect(IoStatus::Success);

        let (cb, reset_done) = capture();
        bdev_api::reset(&desc, cb).unwrap();
        f.env.pump();

        reset_done.expect(IoStatus::Success);
        // Both controllers went through a reset and recovered.
        for c in &ctrlrs {
            assert!(c.is_available());
        }

        // I/O flows normally after the reset barrier.
        let (cb, after) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 2, 1, cb)
            .unwrap();
        f.env.pump();
        after.expect(IoStatus::Success);

        desc.close();
    });
    f.env.pump();
}

#[test]
fn read_after_write_round_trips_across_paths() {
    let f = two_path_fixture(NvmeBdevOpts::default());

    let group = f.mgr.group("nvme0").unwrap();
    let nbdev = group.bdevs()[0].clone();

    f.env.thread().clone().with(|| {
        nbdev.set_multipath_policy(
            MultipathPolicy::ActiveActive,
            MultipathSelector::RoundRobin,
            1,
            |r| assert!(r.is_ok()),
        );
        f.env.pump();

        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        let payload: Vec<u8> = (0 .. 2048).map(|i| (i % 241) as u8).collect();
        let (cb, wdone) = capture();
        bdev_api::write_blocks(
            &desc,
            IoBuffer::from_vec(payload.clone()),
            16,
            4,
            cb,
        )
        .unwrap();
        f.env.pump();
        wdone.expect(IoStatus::Success);

        // The read goes down the other path and sees the same bytes.
        let rbuf = IoBuffer::alloc(2048);
        let (cb, rdone) = capture();
        bdev_api::read_blocks(&desc, rbuf.clone(), 16, 4, cb).unwrap();
        f.env.pump();
        rdone.expect(IoStatus::Success);
        assert_eq!(rbuf.read(0, 2048), payload);

        desc.close();
    });
    f.env.pump();
}
