//! Controller lifecycle: reset, trid failover, delayed reconnect, loss
//! timers, enable/disable and hot plug.

mod common;

use std::sync::{atomic::Ordering, Arc};

use io_core::{
    bdev::{Bdev, BdevDesc, IoBuffer, IoStatus},
    bdev_api,
    core::CoreError,
    nvme::{path::TransportId, NvmeBdevOpts, NvmeCtrlrOpts, NvmeManager},
};
use parking_lot::Mutex;

use common::{capture, setup, FakeTransport, TestEnv};

fn noop_event() -> io_core::bdev::desc::EventCb {
    Arc::new(|_ev, _bdev| {})
}

struct Fixture {
    env: TestEnv,
    transport: Arc<FakeTransport>,
    mgr: Arc<NvmeManager>,
}

fn fixture() -> Fixture {
    let env = setup(1);
    let transport = FakeTransport::new(128, 512);
    let mgr = NvmeManager::new(
        &env.rt,
        transport.clone(),
        NvmeBdevOpts::default(),
    )
    .unwrap();
    Fixture {
        env,
        transport,
        mgr,
    }
}

#[test]
fn opts_validation_matches_the_timer_rules() {
    use io_core::nvme::check_io_error_resiliency_params as check;

    // reconnect_delay = 0 requires both timeouts zero.
    assert!(check(0, 0, 0));
    assert!(!check(10, 0, 0));
    assert!(!check(0, 5, 0));
    assert!(!check(0, 0, 5));

    // reconnect <= fast <= loss when all set.
    assert!(check(60, 5, 30));
    assert!(!check(60, 31, 30));
    assert!(!check(20, 5, 30));

    // -1 means retry forever.
    assert!(check(-1, 5, 0));
    assert!(check(-1, 5, 30));
    assert!(!check(-1, 0, 0));
    assert!(!check(-2, 5, 0));
}

#[test]
fn reset_reconnects_and_completes_pending_resets() {
    let f = fixture();
    let trid = TransportId::tcp("10.0.0.1", "4420", "nqn.test:sub0");
    f.transport.add_endpoint(trid.clone());

    f.env.thread().clone().with(|| {
        let ctrlr = f
            .mgr
            .create_ctrlr("nvme0", trid, NvmeCtrlrOpts::default())
            .unwrap();

        let done = Arc::new(Mutex::new(None));
        let d2 = done.clone();
        ctrlr
            .reset_ctrlr(move |rc| {
                *d2.lock() = Some(rc);
            })
            .unwrap();

        // A second reset while the first runs is busy.
        let err = ctrlr.reset_ctrlr(|_| {}).unwrap_err();
        assert!(matches!(err, CoreError::CtrlrResetting { .. }));

        f.env.pump();
        assert_eq!(*done.lock(), Some(0));

        // The active path is unfailed again.
        assert!(ctrlr.is_available());
    });
    f.env.pump();
}

#[test]
fn failover_rotates_the_trid_list() {
    let f = fixture();
    let trid_a = TransportId::tcp("10.0.0.1", "4420", "nqn.test:sub0");
    let trid_b = TransportId::tcp("10.0.0.2", "4420", "nqn.test:sub0");
    f.transport.add_endpoint(trid_a.clone());
    let ep_b = f.transport.add_endpoint(trid_b.clone());

    f.env.thread().clone().with(|| {
        let ctrlr = f
            .mgr
            .create_ctrlr(
                "nvme0",
                trid_a.clone(),
                NvmeCtrlrOpts::default(),
            )
            .unwrap();
        ctrlr.add_trid(trid_b.clone()).unwrap();
        assert_eq!(ctrlr.trid_count(), 2);
        assert_eq!(ctrlr.active_trid(), Some(trid_a.clone()));

        ctrlr.failover_ctrlr().unwrap();
        f.env.pump();

        // The head rotated; the controller reconnected to B.
        assert_eq!(ctrlr.active_trid(), Some(trid_b.clone()));
        assert!(ctrlr.is_available());
        assert!(
            ep_b.reconnect_attempts.load(Ordering::Relaxed) >= 1
        );

        // The old head went to the tail, not away.
        assert_eq!(ctrlr.trid_count(), 2);
    });
    f.env.pump();
}

#[test]
fn reconnect_failure_rolls_to_the_alternate_trid() {
    let f = fixture();
    let trid_a = TransportId::tcp("10.0.0.1", "4420", "nqn.test:sub0");
    let trid_b = TransportId::tcp("10.0.0.2", "4420", "nqn.test:sub0");
    let ep_a = f.transport.add_endpoint(trid_a.clone());
    f.transport.add_endpoint(trid_b.clone());

    f.env.thread().clone().with(|| {
        let ctrlr = f
            .mgr
            .create_ctrlr(
                "nvme0",
                trid_a.clone(),
                NvmeCtrlrOpts {
                    ctrlr_loss_timeout_sec: -1,
                    reconnect_delay_sec: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        ctrlr.add_trid(trid_b.clone()).unwrap();

        // Take the active endpoint down; the reset fails on A and walks
        // to B.
        ep_a.set_up(false);
        let done = Arc::new(Mutex::new(None));
        let d2 = done.clone();
        ctrlr
            .reset_ctrlr(move |rc| {
                *d2.lock() = Some(rc);
            })
            .unwrap();
        f.env.pump();

        assert_eq!(*done.lock(), Some(0));
        assert_eq!(ctrlr.active_trid(), Some(trid_b));
    });
    f.env.pump();
}

#[test]
fn ctrlr_loss_timeout_destructs_and_fails_io() {
    let f = fixture();
    let trid = TransportId::tcp("10.0.0.1", "4420", "nqn.test:sub0");
    let ep = f.transport.add_endpoint(trid.clone());

    f.env.thread().clone().with(|| {
        let ctrlr = f
            .mgr
            .create_ctrlr(
                "nvme0",
                trid,
                NvmeCtrlrOpts {
                    ctrlr_loss_timeout_sec: 2,
                    reconnect_delay_sec: 1,
                    fast_io_fail_timeout_sec: 0,
                    ..Default::default()
                },
            )
            .unwrap();
        f.env.pump();

        let desc =
            BdevDesc::open_ext(&f.env.rt, "nvme0n1", true, noop_event())
                .unwrap();

        // Warm the channel up.
        let (cb, warm) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 0, 1, cb)
            .unwrap();
        f.env.pump();
        warm.expect(IoStatus::Success);

        // Cut the endpoint and start the recovery machinery.
        ep.set_up(false);
        ep.break_qpair(true);
        let _ = ctrlr.reset_ctrlr(|_| {});
        f.env.pump();

        // An I/O submitted meanwhile parks for retry.
        let (cb, pending) = capture();
        bdev_api::write_blocks(&desc, IoBuffer::alloc(512), 1, 1, cb)
            .unwrap();
        f.env.pump();
        assert!(pending.is_pending());

        // After the loss timeout the controller is torn down and the
        // parked I/O fails.
        f.env.advance_sec(4);
        assert!(f.mgr.group("nvme0").is_none());
        assert_eq!(pending.get(), Some(IoStatus::Failed));

        // The bdev disappears once the last descriptor lets go.
        desc.close();
        f.env.pump();
        assert!(Bdev::lookup(&f.env.rt, "nvme0n1").is_none());
    });
    f.env.pump();
}

#[test]
fn disable_then_enable_round_trip() {
    let f = fixture();
    let trid = TransportId::tcp("10.0.0.1", "4420", "nqn.test:sub0");
    f.transport.add_endpoint(trid.clone());

    f.env.thread().clone().with(|| {
        let ctrlr = f
            .mgr
            .create_ctrlr("nvme0", trid, NvmeCtrlrOpts::default())
            .unwrap();

        ctrlr.disable_ctrlr().unwrap();
        f.env.pump();
        assert!(!ctrlr.is_available());

        // Disable is idempotent-checked.
        let err = ctrlr.disable_ctrlr().unwrap_err();
        assert!(matches!(err, CoreError::CtrlrAlreadySo { .. }));
        // Reset of a disabled controller is refused.
        let err = ctrlr.reset_ctrlr(|_| {}).unwrap_err();
        assert!(matches!(err, CoreError::CtrlrAlreadySo { .. }));

        ctrlr.enable_ctrlr().unwrap();
        f.env.pump();
        assert!(ctrlr.is_available());
    });
    f.env.pump();
}

#[test]
fn hotplug_probe_attaches_new_controllers() {
    let f = fixture();

    f.env.thread().clone().with(|| {
        f.mgr.start_hotplug(10_000);
        f.env.pump();

        let trid = TransportId::tcp("10.0.0.9", "4420", "nqn.test:hot0");
        f.transport.hot_insert(trid);

        f.env.advance_ms(20);
        assert!(f.mgr.group("HotInNvme0").is_some());
        assert!(Bdev::lookup(&f.env.rt, "HotInNvme0n1").is_some());
    });
    f.env.pump();
}
