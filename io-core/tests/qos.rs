//! QoS rate limiting: timeslice admission, rounding rules, rewind across
//! buckets and the disable swap.

mod common;

use std::sync::Arc;

use io_core::{
    bdev::{
        malloc::MallocBdev,
        qos::{set_qos_rate_limits, IOPS_RATE_MIN},
        BdevDesc,
        IoBuffer,
        IoStatus,
    },
    bdev_api,
};

use common::{setup, Counter};

fn noop_event() -> io_core::bdev::desc::EventCb {
    Arc::new(|_ev, _bdev| {})
}

#[test]
fn iops_limit_admits_two_per_timeslice() {
    let env = setup(1);
    let (bdev, _ops) =
        MallocBdev::create(&env.rt, "m0", 256, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        // Create the channel first so it becomes the QoS owner once the
        // limit lands.
        let _ch = desc.get_channel();

        let applied = Counter::new();
        let a = applied.0.clone();
        set_qos_rate_limits(&env.rt, &bdev, [2_000, 0, 0, 0], move |r| {
            assert!(r.is_ok());
            a.lock().push(IoStatus::Success);
        });
        env.pump();
        assert_eq!(applied.total(), 1);

        // 2000 IOPS over a 1 ms timeslice is 2 per slice.
        let counter = Counter::new();
        for i in 0 .. 10 {
            bdev_api::write_blocks(
                &desc,
                IoBuffer::alloc(512),
                i,
                1,
                counter.cb(),
            )
            .unwrap();
        }
        env.pump();
        assert_eq!(counter.successes(), 2);

        for expect in [4, 6, 8, 10] {
            env.advance_ms(1);
            assert_eq!(counter.successes(), expect);
        }

        desc.close();
    });
    env.pump();
}

#[test]
fn rates_round_up_to_the_minimum_multiple() {
    let env = setup(1);
    let (bdev, _ops) =
        MallocBdev::create(&env.rt, "m0", 64, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let _desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();

        set_qos_rate_limits(&env.rt, &bdev, [1_500, 0, 0, 0], |r| {
            assert!(r.is_ok());
        });
        env.pump();

        let qos = bdev.qos().expect("qos enabled");
        assert_eq!(qos.limits()[0].limit_per_sec(), 2 * IOPS_RATE_MIN);

        // Bandwidth rates arrive in MB/s and convert to bytes.
        set_qos_rate_limits(&env.rt, &bdev, [0, 3, 0, 0], |r| {
            assert!(r.is_ok());
        });
        env.pump();
        let qos = bdev.qos().expect("qos enabled");
        assert_eq!(qos.limits()[0].limit_per_sec(), 0);
        assert_eq!(qos.limits()[1].limit_per_sec(), 3 * 1024 * 1024);
    });
    env.pump();
}

#[test]
fn byte_limit_meters_bandwidth() {
    let env = setup(1);
    let (bdev, _ops) =
        MallocBdev::create(&env.rt, "m0", 4096, 4096, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        let _ch = desc.get_channel();

        // 1 MB/s over 1 ms slices: 1048 bytes per slice, rounded to the
        // byte minimum; a 4 KiB write consumes several slices of quota.
        set_qos_rate_limits(&env.rt, &bdev, [0, 1, 0, 0], |r| {
            assert!(r.is_ok());
        });
        env.pump();

        let counter = Counter::new();
        for i in 0 .. 3 {
            bdev_api::write_blocks(
                &desc,
                IoBuffer::alloc(4096),
                i,
                1,
                counter.cb(),
            )
            .unwrap();
        }
        env.pump();
        // The first write overruns the slice and is allowed to.
        assert_eq!(counter.successes(), 1);

        // The overrun is carried: several slices must pass before the
        // next admission.
        env.advance_ms(1);
        assert_eq!(counter.successes(), 1);
        env.advance_ms(10);
        assert!(counter.successes() >= 2);

        desc.close();
    });
    env.pump();
}

#[test]
fn disabling_qos_releases_queued_io() {
    let env = setup(1);
    let (bdev, _ops) =
        MallocBdev::create(&env.rt, "m0", 256, 512, |_| {}).unwrap();

    env.thread().clone().with(|| {
        let desc =
            BdevDesc::open_ext(&env.rt, "m0", true, noop_event()).unwrap();
        let _ch = desc.get_channel();

        set_qos_rate_limits(&env.rt, &bdev, [1_000, 0, 0, 0], |r| {
            assert!(r.is_ok());
        });
        env.pump();

        let counter = Counter::new();
        for i in 0 .. 5 {
            bdev_api::write_blocks(
                &desc,
                IoBuffer::alloc(512),
                i,
                1,
                counter.cb(),
            )
            .unwrap();
        }
        env.pump();
        assert!(counter.successes() < 5);

        // All zeros disables QoS; queued I/O must drain unmetered.
        set_qos_rate_limits(&env.rt, &bdev, [0, 0, 0, 0], |r| {
            assert!(r.is_ok());
        });
        env.pump();
        assert_eq!(counter.successes(), 5);
        assert!(bdev.qos().is_none());

        desc.close();
    });
    env.pump();
}
