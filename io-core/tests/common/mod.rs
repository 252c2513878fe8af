//! Shared test harness: a runtime on a manual clock, completion capture
//! helpers and a fake NVMe transport with failure injection.

#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;

use io_core::{
    bdev::{IoCompletion, IoStatus},
    core::{BdevOpts, Runtime, Thread, TickSource},
    nvme::{
        ana::{AnaGroupDescriptor, AnaLogPage, AnaState},
        path::TransportId,
        status::{self, NvmeStatus},
        transport::{
            AbortCb,
            AnaLogCb,
            AsyncEvent,
            CtrlrData,
            CtrlrHandle,
            EventSink,
            NsData,
            NvmeCompletionCb,
            NvmeSubmission,
            NvmeTransport,
            QpairHandle,
        },
    },
};
use nix::errno::Errno;

/// One tick per microsecond keeps poller arithmetic easy to read.
pub const TEST_TICK_HZ: u64 = 1_000_000;

pub struct TestEnv {
    pub rt: Arc<Runtime>,
    pub threads: Vec<Arc<Thread>>,
}

/// Build a runtime with `n` logical threads on a manual clock.
pub fn setup(n: usize) -> TestEnv {
    let rt = Runtime::init(BdevOpts::default(), TickSource::manual(TEST_TICK_HZ));
    let threads = (0 .. n)
        .map(|i| rt.spawn_thread(&format!("t{}", i)))
        .collect();
    TestEnv {
        rt,
        threads,
    }
}

impl TestEnv {
    pub fn thread(&self) -> &Arc<Thread> {
        &self.threads[0]
    }

    /// Drain all queued work.
    pub fn pump(&self) {
        assert!(self.rt.drain(), "runtime livelocked");
    }

    /// Advance the clock and drain.
    pub fn advance_ms(&self, ms: u64) {
        self.rt.advance_ticks(self.rt.clock().ms_to_ticks(ms));
        self.pump();
    }

    pub fn advance_sec(&self, sec: u64) {
        for _ in 0 .. sec * 10 {
            self.advance_ms(100);
        }
    }
}

/// Capture slot for one I/O completion.
pub struct Captured(Arc<Mutex<Option<IoStatus>>>);

impl Captured {
    pub fn get(&self) -> Option<IoStatus> {
        *self.0.lock()
    }

    pub fn expect(&self, want: IoStatus) {
        assert_eq!(self.get(), Some(want));
    }

    pub fn is_pending(&self) -> bool {
        self.get().is_none()
    }
}

pub fn capture() -> (IoCompletion, Captured) {
    let slot: Arc<Mutex<Option<IoStatus>>> = Arc::new(Mutex::new(None));
    let slot2 = slot.clone();
    (
        Box::new(move |_io, status| {
            *slot2.lock() = Some(status);
        }),
        Captured(slot),
    )
}

/// Count completions across many I/Os.
pub struct Counter(pub Arc<Mutex<Vec<IoStatus>>>);

impl Counter {
    pub fn new() -> Self {
        Counter(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn cb(&self) -> IoCompletion {
        let v = self.0.clone();
        Box::new(move |_io, status| v.lock().push(status))
    }

    pub fn total(&self) -> usize {
        self.0.lock().len()
    }

    pub fn successes(&self) -> usize {
        self.0.lock().iter().filter(|s| s.is_success()).count()
    }
}

// Fake NVMe transport.

/// State of one endpoint (one trid). Shared storage across endpoints
/// makes them paths to the same namespace.
pub struct Endpoint {
    pub trid: TransportId,
    /// Reachability: connect and reconnect fail while down.
    pub up: AtomicBool,
    /// Force qpair submissions to fail with ENXIO.
    pub qpair_broken: AtomicBool,
    /// Completions held for manual release, tagged with their CID.
    pub manual: AtomicBool,
    pub held: Mutex<Vec<(u16, NvmeSubmission, NvmeCompletionCb)>>,
    /// Force the next N completions to this status.
    pub forced_status: Mutex<Vec<NvmeStatus>>,
    pub ana_state: Mutex<AnaState>,
    pub io_count: AtomicU32,
    pub reconnect_attempts: AtomicU32,
}

impl Endpoint {
    fn new(trid: TransportId) -> Arc<Self> {
        Arc::new(Self {
            trid,
            up: AtomicBool::new(true),
            qpair_broken: AtomicBool::new(false),
            manual: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            forced_status: Mutex::new(Vec::new()),
            ana_state: Mutex::new(AnaState::Optimized),
            io_count: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }

    pub fn break_qpair(&self, broken: bool) {
        self.qpair_broken.store(broken, Ordering::Relaxed);
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::Relaxed);
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Complete the oldest held submission.
    pub fn complete_next(&self, storage: &FakeStorage, status: NvmeStatus) {
        let (_cid, sub, cb) = self.held.lock().remove(0);
        if status.is_success() {
            let st = storage.execute(&sub);
            cb(st);
        } else {
            cb(status);
        }
    }

    pub fn set_ana(&self, state: AnaState) {
        *self.ana_state.lock() = state;
    }
}

/// Backing bytes of the one namespace all endpoints serve.
pub struct FakeStorage {
    pub data: Mutex<Vec<u8>>,
    pub block_len: u64,
}

impl FakeStorage {
    pub fn execute(&self, sub: &NvmeSubmission) -> NvmeStatus {
        let bl = self.block_len;
        match sub {
            NvmeSubmission::Read {
                offset_blocks,
                buffer,
                iovs,
                ..
            } => {
                let data = self.data.lock();
                let mut cursor = (offset_blocks * bl) as usize;
                for iov in iovs {
                    let src = &data[cursor .. cursor + iov.len as usize];
                    buffer.write(iov.base, src);
                    cursor += iov.len as usize;
                }
                NvmeStatus::SUCCESS
            }
            NvmeSubmission::Write {
                offset_blocks,
                buffer,
                iovs,
                ..
            }
            | NvmeSubmission::FusedWrite {
                offset_blocks,
                buffer,
                iovs,
                ..
            }
            | NvmeSubmission::ZoneAppend {
                zone_id: offset_blocks,
                buffer,
                iovs,
                ..
            } => {
                let mut data = self.data.lock();
                let mut cursor = (offset_blocks * bl) as usize;
                for iov in iovs {
                    let bytes = buffer.read(iov.base, iov.len);
                    data[cursor .. cursor + iov.len as usize]
                        .copy_from_slice(&bytes);
                    cursor += iov.len as usize;
                }
                NvmeStatus::SUCCESS
            }
            NvmeSubmission::Compare {
                offset_blocks,
                buffer,
                iovs,
                ..
            } => {
                let data = self.data.lock();
                let mut cursor = (offset_blocks * bl) as usize;
                for iov in iovs {
                    let expect = buffer.read(iov.base, iov.len);
                    let actual = &data[cursor .. cursor + iov.len as usize];
                    if expect != actual {
                        return NvmeStatus::new(
                            status::sct::MEDIA_ERROR,
                            status::media::COMPARE_FAILURE,
                        );
                    }
                    cursor += iov.len as usize;
                }
                NvmeStatus::SUCCESS
            }
            NvmeSubmission::Dsm {
                ranges,
            } => {
                let mut data = self.data.lock();
                for (offset, count) in ranges {
                    let start = (offset * bl) as usize;
                    let end = start + (*count as u64 * bl) as usize;
                    data[start .. end].fill(0);
                }
                NvmeStatus::SUCCESS
            }
            NvmeSubmission::WriteZeroes {
                offset_blocks,
                num_blocks,
            } => {
                let mut data = self.data.lock();
                let start = (offset_blocks * bl) as usize;
                let end = start + (num_blocks * bl) as usize;
                data[start .. end].fill(0);
                NvmeStatus::SUCCESS
            }
            NvmeSubmission::Flush
            | NvmeSubmission::ZoneMgmtSend {
                ..
            }
            | NvmeSubmission::ZoneMgmtRecv {
                ..
            }
            | NvmeSubmission::Passthru {
                ..
            } => NvmeStatus::SUCCESS,
        }
    }
}

/// The transport: one namespace behind any number of endpoints.
pub struct FakeTransport {
    pub storage: Arc<FakeStorage>,
    pub ns: NsData,
    pub endpoints: Arc<Mutex<Vec<Arc<Endpoint>>>>,
    pub probe_queue: Mutex<Vec<TransportId>>,
    next_cntlid: AtomicU16,
}

impl FakeTransport {
    pub fn new(num_blocks: u64, block_len: u64) -> Arc<Self> {
        Arc::new(Self {
            storage: Arc::new(FakeStorage {
                data: Mutex::new(vec![0; (num_blocks * block_len) as usize]),
                block_len,
            }),
            ns: NsData {
                nsid: 1,
                num_blocks,
                block_len,
                md_len: 0,
                md_interleave: false,
                dif_type: 0,
                nguid: [7; 16],
                eui64: [0; 8],
                uuid: None,
                csi: 0,
                zoned: false,
            },
            endpoints: Arc::new(Mutex::new(Vec::new())),
            probe_queue: Mutex::new(Vec::new()),
            next_cntlid: AtomicU16::new(1),
        })
    }

    /// Declare an endpoint the transport will accept connections to.
    pub fn add_endpoint(&self, trid: TransportId) -> Arc<Endpoint> {
        let ep = Endpoint::new(trid);
        self.endpoints.lock().push(ep.clone());
        ep
    }

    pub fn endpoint(&self, trid: &TransportId) -> Option<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .iter()
            .find(|e| &e.trid == trid)
            .cloned()
    }

    /// Queue a trid for the hot-plug probe to discover.
    pub fn hot_insert(&self, trid: TransportId) {
        self.add_endpoint(trid.clone());
        self.probe_queue.lock().push(trid);
    }
}

impl NvmeTransport for FakeTransport {
    fn connect(
        &self,
        trid: &TransportId,
    ) -> Result<Arc<dyn CtrlrHandle>, Errno> {
        let ep = self.endpoint(trid).ok_or(Errno::ENODEV)?;
        if !ep.up.load(Ordering::Relaxed) {
            return Err(Errno::EHOSTDOWN);
        }
        Ok(Arc::new(FakeCtrlr {
            ep: Mutex::new(ep),
            storage: self.storage.clone(),
            ns: self.ns.clone(),
            cntlid: self.next_cntlid.fetch_add(1, Ordering::Relaxed),
            failed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            sink: Mutex::new(None),
            transport_eps: self.endpoints.clone(),
        }))
    }

    fn probe(&self) -> Vec<TransportId> {
        self.probe_queue.lock().drain(..).collect()
    }
}

/// One connected controller against one endpoint; failover retargets it.
pub struct FakeCtrlr {
    ep: Mutex<Arc<Endpoint>>,
    storage: Arc<FakeStorage>,
    ns: NsData,
    cntlid: u16,
    failed: AtomicBool,
    disconnected: AtomicBool,
    sink: Mutex<Option<EventSink>>,
    transport_eps: Arc<Mutex<Vec<Arc<Endpoint>>>>,
}

impl FakeCtrlr {
    pub fn fire_event(&self, ev: AsyncEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink(ev);
        }
    }
}

impl CtrlrHandle for FakeCtrlr {
    fn data(&self) -> CtrlrData {
        CtrlrData {
            cntlid: self.cntlid,
            crdt: [0, 1, 5, 10],
            anatt: 10,
            nn: 1,
            mdts: 1024 * 1024,
            vwc: true,
            ..Default::default()
        }
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    fn disconnect(&self) -> Result<(), Errno> {
        self.disconnected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn disconnect_complete(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    fn reconnect_async(&self, trid: &TransportId) {
        // A fresh reconnect attempt starts with a clean failure state.
        self.failed.store(false, Ordering::Relaxed);
        let target = self
            .transport_eps
            .lock()
            .iter()
            .find(|e| &e.trid == trid)
            .cloned();
        if let Some(ep) = target {
            *self.ep.lock() = ep;
        }
    }

    fn reconnect_poll(&self) -> i32 {
        let ep = self.ep.lock().clone();
        ep.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        if self.is_failed() {
            return -(Errno::ENXIO as i32);
        }
        if ep.up.load(Ordering::Relaxed) {
            self.disconnected.store(false, Ordering::Relaxed);
            0
        } else {
            -(Errno::ENXIO as i32)
        }
    }

    fn process_admin_completions(&self) -> i32 {
        0
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn active_ns_list(&self) -> Vec<NsData> {
        vec![self.ns.clone()]
    }

    fn is_active_ns(&self, nsid: u32) -> bool {
        nsid == self.ns.nsid
    }

    fn read_ana_log_page(&self, cb: AnaLogCb) {
        let state = *self.ep.lock().ana_state.lock();
        cb(Ok(AnaLogPage {
            groups: vec![AnaGroupDescriptor {
                group_id: 1,
                state,
                nsids: vec![self.ns.nsid],
            }],
        }));
    }

    fn alloc_qpair(&self) -> Result<Arc<dyn QpairHandle>, Errno> {
        Ok(Arc::new(FakeQpair {
            ep: self.ep.lock().clone(),
            storage: self.storage.clone(),
            connected: AtomicBool::new(false),
            outstanding: AtomicU32::new(0),
            next_cid: AtomicU16::new(1),
        }))
    }

    fn abort_cmd(
        &self,
        _qpair: &Arc<dyn QpairHandle>,
        cid: u16,
        cb: AbortCb,
    ) {
        // A held command on this controller's endpoint can be aborted;
        // anything else already completed synchronously.
        let ep = self.ep.lock().clone();
        let held = {
            let mut held = ep.held.lock();
            held.iter()
                .position(|(c, _, _)| *c == cid)
                .map(|pos| held.remove(pos))
        };
        if let Some((_, _, target_cb)) = held {
            target_cb(
                NvmeStatus::new(
                    status::sct::GENERIC,
                    status::generic::ABORTED_BY_REQUEST,
                ),
            );
        }
        cb(NvmeStatus::SUCCESS);
    }

    fn admin_passthru(
        &self,
        _cmd: &io_core::bdev::NvmePassthruCmd,
        _buffer: Option<io_core::bdev::IoBuffer>,
        cb: NvmeCompletionCb,
    ) {
        cb(NvmeStatus::SUCCESS);
    }
}

pub struct FakeQpair {
    ep: Arc<Endpoint>,
    storage: Arc<FakeStorage>,
    connected: AtomicBool,
    outstanding: AtomicU32,
    next_cid: AtomicU16,
}

impl QpairHandle for FakeQpair {
    fn connect(&self) -> i32 {
        if !self.ep.up.load(Ordering::Relaxed) {
            return -(Errno::ENXIO as i32);
        }
        self.connected.store(true, Ordering::Relaxed);
        0
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn failure_reason(&self) -> Option<Errno> {
        if self.ep.qpair_broken.load(Ordering::Relaxed) {
            Some(Errno::EIO)
        } else {
            None
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    fn outstanding_requests(&self) -> u32 {
        self.outstanding.load(Ordering::Relaxed)
            + self.ep.held.lock().len() as u32
    }

    fn submit(
        &self,
        submission: NvmeSubmission,
        cb: NvmeCompletionCb,
    ) -> Result<u16, Errno> {
        if !self.is_connected()
            || self.ep.qpair_broken.load(Ordering::Relaxed)
        {
            return Err(Errno::ENXIO);
        }

        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        self.ep.io_count.fetch_add(1, Ordering::Relaxed);

        if let Some(forced) = self.ep.forced_status.lock().pop() {
            cb(forced);
            return Ok(cid);
        }

        if self.ep.manual.load(Ordering::Relaxed) {
            self.ep.held.lock().push((cid, submission, cb));
            return Ok(cid);
        }

        let status = self.storage.execute(&submission);
        cb(status);
        Ok(cid)
    }

    fn process_completions(&self) -> i32 {
        0
    }
}
