//! Periodic pollers attached to a logical thread. A poller is the only way
//! the engine observes the passage of time: QoS refills, retry queues,
//! reconnect timers and timeout scans are all pollers.

use std::sync::Arc;

use parking_lot::Mutex;

use super::thread::Thread;

/// Outcome of one poll callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// The poller did work this iteration.
    Busy,
    /// Nothing to do.
    Idle,
}

type PollFn = Box<dyn FnMut() -> PollStatus + Send>;

pub(crate) struct PollerState {
    pub(crate) interval: u64,
    pub(crate) next_fire: u64,
    pub(crate) paused: bool,
    pub(crate) stopped: bool,
    poll_fn: Option<PollFn>,
}

/// Shared poller body; the thread keeps one reference, the owner another.
pub(crate) struct PollerCore {
    name: String,
    hz: u64,
    pub(crate) state: Mutex<PollerState>,
}

impl PollerCore {
    /// Run the callback if the poller is due. The callback is taken out of
    /// the state for the duration of the call so it may stop or re-arm its
    /// own poller without deadlocking. Returns true when the poller did
    /// actual work (reported `Busy`).
    pub(crate) fn run(&self, now: u64) -> bool {
        let mut func = {
            let mut state = self.state.lock();
            if state.stopped || state.paused || now < state.next_fire {
                return false;
            }
            state.next_fire = now + state.interval;
            match state.poll_fn.take() {
                Some(f) => f,
                None => return false,
            }
        };

        let status = func();

        let mut state = self.state.lock();
        if !state.stopped {
            state.poll_fn = Some(func);
        }
        status == PollStatus::Busy
    }
}

/// Owner handle for a registered poller. Dropping it unregisters the
/// poller from its thread.
pub struct Poller {
    core: Arc<PollerCore>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.core.name)
            .finish()
    }
}

impl Poller {
    /// Stop the poller; the owning thread prunes it on its next iteration.
    pub fn stop(&self) {
        let mut state = self.core.state.lock();
        state.stopped = true;
        state.poll_fn = None;
    }

    /// Suspend firing without unregistering.
    pub fn pause(&self) {
        self.core.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.core.state.lock().paused = false;
    }

    /// Change the firing period. The next fire time is recomputed from the
    /// current one so a shorter period takes effect immediately.
    pub fn set_period_us(&self, us: u64) {
        let interval = us.saturating_mul(self.core.hz) / 1_000_000;
        let mut state = self.core.state.lock();
        let base = state.next_fire.saturating_sub(state.interval);
        state.next_fire = base + interval;
        state.interval = interval;
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builder in the conventional shape:
/// `Builder::new().with_name(..).with_interval_us(..).with_poll_fn(..)
/// .build(&thread)`.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    interval_us: u64,
    poll_fn: Option<PollFn>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Firing period in microseconds; zero fires on every thread poll.
    pub fn with_interval_us(mut self, us: u64) -> Self {
        self.interval_us = us;
        self
    }

    pub fn with_poll_fn(
        mut self,
        f: impl FnMut() -> PollStatus + Send + 'static,
    ) -> Self {
        self.poll_fn = Some(Box::new(f));
        self
    }

    /// Register the poller on the given thread.
    pub fn build(self, thread: &Arc<Thread>) -> Poller {
        let rt = thread.runtime();
        let interval = rt.clock().us_to_ticks(self.interval_us);
        let now = rt.ticks();

        let core = Arc::new(PollerCore {
            name: self.name.unwrap_or_else(|| "poller".to_string()),
            hz: rt.ticks_hz(),
            state: Mutex::new(PollerState {
                interval,
                next_fire: now + interval,
                paused: false,
                stopped: false,
                poll_fn: Some(
                    self.poll_fn.expect("poller requires a poll function"),
                ),
            }),
        });

        thread.register_poller(core.clone());

        Poller {
            core,
        }
    }
}
