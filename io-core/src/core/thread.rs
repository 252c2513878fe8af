//! Logical threads: cooperative, single-threaded execution contexts with a
//! message queue and a poller set. Every stateful object in the engine is
//! pinned to one logical thread; the only way to touch it from elsewhere
//! is to send a message to its owner.

use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::trace;

use super::{poller::PollerCore, runtime::Runtime};

type Msg = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = RefCell::new(None);
}

/// A logical thread. Created through [`Runtime::spawn_thread`].
pub struct Thread {
    id: u64,
    name: String,
    rt: Weak<Runtime>,
    msgs: Mutex<VecDeque<Msg>>,
    pollers: Mutex<Vec<Arc<PollerCore>>>,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Thread {
    pub(crate) fn new(rt: &Arc<Runtime>, id: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            rt: Arc::downgrade(rt),
            msgs: Mutex::new(VecDeque::new()),
            pollers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runtime this thread belongs to.
    pub fn runtime(&self) -> Arc<Runtime> {
        self.rt.upgrade().expect("runtime torn down with live threads")
    }

    /// The thread currently executing, if any.
    pub fn current() -> Option<Arc<Thread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Enqueue a closure for execution on this thread.
    pub fn send_msg(&self, f: impl FnOnce() + Send + 'static) {
        self.msgs.lock().push_back(Box::new(f));
    }

    /// Run a closure with this thread set as current. This is how the
    /// message pump executes, and how tests enter a thread context
    /// synchronously.
    pub fn with<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        let prev = CURRENT.with(|c| c.replace(Some(self.clone())));
        let out = f();
        CURRENT.with(|c| {
            *c.borrow_mut() = prev;
        });
        out
    }

    pub(crate) fn register_poller(&self, core: Arc<PollerCore>) {
        self.pollers.lock().push(core);
    }

    /// One cooperative iteration: run due pollers, then drain the messages
    /// that were queued before this call. Returns the amount of work done,
    /// zero meaning the thread was fully idle.
    pub fn poll(self: &Arc<Self>) -> usize {
        let rt = self.runtime();
        let now = rt.ticks();
        let mut work = 0;

        self.with(|| {
            // Snapshot so a poller may register or stop pollers while we
            // iterate, then prune the stopped ones.
            let snapshot: Vec<_> = self.pollers.lock().clone();
            for p in &snapshot {
                if p.run(now) {
                    work += 1;
                }
            }
            self.pollers.lock().retain(|p| !p.state.lock().stopped);

            // Messages enqueued by the batch below run on the next
            // iteration; that keeps send ordering observable.
            let batch: VecDeque<Msg> = std::mem::take(&mut *self.msgs.lock());
            work += batch.len();
            for msg in batch {
                msg();
            }
        });

        if work > 0 {
            trace!(thread = %self.name, work, "thread poll");
        }
        work
    }

    /// Whether messages are pending on this thread.
    pub fn has_pending(&self) -> bool {
        !self.msgs.lock().is_empty()
    }
}

/// Continuation handle for [`for_each`]. The per-item callback must call
/// [`Cont::done`] exactly once, immediately or after parking it across an
/// async step.
pub struct Cont<T: Send + Sync + 'static> {
    items: Arc<Vec<(Arc<Thread>, T)>>,
    on_item: Arc<dyn Fn(&T, Cont<T>) + Send + Sync>,
    state: Arc<Mutex<ForEachState>>,
}

struct ForEachState {
    idx: usize,
    origin: Arc<Thread>,
    on_done: Option<Box<dyn FnOnce(i32) + Send>>,
}

impl<T: Send + Sync + 'static> Cont<T> {
    fn clone_handle(&self) -> Self {
        Cont {
            items: self.items.clone(),
            on_item: self.on_item.clone(),
            state: self.state.clone(),
        }
    }

    fn step(self) {
        let idx = self.state.lock().idx;

        let target = self.items.get(idx).map(|(t, _)| t.clone());
        if let Some(thread) = target {
            thread.send_msg(move || {
                let item = &self.items[idx].1;
                let on_item = self.on_item.clone();
                on_item(item, self.clone_handle());
            });
        } else {
            let (origin, done) = {
                let mut s = self.state.lock();
                (s.origin.clone(), s.on_done.take())
            };
            origin.send_msg(move || {
                if let Some(done) = done {
                    done(0);
                }
            });
        }
    }

    /// Report this item finished. A non-zero status aborts the walk and
    /// reports it to the completion callback.
    pub fn done(self, status: i32) {
        if status != 0 {
            let (origin, done) = {
                let mut s = self.state.lock();
                s.idx = self.items.len();
                (s.origin.clone(), s.on_done.take())
            };
            origin.send_msg(move || {
                if let Some(done) = done {
                    done(status);
                }
            });
            return;
        }

        self.state.lock().idx += 1;
        self.step();
    }
}

/// Walk a set of per-thread items, running the callback for each one on
/// its owning thread, then the completion callback on the origin thread.
/// This is the only cross-thread iteration primitive in the engine; fan
/// outs over bdev channels and controller channels are built on it.
pub fn for_each<T: Send + Sync + 'static>(
    origin: Arc<Thread>,
    items: Vec<(Arc<Thread>, T)>,
    on_item: impl Fn(&T, Cont<T>) + Send + Sync + 'static,
    on_done: impl FnOnce(i32) + Send + 'static,
) {
    let cont = Cont {
        items: Arc::new(items),
        on_item: Arc::new(on_item),
        state: Arc::new(Mutex::new(ForEachState {
            idx: 0,
            origin,
            on_done: Some(Box::new(on_done)),
        })),
    };
    cont.step();
}
