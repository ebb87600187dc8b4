//! Shared timer service.
//!
//! One worker thread serves all connections of a server. On expiry it
//! invokes a cancellation callback, typically shutting down the read half
//! of the targeted connection so the blocked read unblocks and the
//! exchange classifies the failure as an idle timeout.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    id: u64,
    fired: Arc<AtomicBool>,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.id.cmp(&other.id))
    }
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

pub struct TimerService {
    inner: Arc<Inner>,
    worker: Option<thread::JoinHandle<()>>,
}

impl TimerService {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });
        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name("mazurka-timer".into())
            .spawn(move || run(worker_inner))
            .expect("spawning the timer thread");
        TimerService {
            inner,
            worker: Some(worker),
        }
    }

    /// Arm a timeout. The callback runs on the timer thread at the
    /// deadline unless the returned guard is dropped first.
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimeoutGuard {
        let fired = Arc::new(AtomicBool::new(false));
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push(Reverse(Entry {
                deadline: Instant::now() + delay,
                id,
                fired: fired.clone(),
                callback: Box::new(callback),
            }));
            id
        };
        self.cond_notify();
        TimeoutGuard {
            id,
            fired,
            inner: self.inner.clone(),
        }
    }

    fn cond_notify(&self) {
        self.inner.cond.notify_all();
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(inner: Arc<Inner>) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        let next_deadline = state.queue.peek().map(|Reverse(e)| e.deadline);
        match next_deadline {
            None => {
                inner.cond.wait(&mut state);
            }
            Some(deadline) if deadline > now => {
                inner.cond.wait_until(&mut state, deadline);
            }
            Some(_) => {
                let Reverse(entry) = state.queue.pop().expect("peeked entry");
                if state.cancelled.remove(&entry.id) {
                    continue;
                }
                entry.fired.store(true, Ordering::SeqCst);
                // run outside the lock so callbacks may schedule more
                drop(state);
                (entry.callback)();
                state = inner.state.lock();
            }
        }
    }
}

/// De-registers its timeout on drop. `fired()` tells whether the deadline
/// hit first, which is how an unblocked read is classified as a timeout.
pub struct TimeoutGuard {
    id: u64,
    fired: Arc<AtomicBool>,
    inner: Arc<Inner>,
}

impl TimeoutGuard {
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        if !self.fired() {
            self.inner.state.lock().cancelled.insert(self.id);
        }
    }
}
