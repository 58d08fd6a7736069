//! Shared-state primitives for the control plane.
//!
//! `ObservableCell` is the single-writer, multi-reader endpoint cell: reads
//! never block, writes are atomic substitutions, and observers wake on the
//! next change. `Shutdown` + `TaskSet` give every background thread an owner;
//! dropping the owner cancels and joins them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug)]
struct CellState<T> {
    value: T,
    generation: u64,
}

#[derive(Debug)]
pub struct ObservableCell<T> {
    state: Mutex<CellState<T>>,
    changed: Condvar,
}

impl<T: Clone> ObservableCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(CellState {
                value,
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> T {
        self.state.lock().expect("cell lock poisoned").value.clone()
    }

    /// Current generation, for change detection across suspensions.
    pub fn generation(&self) -> u64 {
        self.state.lock().expect("cell lock poisoned").generation
    }

    pub fn set(&self, value: T) {
        let mut state = self.state.lock().expect("cell lock poisoned");
        state.value = value;
        state.generation += 1;
        drop(state);
        self.changed.notify_all();
    }

    /// Block until the generation moves past `seen` or `timeout` elapses.
    /// Returns true if a change was observed.
    pub fn wait_change(&self, seen: u64, timeout: Duration) -> bool {
        let mut state = self.state.lock().expect("cell lock poisoned");
        while state.generation == seen {
            let (next, result) = self
                .changed
                .wait_timeout(state, timeout)
                .expect("cell lock poisoned");
            state = next;
            if result.timed_out() {
                return state.generation != seen;
            }
        }
        true
    }
}

/// Cooperative cancellation token shared by every task a component owns.
#[derive(Clone, Default, Debug)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default, Debug)]
struct ShutdownInner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().expect("shutdown lock poisoned");
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` unless triggered first. Returns true if triggered.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let guard = self.inner.lock.lock().expect("shutdown lock poisoned");
        if self.is_triggered() {
            return true;
        }
        let (_guard, _result) = self
            .inner
            .cond
            .wait_timeout(guard, timeout)
            .expect("shutdown lock poisoned");
        self.is_triggered()
    }

    /// Block until triggered. Used where the protocol calls for a readiness
    /// that never fires.
    pub fn park(&self) {
        while !self.wait(Duration::from_millis(200)) {}
    }
}

/// Owned background threads. Dropping the set triggers shutdown and joins.
pub struct TaskSet {
    shutdown: Shutdown,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            shutdown,
            joins: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn spawn(&self, name: &str, task: impl FnOnce() + Send + 'static) {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(task)
            .expect("spawn control-plane thread");
        self.joins
            .lock()
            .expect("task set lock poisoned")
            .push(handle);
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.shutdown.trigger();
        let joins = std::mem::take(&mut *self.joins.lock().expect("task set lock poisoned"));
        for handle in joins {
            let _ = handle.join();
        }
    }
}

/// Edge-triggered change notification for config observers.
pub struct Notifier {
    cell: ObservableCell<()>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            cell: ObservableCell::new(()),
        }
    }

    pub fn trigger(&self) {
        self.cell.set(());
    }

    /// Snapshot the current generation; pass it to [`Notifier::wait`].
    pub fn subscribe(&self) -> u64 {
        self.cell.generation()
    }

    pub fn wait(&self, seen: u64, timeout: Duration) -> bool {
        self.cell.wait_change(seen, timeout)
    }
}
