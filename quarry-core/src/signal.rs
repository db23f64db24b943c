//! Observable state cells and batched commits
//!
//! [`Signal`] is the narrow `{get, set, subscribe}` capability the engine
//! needs from a reactive host. It is backed by a `tokio::sync::watch`
//! channel, so any number of readers can await changes without the engine
//! knowing who they are.
//!
//! [`Batch`] replaces an implicit global coordinator: work deferred while a
//! batch is open runs once the outermost batch closes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

// ============================================================================
// SIGNAL
// ============================================================================

/// A shared, observable value.
///
/// Clones refer to the same cell.
pub struct Signal<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("value", &*self.tx.borrow())
            .finish()
    }
}

impl<T: Default> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Signal<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Replace the value and notify subscribers. Returns the previous value.
    pub fn set(&self, value: T) -> T {
        self.tx.send_replace(value)
    }

    /// Mutate the value in place and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Mutate in place; subscribers are notified only if `f` returns true.
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Subscribe to future changes. The current value counts as already seen.
    pub fn subscribe(&self) -> SignalReader<T> {
        SignalReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Signal<T> {
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}

impl<T: PartialEq> Signal<T> {
    /// Set the value, notifying only when it actually changed.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

/// Read-only handle onto a [`Signal`].
pub struct SignalReader<T> {
    rx: watch::Receiver<T>,
}

impl<T> Clone for SignalReader<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SignalReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalReader")
            .field("value", &*self.rx.borrow())
            .finish()
    }
}

impl<T> SignalReader<T> {
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.rx.borrow())
    }

    /// Wait for the next change. Returns false once the signal is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait until `predicate` holds for the current value.
    ///
    /// Returns false if the signal is dropped first.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&T) -> bool) -> bool {
        self.rx.wait_for(predicate).await.is_ok()
    }
}

impl<T: Clone> SignalReader<T> {
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }
}

// ============================================================================
// BATCH
// ============================================================================

/// Deferred unit of work.
pub type BatchJob = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct BatchState {
    depth: usize,
    queue: VecDeque<BatchJob>,
}

/// Groups side effects so they run after a set of state changes settles.
///
/// Jobs deferred while any batch is open run in FIFO order when the
/// outermost batch closes. Outside a batch, `defer` runs the job at once.
/// Never call [`Batch::run`] while holding a lock a deferred job may take.
#[derive(Default)]
pub struct Batch {
    state: Mutex<BatchState>,
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Batch")
            .field("depth", &state.depth)
            .field("pending", &state.queue.len())
            .finish()
    }
}

struct DepthGuard<'a> {
    batch: &'a Batch,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.batch.lock();
        state.depth = state.depth.saturating_sub(1);
    }
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self) -> DepthGuard<'_> {
        self.lock().depth += 1;
        DepthGuard { batch: self }
    }

    /// Run `f` inside a batch, then flush deferred work if this was the outermost batch.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _guard = self.enter();
            f()
        };
        self.flush();
        result
    }

    /// Queue `job` if a batch is open, otherwise run it now.
    pub fn defer(&self, job: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.lock();
            if state.depth > 0 {
                state.queue.push_back(Box::new(job));
                return;
            }
        }
        self.run(job);
    }

    pub fn is_batching(&self) -> bool {
        self.lock().depth > 0
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn flush(&self) {
        loop {
            let job = {
                let mut state = self.lock();
                if state.depth > 0 {
                    return;
                }
                match state.queue.pop_front() {
                    Some(job) => job,
                    None => return,
                }
            };
            let _guard = self.enter();
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_signal_get_set_update() {
        let signal = Signal::new(1);
        assert_eq!(signal.get(), 1);
        assert_eq!(signal.set(2), 1);
        signal.update(|v| *v += 40);
        assert_eq!(signal.get(), 42);
    }

    #[test]
    fn test_set_if_changed() {
        let signal = Signal::new("a".to_string());
        assert!(!signal.set_if_changed("a".to_string()));
        assert!(signal.set_if_changed("b".to_string()));
    }

    #[tokio::test]
    async fn test_reader_sees_changes() {
        let signal = Signal::new(0u32);
        let mut reader = signal.subscribe();

        let writer = signal.clone();
        tokio::spawn(async move {
            writer.set(7);
        });

        assert!(reader.changed().await);
        assert_eq!(reader.get(), 7);
    }

    #[tokio::test]
    async fn test_reader_reports_closed_signal() {
        let signal = Signal::new(0u32);
        let mut reader = signal.subscribe();
        drop(signal);
        assert!(!reader.changed().await);
    }

    #[test]
    fn test_batch_defers_until_outermost_close() {
        let batch = Arc::new(Batch::new());
        let ran = Arc::new(AtomicUsize::new(0));

        batch.run(|| {
            let r = Arc::clone(&ran);
            batch.defer(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
            batch.run(|| {
                let r = Arc::clone(&ran);
                batch.defer(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                });
            });
            assert_eq!(ran.load(Ordering::SeqCst), 0);
            assert_eq!(batch.pending(), 2);
        });

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(!batch.is_batching());
    }

    #[test]
    fn test_defer_outside_batch_runs_immediately() {
        let batch = Batch::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        batch.defer(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jobs_deferred_during_flush_still_run() {
        let batch = Arc::new(Batch::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let b = Arc::clone(&batch);
        let o = Arc::clone(&order);
        batch.run(move || {
            let inner_order = Arc::clone(&o);
            let inner_batch = Arc::clone(&b);
            b.defer(move || {
                inner_order.lock().unwrap().push(1);
                let o2 = Arc::clone(&inner_order);
                inner_batch.defer(move || o2.lock().unwrap().push(2));
            });
        });

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
