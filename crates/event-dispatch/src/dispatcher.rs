//! Dispatcher Implementation

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Observer invoked synchronously by the dispatcher worker.
pub trait Observer<E>: Send + Sync {
    /// Called once per dispatched event.
    fn on_event(&self, event: &E);
}

enum Message<E> {
    Event(E),
    Shutdown,
}

struct Shared<E> {
    observers: RwLock<Vec<Arc<dyn Observer<E>>>>,
    /// Mirrors `observers.len()` so `has_observers` never takes the lock.
    observer_count: AtomicUsize,
    shutting_down: AtomicBool,
}

/// Single-consumer event dispatcher.
///
/// One worker thread per instance drains a FIFO of enqueued events and hands
/// each one to every registered observer, in registration order. Producers
/// never block; observers run on the worker thread only.
pub struct EventDispatcher<E> {
    name: String,
    tx: Sender<Message<E>>,
    shared: Arc<Shared<E>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> EventDispatcher<E> {
    /// Create a dispatcher and start its consumer thread.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            observers: RwLock::new(Vec::new()),
            observer_count: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_name = name.to_string();
        let worker = std::thread::spawn(move || consumer_loop(&worker_name, &rx, &worker_shared));

        info!(dispatcher = name, "event dispatcher started");
        Self {
            name: name.to_string(),
            tx,
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an event for dispatch. Non-blocking and safe from any thread.
    /// After shutdown this is a logged no-op.
    pub fn enqueue(&self, event: E) {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            debug!(dispatcher = %self.name, "enqueue after shutdown ignored");
            return;
        }
        if self.tx.send(Message::Event(event)).is_err() {
            debug!(dispatcher = %self.name, "dispatch queue disconnected, event dropped");
        }
    }

    /// Fast-path check producers may use to skip event construction.
    pub fn has_observers(&self) -> bool {
        self.shared.observer_count.load(Ordering::Acquire) > 0
    }

    /// Add an observer. Takes effect for the next dispatched event; a
    /// dispatch already in progress iterates its own snapshot.
    pub fn register_observer(&self, observer: Arc<dyn Observer<E>>) {
        let mut observers = self.shared.observers.write();
        observers.push(observer);
        self.shared
            .observer_count
            .store(observers.len(), Ordering::Release);
    }

    /// Remove an observer by pointer identity. Returns whether it was
    /// registered.
    pub fn unregister_observer(&self, observer: &Arc<dyn Observer<E>>) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|registered| !Arc::ptr_eq(registered, observer));
        self.shared
            .observer_count
            .store(observers.len(), Ordering::Release);
        observers.len() != before
    }

    /// Drop every registered observer.
    pub fn remove_all_observers(&self) {
        let mut observers = self.shared.observers.write();
        observers.clear();
        self.shared.observer_count.store(0, Ordering::Release);
    }

    /// Drain the queue, remove all observers, and stop the consumer thread.
    /// Events enqueued before this call are still dispatched. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // The sentinel lands behind everything already queued, so the worker
        // drains the backlog before it exits.
        let _ = self.tx.send(Message::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(dispatcher = %self.name, "dispatcher worker panicked");
            }
        }
        self.remove_all_observers();
        info!(dispatcher = %self.name, "event dispatcher stopped");
    }
}

impl<E> Drop for EventDispatcher<E> {
    fn drop(&mut self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Message::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn consumer_loop<E>(name: &str, rx: &Receiver<Message<E>>, shared: &Arc<Shared<E>>) {
    loop {
        match rx.recv() {
            Ok(Message::Event(event)) => {
                // Snapshot so concurrent (un)registration cannot affect an
                // iteration already in progress.
                let snapshot: Vec<Arc<dyn Observer<E>>> = shared.observers.read().clone();
                for observer in &snapshot {
                    observer.on_event(&event);
                }
            }
            // Disconnection during shutdown is the normal exit path.
            Ok(Message::Shutdown) | Err(_) => break,
        }
    }
    debug!(dispatcher = name, "dispatcher worker exiting");
}
