use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::error::WriterError;
use crate::packet::Packet;

/// How the Writer persists one accepted packet.
///
/// `sink` must tolerate being called concurrently for distinct indices: with
/// `n_workers > 1`, two sink calls for different indices may run on
/// different threads at the same time. Its return value is opaque to the
/// Writer and is forwarded verbatim as the result of the triggering `push`.
pub trait Sink: Send + Sync + 'static {
    fn sink(&self, packet: Packet, index: u64) -> u64;
}

impl<F> Sink for F
where
    F: Fn(Packet, u64) -> u64 + Send + Sync + 'static,
{
    fn sink(&self, packet: Packet, index: u64) -> u64 {
        self(packet, index)
    }
}

/// What happened to a packet handed to [`Writer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted into the pending queue under `index`; a worker will drain it
    /// in due course. Carries the index back for convenience.
    Queued(u64),
    /// Rejected under the `drop_on_full` backpressure policy; never queued
    /// and never sunk.
    Dropped,
    /// The writer was not active, so the packet was sunk synchronously on
    /// the calling thread. Carries the sink's return value.
    Sunk(u64),
}

struct WriterState {
    pending: BTreeMap<u64, Packet>,
    queued_bytes: usize,
    active: bool,
}

/// Builds a [`Writer`] with validated configuration, mirroring
/// [`crate::precacher::PrecacherBuilder`]'s builder-then-build convention.
pub struct WriterBuilder {
    queue_bytes: usize,
    drop_on_full: bool,
    n_workers: usize,
}

impl Default for WriterBuilder {
    fn default() -> Self {
        Self { queue_bytes: 64 * 1024 * 1024, drop_on_full: false, n_workers: 1 }
    }
}

impl WriterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_bytes(mut self, bytes: usize) -> Self {
        self.queue_bytes = bytes;
        self
    }

    pub fn drop_on_full(mut self, drop_on_full: bool) -> Self {
        self.drop_on_full = drop_on_full;
        self
    }

    pub fn n_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    pub fn build<S: Sink>(self, sink: S) -> Result<Writer<S>, WriterError> {
        if self.n_workers == 0 {
            return Err(WriterError::ZeroWorkers);
        }
        Ok(Writer::new(sink, self.queue_bytes, self.drop_on_full, self.n_workers))
    }
}

/// A multi-worker packet writer: accepts out-of-order `push(packet, idx)`
/// calls under a byte-bounded queue and drains them, smallest index first,
/// to a user-supplied sink via a pool of drain threads.
///
/// Not started on construction — call [`Writer::start`] to spawn the drain
/// pool, or call [`Writer::push`] before starting to sink synchronously on
/// the calling thread with no queueing.
pub struct Writer<S: Sink> {
    sink: Arc<S>,
    max_bytes: usize,
    drop_on_full: bool,
    n_workers: usize,
    shared: Arc<Mutex<WriterState>>,
    non_empty_cv: Arc<Condvar>,
    has_space_cv: Arc<Condvar>,
    workers: Vec<JoinHandle<()>>,
    worker_panicked: Arc<CachePadded<AtomicBool>>,
}

impl<S: Sink> Writer<S> {
    fn new(sink: S, max_bytes: usize, drop_on_full: bool, n_workers: usize) -> Self {
        Self {
            sink: Arc::new(sink),
            max_bytes,
            drop_on_full,
            n_workers,
            shared: Arc::new(Mutex::new(WriterState {
                pending: BTreeMap::new(),
                queued_bytes: 0,
                active: false,
            })),
            non_empty_cv: Arc::new(Condvar::new()),
            has_space_cv: Arc::new(Condvar::new()),
            workers: Vec::new(),
            worker_panicked: Arc::new(CachePadded::new(AtomicBool::new(false))),
        }
    }

    pub fn is_started(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Current sum of payload lengths held in the pending queue. Exposed for
    /// tests and monitoring; not required by any operation.
    pub fn queued_bytes(&self) -> usize {
        self.shared.lock().queued_bytes
    }

    /// Clears state, sets the active flag, and spawns `n_workers` drain
    /// threads.
    pub fn start(&mut self) -> Result<(), WriterError> {
        if !self.workers.is_empty() {
            return Err(WriterError::AlreadyStarted);
        }
        {
            let mut guard = self.shared.lock();
            guard.active = true;
        }
        for id in 0..self.n_workers {
            let shared = Arc::clone(&self.shared);
            let non_empty_cv = Arc::clone(&self.non_empty_cv);
            let has_space_cv = Arc::clone(&self.has_space_cv);
            let sink = Arc::clone(&self.sink);
            let worker_panicked = Arc::clone(&self.worker_panicked);
            let handle = std::thread::Builder::new()
                .name(format!("writer-worker-{id}"))
                .spawn(move || worker_loop(shared, non_empty_cv, has_space_cv, sink, worker_panicked))
                .expect("failed to spawn writer worker thread");
            self.workers.push(handle);
        }
        Ok(())
    }

    /// Sets `active = false`, wakes all workers, and joins them. Workers
    /// drain every remaining pending entry before exiting, so `stop` blocks
    /// until the queue is fully flushed through the sink.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        {
            let mut guard = self.shared.lock();
            guard.active = false;
        }
        self.non_empty_cv.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Accepts, queues-with-backpressure, or drops `packet` under `index`
    /// per §4.2's `push` contract. Returns `Err(WriterError::WorkerPanicked)`
    /// if a prior sink panic was caught and logged by a drain worker; the
    /// pool keeps draining (§4.2 failure semantics) but a caller needs a way
    /// to learn the writer is degraded.
    pub fn push(&self, packet: Packet, index: u64) -> Result<PushOutcome, WriterError> {
        if self.worker_panicked.load(Ordering::Acquire) {
            return Err(WriterError::WorkerPanicked);
        }
        let len = packet.len();
        let mut guard = self.shared.lock();
        if !guard.active {
            drop(guard);
            tracing::debug!(index, "writer: inactive, sinking inline");
            return Ok(PushOutcome::Sunk(self.sink.sink(packet, index)));
        }
        loop {
            if guard.queued_bytes + len <= self.max_bytes {
                let old_len = guard.pending.insert(index, packet.clone()).map(|p| p.len()).unwrap_or(0);
                guard.queued_bytes = guard.queued_bytes - old_len + len;
                drop(guard);
                tracing::debug!(index, len, "writer: accepted");
                self.non_empty_cv.notify_one();
                return Ok(PushOutcome::Queued(index));
            }
            if self.drop_on_full {
                drop(guard);
                tracing::debug!(index, len, "writer: dropped under full queue");
                return Ok(PushOutcome::Dropped);
            }
            tracing::trace!(index, "writer: push blocking on has-space");
            self.has_space_cv.wait(&mut guard);
            if self.worker_panicked.load(Ordering::Acquire) {
                return Err(WriterError::WorkerPanicked);
            }
            if !guard.active {
                drop(guard);
                return Ok(PushOutcome::Sunk(self.sink.sink(packet, index)));
            }
        }
    }
}

impl<S: Sink> Drop for Writer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pops the smallest-index pending entry, blocking on the non-empty
/// condition when the queue is drained but the writer is still active.
/// Returns `None` once the writer is stopped and the queue is empty.
fn next_entry(shared: &Mutex<WriterState>, non_empty_cv: &Condvar) -> Option<(u64, Packet)> {
    let mut guard = shared.lock();
    loop {
        if let Some((&index, _)) = guard.pending.iter().next() {
            let packet = guard.pending.remove(&index).expect("key just observed under the same lock");
            guard.queued_bytes -= packet.len();
            return Some((index, packet));
        }
        if !guard.active {
            return None;
        }
        non_empty_cv.wait(&mut guard);
    }
}

fn worker_loop(
    shared: Arc<Mutex<WriterState>>,
    non_empty_cv: Arc<Condvar>,
    has_space_cv: Arc<Condvar>,
    sink: Arc<dyn Sink>,
    worker_panicked: Arc<CachePadded<AtomicBool>>,
) {
    while let Some((index, packet)) = next_entry(&shared, &non_empty_cv) {
        tracing::trace!(index, "writer: draining");
        if catch_unwind(AssertUnwindSafe(|| sink.sink(packet, index))).is_err() {
            tracing::error!(index, "writer: sink callback panicked; continuing to drain");
            worker_panicked.store(true, Ordering::Release);
        }
        has_space_cv.notify_all();
    }
}
