mod ring;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::error::PrecacherError;
use crate::packet::Packet;
use ring::Ring;

/// How the Precacher's worker fetches one packet by index.
///
/// `load` must be deterministic for a given index and must never call back
/// into the Precacher that owns it. Returning [`Packet::empty`] signals
/// end-of-stream or transient absence; it is never cached.
pub trait Loader: Send + Sync + 'static {
    fn load(&self, index: u64) -> Packet;
}

impl<F> Loader for F
where
    F: Fn(u64) -> Packet + Send + Sync + 'static,
{
    fn load(&self, index: u64) -> Packet {
        self(index)
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_millis(1);
const QUERY_TIMEOUT: Duration = Duration::from_millis(10);
const PREFILL_TIMEOUT: Duration = Duration::from_secs(5);
const FILL_BATCH: usize = 10;

/// Clamp ceiling for `buffer_bytes`, matching the crate's historical IPC
/// region size limits now repurposed as an in-process sanity bound.
#[cfg(target_pointer_width = "64")]
pub const MAX_BUFFER_BYTES: usize = 6 * 1024 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_BUFFER_BYTES: usize = 2 * 1024 * 1024 * 1024;

struct Shared {
    ring: Ring,
    next_expected: u64,
    next_precache: u64,
    pending_idx: Option<u64>,
    request_seq: u64,
    reply_seq: u64,
    last_delivered: Option<(u64, Packet)>,
    shutdown: bool,
}

/// Builds a [`Precacher`] with validated, clamped configuration, mirroring
/// the crate's builder-then-build convention elsewhere in the pipeline.
pub struct PrecacherBuilder {
    buffer_bytes: usize,
}

impl Default for PrecacherBuilder {
    fn default() -> Self {
        Self { buffer_bytes: 64 * 1024 * 1024 }
    }
}

impl PrecacherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes;
        self
    }

    pub fn build<L: Loader>(self, loader: L) -> Result<Precacher<L>, PrecacherError> {
        if self.buffer_bytes == 0 {
            return Err(PrecacherError::ZeroCapacity);
        }
        let capacity = self.buffer_bytes.min(MAX_BUFFER_BYTES);
        Ok(Precacher::new(loader, capacity))
    }
}

/// A single-producer packet precacher: one worker thread maintains a
/// byte-bounded ring of pre-decoded packets ahead of the caller's position
/// and serves synchronous `get_packet` calls from it, repairing itself on
/// out-of-order access.
///
/// Not started on construction — call [`Precacher::start`] to spawn the
/// worker thread, or simply call [`Precacher::get_packet`] to use the
/// bypass fast path, which calls the loader directly with no caching.
pub struct Precacher<L: Loader> {
    loader: Arc<L>,
    capacity: usize,
    shared: Arc<Mutex<Shared>>,
    request_cv: Arc<Condvar>,
    reply_cv: Arc<Condvar>,
    worker_panicked: Arc<CachePadded<AtomicBool>>,
    worker: Option<JoinHandle<()>>,
    in_call: AtomicBool,
    // Bypass-path memoisation when the precacher has never been started.
    last_idx: Option<u64>,
    last_packet: Packet,
}

impl<L: Loader> Precacher<L> {
    fn new(loader: L, capacity: usize) -> Self {
        Self {
            loader: Arc::new(loader),
            capacity,
            shared: Arc::new(Mutex::new(Shared {
                ring: Ring::new(capacity),
                next_expected: 0,
                next_precache: 0,
                pending_idx: None,
                request_seq: 0,
                reply_seq: 0,
                last_delivered: None,
                shutdown: false,
            })),
            request_cv: Arc::new(Condvar::new()),
            reply_cv: Arc::new(Condvar::new()),
            worker_panicked: Arc::new(CachePadded::new(AtomicBool::new(false))),
            worker: None,
            in_call: AtomicBool::new(false),
            last_idx: None,
            last_packet: Packet::empty(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Allocates the scratch buffer and spawns the worker thread.
    pub fn start(&mut self) -> Result<(), PrecacherError> {
        if self.worker.is_some() {
            return Err(PrecacherError::AlreadyStarted);
        }
        let shared = Arc::clone(&self.shared);
        let request_cv = Arc::clone(&self.request_cv);
        let reply_cv = Arc::clone(&self.reply_cv);
        let loader = Arc::clone(&self.loader);
        let worker_panicked = Arc::clone(&self.worker_panicked);
        self.worker = Some(
            std::thread::Builder::new()
                .name("precacher-worker".to_string())
                .spawn(move || worker_loop(shared, request_cv, reply_cv, loader, worker_panicked))
                .expect("failed to spawn precacher worker thread"),
        );
        Ok(())
    }

    /// Signals shutdown, wakes the worker, and joins it, releasing the
    /// scratch buffer. A no-op if the precacher was never started.
    pub fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            {
                let mut guard = self.shared.lock();
                guard.shutdown = true;
            }
            self.request_cv.notify_all();
            let _ = handle.join();
        }
    }

    /// Fetches the packet at `index`, blocking until the worker thread (if
    /// started) replies. Returns [`Packet::empty`] at end-of-stream, never
    /// an error, for that case: errors are reserved for lifecycle misuse
    /// and a dead worker thread.
    pub fn get_packet(&mut self, index: u64) -> Result<Packet, PrecacherError> {
        let reentrant = self.in_call.swap(true, Ordering::AcqRel);
        debug_assert!(!reentrant, "concurrent calls to get_packet are not supported");
        let result = self.get_packet_inner(index);
        self.in_call.store(false, Ordering::Release);
        result
    }

    fn get_packet_inner(&mut self, index: u64) -> Result<Packet, PrecacherError> {
        if self.worker.is_none() {
            if self.last_idx == Some(index) {
                return Ok(self.last_packet.clone());
            }
            let packet = self.loader.load(index);
            self.last_idx = Some(index);
            self.last_packet = packet.clone();
            return Ok(packet);
        }

        if self.worker_panicked.load(Ordering::Acquire) {
            return Err(PrecacherError::WorkerPanicked);
        }

        let my_seq = {
            let mut guard = self.shared.lock();
            guard.request_seq += 1;
            guard.pending_idx = Some(index);
            guard.request_seq
        };
        self.request_cv.notify_one();

        let mut guard = self.shared.lock();
        loop {
            if guard.reply_seq == my_seq {
                let (_, packet) = guard
                    .last_delivered
                    .clone()
                    .expect("reply published without a last_delivered packet");
                return Ok(packet);
            }
            if self.worker_panicked.load(Ordering::Acquire) {
                return Err(PrecacherError::WorkerPanicked);
            }
            let timed_out = self.reply_cv.wait_for(&mut guard, REQUEST_TIMEOUT).timed_out();
            if timed_out && guard.reply_seq != my_seq {
                self.request_cv.notify_one();
            }
        }
    }
}

impl<L: Loader> Drop for Precacher<L> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    shared: Arc<Mutex<Shared>>,
    request_cv: Arc<Condvar>,
    reply_cv: Arc<Condvar>,
    loader: Arc<dyn Loader>,
    worker_panicked: Arc<CachePadded<AtomicBool>>,
) {
    let capacity = shared.lock().ring.capacity();
    prefill(&shared, &request_cv, &reply_cv, &loader, capacity, &worker_panicked);
    if worker_panicked.load(Ordering::Acquire) {
        return;
    }

    loop {
        let mut guard = shared.lock();
        if guard.shutdown {
            return;
        }
        let has_fresh_request = |g: &Shared| g.pending_idx.is_some() && g.reply_seq != g.request_seq;
        if !has_fresh_request(&guard) {
            request_cv.wait_for(&mut guard, QUERY_TIMEOUT);
            if guard.shutdown {
                return;
            }
            if !has_fresh_request(&guard) {
                // Nothing new to serve; consider an opportunistic fill.
                let used = guard.ring.used_bytes();
                drop(guard);
                if used < capacity / 4 && !fill_once(&shared, &request_cv, &reply_cv, &loader, &worker_panicked) {
                    return;
                }
                continue;
            }
        }

        let r = guard.pending_idx.expect("checked above");
        let seq = guard.request_seq;

        if r + 1 == guard.next_expected {
            // Re-request of the just-delivered index: republish the same slot.
            tracing::trace!(index = r, "precacher: re-publishing last delivered packet");
            guard.reply_seq = seq;
            drop(guard);
            reply_cv.notify_one();
            continue;
        }

        if r >= guard.next_expected && r < guard.next_precache && !guard.ring.is_empty() {
            drop(guard);
            match discard_until(&shared, r) {
                Some((index, bytes, shape)) => {
                    let packet = Packet::new(bytes, shape);
                    let mut guard = shared.lock();
                    guard.next_expected = index + 1;
                    guard.last_delivered = Some((index, packet));
                    guard.reply_seq = seq;
                    drop(guard);
                    reply_cv.notify_one();
                    continue;
                }
                None => {
                    // Queue emptied out from under us (shouldn't happen
                    // under the single-consumer contract); fall through to
                    // the flush-and-reload path below.
                }
            }
        } else {
            drop(guard);
        }

        // Gap, backward jump, or queue empty: flush and reload synchronously.
        {
            let mut guard = shared.lock();
            guard.ring.flush();
        }
        tracing::debug!(index = r, "precacher: flush and reload");
        let loaded = match load_checked(&loader, r) {
            Ok(packet) => packet,
            Err(()) => {
                mark_panicked(&shared, &request_cv, &reply_cv, &worker_panicked);
                return;
            }
        };
        let mut guard = shared.lock();
        guard.next_expected = r + 1;
        guard.next_precache = r + 1;
        guard.last_delivered = Some((r, loaded));
        guard.reply_seq = seq;
        drop(guard);
        reply_cv.notify_one();
    }
}

/// Calls the loader with panic isolation. On panic, returns `Err(())`; the
/// caller is responsible for marking the precacher dead and tearing down.
fn load_checked(loader: &Arc<dyn Loader>, index: u64) -> Result<Packet, ()> {
    match catch_unwind(AssertUnwindSafe(|| loader.load(index))) {
        Ok(packet) => Ok(packet),
        Err(payload) => {
            tracing::error!(index, "precacher: loader callback panicked");
            drop(payload);
            Err(())
        }
    }
}

fn mark_panicked(
    shared: &Arc<Mutex<Shared>>,
    request_cv: &Arc<Condvar>,
    reply_cv: &Arc<Condvar>,
    worker_panicked: &Arc<CachePadded<AtomicBool>>,
) {
    worker_panicked.store(true, Ordering::Release);
    shared.lock().shutdown = true;
    request_cv.notify_all();
    reply_cv.notify_all();
}

/// Pops entries from the ring head until the one matching `target` is found,
/// returning its bytes and shape. Reacquires the lock internally; designed
/// to be called with no lock held.
fn discard_until(shared: &Arc<Mutex<Shared>>, target: u64) -> Option<(u64, Box<[u8]>, crate::packet::PacketShape)> {
    let mut guard = shared.lock();
    guard.ring.discard_until(target).map(|(entry, bytes)| (entry.index, bytes, entry.shape))
}

fn prefill(
    shared: &Arc<Mutex<Shared>>,
    request_cv: &Arc<Condvar>,
    reply_cv: &Arc<Condvar>,
    loader: &Arc<dyn Loader>,
    capacity: usize,
    worker_panicked: &Arc<CachePadded<AtomicBool>>,
) {
    let start = std::time::Instant::now();
    loop {
        if start.elapsed() >= PREFILL_TIMEOUT {
            return;
        }
        let next = {
            let guard = shared.lock();
            if guard.shutdown || guard.ring.used_bytes() >= capacity {
                return;
            }
            guard.next_precache
        };
        let packet = match load_checked(loader, next) {
            Ok(p) => p,
            Err(()) => {
                mark_panicked(shared, request_cv, reply_cv, worker_panicked);
                return;
            }
        };
        if packet.is_empty() {
            return;
        }
        let mut guard = shared.lock();
        if !guard.ring.try_push(next, packet.bytes(), packet.shape()) {
            return;
        }
        guard.next_precache += 1;
    }
}

/// One opportunistic fill pass from the idle/timeout state: up to
/// `FILL_BATCH` packets, stopping early on a full ring or end-of-stream.
/// Returns `false` if the worker should give up entirely (loader panicked).
fn fill_once(
    shared: &Arc<Mutex<Shared>>,
    request_cv: &Arc<Condvar>,
    reply_cv: &Arc<Condvar>,
    loader: &Arc<dyn Loader>,
    worker_panicked: &Arc<CachePadded<AtomicBool>>,
) -> bool {
    for _ in 0..FILL_BATCH {
        let next = {
            let guard = shared.lock();
            if guard.shutdown {
                return false;
            }
            guard.next_precache
        };
        let packet = match load_checked(loader, next) {
            Ok(p) => p,
            Err(()) => {
                mark_panicked(shared, request_cv, reply_cv, worker_panicked);
                return false;
            }
        };
        if packet.is_empty() {
            return true;
        }
        let mut guard = shared.lock();
        if !guard.ring.try_push(next, packet.bytes(), packet.shape()) {
            return true;
        }
        guard.next_precache += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn counting_loader(limit: u64, calls: Arc<AtomicU64>) -> impl Loader {
        move |i: u64| {
            calls.fetch_add(1, Ordering::SeqCst);
            if i >= limit {
                Packet::empty()
            } else {
                let byte = (i % 256) as u8;
                Packet::new(vec![byte; 64 * 1024], crate::packet::PacketShape::new(256, 256, 1, 1))
            }
        }
    }

    #[test]
    fn bypass_path_memoises_last_index() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut precacher = PrecacherBuilder::new()
            .buffer_bytes(1024 * 1024)
            .build(counting_loader(100, Arc::clone(&calls)))
            .unwrap();
        // Never started: uses the bypass path.
        let a = precacher.get_packet(5).unwrap();
        let b = precacher.get_packet(5).unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequential_drain_matches_loader_output() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut precacher = PrecacherBuilder::new()
            .buffer_bytes(1024 * 1024)
            .build(counting_loader(1_000, Arc::clone(&calls)))
            .unwrap();
        precacher.start().unwrap();
        for i in 0..32u64 {
            let packet = precacher.get_packet(i).unwrap();
            let expected_byte = (i % 256) as u8;
            assert_eq!(packet.bytes()[0], expected_byte);
            assert_eq!(packet.len(), 64 * 1024);
        }
    }

    #[test]
    fn backward_jump_flushes_and_reloads() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut precacher = PrecacherBuilder::new()
            .buffer_bytes(1024 * 1024)
            .build(counting_loader(1_000, Arc::clone(&calls)))
            .unwrap();
        precacher.start().unwrap();
        for i in 0..8u64 {
            precacher.get_packet(i).unwrap();
        }
        let packet = precacher.get_packet(2).unwrap();
        assert_eq!(packet.bytes()[0], 2u8);
    }

    #[test]
    fn end_of_stream_returns_empty_without_busy_looping() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut precacher = PrecacherBuilder::new()
            .buffer_bytes(256 * 1024)
            .build(counting_loader(10, Arc::clone(&calls)))
            .unwrap();
        precacher.start().unwrap();
        for i in 0..10u64 {
            assert!(!precacher.get_packet(i).unwrap().is_empty());
        }
        for i in 10..13u64 {
            assert!(precacher.get_packet(i).unwrap().is_empty());
        }
    }

    #[test]
    fn repeated_request_does_not_reinvoke_loader() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut precacher = PrecacherBuilder::new()
            .buffer_bytes(1024 * 1024)
            .build(counting_loader(1_000, Arc::clone(&calls)))
            .unwrap();
        precacher.start().unwrap();
        precacher.get_packet(3).unwrap();
        let before = calls.load(Ordering::SeqCst);
        let first = precacher.get_packet(3).unwrap();
        let second = precacher.get_packet(3).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = PrecacherBuilder::new().buffer_bytes(0).build(|_: u64| Packet::empty());
        assert!(matches!(err, Err(PrecacherError::ZeroCapacity)));
    }
}
