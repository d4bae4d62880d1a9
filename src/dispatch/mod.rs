//! Fan-out of filled frames to registered processors.
//!
//! One dedicated worker thread per processor, one atomic busy flag per
//! processor. Dispatch runs on the producer thread and returns immediately:
//! a processor still working on a previous frame has the new one dropped
//! for it alone. No queueing - drop-on-busy is the backpressure mechanism.

mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::utils::CachePadded;
use tracing::{debug, info, warn};

use crate::error::FrameError;
use crate::frame::handle::{FrameHandle, FrameMeta};
use crate::frame::pool::{lock, read, release_reader, FrameLease};

/// Error type processors may return. Contained and logged, never propagated
/// to the dispatcher, the producer, or other processors.
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync>;

/// A frame consumer. `process` runs synchronously on the processor's own
/// dedicated worker; blocking inside it only delays (and drops) frames for
/// this processor, never for others and never for the producer.
pub trait FrameProcessor: Send + 'static {
    fn process(&mut self, frame: &FrameHandle) -> Result<(), ProcessorError>;
}

impl<F> FrameProcessor for F
where
    F: FnMut(&FrameHandle) -> Result<(), ProcessorError> + Send + 'static,
{
    fn process(&mut self, frame: &FrameHandle) -> Result<(), ProcessorError> {
        self(frame)
    }
}

#[derive(Default)]
struct ProcessorStats {
    delivered: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
}

struct ProcessorEntry {
    name: String,
    busy: Arc<AtomicBool>,
    stats: Arc<ProcessorStats>,
    tx: flume::Sender<FrameHandle>,
    worker: Option<JoinHandle<()>>,
}

/// Routes each captured frame to every registered processor's worker,
/// applying drop-on-busy per processor.
pub struct Dispatcher {
    entries: Mutex<Vec<ProcessorEntry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a processor under a unique name, spawning its worker thread.
    pub fn add_processor(
        &self,
        name: impl Into<String>,
        processor: impl FrameProcessor,
    ) -> Result<(), FrameError> {
        let name = name.into();
        let mut entries = lock(&self.entries);
        if entries.iter().any(|e| e.name == name) {
            return Err(FrameError::AlreadyRegistered(name));
        }

        let busy = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ProcessorStats::default());
        // Capacity 1 is enough: the busy flag guarantees at most one frame
        // in flight per processor.
        let (tx, rx) = flume::bounded(1);
        let worker = worker::spawn(name.clone(), rx, busy.clone(), processor)
            .map_err(|e| FrameError::WorkerSpawn(e.to_string()))?;

        info!(processor = %name, "processor registered");
        entries.push(ProcessorEntry {
            name,
            busy,
            stats,
            tx,
            worker: Some(worker),
        });
        Ok(())
    }

    /// Unregister a processor. Waits out any in-flight callback on its
    /// worker before the thread is torn down; no further frames are
    /// delivered to it.
    pub fn remove_processor(&self, name: &str) -> Result<(), FrameError> {
        let entry = {
            let mut entries = lock(&self.entries);
            let pos = entries
                .iter()
                .position(|e| e.name == name)
                .ok_or_else(|| FrameError::UnknownProcessor(name.to_string()))?;
            entries.remove(pos)
        };
        join_entry(entry);
        Ok(())
    }

    /// Unregister every processor, joining all workers.
    pub fn clear_processors(&self) {
        let drained: Vec<ProcessorEntry> = {
            let mut entries = lock(&self.entries);
            entries.drain(..).collect()
        };
        for entry in drained {
            join_entry(entry);
        }
    }

    pub fn processor_count(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Frames dropped for a processor because it was busy.
    pub fn drop_count(&self, name: &str) -> Option<u64> {
        lock(&self.entries)
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.stats.dropped.load(Ordering::Relaxed))
    }

    /// Frames handed to a processor's worker.
    pub fn delivered_count(&self, name: &str) -> Option<u64> {
        lock(&self.entries)
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.stats.delivered.load(Ordering::Relaxed))
    }

    /// Whether a processor is currently inside (or about to enter) its
    /// callback. The next frame dispatched while busy is dropped for it.
    pub fn is_busy(&self, name: &str) -> Option<bool> {
        lock(&self.entries)
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.busy.load(Ordering::Acquire))
    }

    /// Offer one filled frame to every registered processor and return
    /// immediately. With zero registered processors (or all busy) the
    /// buffer recycles right away.
    pub fn dispatch(&self, lease: FrameLease) {
        let (slot, shared) = lease.defuse();
        let generation = slot.generation.load(Ordering::Acquire);
        let meta = FrameMeta::snapshot(&read(&slot.buf));
        metrics::counter!("lumen_frames_dispatched_total").increment(1);

        let drop_log_interval = crate::CONFIG.load().dispatch.drop_log_interval.max(1);
        let entries = lock(&self.entries);
        for entry in entries.iter() {
            if entry
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                let dropped = entry.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!(
                    "lumen_frames_dropped_total",
                    "processor" => entry.name.clone()
                )
                .increment(1);
                if dropped % drop_log_interval == 0 {
                    debug!(
                        processor = %entry.name,
                        dropped,
                        seq = meta.sequence,
                        "frame dropped (processor busy)"
                    );
                }
                continue;
            }

            slot.readers.fetch_add(1, Ordering::AcqRel);
            let handle = FrameHandle::new(slot.clone(), shared.clone(), generation, meta);
            match entry.tx.try_send(handle) {
                Ok(()) => {
                    entry.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(
                        "lumen_frames_delivered_total",
                        "processor" => entry.name.clone()
                    )
                    .increment(1);
                }
                Err(err) => {
                    // Worker gone or mailbox unexpectedly full; dropping the
                    // rejected handle releases its slot reference.
                    entry.busy.store(false, Ordering::Release);
                    entry.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(processor = %entry.name, error = %err, "failed to hand frame to worker");
                }
            }
        }
        drop(entries);

        // Release the dispatch's own reference. With zero acceptances this
        // recycles the buffer immediately.
        release_reader(&shared, &slot);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.clear_processors();
    }
}

fn join_entry(entry: ProcessorEntry) {
    let ProcessorEntry {
        name, tx, worker, ..
    } = entry;
    // Disconnecting the mailbox ends the worker loop after any in-flight
    // callback completes.
    drop(tx);
    if let Some(handle) = worker {
        if handle.join().is_err() {
            warn!(processor = %name, "worker terminated by panic");
        }
    }
    info!(processor = %name, "processor removed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::ConstraintNegotiator;
    use crate::frame::pool::FramePool;
    use crate::frame::{PixelFormat, Rotation};
    use crate::{ConstraintConfig, PoolConfig};
    use std::time::{Duration, Instant};

    fn test_pool(initial: usize, max: usize) -> FramePool {
        let negotiator = Arc::new(
            ConstraintNegotiator::new(&ConstraintConfig {
                max_width: 4,
                max_height: 4,
                format: PixelFormat::Rgb24,
            })
            .unwrap(),
        );
        FramePool::new(
            &PoolConfig {
                initial_buffers: initial,
                max_buffers: max,
            },
            negotiator,
        )
    }

    fn filled(pool: &FramePool, value: u8) -> FrameLease {
        let mut lease = pool.acquire().unwrap();
        lease
            .fill_bytes(&[value; 12], 2, 2, Rotation::Deg0)
            .unwrap();
        lease
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn zero_processors_recycles_immediately() {
        let pool = test_pool(1, 1);
        let dispatcher = Dispatcher::new();
        dispatcher.dispatch(filled(&pool, 1));
        // Synchronous: the producer reference was the only one.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dispatcher = Dispatcher::new();
        let noop = |_: &FrameHandle| -> Result<(), ProcessorError> { Ok(()) };
        dispatcher.add_processor("p", noop).unwrap();
        let err = dispatcher.add_processor("p", noop).unwrap_err();
        assert_eq!(err, FrameError::AlreadyRegistered("p".into()));
        assert_eq!(
            dispatcher.remove_processor("ghost"),
            Err(FrameError::UnknownProcessor("ghost".into()))
        );
    }

    #[test]
    fn busy_processor_drops_but_others_deliver() {
        let pool = test_pool(2, 4);
        let dispatcher = Dispatcher::new();

        let fast_seen = Arc::new(AtomicU64::new(0));
        let seen = fast_seen.clone();
        dispatcher
            .add_processor("fast", move |_: &FrameHandle| -> Result<(), ProcessorError> {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        // Slow processor parks on a channel until the test releases it.
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let slow_seen = Arc::new(AtomicU64::new(0));
        let seen = slow_seen.clone();
        dispatcher
            .add_processor("slow", move |_: &FrameHandle| -> Result<(), ProcessorError> {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();

        for i in 0..3u64 {
            dispatcher.dispatch(filled(&pool, i as u8));
            let fast = fast_seen.clone();
            wait_until("fast delivery", move || {
                fast.load(Ordering::SeqCst) == i + 1
            });
            wait_until("fast idle", || {
                dispatcher.is_busy("fast") == Some(false)
            });
            if i == 0 {
                let slow = slow_seen.clone();
                wait_until("slow entered callback", move || {
                    slow.load(Ordering::SeqCst) == 1
                });
            }
        }

        assert_eq!(fast_seen.load(Ordering::SeqCst), 3);
        assert_eq!(slow_seen.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.delivered_count("fast"), Some(3));
        assert_eq!(dispatcher.delivered_count("slow"), Some(1));
        assert_eq!(dispatcher.drop_count("slow"), Some(2));

        release_tx.send(()).unwrap();
        dispatcher.clear_processors();
    }

    #[test]
    fn buffer_is_not_recycled_while_callback_runs() {
        let pool = test_pool(1, 1);
        let dispatcher = Dispatcher::new();

        let (stalled_tx, stalled_rx) = flume::bounded::<u8>(1);
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let (result_tx, result_rx) = flume::bounded::<(u8, u8)>(1);
        dispatcher
            .add_processor("staller", move |frame: &FrameHandle| -> Result<(), ProcessorError> {
                let before = frame.with_bytes(|b| b[0])?;
                let _ = stalled_tx.send(before);
                let _ = release_rx.recv();
                let after = frame.with_bytes(|b| b[0])?;
                let _ = result_tx.send((before, after));
                Ok(())
            })
            .unwrap();

        dispatcher.dispatch(filled(&pool, 42));
        assert_eq!(stalled_rx.recv().unwrap(), 42);

        // While the callback is stalled, the slot stays checked out and the
        // producer gets exhaustion instead of a torn buffer.
        assert_eq!(pool.available(), 0);
        assert!(matches!(
            pool.acquire(),
            Err(FrameError::PoolExhausted { .. })
        ));

        release_tx.send(()).unwrap();
        let (before, after) = result_rx.recv().unwrap();
        assert_eq!((before, after), (42, 42));

        wait_until("slot recycled", || pool.available() == 1);
        dispatcher.clear_processors();
    }

    #[test]
    fn callback_failure_clears_busy_and_is_contained() {
        let pool = test_pool(2, 2);
        let dispatcher = Dispatcher::new();

        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        dispatcher
            .add_processor("flaky", move |_: &FrameHandle| -> Result<(), ProcessorError> {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    return Err("synthetic failure".into());
                }
                if n == 1 {
                    panic!("synthetic panic");
                }
                Ok(())
            })
            .unwrap();

        for i in 0..3u64 {
            dispatcher.dispatch(filled(&pool, i as u8));
            let seen = calls.clone();
            wait_until("flaky delivery", move || {
                seen.load(Ordering::SeqCst) == i + 1
            });
            wait_until("flaky idle", || {
                dispatcher.is_busy("flaky") == Some(false)
            });
        }

        // Error and panic both cleared the busy flag; all frames delivered.
        assert_eq!(dispatcher.delivered_count("flaky"), Some(3));
        assert_eq!(dispatcher.drop_count("flaky"), Some(0));
        wait_until("all slots recycled", || pool.available() == 2);
        dispatcher.clear_processors();
    }

    #[test]
    fn remove_waits_for_in_flight_callback() {
        let pool = test_pool(1, 2);
        let dispatcher = Arc::new(Dispatcher::new());

        let (stalled_tx, stalled_rx) = flume::bounded::<()>(1);
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        dispatcher
            .add_processor("victim", move |_: &FrameHandle| -> Result<(), ProcessorError> {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = stalled_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();

        dispatcher.dispatch(filled(&pool, 1));
        stalled_rx.recv().unwrap();

        let remover = {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || dispatcher.remove_processor("victim"))
        };
        // Removal must block on the in-flight callback.
        std::thread::sleep(Duration::from_millis(20));
        assert!(!remover.is_finished());

        release_tx.send(()).unwrap();
        remover.join().unwrap().unwrap();
        assert_eq!(dispatcher.processor_count(), 0);

        // Dispatching after removal delivers nowhere and recycles.
        dispatcher.dispatch(filled(&pool, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        wait_until("slots recycled", || pool.available() >= 1);
    }

    #[test]
    fn per_processor_order_is_capture_order() {
        let pool = test_pool(2, 4);
        let dispatcher = Dispatcher::new();

        let seqs = Arc::new(Mutex::new(Vec::new()));
        let sink = seqs.clone();
        let overlap = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlap_flag = overlap.clone();
        let gate = in_flight.clone();
        dispatcher
            .add_processor("orderly", move |frame: &FrameHandle| -> Result<(), ProcessorError> {
                if gate.swap(true, Ordering::SeqCst) {
                    overlap_flag.store(true, Ordering::SeqCst);
                }
                lock(&sink).push(frame.sequence());
                gate.store(false, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        for i in 0..10u64 {
            dispatcher.dispatch(filled(&pool, i as u8));
            let sink = seqs.clone();
            wait_until("delivery", move || lock(&sink).len() as u64 == i + 1);
            wait_until("orderly idle", || {
                dispatcher.is_busy("orderly") == Some(false)
            });
        }
        dispatcher.clear_processors();

        let recorded = lock(&seqs).clone();
        assert_eq!(recorded.len(), 10);
        assert!(recorded.windows(2).all(|w| w[0] < w[1]), "capture order");
        assert!(!overlap.load(Ordering::SeqCst), "no overlapping callbacks");
    }
}
