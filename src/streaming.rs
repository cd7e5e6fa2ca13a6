//! The bus worker thread and live mirroring statistics.
//!
//! The worker owns the consumer half of the task queue and a
//! [`BusExecutor`]. It parks while the queue is empty, drives every task
//! to completion in FIFO order, and exits once the queue has been closed
//! and drained. Errors from the executor are logged and counted but never
//! stop the worker: one failed transfer only leaves a stale region on the
//! panel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};

use crate::backend::BusExecutor;
use crate::error::{MirrorError, MirrorResult};
use crate::queue::{QueueCloser, QueueStats, TaskConsumer};

/// Smoothing factor of the diff latency moving average.
const LATENCY_ALPHA: f64 = 0.1;

/// Live counters shared by the session (producer side) and the bus worker.
#[derive(Debug, Default)]
pub struct MirrorStats {
    /// Frames handed to `submit`.
    pub frames_submitted: AtomicU64,
    /// Submitted frames that produced no spans.
    pub frames_unchanged: AtomicU64,
    /// Frames diffed on a single field.
    pub interlaced_frames: AtomicU64,
    /// Frames sent whole without diffing.
    pub full_refreshes: AtomicU64,
    /// Spans queued after merging.
    pub spans_emitted: AtomicU64,
    pub merges: AtomicU64,
    /// Pixels queued for transfer, merge waste included.
    pub pixels_queued: AtomicU64,
    pub tasks_driven: AtomicU64,
    /// Payload bytes handed to the executor.
    pub bytes_driven: AtomicU64,
    pub bus_errors: AtomicU64,
    /// Exponentially-weighted moving average of diff+merge time in
    /// nanoseconds, stored as `f64` bits.
    pub diff_latency_avg_ns: AtomicU64,
}

impl MirrorStats {
    /// Fold one diff timing into the moving average. Only the producer
    /// thread records latencies.
    pub(crate) fn record_diff_latency(&self, elapsed: Duration) {
        let previous = f64::from_bits(self.diff_latency_avg_ns.load(Ordering::Relaxed));
        let sample = elapsed.as_nanos() as f64;
        let average = if previous == 0.0 {
            sample
        } else {
            LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * previous
        };
        self.diff_latency_avg_ns
            .store(average.to_bits(), Ordering::Relaxed);
    }

    /// Snapshot the counters, folding in the queue's own counters.
    pub fn snapshot(&self, queue: QueueStats) -> MirrorStatsSnapshot {
        MirrorStatsSnapshot {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_unchanged: self.frames_unchanged.load(Ordering::Relaxed),
            interlaced_frames: self.interlaced_frames.load(Ordering::Relaxed),
            full_refreshes: self.full_refreshes.load(Ordering::Relaxed),
            spans_emitted: self.spans_emitted.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            pixels_queued: self.pixels_queued.load(Ordering::Relaxed),
            tasks_committed: queue.tasks_committed,
            tasks_driven: self.tasks_driven.load(Ordering::Relaxed),
            bytes_driven: self.bytes_driven.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            producer_stalls: queue.producer_stalls,
            queue_wraps: queue.wraps,
            backlog_bytes: queue.bytes_queued,
            diff_latency_avg: Duration::from_nanos(f64::from_bits(
                self.diff_latency_avg_ns.load(Ordering::Relaxed),
            ) as u64),
        }
    }
}

/// A point-in-time copy of mirroring statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MirrorStatsSnapshot {
    pub frames_submitted: u64,
    pub frames_unchanged: u64,
    pub interlaced_frames: u64,
    pub full_refreshes: u64,
    pub spans_emitted: u64,
    pub merges: u64,
    pub pixels_queued: u64,
    pub tasks_committed: u64,
    pub tasks_driven: u64,
    pub bytes_driven: u64,
    pub bus_errors: u64,
    pub producer_stalls: u64,
    pub queue_wraps: u64,
    /// Ring bytes still waiting for the bus when the snapshot was taken.
    pub backlog_bytes: usize,
    pub diff_latency_avg: Duration,
}

/// Handle to the running bus thread. Dropping it closes the queue and
/// joins the thread.
pub(crate) struct BusWorker {
    closer: QueueCloser,
    join_handle: Option<JoinHandle<MirrorResult<()>>>,
}

impl BusWorker {
    pub(crate) fn spawn<B>(
        consumer: TaskConsumer,
        bus: B,
        stats: Arc<MirrorStats>,
    ) -> MirrorResult<Self>
    where
        B: BusExecutor + 'static,
    {
        let closer = consumer.closer();
        let join_handle = std::thread::Builder::new()
            .name("snow-mirror-bus".to_string())
            .spawn(move || bus_loop(consumer, bus, &stats))
            .map_err(|e| {
                MirrorError::Platform(anyhow::anyhow!("failed to spawn bus worker thread: {e}"))
            })?;

        Ok(Self {
            closer,
            join_handle: Some(join_handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Close the queue, let the worker drain what is already committed,
    /// and join it.
    pub(crate) fn stop(&mut self) -> MirrorResult<()> {
        self.closer.close();
        let Some(handle) = self.join_handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("bus worker thread panicked");
                Err(MirrorError::WorkerDead)
            }
        }
    }
}

impl Drop for BusWorker {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("bus worker stopped with error: {e}");
        }
    }
}

/// Closes the queue when the worker leaves `bus_loop`, including by
/// panic, so a producer blocked on a full ring is released.
struct CloseOnExit(QueueCloser);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn bus_loop<B: BusExecutor>(
    mut consumer: TaskConsumer,
    mut bus: B,
    stats: &MirrorStats,
) -> MirrorResult<()> {
    let _close_on_exit = CloseOnExit(consumer.closer());
    let mut tasks: u64 = 0;

    while consumer.wait_for_work() {
        while let Some(task) = consumer.dequeue() {
            match bus.drive(&task) {
                Ok(()) => {
                    stats.tasks_driven.fetch_add(1, Ordering::Relaxed);
                    stats
                        .bytes_driven
                        .fetch_add(task.payload_len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.bus_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "bus task 0x{:02X} ({} bytes) failed: {e}",
                        task.cmd(),
                        task.payload_len()
                    );
                }
            }
            task.release();
            tasks += 1;
        }
    }

    info!("bus worker exiting after {tasks} tasks");
    bus.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBus;
    use crate::queue::{QueueConfig, Task, TaskQueue};

    struct FailingBus;

    impl BusExecutor for FailingBus {
        fn drive(&mut self, task: &Task<'_>) -> MirrorResult<()> {
            if task.cmd() == 0xEE {
                return Err(MirrorError::Platform(anyhow::anyhow!("bus timeout")));
            }
            Ok(())
        }
    }

    fn queue() -> (crate::queue::TaskProducer, TaskConsumer) {
        TaskQueue::create(QueueConfig {
            capacity_bytes: 1024,
            max_payload_bytes: 64,
        })
        .unwrap()
    }

    fn push(producer: &mut crate::queue::TaskProducer, cmd: u8, payload: &[u8]) {
        let mut writer = producer.allocate(payload.len()).unwrap();
        writer.set_cmd(cmd);
        writer.payload_mut().copy_from_slice(payload);
        writer.commit();
    }

    #[test]
    fn worker_drains_queue_before_exiting() -> MirrorResult<()> {
        let (mut producer, consumer) = queue();
        let stats = Arc::new(MirrorStats::default());
        let recorder = RecordingBus::new();
        let mut worker = BusWorker::spawn(consumer, recorder.clone(), stats.clone())?;

        for i in 0..50u8 {
            push(&mut producer, i, &[i; 3]);
        }
        worker.stop()?;

        let tasks = recorder.tasks();
        assert_eq!(tasks.len(), 50);
        assert!(tasks.iter().enumerate().all(|(i, t)| t.cmd == i as u8));
        let snapshot = stats.snapshot(producer.stats());
        assert_eq!(snapshot.tasks_driven, 50);
        assert_eq!(snapshot.bytes_driven, 150);
        assert_eq!(snapshot.backlog_bytes, 0);
        assert!(!worker.is_running());
        Ok(())
    }

    #[test]
    fn bus_errors_are_counted_not_fatal() -> MirrorResult<()> {
        let (mut producer, consumer) = queue();
        let stats = Arc::new(MirrorStats::default());
        let mut worker = BusWorker::spawn(consumer, FailingBus, stats.clone())?;

        push(&mut producer, 0x2A, &[1]);
        push(&mut producer, 0xEE, &[2]);
        push(&mut producer, 0x2C, &[3]);
        worker.stop()?;

        assert_eq!(stats.bus_errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.tasks_driven.load(Ordering::Relaxed), 2);
        Ok(())
    }

    #[test]
    fn diff_latency_average_starts_at_first_sample() {
        let stats = MirrorStats::default();
        stats.record_diff_latency(Duration::from_micros(100));
        stats.record_diff_latency(Duration::from_micros(200));
        let avg = stats.snapshot(QueueStats::default()).diff_latency_avg;
        assert_eq!(avg, Duration::from_micros(110));
    }
}
