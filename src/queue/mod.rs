//! Single-producer/single-consumer ring of variable-length task records.
//!
//! Every record is a 5-byte header (`u32` little-endian payload size, `u8`
//! command) followed by the payload. A header with size `0` is the wrap
//! sentinel: the producer writes it when the next record would not fit
//! before the end of the buffer and continues at offset 0.
//!
//! `head` is written only by the consumer and `tail` only by the producer.
//! Records between `head` and `tail` belong to the consumer, everything
//! else to the producer, so payload bytes are plain memory handed across
//! with acquire/release on the indices.

mod signal;

pub use signal::WakeSignal;

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{MirrorError, MirrorResult};
use crate::frame::FrameLayout;

/// Size of the record header preceding each payload.
pub const TASK_HEADER_BYTES: usize = 5;

const SENTINEL_SIZE: u32 = 0;

/// Producer busy-polls this many times before it starts sleeping.
const STALL_SPIN_ROUNDS: u32 = 64;
const STALL_SLEEP: Duration = Duration::from_micros(100);
/// Upper bound on a single consumer park; the consumer re-checks state
/// after every timeout.
const CONSUMER_PARK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Total ring size in bytes, headers and sentinel included.
    pub capacity_bytes: usize,
    /// Largest payload the producer will ever ask for.
    pub max_payload_bytes: usize,
}

impl QueueConfig {
    /// Sized to hold three full frames of wire pixels, with a single task
    /// allowed to carry one full frame.
    pub fn for_frame(layout: FrameLayout, bytes_per_pixel: usize) -> MirrorResult<Self> {
        let frame_bytes = layout
            .pixel_count()
            .checked_mul(bytes_per_pixel)
            .ok_or(MirrorError::BufferOverflow)?;
        let capacity_bytes = frame_bytes
            .checked_mul(3)
            .ok_or(MirrorError::BufferOverflow)?;
        Ok(Self {
            capacity_bytes,
            max_payload_bytes: frame_bytes,
        })
    }

    /// Largest payload a ring of `capacity_bytes` can accept.
    pub fn payload_limit(capacity_bytes: usize) -> usize {
        capacity_bytes.saturating_sub(2 * TASK_HEADER_BYTES + 1)
    }

    pub fn validate(&self) -> MirrorResult<()> {
        if self.capacity_bytes > u32::MAX as usize {
            return Err(MirrorError::InvalidConfig(format!(
                "queue capacity of {} bytes exceeds the 32-bit index range",
                self.capacity_bytes
            )));
        }
        if self.max_payload_bytes == 0 {
            return Err(MirrorError::InvalidConfig(
                "maximum task payload must be > 0".into(),
            ));
        }
        // A maximal task plus its header must fit at offset 0 with room
        // left for a sentinel, and must never make tail catch up to head.
        let limit = Self::payload_limit(self.capacity_bytes);
        if self.max_payload_bytes > limit {
            return Err(MirrorError::TaskTooLarge {
                payload_bytes: self.max_payload_bytes,
                max_payload_bytes: limit,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    committed: AtomicU64,
    stalls: AtomicU64,
    wraps: AtomicU64,
}

/// Point-in-time copy of the queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub tasks_committed: u64,
    /// Number of `allocate` calls that had to wait for the consumer.
    pub producer_stalls: u64,
    pub wraps: u64,
    pub bytes_queued: usize,
}

struct Ring {
    buffer: Box<[UnsafeCell<u8>]>,
    max_payload_bytes: usize,
    head: AtomicU32,
    tail: AtomicU32,
    bytes_queued: AtomicUsize,
    closed: AtomicBool,
    consumer_wake: WakeSignal,
    counters: QueueCounters,
}

// The buffer is only touched through the index protocol: the producer
// writes outside `head..tail`, the consumer reads inside it.
unsafe impl Sync for Ring {}

impl Ring {
    fn new(config: QueueConfig) -> Self {
        let buffer = (0..config.capacity_bytes)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            max_payload_bytes: config.max_payload_bytes,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            bytes_queued: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            consumer_wake: WakeSignal::new(),
            counters: QueueCounters::default(),
        }
    }

    #[inline(always)]
    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    /// # Safety
    /// `offset..offset + TASK_HEADER_BYTES` must be in bounds and owned by
    /// the calling side.
    #[inline(always)]
    unsafe fn write_header(&self, offset: usize, size: u32, cmd: u8) {
        let mut header = [0u8; TASK_HEADER_BYTES];
        header[..4].copy_from_slice(&size.to_le_bytes());
        header[4] = cmd;
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), self.base().add(offset), TASK_HEADER_BYTES);
        }
    }

    /// # Safety
    /// Same as [`Ring::write_header`].
    #[inline(always)]
    unsafe fn read_header(&self, offset: usize) -> (u32, u8) {
        let mut header = [0u8; TASK_HEADER_BYTES];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(offset), header.as_mut_ptr(), TASK_HEADER_BYTES);
        }
        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        (size, header[4])
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.consumer_wake.signal();
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            tasks_committed: self.counters.committed.load(Ordering::Relaxed),
            producer_stalls: self.counters.stalls.load(Ordering::Relaxed),
            wraps: self.counters.wraps.load(Ordering::Relaxed),
            bytes_queued: self.bytes_queued.load(Ordering::Acquire),
        }
    }
}

/// Constructor for the producer/consumer pair.
pub struct TaskQueue;

impl TaskQueue {
    /// Allocate the ring once and split it into its two owned halves.
    pub fn create(config: QueueConfig) -> MirrorResult<(TaskProducer, TaskConsumer)> {
        config.validate()?;
        let ring = Arc::new(Ring::new(config));
        debug!(
            "task queue created: capacity={} bytes, max payload={} bytes",
            config.capacity_bytes, config.max_payload_bytes
        );
        Ok((
            TaskProducer {
                ring: ring.clone(),
                tail: 0,
            },
            TaskConsumer { ring },
        ))
    }
}

/// Closes a queue from any thread.
#[derive(Clone)]
pub struct QueueCloser {
    ring: Arc<Ring>,
}

impl QueueCloser {
    /// Mark the queue closed and wake the consumer. Tasks already
    /// committed stay dequeueable; a producer blocked in `allocate`
    /// returns [`MirrorError::QueueClosed`].
    pub fn close(&self) {
        self.ring.close();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }
}

/// Writing half of the queue.
pub struct TaskProducer {
    ring: Arc<Ring>,
    /// Mirror of `ring.tail`; this side is its only writer.
    tail: usize,
}

impl TaskProducer {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.ring.max_payload_bytes
    }

    pub fn bytes_queued(&self) -> usize {
        self.ring.bytes_queued.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        self.ring.stats()
    }

    pub fn closer(&self) -> QueueCloser {
        QueueCloser {
            ring: self.ring.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    /// Reserve space for a task with a `payload_bytes`-byte payload,
    /// waiting for the consumer while the ring is full.
    ///
    /// # Panics
    /// When `payload_bytes` is zero or above the configured maximum.
    pub fn allocate(&mut self, payload_bytes: usize) -> MirrorResult<TaskWriter<'_>> {
        assert!(
            payload_bytes > 0 && payload_bytes <= self.ring.max_payload_bytes,
            "task payload of {payload_bytes} bytes outside 1..={}",
            self.ring.max_payload_bytes
        );
        let needed = TASK_HEADER_BYTES + payload_bytes;
        let mut backoff = Backoff::new();

        if self.tail + needed + TASK_HEADER_BYTES >= self.ring.capacity() {
            // The consumer must not sit at 0 (tail would land on it and
            // read as empty) nor beyond tail (it still has records up to
            // the end of the buffer to read).
            let tail = self.tail as u32;
            self.wait_while(&mut backoff, |head| head > tail || head == 0)?;

            // SAFETY: head <= tail, so `tail..` is producer-owned, and the
            // capacity check at construction leaves room for a header.
            unsafe { self.ring.write_header(self.tail, SENTINEL_SIZE, 0) };
            let prior_tail = self.tail;
            self.tail = 0;
            self.publish_tail();
            self.ring.counters.wraps.fetch_add(1, Ordering::Relaxed);
            trace!("task queue wrapped at offset {prior_tail}");
        }

        let tail = self.tail as u32;
        let new_tail = (self.tail + needed) as u32;
        self.wait_while(&mut backoff, |head| head > tail && head <= new_tail)?;

        if backoff.stalled() {
            self.ring.counters.stalls.fetch_add(1, Ordering::Relaxed);
            debug!(
                "producer stalled {:?} waiting for {needed} bytes",
                backoff.waited()
            );
        }

        Ok(TaskWriter {
            offset: self.tail,
            payload_bytes,
            cmd: 0,
            producer: self,
        })
    }

    fn wait_while(
        &self,
        backoff: &mut Backoff,
        blocked: impl Fn(u32) -> bool,
    ) -> MirrorResult<()> {
        loop {
            if !blocked(self.ring.head.load(Ordering::Acquire)) {
                return Ok(());
            }
            if self.ring.is_closed() {
                return Err(MirrorError::QueueClosed);
            }
            backoff.snooze();
        }
    }

    fn publish_tail(&self) {
        self.ring.tail.store(self.tail as u32, Ordering::Release);
        // The tail store must be ordered before the `parked` check, which
        // `signal_if_parked` fences for. It returns early when nobody waits.
        self.ring.consumer_wake.signal_if_parked();
    }
}

/// A reserved, unpublished task. Dropping it without [`TaskWriter::commit`]
/// discards the reservation.
pub struct TaskWriter<'a> {
    producer: &'a mut TaskProducer,
    offset: usize,
    payload_bytes: usize,
    cmd: u8,
}

impl TaskWriter<'_> {
    pub fn set_cmd(&mut self, cmd: u8) -> &mut Self {
        self.cmd = cmd;
        self
    }

    /// Payload size in bytes. Never zero, since a zero size marks the wrap.
    pub fn payload_len(&self) -> usize {
        self.payload_bytes
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: `allocate` reserved `offset..offset + header + payload`
        // outside the consumer's `head..tail` window, and the exclusive
        // borrow of the producer keeps it reserved for this writer.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.producer
                    .ring
                    .base()
                    .add(self.offset + TASK_HEADER_BYTES),
                self.payload_bytes,
            )
        }
    }

    /// Publish the task to the consumer.
    pub fn commit(self) {
        let ring = &self.producer.ring;
        let needed = TASK_HEADER_BYTES + self.payload_bytes;
        // SAFETY: see `payload_mut`.
        unsafe { ring.write_header(self.offset, self.payload_bytes as u32, self.cmd) };

        // Counted before the record becomes visible so the consumer's
        // release can never observe it missing.
        ring.bytes_queued.fetch_add(needed, Ordering::AcqRel);
        ring.counters.committed.fetch_add(1, Ordering::Relaxed);

        self.producer.tail = self.offset + needed;
        self.producer.publish_tail();
    }
}

/// Reading half of the queue.
pub struct TaskConsumer {
    ring: Arc<Ring>,
}

impl TaskConsumer {
    pub fn bytes_queued(&self) -> usize {
        self.ring.bytes_queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    pub fn stats(&self) -> QueueStats {
        self.ring.stats()
    }

    pub fn closer(&self) -> QueueCloser {
        QueueCloser {
            ring: self.ring.clone(),
        }
    }

    /// Peek the oldest committed task. The task stays queued until
    /// [`Task::release`] is called.
    pub fn dequeue(&mut self) -> Option<Task<'_>> {
        loop {
            let head = self.ring.head.load(Ordering::Relaxed) as usize;
            let tail = self.ring.tail.load(Ordering::Acquire) as usize;
            if head == tail {
                return None;
            }
            assert!(
                head + TASK_HEADER_BYTES <= self.ring.capacity(),
                "task queue corrupted: head {head} leaves no room for a header"
            );

            // SAFETY: head != tail, so the producer published a record here.
            let (size, cmd) = unsafe { self.ring.read_header(head) };
            if size == SENTINEL_SIZE {
                self.ring.head.store(0, Ordering::Release);
                continue;
            }

            let payload_bytes = size as usize;
            assert!(
                head + TASK_HEADER_BYTES + payload_bytes <= self.ring.capacity(),
                "task queue corrupted: {payload_bytes}-byte record at {head} overruns the buffer"
            );
            return Some(Task {
                consumer: self,
                offset: head,
                payload_bytes,
                cmd,
            });
        }
    }

    /// Park until a task is available. Returns `false` once the queue has
    /// been closed and fully drained.
    pub fn wait_for_work(&mut self) -> bool {
        loop {
            if !self.ring.is_empty() {
                return true;
            }
            if self.ring.is_closed() {
                return false;
            }
            let ring = &self.ring;
            ring.consumer_wake
                .park_until_signalled(|| !ring.is_empty() || ring.is_closed(), CONSUMER_PARK_TIMEOUT);
        }
    }
}

/// A committed task borrowed from the consumer side of the ring.
pub struct Task<'a> {
    consumer: &'a mut TaskConsumer,
    offset: usize,
    payload_bytes: usize,
    cmd: u8,
}

impl Task<'_> {
    /// The opaque command byte, interpreted only by the bus executor.
    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    pub fn payload(&self) -> &[u8] {
        // SAFETY: the record lies in `head..tail`, which the producer does
        // not touch until `release` advances head past it.
        unsafe {
            std::slice::from_raw_parts(
                self.consumer
                    .ring
                    .base()
                    .add(self.offset + TASK_HEADER_BYTES),
                self.payload_bytes,
            )
        }
    }

    /// Payload size in bytes. Never zero, since a zero size marks the wrap.
    pub fn payload_len(&self) -> usize {
        self.payload_bytes
    }

    /// Bytes the task occupies in the ring, header included.
    pub fn footprint(&self) -> usize {
        TASK_HEADER_BYTES + self.payload_bytes
    }

    /// Hand the task's space back to the producer.
    pub fn release(self) {
        let ring = &self.consumer.ring;
        let footprint = self.footprint();
        ring.bytes_queued.fetch_sub(footprint, Ordering::AcqRel);
        fence(Ordering::Release);
        ring.head
            .store((self.offset + footprint) as u32, Ordering::Release);
    }
}

impl std::fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("offset", &self.offset)
            .field("cmd", &self.cmd)
            .field("payload_bytes", &self.payload_bytes)
            .finish()
    }
}

/// Spin briefly, then fall back to short sleeps.
struct Backoff {
    rounds: u32,
    started: Option<Instant>,
}

impl Backoff {
    fn new() -> Self {
        Self {
            rounds: 0,
            started: None,
        }
    }

    fn snooze(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        if self.rounds < STALL_SPIN_ROUNDS {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(STALL_SLEEP);
        }
        self.rounds = self.rounds.saturating_add(1);
    }

    fn stalled(&self) -> bool {
        self.started.is_some()
    }

    fn waited(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |started| started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small_queue(capacity_bytes: usize, max_payload_bytes: usize) -> (TaskProducer, TaskConsumer) {
        TaskQueue::create(QueueConfig {
            capacity_bytes,
            max_payload_bytes,
        })
        .unwrap()
    }

    fn push(producer: &mut TaskProducer, cmd: u8, payload: &[u8]) -> MirrorResult<()> {
        let mut writer = producer.allocate(payload.len())?;
        writer.set_cmd(cmd);
        writer.payload_mut().copy_from_slice(payload);
        writer.commit();
        Ok(())
    }

    fn pop(consumer: &mut TaskConsumer) -> Option<(u8, Vec<u8>)> {
        let task = consumer.dequeue()?;
        let out = (task.cmd(), task.payload().to_vec());
        task.release();
        Some(out)
    }

    #[test]
    fn config_rejects_tasks_that_cannot_fit() {
        let err = QueueConfig {
            capacity_bytes: 64,
            max_payload_bytes: 60,
        }
        .validate();
        assert!(matches!(
            err,
            Err(MirrorError::TaskTooLarge {
                payload_bytes: 60,
                max_payload_bytes: 53
            })
        ));
        assert!(
            QueueConfig {
                capacity_bytes: 64,
                max_payload_bytes: 53
            }
            .validate()
            .is_ok()
        );
        assert!(
            QueueConfig {
                capacity_bytes: 64,
                max_payload_bytes: 0
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn frame_sized_config_holds_three_frames() -> MirrorResult<()> {
        let layout = FrameLayout::packed(480, 320)?;
        let config = QueueConfig::for_frame(layout, 2)?;
        assert_eq!(config.max_payload_bytes, 480 * 320 * 2);
        assert_eq!(config.capacity_bytes, 480 * 320 * 2 * 3);
        config.validate()
    }

    #[test]
    fn tasks_come_out_in_order_and_bytes_return_to_zero() -> MirrorResult<()> {
        let (mut producer, mut consumer) = small_queue(256, 32);
        assert!(consumer.dequeue().is_none());

        push(&mut producer, 0x2A, &[0, 1, 0, 9])?;
        push(&mut producer, 0x2B, &[0, 2])?;
        push(&mut producer, 0x2C, &[7; 20])?;
        assert_eq!(producer.bytes_queued(), 3 * TASK_HEADER_BYTES + 26);

        assert_eq!(pop(&mut consumer), Some((0x2A, vec![0, 1, 0, 9])));
        assert_eq!(pop(&mut consumer), Some((0x2B, vec![0, 2])));
        assert_eq!(pop(&mut consumer), Some((0x2C, vec![7; 20])));
        assert_eq!(pop(&mut consumer), None);
        assert_eq!(consumer.bytes_queued(), 0);
        assert_eq!(producer.stats().tasks_committed, 3);
        Ok(())
    }

    #[test]
    fn unreleased_task_is_dequeued_again() -> MirrorResult<()> {
        let (mut producer, mut consumer) = small_queue(64, 8);
        push(&mut producer, 1, &[1, 2, 3])?;
        {
            let task = consumer.dequeue().unwrap();
            assert_eq!(task.payload(), &[1, 2, 3]);
        }
        assert_eq!(pop(&mut consumer), Some((1, vec![1, 2, 3])));
        Ok(())
    }

    #[test]
    fn uncommitted_writer_publishes_nothing() -> MirrorResult<()> {
        let (mut producer, mut consumer) = small_queue(64, 8);
        {
            let mut writer = producer.allocate(4)?;
            writer.payload_mut().fill(0xEE);
        }
        assert!(consumer.dequeue().is_none());
        push(&mut producer, 3, &[5])?;
        assert_eq!(pop(&mut consumer), Some((3, vec![5])));
        Ok(())
    }

    #[test]
    fn wrap_skips_sentinel_and_restarts_at_zero() -> MirrorResult<()> {
        // 40-byte ring: two 15-byte records fill offsets 0..30, a third
        // one needs 15 + 5 more bytes and must wrap.
        let (mut producer, mut consumer) = small_queue(40, 10);
        push(&mut producer, 1, &[1; 10])?;
        push(&mut producer, 2, &[2; 10])?;
        assert_eq!(pop(&mut consumer), Some((1, vec![1; 10])));
        assert_eq!(pop(&mut consumer), Some((2, vec![2; 10])));

        push(&mut producer, 3, &[3; 10])?;
        assert_eq!(producer.stats().wraps, 1);
        assert_eq!(producer.tail, TASK_HEADER_BYTES + 10);

        assert_eq!(pop(&mut consumer), Some((3, vec![3; 10])));
        assert_eq!(pop(&mut consumer), None);
        assert_eq!(consumer.bytes_queued(), 0);
        Ok(())
    }

    #[test]
    fn close_unblocks_a_full_producer() -> MirrorResult<()> {
        let (mut producer, consumer) = small_queue(40, 10);
        push(&mut producer, 1, &[1; 10])?;
        push(&mut producer, 2, &[2; 10])?;

        let closer = consumer.closer();
        let blocked = thread::spawn(move || producer.allocate(10).map(|_| ()));
        thread::sleep(Duration::from_millis(20));
        closer.close();

        let result = blocked.join().unwrap();
        assert!(matches!(result, Err(MirrorError::QueueClosed)));
        Ok(())
    }

    #[test]
    fn wait_for_work_reports_closed_only_after_drain() -> MirrorResult<()> {
        let (mut producer, mut consumer) = small_queue(64, 8);
        push(&mut producer, 9, &[9])?;
        producer.closer().close();

        assert!(consumer.wait_for_work());
        assert_eq!(pop(&mut consumer), Some((9, vec![9])));
        assert!(!consumer.wait_for_work());
        Ok(())
    }

    #[test]
    fn threaded_fifo_across_many_wraps() -> MirrorResult<()> {
        const TASKS: u32 = 5_000;
        let (mut producer, mut consumer) = small_queue(97, 23);

        let reader = thread::spawn(move || {
            let mut seen = Vec::with_capacity(TASKS as usize);
            while consumer.wait_for_work() {
                while let Some(task) = consumer.dequeue() {
                    let payload = task.payload();
                    let expected_len = (seen.len() % 23) + 1;
                    assert_eq!(payload.len(), expected_len);
                    assert!(payload.iter().all(|&b| b == task.cmd()));
                    seen.push(task.cmd());
                    task.release();
                }
            }
            (seen, consumer.bytes_queued())
        });

        for i in 0..TASKS {
            let len = (i as usize % 23) + 1;
            let cmd = (i % 251) as u8;
            let mut writer = producer.allocate(len)?;
            writer.set_cmd(cmd);
            writer.payload_mut().fill(cmd);
            writer.commit();
        }
        let stats = producer.stats();
        producer.closer().close();

        let (seen, bytes_left) = reader.join().unwrap();
        assert_eq!(seen.len(), TASKS as usize);
        for (i, cmd) in seen.iter().enumerate() {
            assert_eq!(*cmd, (i % 251) as u8);
        }
        assert_eq!(bytes_left, 0);
        assert!(stats.wraps > 0);
        Ok(())
    }

    /// Park a consumer thread on an empty ring, push one task after it has
    /// had time to park, and return how long the task took to arrive.
    fn wake_latency(
        producer: &mut TaskProducer,
        mut consumer: TaskConsumer,
        payload: &[u8],
    ) -> MirrorResult<(Duration, TaskConsumer)> {
        let reader = thread::spawn(move || {
            loop {
                assert!(consumer.wait_for_work(), "queue closed unexpectedly");
                if let Some(task) = consumer.dequeue() {
                    task.release();
                    return (Instant::now(), consumer);
                }
            }
        });

        thread::sleep(Duration::from_millis(20));
        let pushed = Instant::now();
        push(producer, 7, payload)?;

        let (received, consumer) = reader.join().unwrap();
        Ok((received.saturating_duration_since(pushed), consumer))
    }

    #[test]
    fn commit_wakes_a_parked_consumer() -> MirrorResult<()> {
        let (mut producer, mut consumer) = small_queue(256, 16);
        for round in 0..3u8 {
            let (latency, back) = wake_latency(&mut producer, consumer, &[round; 16])?;
            consumer = back;
            assert!(
                latency < CONSUMER_PARK_TIMEOUT / 2,
                "round {round}: consumer slept {latency:?} past the commit"
            );
        }
        assert_eq!(producer.stats().wraps, 0);
        Ok(())
    }

    #[test]
    fn wrapping_commit_wakes_a_parked_consumer() -> MirrorResult<()> {
        let (mut producer, mut consumer) = small_queue(40, 10);
        push(&mut producer, 1, &[1; 10])?;
        push(&mut producer, 2, &[2; 10])?;
        assert!(pop(&mut consumer).is_some());
        assert!(pop(&mut consumer).is_some());

        let (latency, consumer) = wake_latency(&mut producer, consumer, &[3; 10])?;
        assert_eq!(producer.stats().wraps, 1);
        assert!(
            latency < CONSUMER_PARK_TIMEOUT / 2,
            "consumer slept {latency:?} past the wrapping commit"
        );
        assert_eq!(consumer.bytes_queued(), 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "outside 1..=")]
    fn empty_payload_is_rejected_at_allocation() {
        let (mut producer, _consumer) = small_queue(64, 8);
        let _ = producer.allocate(0);
    }
}
