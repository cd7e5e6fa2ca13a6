use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::backend::{BusExecutor, FrameSource};
use crate::convert::BusPixelFormat;
use crate::diff::{DiffEngine, DiffMode, FieldParity};
use crate::env_config::{
    define_env_flag, env_var_keyword, env_var_positive_u64, env_var_u32,
};
use crate::error::{MirrorError, MirrorResult};
use crate::frame::{Frame, FrameLayout, FrameView};
use crate::merge::{MergePolicy, merge_spans};
use crate::protocol::DisplayProtocol;
use crate::queue::{QueueConfig, TASK_HEADER_BYTES, TaskProducer, TaskQueue};
use crate::span::{Span, SpanList};
use crate::streaming::{BusWorker, MirrorStats, MirrorStatsSnapshot};

define_env_flag!(enabled_unless(merge_enabled_by_env, "SNOW_MIRROR_DISABLE_MERGE"));

const IDLE_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// When a frame is diffed on one field of scanlines instead of all of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InterlacePolicy {
    #[default]
    Never,
    Always,
    /// Interlace while the bus backlog exceeds half a frame of wire bytes.
    Adaptive,
}

impl InterlacePolicy {
    pub(crate) fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "never" | "off" | "progressive" => Some(Self::Never),
            "always" | "on" => Some(Self::Always),
            "adaptive" | "auto" => Some(Self::Adaptive),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MirrorConfig {
    pub diff_mode: DiffMode,
    pub interlace: InterlacePolicy,
    /// Unchanged pixels the exact diff looks past before closing a span.
    pub coalesce_threshold: u32,
    /// Unchanged pixels a single span merge may add.
    pub merge_threshold: u32,
    pub merge_enabled: bool,
    /// Largest task payload. Defaults to one frame of wire pixels.
    pub max_task_bytes: Option<usize>,
    /// Ring size. Defaults to three frames of wire pixels.
    pub queue_bytes: Option<usize>,
    pub protocol: DisplayProtocol,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            diff_mode: DiffMode::Coarse,
            interlace: InterlacePolicy::Never,
            coalesce_threshold: 320,
            merge_threshold: 320,
            merge_enabled: true,
            max_task_bytes: None,
            queue_bytes: None,
            protocol: DisplayProtocol::default(),
        }
    }
}

impl MirrorConfig {
    /// Defaults overlaid with the `SNOW_MIRROR_*` environment knobs.
    /// Unrecognized values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(keyword) = env_var_keyword("SNOW_MIRROR_DIFF") {
            match DiffMode::from_keyword(&keyword) {
                Some(mode) => config.diff_mode = mode,
                None => warn!("ignoring SNOW_MIRROR_DIFF={keyword}"),
            }
        }
        if let Some(keyword) = env_var_keyword("SNOW_MIRROR_INTERLACE") {
            match InterlacePolicy::from_keyword(&keyword) {
                Some(policy) => config.interlace = policy,
                None => warn!("ignoring SNOW_MIRROR_INTERLACE={keyword}"),
            }
        }
        if let Some(keyword) = env_var_keyword("SNOW_MIRROR_PIXEL_FORMAT") {
            match BusPixelFormat::from_keyword(&keyword) {
                Some(format) => config.protocol = config.protocol.with_pixel_format(format),
                None => warn!("ignoring SNOW_MIRROR_PIXEL_FORMAT={keyword}"),
            }
        }
        if let Some(threshold) = env_var_u32("SNOW_MIRROR_COALESCE_THRESHOLD") {
            config.coalesce_threshold = threshold;
        }
        if let Some(threshold) = env_var_u32("SNOW_MIRROR_MERGE_THRESHOLD") {
            config.merge_threshold = threshold;
        }
        if let Some(bytes) = env_var_positive_u64("SNOW_MIRROR_MAX_TASK_BYTES") {
            config.max_task_bytes = usize::try_from(bytes).ok();
        }
        if let Some(bytes) = env_var_positive_u64("SNOW_MIRROR_QUEUE_BYTES") {
            config.queue_bytes = usize::try_from(bytes).ok();
        }
        config.merge_enabled = merge_enabled_by_env();
        config
    }

    /// Size the task queue for `layout`.
    pub fn queue_config(&self, layout: FrameLayout) -> MirrorResult<QueueConfig> {
        let bpp = self.protocol.bytes_per_pixel();
        let mut queue = QueueConfig::for_frame(layout, bpp)?;
        queue.max_payload_bytes = queue
            .max_payload_bytes
            .max(self.protocol.window_payload_len());

        match self.queue_bytes {
            Some(capacity_bytes) => {
                queue.capacity_bytes = capacity_bytes;
                queue.max_payload_bytes = queue
                    .max_payload_bytes
                    .min(QueueConfig::payload_limit(capacity_bytes));
            }
            None => {
                let floor = (queue.max_payload_bytes + TASK_HEADER_BYTES)
                    .checked_mul(3)
                    .ok_or(MirrorError::BufferOverflow)?;
                queue.capacity_bytes = queue.capacity_bytes.max(floor);
            }
        }
        if let Some(max_task_bytes) = self.max_task_bytes {
            queue.max_payload_bytes = max_task_bytes;
        }

        queue.validate()?;
        Ok(queue)
    }

    fn validate(&self) -> MirrorResult<()> {
        if self.max_task_bytes == Some(0) {
            return Err(MirrorError::InvalidConfig(
                "max_task_bytes must be > 0".into(),
            ));
        }
        if self.queue_bytes == Some(0) {
            return Err(MirrorError::InvalidConfig("queue_bytes must be > 0".into()));
        }
        Ok(())
    }
}

pub struct MirrorSessionBuilder {
    config: MirrorConfig,
}

impl MirrorSessionBuilder {
    pub fn new() -> Self {
        Self {
            config: MirrorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MirrorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_diff_mode(mut self, mode: DiffMode) -> Self {
        self.config.diff_mode = mode;
        self
    }

    pub fn with_interlace(mut self, policy: InterlacePolicy) -> Self {
        self.config.interlace = policy;
        self
    }

    pub fn with_coalesce_threshold(mut self, threshold: u32) -> Self {
        self.config.coalesce_threshold = threshold;
        self
    }

    pub fn with_merge_threshold(mut self, threshold: u32) -> Self {
        self.config.merge_threshold = threshold;
        self
    }

    pub fn with_merging(mut self, enabled: bool) -> Self {
        self.config.merge_enabled = enabled;
        self
    }

    pub fn with_max_task_bytes(mut self, bytes: usize) -> Self {
        self.config.max_task_bytes = Some(bytes);
        self
    }

    pub fn with_queue_bytes(mut self, bytes: usize) -> Self {
        self.config.queue_bytes = Some(bytes);
        self
    }

    pub fn with_protocol(mut self, protocol: DisplayProtocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Size the queue for `layout` and start the bus worker thread on
    /// `bus`.
    pub fn build<B>(self, layout: FrameLayout, bus: B) -> MirrorResult<MirrorSession>
    where
        B: BusExecutor + 'static,
    {
        let config = self.config;
        config.validate()?;
        let queue_config = config.queue_config(layout)?;
        config
            .protocol
            .check_layout(layout, queue_config.max_payload_bytes)?;

        let (width, height) = layout.dimensions();
        let shadow = Frame::new(width, height)?;
        let (producer, consumer) = TaskQueue::create(queue_config)?;
        let stats = Arc::new(MirrorStats::default());
        let worker = BusWorker::spawn(consumer, bus, stats.clone())?;

        // Pre-initialize the conversion pool so the first captured surface
        // doesn't pay the one-time cost.
        crate::convert::warmup();

        let bpp = config.protocol.bytes_per_pixel();
        info!(
            "mirror session {width}x{height}: diff={:?} interlace={:?} merge={} queue={}B max_task={}B",
            config.diff_mode,
            config.interlace,
            if config.merge_enabled {
                config.merge_threshold as i64
            } else {
                -1
            },
            queue_config.capacity_bytes,
            queue_config.max_payload_bytes,
        );

        Ok(MirrorSession {
            engine: DiffEngine::new(config.diff_mode, config.coalesce_threshold),
            merge_policy: MergePolicy {
                threshold: config.merge_threshold,
                max_task_bytes: Some(queue_config.max_payload_bytes),
                bytes_per_pixel: bpp,
            },
            adaptive_backlog_bytes: layout.pixel_count().saturating_mul(bpp) / 2,
            config,
            layout,
            shadow,
            shadow_valid: false,
            spans: SpanList::for_layout(layout),
            parity: FieldParity::Even,
            producer,
            worker,
            stats,
        })
    }
}

impl Default for MirrorSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of a mirroring pipeline: diffs submitted frames against
/// what the panel shows and queues the changed regions for the bus worker.
pub struct MirrorSession {
    config: MirrorConfig,
    engine: DiffEngine,
    merge_policy: MergePolicy,
    adaptive_backlog_bytes: usize,
    layout: FrameLayout,
    /// What the panel shows once the queue drains.
    shadow: Frame,
    /// Cleared until the first frame lands, and whenever a submit fails
    /// halfway, so the next frame is sent in full.
    shadow_valid: bool,
    spans: SpanList,
    parity: FieldParity,
    producer: TaskProducer,
    worker: BusWorker,
    stats: Arc<MirrorStats>,
}

impl MirrorSession {
    pub fn builder() -> MirrorSessionBuilder {
        MirrorSessionBuilder::new()
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Queue the differences between `frame` and the panel. Returns the
    /// number of spans queued.
    pub fn submit(&mut self, frame: &Frame) -> MirrorResult<usize> {
        self.submit_view(frame.view(), frame.metadata.force_full_refresh)
    }

    pub fn submit_view(
        &mut self,
        frame: FrameView<'_>,
        force_full_refresh: bool,
    ) -> MirrorResult<usize> {
        if frame.layout().dimensions() != self.layout.dimensions() {
            return Err(MirrorError::InvalidFrame(format!(
                "frame is {}x{}, session mirrors {}x{}",
                frame.width(),
                frame.height(),
                self.layout.width(),
                self.layout.height()
            )));
        }
        if self.producer.is_closed() {
            return Err(self.worker_gone());
        }
        self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);

        let full_refresh = !self.shadow_valid
            || force_full_refresh
            || self.engine.mode() == DiffMode::FullFrame;
        if full_refresh {
            self.spans.clear();
            self.spans.push(Span::full_frame(self.layout));
            self.stats.full_refreshes.fetch_add(1, Ordering::Relaxed);
            debug!("full refresh of {}x{}", frame.width(), frame.height());
        } else {
            let field = self.next_field();
            let started = Instant::now();
            self.engine
                .diff(&frame, &self.shadow.view(), field, &mut self.spans)?;
            if self.config.merge_enabled && self.spans.len() > 1 {
                let outcome = merge_spans(&mut self.spans, &self.merge_policy);
                self.stats
                    .merges
                    .fetch_add(u64::from(outcome.merges), Ordering::Relaxed);
            }
            self.stats.record_diff_latency(started.elapsed());
        }

        if self.spans.is_empty() {
            self.stats.frames_unchanged.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        }

        self.shadow_valid = false;
        for span in self.spans.iter() {
            if let Err(e) = self
                .config
                .protocol
                .enqueue_span(&mut self.producer, span, &frame)
            {
                return Err(match e {
                    MirrorError::QueueClosed => self.worker_gone(),
                    other => other,
                });
            }
            self.stats
                .pixels_queued
                .fetch_add(u64::from(span.size), Ordering::Relaxed);
        }

        if full_refresh {
            self.shadow.copy_from(&frame)?;
        } else {
            for span in self.spans.iter() {
                self.shadow.apply_span(&frame, span);
            }
        }
        self.shadow_valid = true;

        let emitted = self.spans.len();
        self.stats
            .spans_emitted
            .fetch_add(emitted as u64, Ordering::Relaxed);
        Ok(emitted)
    }

    /// Capture one frame from `source` into `frame` and submit it.
    /// Returns `false` when the source had nothing new.
    pub fn pump(&mut self, source: &mut dyn FrameSource, frame: &mut Frame) -> MirrorResult<bool> {
        if frame.layout().dimensions() != self.layout.dimensions() {
            frame.ensure_layout(self.layout)?;
        }
        if !source.capture_into(frame)? {
            return Ok(false);
        }
        self.submit(frame)?;
        Ok(true)
    }

    /// Queue a raw controller command behind any pending pixel data.
    pub fn enqueue_command(&mut self, cmd: u8, payload: &[u8]) -> MirrorResult<()> {
        match self
            .config
            .protocol
            .enqueue_command(&mut self.producer, cmd, payload)
        {
            Err(MirrorError::QueueClosed) => Err(self.worker_gone()),
            result => result,
        }
    }

    /// Send the next frame in full regardless of its contents.
    pub fn request_full_refresh(&mut self) {
        self.shadow_valid = false;
    }

    /// Ring bytes not yet driven onto the bus.
    pub fn backlog_bytes(&self) -> usize {
        self.producer.bytes_queued()
    }

    /// Block until the bus worker has driven every queued task or
    /// `timeout` passes. Returns whether the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> MirrorResult<bool> {
        let started = Instant::now();
        loop {
            if self.producer.bytes_queued() == 0 {
                return Ok(true);
            }
            if !self.worker.is_running() {
                return Err(self.worker_gone());
            }
            if started.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(IDLE_POLL_INTERVAL);
        }
    }

    pub fn stats(&self) -> MirrorStatsSnapshot {
        self.stats.snapshot(self.producer.stats())
    }

    /// Let the worker drain the queue, stop it, and return final stats.
    pub fn shutdown(mut self) -> MirrorResult<MirrorStatsSnapshot> {
        self.worker.stop()?;
        let stats = self.stats();
        info!(
            "mirror session stopped: {} frames, {} spans, {} tasks driven, {} bus errors",
            stats.frames_submitted, stats.spans_emitted, stats.tasks_driven, stats.bus_errors
        );
        Ok(stats)
    }

    fn next_field(&mut self) -> Option<FieldParity> {
        let interlace = match self.config.interlace {
            InterlacePolicy::Never => false,
            InterlacePolicy::Always => true,
            InterlacePolicy::Adaptive => {
                self.producer.bytes_queued() > self.adaptive_backlog_bytes
            }
        };
        if !interlace {
            return None;
        }
        let field = self.parity;
        self.parity = field.flipped();
        self.stats.interlaced_frames.fetch_add(1, Ordering::Relaxed);
        Some(field)
    }

    fn worker_gone(&self) -> MirrorError {
        error!("bus worker is no longer draining the task queue");
        MirrorError::WorkerDead
    }
}
