use std::sync::{Arc, Mutex};

use crate::error::{MirrorError, MirrorResult};
use crate::frame::{Frame, FrameLayout};
use crate::protocol::DisplayProtocol;
use crate::queue::Task;

/// Executes tasks on the physical display bus. Runs on the bus worker
/// thread; each call must finish the whole task before returning.
pub trait BusExecutor: Send {
    fn drive(&mut self, task: &Task<'_>) -> MirrorResult<()>;

    /// Called once when the worker drains its last task and exits.
    fn finish(&mut self) -> MirrorResult<()> {
        Ok(())
    }
}

/// Supplies frames to mirror, typically from a GPU snapshot API.
pub trait FrameSource {
    /// Capture into `frame`. [`MirrorSession::pump`] has already sized it
    /// to the session layout. Returns `false` when no new frame was
    /// available.
    ///
    /// [`MirrorSession::pump`]: crate::session::MirrorSession::pump
    fn capture_into(&mut self, frame: &mut Frame) -> MirrorResult<bool>;
}

impl<B: BusExecutor + ?Sized> BusExecutor for Box<B> {
    fn drive(&mut self, task: &Task<'_>) -> MirrorResult<()> {
        (**self).drive(task)
    }

    fn finish(&mut self) -> MirrorResult<()> {
        (**self).finish()
    }
}

/// Discards every task.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBus;

impl BusExecutor for NullBus {
    fn drive(&mut self, _task: &Task<'_>) -> MirrorResult<()> {
        Ok(())
    }
}

/// A task as seen by [`RecordingBus`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedTask {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

/// Keeps a copy of every driven task. Clones share the same log, so a
/// test can keep one handle and give the other to the session.
#[derive(Clone, Debug, Default)]
pub struct RecordingBus {
    log: Arc<Mutex<Vec<RecordedTask>>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<RecordedTask> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn take(&self) -> Vec<RecordedTask> {
        self.log
            .lock()
            .map(|mut log| std::mem::take(&mut *log))
            .unwrap_or_default()
    }
}

impl BusExecutor for RecordingBus {
    fn drive(&mut self, task: &Task<'_>) -> MirrorResult<()> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| MirrorError::Platform(anyhow::anyhow!("recording bus log poisoned")))?;
        log.push(RecordedTask {
            cmd: task.cmd(),
            payload: task.payload().to_vec(),
        });
        Ok(())
    }
}

#[derive(Debug)]
struct PanelState {
    pixels: Frame,
    columns: (u32, u32),
    rows: (u32, u32),
    tasks_driven: u64,
    unknown_commands: u64,
}

/// Emulates a controller's frame memory: tracks the column/row window and
/// fills it in row-major order on pixel writes. Clones share one panel.
///
/// Only RGB565 bus encoding is understood.
#[derive(Clone, Debug)]
pub struct PanelSimulator {
    protocol: DisplayProtocol,
    state: Arc<Mutex<PanelState>>,
}

impl PanelSimulator {
    pub fn new(layout: FrameLayout, protocol: DisplayProtocol) -> MirrorResult<Self> {
        let (width, height) = layout.dimensions();
        Ok(Self {
            protocol,
            state: Arc::new(Mutex::new(PanelState {
                pixels: Frame::new(width, height)?,
                columns: (0, width - 1),
                rows: (0, height - 1),
                tasks_driven: 0,
                unknown_commands: 0,
            })),
        })
    }

    fn lock(&self) -> MirrorResult<std::sync::MutexGuard<'_, PanelState>> {
        self.state
            .lock()
            .map_err(|_| MirrorError::Platform(anyhow::anyhow!("panel simulator state poisoned")))
    }

    /// Copy of the panel contents.
    pub fn snapshot(&self) -> MirrorResult<Frame> {
        let state = self.lock()?;
        let mut copy = Frame::with_layout(state.pixels.layout())?;
        copy.copy_from(&state.pixels.view())?;
        Ok(copy)
    }

    pub fn tasks_driven(&self) -> u64 {
        self.lock().map(|state| state.tasks_driven).unwrap_or(0)
    }

    pub fn unknown_commands(&self) -> u64 {
        self.lock().map(|state| state.unknown_commands).unwrap_or(0)
    }

    /// Whether the panel shows exactly `frame`.
    pub fn matches(&self, frame: &Frame) -> MirrorResult<bool> {
        let state = self.lock()?;
        if state.pixels.dimensions() != frame.dimensions() {
            return Ok(false);
        }
        Ok((0..frame.height()).all(|y| state.pixels.row(y) == frame.row(y)))
    }

    fn window(&self, payload: &[u8], limit: u32) -> MirrorResult<(u32, u32)> {
        let (start, end) = self.protocol.decode_window(payload).ok_or_else(|| {
            MirrorError::Platform(anyhow::anyhow!(
                "malformed window payload of {} bytes",
                payload.len()
            ))
        })?;
        let (start, end) = (u32::from(start), u32::from(end));
        if start > end || end >= limit {
            return Err(MirrorError::Platform(anyhow::anyhow!(
                "window {start}..={end} outside 0..{limit}"
            )));
        }
        Ok((start, end))
    }
}

impl BusExecutor for PanelSimulator {
    fn drive(&mut self, task: &Task<'_>) -> MirrorResult<()> {
        let protocol = self.protocol;
        let mut state = self.lock()?;
        state.tasks_driven += 1;
        let (width, height) = state.pixels.dimensions();
        let cmd = task.cmd();

        if cmd == protocol.set_column {
            let columns = self.window(task.payload(), width)?;
            state.columns = columns;
        } else if cmd == protocol.set_row {
            let rows = self.window(task.payload(), height)?;
            state.rows = rows;
        } else if cmd == protocol.write_pixels {
            let ((x0, x1), (y0, y1)) = (state.columns, state.rows);
            let window_width = (x1 - x0 + 1) as usize;
            let window_pixels = window_width * (y1 - y0 + 1) as usize;
            let samples = task.payload().chunks_exact(2);
            for (index, bytes) in samples.take(window_pixels).enumerate() {
                let x = x0 + (index % window_width) as u32;
                let y = y0 + (index / window_width) as u32;
                state
                    .pixels
                    .set_pixel(x, y, u16::from_be_bytes([bytes[0], bytes[1]]));
            }
        } else {
            state.unknown_commands += 1;
        }
        Ok(())
    }
}
