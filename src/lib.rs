pub mod backend;
pub mod convert;
pub mod diff;
pub(crate) mod env_config;
pub mod error;
pub mod frame;
pub mod merge;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod span;
pub mod streaming;

use backend::BusExecutor;
use frame::Frame;

pub use backend::{FrameSource, NullBus, PanelSimulator, RecordedTask, RecordingBus};
pub use convert::{BusPixelFormat, SurfacePixelFormat};
pub use diff::{DiffEngine, DiffMode, FieldParity};
pub use error::{MirrorError, MirrorErrorClass, MirrorResult};
pub use frame::{FrameLayout, FrameMetadata, FrameView};
pub use merge::{MergeOutcome, MergePolicy, merge_spans};
pub use protocol::DisplayProtocol;
pub use queue::{QueueCloser, QueueConfig, QueueStats, Task, TaskConsumer, TaskProducer, TaskQueue};
pub use session::{InterlacePolicy, MirrorConfig, MirrorSession, MirrorSessionBuilder};
pub use span::{Span, SpanList};
pub use streaming::{MirrorStats, MirrorStatsSnapshot};

/// Send one whole frame to `bus` with the environment's configuration and
/// wait for the bus to finish.
pub fn mirror_once<B>(frame: &Frame, bus: B) -> MirrorResult<MirrorStatsSnapshot>
where
    B: BusExecutor + 'static,
{
    let mut session = MirrorSession::builder()
        .with_config(MirrorConfig::from_env())
        .build(frame.layout(), bus)?;
    session.submit(frame)?;
    session.shutdown()
}
