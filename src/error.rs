use std::fmt;

#[derive(Debug)]
pub enum MirrorError {
    InvalidConfig(String),

    /// Frame dimensions, stride or pixel storage don't match what the
    /// operation expects (e.g. diffing two frames of different layouts).
    InvalidFrame(String),

    BufferOverflow,

    /// The task queue cannot hold a task of this size even when empty.
    /// Raised while building the queue, never per task at runtime.
    TaskTooLarge {
        payload_bytes: usize,
        max_payload_bytes: usize,
    },

    /// The task queue was closed while the producer was waiting on it.
    QueueClosed,

    WorkerDead,

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorErrorClass {
    InvalidInput,
    Transient,
    Fatal,
}

impl MirrorError {
    pub fn class(&self) -> MirrorErrorClass {
        match self {
            Self::InvalidConfig(_) | Self::InvalidFrame(_) | Self::TaskTooLarge { .. } => {
                MirrorErrorClass::InvalidInput
            }
            Self::QueueClosed => MirrorErrorClass::Transient,
            Self::BufferOverflow | Self::WorkerDead | Self::Platform(_) => MirrorErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), MirrorErrorClass::Transient)
    }

    /// Create a string-based copy of this error suitable for sending
    /// through channels. The `Platform` variant loses its inner
    /// `anyhow::Error` chain and becomes a formatted string.
    pub fn to_sendable(&self) -> Self {
        match self {
            Self::InvalidConfig(s) => Self::InvalidConfig(s.clone()),
            Self::InvalidFrame(s) => Self::InvalidFrame(s.clone()),
            Self::BufferOverflow => Self::BufferOverflow,
            Self::TaskTooLarge {
                payload_bytes,
                max_payload_bytes,
            } => Self::TaskTooLarge {
                payload_bytes: *payload_bytes,
                max_payload_bytes: *max_payload_bytes,
            },
            Self::QueueClosed => Self::QueueClosed,
            Self::WorkerDead => Self::WorkerDead,
            Self::Platform(inner) => Self::Platform(anyhow::anyhow!("{inner:#}")),
        }
    }
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(message) => write!(f, "invalid mirror configuration: {message}"),
            Self::InvalidFrame(message) => write!(f, "invalid frame: {message}"),
            Self::BufferOverflow => write!(f, "frame buffer size overflow"),
            Self::TaskTooLarge {
                payload_bytes,
                max_payload_bytes,
            } => write!(
                f,
                "task payload of {payload_bytes} bytes exceeds the queue limit of {max_payload_bytes} bytes"
            ),
            Self::QueueClosed => write!(f, "task queue was closed"),
            Self::WorkerDead => write!(f, "bus worker is not running"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;
