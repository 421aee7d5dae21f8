use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The kind of object a lookup or uniqueness check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Object {
    SubmissionQueue,
    CompletionQueue,
    Command,
    InterruptLine,
    MetadataBuffer,
    MetadataPool,
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Object::SubmissionQueue => "submission queue",
            Object::CompletionQueue => "completion queue",
            Object::Command => "command",
            Object::InterruptLine => "interrupt line",
            Object::MetadataBuffer => "metadata buffer",
            Object::MetadataPool => "metadata pool",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by every harness operation.
///
/// Each variant maps to a fixed negative errno through [`Error::errno`]; that
/// value is what the control-request router hands back to the test program.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{object} {id} not found")]
    NotFound { object: Object, id: u32 },

    /// A completion entry named a submission queue or command id the harness
    /// is not tracking.
    #[error("completion references unknown slot: sqid={sqid} cid={cid:?}")]
    BadSlot { sqid: u16, cid: Option<u16> },

    #[error("{object} {id} already exists")]
    AlreadyExists { object: Object, id: u32 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("submission queue {sqid} is full")]
    QueueFull { sqid: u16 },

    #[error("timed out after {waited_ms} ms waiting for {what}")]
    Timeout { what: &'static str, waited_ms: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Reaping stopped early. `reaped` entries were copied out (including the
    /// one that triggered `source`) and the completion queue head moved past
    /// them.
    #[error("reaped {reaped} entries before failing: {source}")]
    PartialReap {
        reaped: u32,
        #[source]
        source: Box<Error>,
    },
}

mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const EBADSLT: i32 = 57;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ETIMEDOUT: i32 = 110;
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn not_found(object: Object, id: impl Into<u32>) -> Self {
        Error::NotFound {
            object,
            id: id.into(),
        }
    }

    pub(crate) fn exists(object: Object, id: impl Into<u32>) -> Self {
        Error::AlreadyExists {
            object,
            id: id.into(),
        }
    }

    /// Negative Linux errno for this error.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::InvalidArgument(_) => errno::EINVAL,
            Error::NotFound { .. } => errno::ENOENT,
            Error::BadSlot { .. } => errno::EBADSLT,
            Error::AlreadyExists { .. } => errno::EEXIST,
            Error::ResourceExhausted(_) => errno::ENOMEM,
            Error::QueueFull { .. } => errno::EBUSY,
            Error::Timeout { .. } => errno::ETIMEDOUT,
            Error::ProtocolViolation(_) => errno::EPERM,
            Error::Unsupported(_) => errno::EOPNOTSUPP,
            Error::PartialReap { source, .. } => return source.errno(),
        };
        -code
    }

    /// True when the device or the harness bookkeeping is inconsistent.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Error::ProtocolViolation(_) | Error::BadSlot { .. } => true,
            Error::PartialReap { source, .. } => source.is_protocol_violation(),
            _ => false,
        }
    }

    /// Entries reaped before the error, when the error came out of a reap.
    pub fn partial_count(&self) -> Option<u32> {
        match self {
            Error::PartialReap { reaped, .. } => Some(*reaped),
            _ => None,
        }
    }
}

/// Failures reported by the host platform collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("bad address {addr:#x} (len {len})")]
    Fault { addr: u64, len: usize },

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("platform does not support {0}")]
    Unsupported(&'static str),
}

impl From<PlatformError> for Error {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Unsupported(what) => Error::Unsupported(what.to_string()),
            other => Error::ResourceExhausted(other.to_string()),
        }
    }
}
