use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Identity of a skeleton container, used to chain `DataNotLoaded` back to
/// the container that raised it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

impl ContainerId {
    /// Allocate a fresh id. Ids increase monotonically within a process.
    pub fn next() -> Self {
        Self(NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container#{}", self.0)
    }
}

/// A read touched a key (or subtree) that is only held as a reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataNotLoaded {
    pub parent: ContainerId,
    pub key: String,
}

impl DataNotLoaded {
    pub fn new(parent: ContainerId, key: &impl fmt::Debug) -> Self {
        Self {
            parent,
            key: format!("{:?}", key),
        }
    }

    /// Whether this error was raised by `parent` for `key`.
    pub fn is_for(&self, parent: ContainerId, key: &impl fmt::Debug) -> bool {
        self.parent == parent && self.key == format!("{:?}", key)
    }
}

impl fmt::Display for DataNotLoaded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data not loaded: {} in {}", self.key, self.parent)
    }
}

/// Malformed bytes encountered while decoding.
#[derive(Debug)]
pub struct DataFormatError {
    pub message: String,
    pub value: Option<String>,
    pub parent: Option<String>,
    pub key: Option<String>,
    pub cause: Option<Box<BindexError>>,
}

impl DataFormatError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            value: None,
            parent: None,
            key: None,
            cause: None,
        }
    }

    pub fn with_value(mut self, value: impl fmt::Debug) -> Self {
        self.value = Some(format!("{:?}", value));
        self
    }

    pub fn with_parent(mut self, parent: impl fmt::Display) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_key(mut self, key: impl fmt::Debug) -> Self {
        self.key = Some(format!("{:?}", key));
        self
    }

    pub fn with_cause(mut self, cause: BindexError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for DataFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(value) = &self.value {
            write!(f, " (value: {})", value)?;
        }
        if let Some(parent) = &self.parent {
            write!(f, " (parent: {})", parent)?;
        }
        if let Some(key) = &self.key {
            write!(f, " (key: {})", key)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Failure (or benign short-circuit) of an archiving, codec or merge task.
#[derive(Debug)]
pub struct TaskAbort {
    pub message: String,
    pub cause: Option<Box<BindexError>>,
    is_error: bool,
}

impl TaskAbort {
    /// A genuine failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            is_error: true,
        }
    }

    /// The task was found to be complete already. Not an error.
    pub fn complete(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            is_error: false,
        }
    }

    pub fn caused_by(mut self, cause: BindexError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// Copy suitable for reporting the same abort to several observers.
    /// The cause chain is flattened into the message.
    pub fn duplicate(&self) -> Self {
        let message = match &self.cause {
            Some(cause) => format!("{}: {}", self.message, cause),
            None => self.message.clone(),
        };
        Self {
            message,
            cause: None,
            is_error: self.is_error,
        }
    }
}

impl fmt::Display for TaskAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error {
            write!(f, "task aborted: {}", self.message)?;
        } else {
            write!(f, "task already complete: {}", self.message)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Main error type for bindex operations
#[derive(Error, Debug)]
pub enum BindexError {
    #[error("{0}")]
    DataNotLoaded(DataNotLoaded),

    #[error("Data format error: {0}")]
    DataFormat(DataFormatError),

    #[error("{0}")]
    TaskAbort(TaskAbort),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for bindex operations
pub type Result<T> = std::result::Result<T, BindexError>;

impl From<DataNotLoaded> for BindexError {
    fn from(err: DataNotLoaded) -> Self {
        BindexError::DataNotLoaded(err)
    }
}

impl From<DataFormatError> for BindexError {
    fn from(err: DataFormatError) -> Self {
        BindexError::DataFormat(err)
    }
}

impl From<TaskAbort> for BindexError {
    fn from(err: TaskAbort) -> Self {
        BindexError::TaskAbort(err)
    }
}

impl BindexError {
    /// The caller should inflate and retry.
    pub fn is_not_loaded(&self) -> bool {
        matches!(self, BindexError::DataNotLoaded(_))
    }

    pub fn not_loaded(&self) -> Option<&DataNotLoaded> {
        match self {
            BindexError::DataNotLoaded(err) => Some(err),
            _ => None,
        }
    }

    /// Benign abort: the work had already been done.
    pub fn is_already_complete(&self) -> bool {
        matches!(self, BindexError::TaskAbort(abort) if !abort.is_error())
    }

    /// Check if this error indicates a transient failure that could be retried
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BindexError::DataNotLoaded(_) | BindexError::Io(_)
        ) || matches!(self, BindexError::TaskAbort(abort) if abort.is_error())
    }

    /// Wrap a storage-level failure as a task abort.
    pub fn into_abort(self, message: impl Into<String>) -> BindexError {
        match self {
            BindexError::TaskAbort(_) | BindexError::DataNotLoaded(_) => self,
            other => BindexError::TaskAbort(TaskAbort::failed(message).caused_by(other)),
        }
    }
}
