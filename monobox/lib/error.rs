use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a monobox-related operation.
pub type MonoboxResult<T> = Result<T, MonoboxError>;

/// An error that occurred during a sandbox-controller operation.
#[derive(Debug, Error)]
pub enum MonoboxError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A permanently invalid object was submitted; retrying cannot help.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced object does not exist in the resource store.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// The resource kind that was looked up.
        kind: String,
        /// The name of the missing object.
        name: String,
    },

    /// A create collided with an existing object of the same name.
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// The resource kind that was created.
        kind: String,
        /// The name that collided.
        name: String,
    },

    /// A write lost against a concurrent writer; re-read and retry.
    #[error("conflicting write on {kind} {name}")]
    Conflict {
        /// The resource kind that was written.
        kind: String,
        /// The name of the contended object.
        name: String,
    },

    /// A transient control-plane or network failure.
    #[error("store error: {0}")]
    Store(String),

    /// A pool had no ready, unclaimed member to hand out.
    #[error("no sandbox available in pool '{0}'")]
    NoSandboxAvailable(String),

    /// An operation required a running sandbox.
    #[error("sandbox {name} is not running (phase: {phase})")]
    SandboxNotRunning {
        /// The sandbox that was targeted.
        name: String,
        /// The phase it was actually in.
        phase: String,
    },

    /// A sandbox status carries no backing pod name.
    #[error("sandbox {0} has no backing pod recorded")]
    MissingPod(String),

    /// A sandbox reached Terminated while a caller was waiting on it.
    #[error("sandbox {name} terminated while waiting ({message})")]
    SandboxTerminated {
        /// The sandbox that terminated.
        name: String,
        /// The status message recorded at termination.
        message: String,
    },

    /// A command inside the sandbox exited nonzero.
    #[error("command failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        /// The exit code reported by the container.
        exit_code: i32,
        /// Captured standard error output.
        stderr: String,
    },

    /// A bounded wait expired before the condition held.
    #[error("timed out after {secs}s waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// The wait budget that expired.
        secs: u64,
    },

    /// An exec working directory failed validation.
    #[error("invalid working directory: {0}")]
    InvalidWorkingDir(String),

    /// A file path for upload or download failed validation.
    #[error("invalid file path: {0}")]
    InvalidPath(String),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MonoboxError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> MonoboxError {
        MonoboxError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates a not-found error for the given kind and name.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> MonoboxError {
        MonoboxError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates an already-exists error for the given kind and name.
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> MonoboxError {
        MonoboxError::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates a conflict error for the given kind and name.
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> MonoboxError {
        MonoboxError::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Whether this error means the referenced object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MonoboxError::NotFound { .. })
    }

    /// Whether this error means a concurrent writer won and the caller should re-read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MonoboxError::Conflict { .. })
    }

    /// Whether this error means an object of that name already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, MonoboxError::AlreadyExists { .. })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `MonoboxResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> MonoboxResult<T> {
    Result::Ok(value)
}

/// Collapses a not-found error into `Ok(None)`.
///
/// Cleanup paths delete objects that may already be gone; absence is success
/// there, while any other failure still propagates.
pub fn ignore_not_found<T>(result: MonoboxResult<T>) -> MonoboxResult<Option<T>> {
    match result {
        Result::Ok(value) => Result::Ok(Some(value)),
        Err(e) if e.is_not_found() => Result::Ok(None),
        Err(e) => Err(e),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_not_found_passes_values_through() {
        let ok: MonoboxResult<u32> = Ok(7);
        assert_eq!(ignore_not_found(ok).unwrap(), Some(7));
    }

    #[test]
    fn test_ignore_not_found_collapses_absence() {
        let missing: MonoboxResult<u32> = Err(MonoboxError::not_found("pod", "gone"));
        assert_eq!(ignore_not_found(missing).unwrap(), None);
    }

    #[test]
    fn test_ignore_not_found_propagates_other_errors() {
        let failed: MonoboxResult<u32> = Err(MonoboxError::Store("boom".into()));
        assert!(ignore_not_found(failed).is_err());
    }

    #[test]
    fn test_error_classification_helpers() {
        assert!(MonoboxError::not_found("sandbox", "a").is_not_found());
        assert!(MonoboxError::conflict("sandbox", "a").is_conflict());
        assert!(!MonoboxError::Store("x".into()).is_not_found());
    }
}
