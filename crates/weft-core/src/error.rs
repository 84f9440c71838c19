//! Error taxonomy shared across the engine.
//!
//! Every failure a task can experience maps onto one of these kinds; the
//! scheduler's retry policy keys off [`Error::is_retryable`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Work-directory staging failed. `retryable` distinguishes I/O
    /// failures from policy violations (forbidden entrynames etc.).
    #[error("staging failed: {message}")]
    Staging { message: String, retryable: bool },

    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A worker lease expired and the task was reaped.
    #[error("lease lost")]
    LeaseLost,

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("internal error: {0}")]
    System(String),
}

impl Error {
    pub fn staging(message: impl Into<String>) -> Self {
        Error::Staging {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn staging_io(message: impl Into<String>) -> Self {
        Error::Staging {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether the retry policy may re-queue a task that failed with
    /// this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::Validation(_) | Error::Conflict(_) => false,
            Error::Staging { retryable, .. } => *retryable,
            Error::Exec(e) => e.is_retryable(),
            Error::LeaseLost => true,
            Error::Rpc(e) => e.is_retryable(),
            Error::System(_) => true,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::System(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an executor run.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub message: String,
    /// Exit code of the child process, when one ran.
    pub exit_code: Option<i32>,
}

impl ExecError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn non_zero_exit(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ExecErrorKind::NonZeroExit,
            message: message.into(),
            exit_code: Some(code),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Transport, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ExecErrorKind::Transport | ExecErrorKind::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    NonZeroExit,
    Timeout,
    Cancelled,
    Transport,
}

impl std::fmt::Display for ExecErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecErrorKind::NonZeroExit => write!(f, "non-zero exit"),
            ExecErrorKind::Timeout => write!(f, "timeout"),
            ExecErrorKind::Cancelled => write!(f, "cancelled"),
            ExecErrorKind::Transport => write!(f, "transport error"),
        }
    }
}

/// Error returned by a remote JSON-RPC service.
#[derive(Debug, Error)]
#[error("rpc error {code} ({name}): {message}")]
pub struct RpcError {
    pub code: i64,
    pub name: String,
    pub message: String,
}

impl RpcError {
    /// Codes the remote service may return transiently.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, -32000 | 429 | 500 | 502 | 503 | 504)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_retryability_follows_kind() {
        let nz = ExecError::new(ExecErrorKind::NonZeroExit, "exit 1");
        let to = ExecError::new(ExecErrorKind::Timeout, "deadline");
        let tr = ExecError::transport("connection reset");
        assert!(!Error::from(nz).is_retryable());
        assert!(!Error::from(to).is_retryable());
        assert!(Error::from(tr).is_retryable());
    }

    #[test]
    fn staging_policy_violations_are_terminal() {
        assert!(!Error::staging("absolute entryname forbidden").is_retryable());
        assert!(Error::staging_io("read failed").is_retryable());
    }

    #[test]
    fn rpc_retry_codes() {
        for code in [-32000, 429, 500, 502, 503, 504] {
            let err = RpcError {
                code,
                name: "ServerError".into(),
                message: "busy".into(),
            };
            assert!(err.is_retryable(), "code {code} should retry");
        }
        let terminal = RpcError {
            code: 400,
            name: "InvalidParams".into(),
            message: "bad".into(),
        };
        assert!(!terminal.is_retryable());
    }
}
