use thiserror::Error;

use crate::model::{OperationId, TargetKey};

/// Everything the orchestration core can report.
///
/// Process and parser failures never escape the queue as `Err`: they are
/// stored on the operation as its terminal `Failed` state. The variants that
/// callers see directly are the synchronous rejections (`PackageConflict`,
/// `UnknownOperation`, ...) and the errors of the read/maintenance APIs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("failed to start `{program}`: {reason}")]
    SpawnFailure { program: String, reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("remote or package not found: {0}")]
    RemoteNotFound(String),

    #[error("{target} is busy with operation {active}")]
    PackageConflict { target: TargetKey, active: OperationId },

    #[error("ambiguous tool output: {0}")]
    ParseAmbiguous(String),

    #[error("command exited with status {code}: {summary}")]
    ProcessNonZeroExit {
        code: i32,
        summary: String,
        log_tail: Vec<String>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    #[error("operation {0} is not waiting for confirmation")]
    NoPendingConfirmation(OperationId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl CoreError {
    /// Map a spawn error to the matching variant. Spawn problems are reported
    /// immediately, never through an exit code.
    pub fn from_spawn(program: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CoreError::PermissionDenied(format!("cannot execute `{program}`: {err}"))
            }
            _ => CoreError::SpawnFailure {
                program: program.to_string(),
                reason: err.to_string(),
            },
        }
    }

    /// Captured output attached to the failure, if any.
    pub fn log_tail(&self) -> &[String] {
        match self {
            CoreError::ProcessNonZeroExit { log_tail, .. } => log_tail,
            _ => &[],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
