use thiserror::Error;

/// HTTP-style codes carried by coded run errors.
pub const CODE_BAD_REQUEST: u32 = 400;
pub const CODE_NOT_FOUND: u32 = 404;
pub const CODE_INTERNAL: u32 = 500;

#[derive(Error, Debug)]
pub enum PmError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("duplicate job id: {0}")]
    DuplicateId(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job is not running: {0}")]
    NotRunning(String),

    #[error("job not receiving signals: {0}")]
    SignalRejected(String),

    #[error("admission queue is closed")]
    QueueClosed,

    #[error("pid {0} is not registered")]
    UnknownPid(i32),

    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),

    #[error("invalid result format, expecting json, got level {0}")]
    InvalidResultFormat(u16),

    #[error("{message}")]
    Run { code: u32, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl PmError {
    /// A run error carrying an explicit status code.
    pub fn coded(code: u32, message: impl Into<String>) -> Self {
        PmError::Run {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::coded(CODE_NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::coded(CODE_BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::coded(CODE_INTERNAL, message)
    }

    /// Status code of the error, 0 when the error carries none.
    pub fn code(&self) -> u32 {
        match self {
            PmError::Run { code, .. } => *code,
            PmError::Spawn(err) if err.kind() == std::io::ErrorKind::NotFound => CODE_NOT_FOUND,
            _ => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, PmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_errors_keep_their_code() {
        assert_eq!(PmError::not_found("missing").code(), 404);
        assert_eq!(PmError::bad_request("bad").code(), 400);
        assert_eq!(PmError::internal("boom").code(), 500);
        assert_eq!(PmError::coded(1001, "exit").to_string(), "exit");
    }

    #[test]
    fn uncoded_errors_report_zero() {
        assert_eq!(PmError::QueueClosed.code(), 0);
        assert_eq!(PmError::UnknownCommand("x".into()).code(), 0);
    }

    #[test]
    fn missing_binary_spawn_is_not_found() {
        let err = PmError::Spawn(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(err.code(), 404);
        let err = PmError::Spawn(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(err.code(), 0);
    }
}
