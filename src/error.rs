use thiserror::Error;

/// Error taxonomy for the replication pipeline.
///
/// Numeric codes follow the scheme used in log output: 1xxxx configuration
/// and runtime failures, 2xxxx persisted-state data errors, 3xxxx config
/// semantics, 5xxxx internal invariants, 6xxxx recoverable redo anomalies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error [{code}]: {message}")]
    Config { code: u32, message: String },

    #[error("data error [{code}]: {message}")]
    Data { code: u32, message: String },

    #[error("runtime error [{code}]: {message}")]
    Runtime { code: u32, message: String },

    #[error("redo log error [{code}]: {message}")]
    Redo { code: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("shutdown requested")]
    Shutdown,
}

impl Error {
    pub fn config(code: u32, message: impl Into<String>) -> Self {
        Error::Config { code, message: message.into() }
    }

    pub fn data(code: u32, message: impl Into<String>) -> Self {
        Error::Data { code, message: message.into() }
    }

    pub fn runtime(code: u32, message: impl Into<String>) -> Self {
        Error::Runtime { code, message: message.into() }
    }

    pub fn redo(code: u32, message: impl Into<String>) -> Self {
        Error::Redo { code, message: message.into() }
    }

    /// Redo anomalies are contained per record; everything else halts
    /// replication.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Redo { .. })
    }

    pub fn code(&self) -> u32 {
        match self {
            Error::Config { code, .. }
            | Error::Data { code, .. }
            | Error::Runtime { code, .. }
            | Error::Redo { code, .. } => *code,
            Error::Io(_) => 10013,
            Error::Serialization(_) => 20001,
            Error::Shutdown => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redo_errors_are_recoverable() {
        assert!(!Error::redo(60002, "bad numeric").is_fatal());
        assert!(Error::runtime(10017, "out of memory").is_fatal());
        assert!(Error::config(10001, "missing file").is_fatal());
    }

    #[test]
    fn codes_surface() {
        assert_eq!(Error::data(20003, "bad state file").code(), 20003);
        assert_eq!(Error::Shutdown.code(), 0);
    }
}
