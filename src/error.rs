use thiserror::Error;

/// Errors raised by the caller-visible surface of this crate.
///
/// Wire-level faults (short datagrams, bad checksums) never reach here --
/// they are logged and dropped inside `session`/`emulator`, which treat the
/// underlying link as unreliable by definition.
#[derive(Debug, Error)]
pub enum RdtError {
    #[error("invalid socket address {0:?}: {1}")]
    InvalidAddress(String, std::net::AddrParseError),

    #[error("file {0:?} not found")]
    FileNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RdtError>;
