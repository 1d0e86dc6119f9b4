//! Error types for msspi.

use std::io;

/// Errors produced by msspi sessions, engines and transports.
#[derive(Debug, thiserror::Error)]
pub enum MsspiError {
    #[error("engine error: {0}")]
    Engine(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("config error: {0}")]
    Config(String),

    /// The connection was closed (or never produced a more specific error).
    #[error("connection closed")]
    Closed,

    /// The peer ended the byte stream.
    #[error("end of stream")]
    Eof,

    #[error("operation timed out")]
    Timeout,

    /// The engine stopped accepting bytes part way through a write.
    #[error("short write: {written} bytes accepted")]
    ShortWrite {
        written: usize,
        #[source]
        source: Box<MsspiError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl MsspiError {
    /// Whether this error means "no progress before the deadline" rather than
    /// a hard failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether this error marks the end of the byte stream.
    pub fn is_eof(&self) -> bool {
        match self {
            Self::Eof => true,
            Self::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, MsspiError>;
