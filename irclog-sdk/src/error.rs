//! Error types shared across the SDK.

/// Errors that unwind out of a session tick or the client loop.
///
/// Everything except [`Error::Interrupted`] is a connection fault: the client
/// reports it, backs off, and moves on to the next server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("connection timed out")]
    Timeout,

    #[error("incoming line exceeds {limit} bytes without a delimiter")]
    LineTooLong { limit: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A handler or observer failed.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the deliberate-interrupt case, which must never be retried.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A received line could not be decoded with any of the configured encodings.
#[derive(Debug, thiserror::Error)]
#[error("could not decode {} byte line with any supported encoding", line.len())]
pub struct DecodeError {
    /// The undecodable line, without its delimiter.
    pub line: Vec<u8>,
}
