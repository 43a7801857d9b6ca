//! Error taxonomy for the wire protocol layer.
//!
//! Connection-level failures (`Io`, `MalformedProtocol`) are fatal to the
//! connection: the protocol has no resynchronization point, so callers must
//! drop the connection and reconnect. `RemoteOperation` is a well-formed
//! `failure` reply from the peer and leaves the connection usable.

use std::fmt;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Which raw transfer direction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Connect,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => write!(f, "read"),
            IoOp::Write => write!(f, "write"),
            IoOp::Connect => write!(f, "connect"),
        }
    }
}

/// Errors that can occur on a protocol connection.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Transport failure. Always fatal to the connection.
    #[error("{op} failed on connection: {source}")]
    Io {
        op: IoOp,
        #[source]
        source: std::io::Error,
    },

    /// Undecodable or out-of-contract data from the peer. Always fatal.
    #[error("malformed network data: {0}")]
    MalformedProtocol(String),

    /// Explicit authentication rejection by the peer. The caller may retry
    /// with different credentials or another mechanism.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A well-formed `failure` reply carrying the peer's error chain.
    /// Does not invalidate the connection.
    #[error("remote operation failed: {0}")]
    RemoteOperation(#[from] RemoteErrorChain),

    /// The local caller cancelled an edit drive. Clean termination.
    #[error("edit drive aborted by caller")]
    AbortedByCaller,
}

impl WireError {
    pub(crate) fn io(op: IoOp, source: std::io::Error) -> Self {
        WireError::Io { op, source }
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        WireError::MalformedProtocol(msg.into())
    }

    /// True if the connection must be dropped after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::Io { .. } | WireError::MalformedProtocol(_))
    }
}

/// One error record from a `failure` reply: `( code message file line )`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: u64,
    pub message: String,
    pub file: String,
    pub line: u64,
}

/// An ordered chain of remote error records, outermost first, exactly as the
/// peer reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteErrorChain(pub Vec<RemoteError>);

impl RemoteErrorChain {
    /// A single-record chain, for locally generated failure replies.
    pub fn single(code: u64, message: impl Into<String>) -> Self {
        RemoteErrorChain(vec![RemoteError {
            code,
            message: message.into(),
            file: String::new(),
            line: 0,
        }])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteError> {
        self.0.iter()
    }
}

impl fmt::Display for RemoteErrorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; caused by: ")?;
            }
            write!(f, "{} (code {})", err.message, err.code)?;
            if !err.file.is_empty() {
                write!(f, " [{}:{}]", err.file, err.line)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RemoteErrorChain {}
