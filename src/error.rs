use std::io;
use std::path::PathBuf;

/// Crate-wide error type. Every surfaced failure in the Distributed Cache
/// Core round-trips through one of these variants; internal recoveries
/// (retried I/O, single-peer piece mismatches) never reach here.
#[derive(Debug, thiserror::Error)]
pub enum DccError {
    #[error("source file missing: {path}")]
    SourceMissing { path: PathBuf },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("invalid canonical form: {message}")]
    InvalidCanonicalForm { message: String },

    #[error("io error: {source}")]
    IoError {
        #[source]
        source: io::Error,
    },

    #[error("content id is blocked: {reason}")]
    Blocked { reason: String },

    #[error("no peers found within policy window")]
    PeerDiscoveryTimeout,

    #[error("piece {piece_index} failed integrity check after exhausting retry budget")]
    IntegrityMismatch { piece_index: u64 },

    #[error("gateway protocol error: {message}")]
    GatewayProtocolError { message: String },

    #[error("operation canceled")]
    Canceled,

    #[error("shutdown in progress, new operations are refused")]
    ShutdownInProgress,
}

impl From<io::Error> for DccError {
    fn from(source: io::Error) -> Self {
        DccError::IoError { source }
    }
}

pub type DccResult<T> = Result<T, DccError>;
