use std::io;

use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failures of the dispatch protocol, on both the client and the server side.
///
/// Server-side failures never travel across the network as such: the router turns them into an
///  error reply or drops the datagram. Client-side failures are returned to the caller, one
///  variant per stage of the round trip.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no encryption key is configured")]
    KeyNotConfigured,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("remote operation failed: {0}")]
    RemoteOperationFailed(String),

    #[error("orchestration API or encryption key is not configured")]
    NotConfigured,

    #[error("can not encrypt request: {0}")]
    Encryption(#[source] Box<DispatchError>),

    #[error("can not decrypt reply: {0}")]
    Decryption(#[source] Box<DispatchError>),
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Network(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}
