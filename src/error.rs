use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("message of {0} bytes exceeds datagram limit")]
    Oversized(usize),

    /// `error{message}` reported by the rendezvous server.
    #[error("{0}")]
    Remote(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("not registered with rendezvous server")]
    NotRegistered,

    #[error("no active relay session")]
    NotConnected,

    #[error("a connection request is already in flight")]
    Busy,

    #[error("peer agent has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
