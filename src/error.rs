//! Error types for the proxy.

use std::io;
use thiserror::Error;

/// Proxy error type.
///
/// Client-facing variants (`Parse`, `ClientClosed`) display as the bare
/// message because the forwarding engine embeds it verbatim in the 400 body.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    ClientClosed(String),

    #[error("Upstream connect timed out: {0}")]
    ConnectTimeout(String),

    #[error("Upstream connection failed: {0}")]
    Connect(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn client_closed<S: Into<String>>(msg: S) -> Self {
        Error::ClientClosed(msg.into())
    }

    pub fn connect_timeout<S: Into<String>>(msg: S) -> Self {
        Error::ConnectTimeout(msg.into())
    }

    pub fn connect<S: Into<String>>(msg: S) -> Self {
        Error::Connect(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    /// True for the quiet end-of-session cases that must not produce a 400.
    pub fn is_client_disconnect(&self) -> bool {
        matches!(self, Error::ClientClosed(_))
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
