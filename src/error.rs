//! Error types for guest-nfsd

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using guest-nfsd Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the server.
///
/// Per-request failures never surface here: procedure handlers turn host
/// errors into protocol status codes (see [`crate::nfsd::NfsStat`]).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The export root is missing or not readable and writable
    #[error("Export root {} is not accessible: {source}", path.display())]
    ExportUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Socket setup errors
    #[error("Failed to bind {service}: {source}")]
    Bind {
        service: &'static str,
        source: std::io::Error,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// XDR / RPC wire-format errors
    #[error("Protocol error: {0}")]
    Xdr(#[from] nfsd_xdr::XdrError),
}
