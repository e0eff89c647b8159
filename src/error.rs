//! Error taxonomy for the SMTP core (spec.md §7).
//!
//! Every fallible core operation returns one of these enums rather than a
//! boxed trait object; only the binary's `main` collapses into
//! `Box<dyn std::error::Error>`.

use thiserror::Error;

/// Errors from [`crate::line::read_command_line`].
#[derive(Debug, Error)]
pub enum LineError {
    #[error("line exceeds maximum length")]
    TooLong,
    #[error("connection closed")]
    Eof,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`crate::line::read_data_body`].
#[derive(Debug, Error)]
pub enum DataError {
    #[error("message exceeds maximum size")]
    TooLarge,
    #[error("connection closed during DATA")]
    Eof,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`crate::address`] parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("malformed parameter")]
    Malformed,
}

/// Errors from [`crate::proxy`] preamble parsing.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("PROXY preamble malformed: {0}")]
    Malformed(&'static str),
    #[error("PROXY preamble timed out")]
    Timeout,
    #[error("PROXY unrecognized signature")]
    UnrecognizedSignature,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`crate::auth`] sub-dialogs. Each variant corresponds to a
/// reply that has already been pushed to the client by the time the error
/// is returned — the dispatcher does nothing more than abandon the AUTH
/// attempt.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("501 5.5.2 Can't decode base64")]
    BadBase64,
    #[error("501 5.5.2 Can't split auth value")]
    BadShape,
    #[error("501 Auth aborted")]
    Aborted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error surfaced out of a single connection's session loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Line(#[from] LineError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
}
