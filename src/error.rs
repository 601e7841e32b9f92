//! Crate-local error type.
//!
//! Every fallible site in this crate constructs an [Error] through the
//! [err_at] macro so that the failing `file!()`/`line!()` travels with the
//! error instead of being lost the moment an `Err` is converted.

use std::{fmt, result, sync::mpsc, sync::PoisonError};

/// Result alias used throughout this crate.
pub type Result<T> = result::Result<T, Error>;

/// The kind of failure, independent of where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Underlying `std::io` failure (open, read, write, sync, ...).
    IoError(String),
    /// A `read()` returned fewer bytes than requested and it wasn't EOF-safe.
    PartialRead(String),
    /// A `write()` drained fewer bytes than handed to it after looping.
    PartialWrite(String),
    /// A shard index file, `index-count`, or `index.stats` was structurally
    /// unreadable: bad magic, truncated header, truncated catalog, ...
    InvalidFile(String),
    /// A decoded on-disk node violated a layout invariant.
    InvalidNode(String),
    /// Lookup against a key that does not exist (or is a tombstone) in a
    /// context where that is an error rather than an `Option::None`.
    KeyNotFound(String),
    /// A channel endpoint was dropped while a request or reply was still
    /// expected; this is a normal, non-error shutdown signal once a shard
    /// has started stopping, but a bug anywhere else.
    Disconnected(String),
    /// A request named a cache-segment id or op type that no binding
    /// exists for, or `setPosition`'s invariants were violated.
    UnReachable(String),
    /// Any other invariant violation that should never be reachable in
    /// correct code.
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, msg) = match self {
            Error::IoError(m) => ("IoError", m),
            Error::PartialRead(m) => ("PartialRead", m),
            Error::PartialWrite(m) => ("PartialWrite", m),
            Error::InvalidFile(m) => ("InvalidFile", m),
            Error::InvalidNode(m) => ("InvalidNode", m),
            Error::KeyNotFound(m) => ("KeyNotFound", m),
            Error::Disconnected(m) => ("Disconnected", m),
            Error::UnReachable(m) => ("UnReachable", m),
            Error::Fatal(m) => ("Fatal", m),
        };
        write!(f, "{}: {}", kind, msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(format!("{}", err))
    }
}

impl<T> From<mpsc::SendError<T>> for Error {
    fn from(err: mpsc::SendError<T>) -> Error {
        Error::Disconnected(format!("{}", err))
    }
}

impl From<mpsc::RecvError> for Error {
    fn from(err: mpsc::RecvError) -> Error {
        Error::Disconnected(format!("{}", err))
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(err: crossbeam_channel::SendError<T>) -> Error {
        Error::Disconnected(format!("{}", err))
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(err: crossbeam_channel::RecvError) -> Error {
        Error::Disconnected(format!("{}", err))
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Error {
        Error::Fatal(format!("poisoned lock: {}", err))
    }
}

/// Build an [Error], tagging it with the call-site `file!()`/`line!()`.
///
/// Two forms:
/// * `err_at!(Variant, fallible_expr)` — evaluate `fallible_expr` (any
///   `Result<T, E>` where `E: fmt::Display`); on `Err`, wrap it into
///   `Error::Variant` with location context and return `Result<T>`.
/// * `err_at!(Variant, msg: "fmt", args...)` — construct an `Error::Variant`
///   directly, no underlying `Result` to unwrap.
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::error::Error::$v(format!("{} {}", prefix, format!($($arg),+))))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::error::Error::$v(format!("{} {}", prefix, err)))
            }
        }
    }};
}
