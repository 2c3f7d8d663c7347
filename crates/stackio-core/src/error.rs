//! Crate-wide error domain.
//!
//! # Design background (Why)
//! Every layer in the stack — OS-Funcs, a `Filter`, a `LowerLayer`, the
//! Base Endpoint itself — needs to surface failure through one shape so
//! that callers (and the endpoint's own open/close state machine) can
//! branch on *category* rather than parse messages. `spec.md` §7 fixes
//! the exact set of kinds the core distinguishes; this module is the
//! carrier for them.
//!
//! # Contract (What)
//! [`StackError`] bundles a stable [`ErrorKind`], a human message, and an
//! optional boxed cause, mirroring the `code`/`message`/`cause` shape the
//! grounding repo's `CoreError` uses, but collapsed into one crate (no
//! `no_std` split — this crate is std-only, see module docs on
//! `osfuncs`). `ErrorKind` itself is a `thiserror`-derived enum so each
//! variant gets a stable `Display` message for logs without hand-writing
//! `fmt::Display`.
//!
//! # Trade-offs
//! `source` is `Box<dyn std::error::Error + Send + Sync>` rather than a
//! generic parameter: the Base Endpoint stores endpoints behind trait
//! objects throughout, so a generic error type would just get erased at
//! the first `Box<dyn Filter>` boundary anyway.
use std::fmt;

/// The error kinds the core distinguishes, verbatim from `spec.md` §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Allocation failure.
    #[error("out of memory")]
    NoMem,
    /// A filter or lower layer lacks the requested capability.
    #[error("operation not supported")]
    NotSup,
    /// Bad argument.
    #[error("invalid argument")]
    Inval,
    /// Close when not open, open when already open.
    #[error("not ready for this operation")]
    NotReady,
    /// Second free, second watch removal, etc.
    #[error("resource already in use")]
    InUse,
    /// Open/close will complete asynchronously; a `done` callback follows.
    #[error("operation in progress")]
    InProgress,
    /// Peer closed; endpoint remains open until the user calls close.
    #[error("remote end closed the connection")]
    RemClose,
    /// A handshake deadline elapsed.
    #[error("operation timed out")]
    TimedOut,
    /// Close raced an in-flight open.
    #[error("operation cancelled")]
    Cancelled,
    /// Catch-all for a transport- or filter-supplied I/O error.
    #[error("transport error")]
    Transport,
}

impl ErrorKind {
    /// Whether the Base Endpoint's connect loop (`spec.md` §4.E step 4)
    /// should keep retrying `try_connect`/`try_disconnect` on an error of
    /// this kind, rather than aborting the open/close immediately.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::InProgress)
    }

    /// Whether an error of this kind is returned synchronously and never
    /// leaves the endpoint partially initialized (`spec.md` §7
    /// "Propagation policy").
    pub fn is_synchronous_rejection(self) -> bool {
        matches!(
            self,
            ErrorKind::NoMem
                | ErrorKind::NotSup
                | ErrorKind::Inval
                | ErrorKind::NotReady
                | ErrorKind::InUse
        )
    }
}

/// The crate-wide error type returned by fallible operations across
/// `OsFuncs`, `Filter`, `LowerLayer`, and the Base Endpoint.
#[derive(Debug)]
pub struct StackError {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl StackError {
    /// Construct an error carrying no further context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for the common `ErrorKind -> StackError` case where the
    /// kind's own `Display` message is descriptive enough.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.to_string())
    }

    /// Attach an underlying cause (e.g. an `io::Error` from a concrete
    /// FD), preserving it for `source()`.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for StackError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::WouldBlock => ErrorKind::InProgress,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => ErrorKind::RemClose,
            std::io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => ErrorKind::Inval,
            _ => ErrorKind::Transport,
        };
        let message = err.to_string();
        StackError::new(kind, message).with_source(err)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_kind_and_message() {
        let err = StackError::new(ErrorKind::NotReady, "close before open");
        assert_eq!(err.to_string(), "not ready for this operation: close before open");
    }

    #[test]
    fn wraps_io_error_as_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = StackError::from(io_err);
        assert_eq!(err.kind(), ErrorKind::RemClose);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn in_progress_is_retryable_only() {
        assert!(ErrorKind::InProgress.is_retryable());
        assert!(!ErrorKind::TimedOut.is_retryable());
    }
}
