//! The pluggable transport contract (`spec.md` §4.C).
//!
//! # Design background (Why)
//! Same shape and same rationale as [`crate::filter`]: one `dyn`-safe
//! trait, one method per §4.C operation, no generic/object trait split.
//! A `LowerLayer` is the bottom of an endpoint's stack — a concrete
//! per-transport driver (TCP socket, serial port, subprocess pipe) or,
//! via the Filter-as-LL bridge (`spec.md` §4.F, [`crate::bridge`]),
//! another endpoint standing in for one.
//!
//! # Contract (What)
//! A `LowerLayer` publishes exactly two events upward through
//! [`LowerLayerEvents`]: `read` (data, or an error, with the LL
//! reporting back how many bytes were consumed) and `write_ready`. Every
//! method below runs only on the event-loop thread, consistent with
//! `spec.md` §5's single-threaded-cooperative model; [`LowerLayer::open`]
//! and [`LowerLayer::close`] may complete synchronously or hand their
//! result to `done` later, exactly mirroring the FD LL's own state
//! machine (`spec.md` §4.D).
use crate::error::{Result, StackError};
use std::sync::Arc;

/// Up-calls a `LowerLayer` delivers to whatever owns it (almost always
/// the Base Endpoint, or the Filter-as-LL bridge standing in for one).
pub trait LowerLayerEvents: Send + Sync {
    /// `buf` holds the bytes read (already consumed up to the returned
    /// count from the LL's perspective, but the buffer may carry more
    /// than the receiver accepts); `Err` carries a terminal or
    /// `RemClose` style error (`spec.md` §7). Returns the number of
    /// bytes of `buf` the receiver consumed; a short return re-offers
    /// the remainder on the LL's own next read-enable, per the FD LL's
    /// buffering contract (`spec.md` §4.D).
    fn read(&self, result: std::result::Result<&[u8], &StackError>, aux: &[&str]) -> usize;

    /// The LL can accept more bytes for the wire.
    fn write_ready(&self);
}

/// The pluggable transport contract.
pub trait LowerLayer: Send {
    /// Register the up-call sink. Called exactly once, before `open`.
    fn set_callback(&mut self, events: Arc<dyn LowerLayerEvents>);

    /// Write pre-formatted bytes to the transport. `aux` carries
    /// well-known tags (`spec.md` §6), notably `"oob"`. Returns the
    /// number of bytes of `sg` accepted; a short write means the
    /// caller must wait for `write_ready` before retrying the rest.
    fn write_sg(&mut self, sg: &[u8], aux: &[&str]) -> Result<usize>;

    /// Render the remote address as a human-readable string.
    fn raddr_to_str(&self, buf: &mut String) -> Result<()>;

    /// Copy the remote address in its native binary form.
    fn get_raddr(&self, buf: &mut Vec<u8>) -> Result<()>;

    /// A stable identifier for the remote end (e.g. a serialized
    /// sockaddr or device path), used for logging and `remote_id`
    /// up-calls.
    fn remote_id(&self) -> Result<String>;

    /// Begin opening the transport. If this returns `Ok(true)`, the
    /// open already completed synchronously and `done` must not be
    /// invoked. If `Ok(false)`, `done` fires exactly once, later,
    /// through the deferred runner.
    fn open(&mut self, done: Box<dyn FnOnce(Result<()>) + Send>) -> Result<bool>;

    /// Begin closing the transport. Same synchronous/asynchronous
    /// contract as `open`.
    fn close(&mut self, done: Box<dyn FnOnce() + Send>) -> Result<bool>;

    fn set_read_callback_enable(&mut self, enabled: bool) -> Result<()>;
    fn set_write_callback_enable(&mut self, enabled: bool) -> Result<()>;

    /// Get (`get = true`) or set a named option.
    fn control(&mut self, get: bool, option: &str, buf: &mut Vec<u8>) -> Result<()>;

    /// Immediate, non-graceful teardown: no up-calls fire afterward.
    /// Used when a parent decides a child must stop emitting events
    /// regardless of any in-flight close (`spec.md` §4.D "Disable").
    fn disable(&mut self);
}
