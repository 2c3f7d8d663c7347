//! OS-Funcs: the event-loop services the stack runtime consumes.
//!
//! # Design background (Why)
//! `spec.md` §4.A lists exactly what the core needs from its host: FD
//! readiness notification with synchronous clearance, one-shot timers
//! with a stop-with-done variant, a deferred runner that breaks
//! reentrancy, and a structured logger. In the grounding repo this shape
//! is a "contract-only runtime surface" (`spark-core::runtime`) that a
//! host implements and injects — we follow the same split: [`OsFuncs`] is
//! the trait the Base Endpoint and FD Lower Layer are generic over (or,
//! since they're stored behind `Arc<dyn OsFuncs>` throughout, dynamically
//! dispatch to), never a concrete reactor baked into those modules.
//!
//! Two differences from the grounding repo's `runtime` module, both
//! deliberate:
//! - This crate does not abstract mutual-exclusion locks the way
//!   `spec.md` §4.A's prose does. The original C library needs that
//!   abstraction because different host bindings (glib, Tcl, a bare
//!   `select` loop) each bring their own lock primitive; in Rust,
//!   `std::sync::Mutex` already is the one universal primitive, so
//!   `OsFuncs` does not expose a `lock()` method and internal types just
//!   use `std::sync::Mutex` directly. Recorded in DESIGN.md.
//! - Unlike `spark-core::runtime` (which is intentionally `no_std`-clean
//!   and ships zero backends — "Contract-only: ... implementation must
//!   be provided by the host runtime"), this crate ships a real backend,
//!   [`mio_impl::MioOsFuncs`], because the FD Lower Layer is useless
//!   without *some* runnable reactor and `spec.md`'s Non-goal is "OS
//!   handler *selection*", not "zero handlers". `mio` is the natural
//!   choice: it already appears in this retrieval pack as a dependency
//!   of `flux-network` and as the `tokio-rs-mio` crate itself.
//!
//! # Contract (What)
//! All `OsFuncs` methods are non-blocking and may be called from any
//! thread; the trait's job is to marshal the request onto whatever
//! thread actually owns the reactor and FD watch table.
mod logger;
#[cfg(feature = "mio-reactor")]
pub mod mio_impl;

pub use logger::{LogLevel, Logger, TracingLogger};

use crate::error::Result;
use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

/// Up-calls a registered FD's owner receives. Implemented by whichever
/// component registered the fd (almost always an FD Lower Layer).
///
/// Only one of these fires per dispatch; `except_ready` exists
/// separately from `read_ready` because some hosts (and `spec.md` §4.D's
/// connect-completion handling) need to distinguish the exception set
/// from ordinary read readiness, e.g. to detect a failed non-blocking
/// `connect()` on platforms that signal it via the exception fd set
/// rather than write-ready.
pub trait FdEvents: Send + Sync {
    fn read_ready(&self);
    fn write_ready(&self);
    fn except_ready(&self);
}

/// Opaque handle to a registered FD watch. Carries no behavior; it is
/// only ever handed back to the `OsFuncs` that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdWatchId(pub(crate) u64);

/// Opaque handle to a scheduled one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// The services the stack runtime requires from its host event loop.
///
/// See the module docs for why locks are not part of this contract.
pub trait OsFuncs: Send + Sync + 'static {
    /// Register `fd` for readiness notification. Both read and write (and
    /// exception) interest start disabled; the caller toggles them with
    /// [`OsFuncs::set_read_enabled`] / [`OsFuncs::set_write_enabled`].
    fn register_fd(&self, fd: RawFd, events: std::sync::Arc<dyn FdEvents>) -> Result<FdWatchId>;

    /// Enable or disable read-ready delivery for a watch.
    fn set_read_enabled(&self, watch: FdWatchId, enabled: bool) -> Result<()>;

    /// Enable or disable write-ready delivery for a watch.
    fn set_write_enabled(&self, watch: FdWatchId, enabled: bool) -> Result<()>;

    /// Enable or disable exception-ready delivery for a watch.
    fn set_except_enabled(&self, watch: FdWatchId, enabled: bool) -> Result<()>;

    /// Deregister `watch`. `cleared` fires exactly once, after the watch
    /// has been removed from the readiness table *and* after every
    /// in-flight up-call for this fd has unwound (`spec.md` §4.A). The
    /// callback always runs via [`OsFuncs::defer`], never synchronously.
    fn clear_fd_handlers(&self, watch: FdWatchId, cleared: Box<dyn FnOnce() + Send>);

    /// Schedule a one-shot timer that fires `callback` after `after` has
    /// elapsed, on the reactor thread.
    fn start_timer(&self, after: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerId;

    /// Stop a running timer before it fires. `done` receives `true` if
    /// the timer had already begun firing (its callback is queued or
    /// running and cannot be recalled) or `false` if cancellation
    /// pre-empted it cleanly. This mirrors `spec.md` §9's
    /// "stop-with-done... so the stopper can learn whether the timer was
    /// already firing, letting a 'stopped-so-restart' path restart
    /// cleanly".
    fn stop_timer(&self, timer: TimerId, done: Box<dyn FnOnce(bool) + Send>);

    /// Schedule `callback` to run on the reactor thread, even if the
    /// caller *is* the reactor thread — the defining property that lets
    /// the Base Endpoint break reentrancy (`spec.md` §3, §5).
    fn defer(&self, callback: Box<dyn FnOnce() + Send>);

    /// Structured logging sink.
    fn logger(&self) -> &dyn Logger;
}

impl fmt::Debug for dyn OsFuncs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn OsFuncs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_and_timer_ids_are_distinguishable() {
        let a = FdWatchId(1);
        let b = FdWatchId(2);
        assert_ne!(a, b);
        let t = TimerId(1);
        assert_eq!(t, TimerId(1));
    }
}
