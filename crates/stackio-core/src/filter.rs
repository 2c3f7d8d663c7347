//! The pluggable protocol-layer contract (`spec.md` §4.B).
//!
//! # Design background (Why)
//! `spec.md` §9 is explicit that the dispatch-by-integer pattern of the
//! library this was distilled from ("one function per role with an
//! opcode argument") is a source artifact, and recommends "one method
//! per operation" over a tagged-enum-of-filter-kinds. The grounding
//! repo makes the same call for its own pluggable seams
//! (`transport::traits::generic`/`object`): a `dyn`-safe trait with one
//! method per contract operation. This module follows that shape but
//! does not replicate the grounding repo's *dual* generic/object trait
//! split (a blanket-impl'd generic trait plus a narrower object-safe
//! mirror) — every `Filter` here is already stored behind `Box<dyn
//! Filter>` by the Base Endpoint (`spec.md` §9 "realistically use an
//! abstraction with a vtable"), so there is no monomorphized call site
//! that would benefit from the generic half; adding it would be
//! indirection with no consumer. Recorded in DESIGN.md.
//!
//! # Contract (What)
//! A `Filter` translates between an *upper-layer* byte stream (the
//! user's view) and a *lower-layer* byte stream (the transport's view).
//! All operations are synchronous and non-blocking; anything that takes
//! time is expressed as the `Progress::InProgress`/`RetryLater`
//! tri-state rather than as an async function, matching `spec.md` §4.B.
use crate::error::Result;
use std::time::{Duration, Instant};

/// Outcome of `try_connect`/`try_disconnect`: a tri-state rather than a
/// plain `Result`, because "not finished yet" is not an error
/// (`spec.md` §4.B).
#[derive(Debug)]
pub enum Progress {
    /// The handshake step completed.
    Success,
    /// Call again once the lower layer reports I/O (no explicit deadline).
    InProgress,
    /// Call again on I/O or when `deadline` elapses, whichever is first.
    /// The filter may shorten (but not lengthen) a deadline the base
    /// already holds by writing a new `Instant` here.
    RetryLater { deadline: Instant },
}

/// What a `Filter` currently wants the Base Endpoint to do with its LL
/// enables (`spec.md` §3 "four readiness predicates" and §4.E "enable
/// recomputation").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Decoded data is waiting for the user.
    pub ul_read_pending: bool,
    /// Encoded data is waiting for the transport.
    pub ll_write_pending: bool,
    /// The filter cannot make progress without more transport input.
    pub ll_read_needed: bool,
    /// The filter has an outstanding timer request.
    pub timer_running: bool,
}

/// The single channel a `Filter` uses to ask its owning Base Endpoint
/// for action, handed to it once in [`Filter::setup`]. Mirrors
/// `spec.md` §4.B "the filter may request base actions only through the
/// single base-callback it was handed during setup".
pub trait FilterBaseCallback: Send + Sync {
    /// Ask the base to re-run enable recomputation (`spec.md` §4.E)
    /// outside of a hop already in progress, e.g. after an internal
    /// state change triggered by `control`.
    fn recalculate_enables(&self);

    /// Request (or replace) the filter's one-shot wakeup timer. A
    /// `None` cancels any outstanding request.
    fn set_timer(&self, after: Option<Duration>);
}

/// A named option for [`Filter::control`], mirroring the grounding
/// repo's string-keyed control-plane convention
/// (`spark-core::contract::control`) rather than inventing a numeric
/// opcode space.
pub type ControlOption<'a> = &'a str;

/// The pluggable protocol-layer contract.
///
/// All methods below run only while the Base Endpoint's internal lock
/// is held (`spec.md` §6); implementations must not block.
pub trait Filter: Send {
    /// One step of the connect handshake. Called repeatedly by the
    /// base's connect loop until it returns `Success` or an error.
    fn try_connect(&mut self, deadline: Instant) -> Result<Progress>;

    /// One step of the disconnect handshake (e.g. flushing a TLS
    /// close-notify). Same tri-state contract as `try_connect`.
    fn try_disconnect(&mut self, deadline: Instant) -> Result<Progress>;

    /// Accept bytes written by the user. If `sg` is empty, drain
    /// internal buffers into `ll_emit` instead of consuming new input
    /// (the "drain path" `spec.md` §4.B and §8 require to fire exactly
    /// once per `WRITE_READY` reentry). Returns the number of bytes of
    /// `sg` consumed.
    fn ul_write(
        &mut self,
        sg: &[u8],
        aux: &[&str],
        ll_emit: &mut dyn FnMut(&[u8], &[&str]) -> Result<usize>,
    ) -> Result<usize>;

    /// Accept bytes read from the lower layer. If `buf` is empty, drain
    /// internal buffers into `ul_emit` instead. Returns the number of
    /// bytes of `buf` consumed.
    fn ll_write(
        &mut self,
        buf: &[u8],
        aux: &[&str],
        ul_emit: &mut dyn FnMut(&[u8], &[&str]) -> Result<usize>,
    ) -> Result<usize>;

    /// Current readiness predicates (`spec.md` §3).
    fn readiness(&self) -> Readiness;

    /// Final gate after `try_connect` reports `Success`; failure here
    /// aborts the open exactly as a `try_connect` error would
    /// (`spec.md` §4.E step 5).
    fn check_open_done(&mut self) -> Result<()> {
        Ok(())
    }

    /// Fires when the filter's requested timer (via
    /// [`FilterBaseCallback::set_timer`]) elapses.
    fn timeout(&mut self) {}

    /// Called once, before any other operation, with the callback the
    /// filter uses to talk back to its base.
    fn setup(&mut self, base: std::sync::Arc<dyn FilterBaseCallback>) -> Result<()>;

    /// Called once the LL (and any child filter) has fully closed.
    fn cleanup(&mut self) {}

    /// Get (`get = true`) or set a named option.
    fn control(&mut self, get: bool, option: ControlOption<'_>, buf: &mut Vec<u8>) -> Result<()>;

    /// Request a new logical channel multiplexed over this filter (used
    /// by multiplexing filters; most filters reject this with
    /// `ErrorKind::NotSup`).
    fn open_channel(&mut self, args: &[(&str, &str)]) -> Result<()> {
        let _ = args;
        Err(crate::error::StackError::from_kind(
            crate::error::ErrorKind::NotSup,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_default_is_all_false() {
        let r = Readiness::default();
        assert!(!r.ul_read_pending);
        assert!(!r.ll_write_pending);
        assert!(!r.ll_read_needed);
        assert!(!r.timer_running);
    }
}
