//! Conformance test kit for `stackio-core`.
//!
//! # Design background (Why)
//! `spec.md` §8's properties and scenarios need a deterministic harness
//! to exercise: a test double for `OsFuncs` whose timers and deferred
//! callbacks fire only when the test asks, not on wall-clock time or a
//! background thread; and a loopback `LowerLayer` pair so a scenario can
//! drive both ends of a connection without touching a real socket.
//! Grounded on the grounding repo's own `test_stubs`/contract-test split
//! (a crate dedicated to in-memory doubles consumed by both the core
//! crate's own tests and downstream implementers' conformance suites).
pub mod loopback;
pub mod manual_osfuncs;
pub mod mock_filter;

pub use loopback::{loopback_pair, LoopbackLowerLayer};
pub use manual_osfuncs::ManualOsFuncs;
pub use mock_filter::{LineDelimFilter, PassthroughFilter};
