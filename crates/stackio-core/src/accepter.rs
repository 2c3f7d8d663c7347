//! Listener-side contract the core needs to construct server endpoints
//! from accepted transport handles (`spec.md` §4.H).
//!
//! # Design background (Why)
//! From the stack runtime's point of view, a listener (a TCP accept
//! loop, a Unix-socket listener, a serial port waiting for DCD) is
//! uninteresting except for the one thing it hands the core: an
//! already-open transport. `spec.md` explicitly scopes the
//! "accepter factory" registry (how to build a listener from a
//! descriptor string) out as a Non-goal; what remains is the small
//! contract below plus the one piece of core logic an accepter needs
//! from this crate — turning an accepted handle into a server-side
//! [`Endpoint`] via §4.E's server construction path.
//!
//! # Contract (What)
//! An [`Accepter`] need only implement `shutdown`, `set_callback_enable`,
//! and `control`; it reports new connections through
//! [`AccepterEvents::new_connection`], already wrapped as an `Endpoint`
//! by whatever called [`accept_child`].
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::filter::Filter;
use crate::lowerlayer::LowerLayer;
use crate::osfuncs::OsFuncs;
use std::sync::Arc;

/// Up-call an [`Accepter`] delivers for each accepted transport.
pub trait AccepterEvents: Send + Sync {
    fn new_connection(&self, child: Endpoint);
}

/// The listener-side contract the core consumes. Concrete per-transport
/// listeners (a TCP `Listener`, a Unix-socket acceptor) implement this
/// and call [`accept_child`] for each accepted handle.
pub trait Accepter: Send {
    /// Stop accepting new connections. `done` fires once the listener
    /// has fully unwound.
    fn shutdown(&mut self, done: Box<dyn FnOnce() + Send>) -> Result<()>;

    /// Enable or disable delivery of `new_connection`.
    fn set_callback_enable(&mut self, enabled: bool, done: Box<dyn FnOnce() + Send>) -> Result<()>;

    fn control(&mut self, get: bool, option: &str, buf: &mut Vec<u8>) -> Result<()>;
}

/// Build a server-side [`Endpoint`] from an already-connected LL
/// (`spec.md` §4.E "Server construction"): the endpoint starts in
/// `IoOpenPending` and `open` below only runs the filter handshake, with
/// `open_done` firing once that handshake completes.
pub fn accept_child(
    ll: Box<dyn LowerLayer>,
    filter: Option<Box<dyn Filter>>,
    osfuncs: Arc<dyn OsFuncs>,
    open_done: Box<dyn FnOnce(Result<()>) + Send>,
) -> Result<Endpoint> {
    let endpoint = Endpoint::new_server(ll, filter, osfuncs);
    endpoint.open(open_done)?;
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn accepter_events_trait_is_object_safe() {
        struct Sink;
        impl AccepterEvents for Sink {
            fn new_connection(&self, _child: Endpoint) {}
        }
        let _boxed: Box<dyn AccepterEvents> = Box::new(Sink);
        // Compile-level check only; behavioral coverage lives in
        // `stackio-tck`, which can assemble a loopback LL.
        assert_eq!(ErrorKind::NotSup.to_string(), "operation not supported");
    }
}
