//! An in-memory `LowerLayer` pair standing in for a real transport.
//!
//! # Design background (Why)
//! `spec.md` §8's round-trip property ("writing then reading across a
//! pair of endpoints joined by a loopback transport reproduces the
//! bytes exactly") names this exact fixture. A loopback pair lets a
//! scenario test drive both ends of a connection — client write,
//! server read, server write, client read — without a real socket or
//! OS thread, the same role `spark-transport-tcp`'s own loopback test
//! helpers play for the grounding repo's channel tests.
//!
//! # Contract (What)
//! [`loopback_pair`] returns two [`LoopbackLowerLayer`] handles sharing
//! one hub. A write on one side becomes readable on the other after one
//! `OsFuncs::defer` trip, matching the non-reentrant delivery discipline
//! every other `LowerLayer` in this crate follows.
use stackio_core::error::{ErrorKind, Result, StackError};
use stackio_core::lowerlayer::{LowerLayer, LowerLayerEvents};
use stackio_core::osfuncs::OsFuncs;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct Side {
    inbox: VecDeque<u8>,
    events: Option<Arc<dyn LowerLayerEvents>>,
    read_enabled: bool,
    open: bool,
}

impl Side {
    fn new() -> Self {
        Self {
            inbox: VecDeque::new(),
            events: None,
            read_enabled: false,
            open: false,
        }
    }
}

struct Hub {
    sides: [Mutex<Side>; 2],
}

impl Hub {
    fn deliver(&self, side: usize) {
        let (events, snapshot) = {
            let guard = self.sides[side].lock().expect("loopback lock poisoned");
            if !guard.read_enabled || guard.inbox.is_empty() {
                return;
            }
            let Some(events) = guard.events.clone() else {
                return;
            };
            (events, guard.inbox.iter().copied().collect::<Vec<u8>>())
        };
        let consumed = events.read(Ok(&snapshot), &[]).min(snapshot.len());
        let mut guard = self.sides[side].lock().expect("loopback lock poisoned");
        guard.inbox.drain(..consumed);
    }
}

/// One end of an in-memory loopback transport.
pub struct LoopbackLowerLayer {
    hub: Arc<Hub>,
    side: usize,
    osfuncs: Arc<dyn OsFuncs>,
}

/// Build a connected pair; `.0` and `.1` are each other's peer.
pub fn loopback_pair(osfuncs: Arc<dyn OsFuncs>) -> (LoopbackLowerLayer, LoopbackLowerLayer) {
    let hub = Arc::new(Hub {
        sides: [Mutex::new(Side::new()), Mutex::new(Side::new())],
    });
    (
        LoopbackLowerLayer {
            hub: Arc::clone(&hub),
            side: 0,
            osfuncs: Arc::clone(&osfuncs),
        },
        LoopbackLowerLayer { hub, side: 1, osfuncs },
    )
}

impl LoopbackLowerLayer {
    fn peer(&self) -> usize {
        1 - self.side
    }

    fn schedule_delivery(&self, side: usize) {
        let hub = Arc::clone(&self.hub);
        self.osfuncs.defer(Box::new(move || hub.deliver(side)));
    }
}

impl LowerLayer for LoopbackLowerLayer {
    fn set_callback(&mut self, events: Arc<dyn LowerLayerEvents>) {
        self.hub.sides[self.side].lock().expect("loopback lock poisoned").events = Some(events);
    }

    fn write_sg(&mut self, sg: &[u8], _aux: &[&str]) -> Result<usize> {
        let peer = self.peer();
        {
            let mut guard = self.hub.sides[peer].lock().expect("loopback lock poisoned");
            if !guard.open {
                return Err(StackError::from_kind(ErrorKind::RemClose));
            }
            guard.inbox.extend(sg.iter().copied());
        }
        self.schedule_delivery(peer);
        Ok(sg.len())
    }

    fn raddr_to_str(&self, buf: &mut String) -> Result<()> {
        buf.push_str("loopback");
        Ok(())
    }

    fn get_raddr(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(b"loopback");
        Ok(())
    }

    fn remote_id(&self) -> Result<String> {
        Ok(format!("loopback-{}", self.peer()))
    }

    fn open(&mut self, _done: Box<dyn FnOnce(Result<()>) + Send>) -> Result<bool> {
        self.hub.sides[self.side].lock().expect("loopback lock poisoned").open = true;
        Ok(true)
    }

    fn close(&mut self, done: Box<dyn FnOnce() + Send>) -> Result<bool> {
        self.hub.sides[self.side].lock().expect("loopback lock poisoned").open = false;
        done();
        Ok(true)
    }

    fn set_read_callback_enable(&mut self, enabled: bool) -> Result<()> {
        let side = self.side;
        self.hub.sides[side].lock().expect("loopback lock poisoned").read_enabled = enabled;
        if enabled {
            self.schedule_delivery(side);
        }
        Ok(())
    }

    fn set_write_callback_enable(&mut self, _enabled: bool) -> Result<()> {
        // Loopback writes never block, so write-ready delivery is not
        // meaningful here; the Base Endpoint's drain paths are still
        // exercised because `write_sg` always accepts the full buffer.
        Ok(())
    }

    fn control(&mut self, _get: bool, _option: &str, _buf: &mut Vec<u8>) -> Result<()> {
        Err(StackError::from_kind(ErrorKind::NotSup))
    }

    fn disable(&mut self) {
        self.hub.sides[self.side].lock().expect("loopback lock poisoned").open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual_osfuncs::ManualOsFuncs;

    struct CollectingEvents {
        out: Arc<Mutex<Vec<u8>>>,
    }
    impl LowerLayerEvents for CollectingEvents {
        fn read(&self, result: std::result::Result<&[u8], &StackError>, _aux: &[&str]) -> usize {
            let Ok(buf) = result else { return 0 };
            self.out.lock().expect("collector lock poisoned").extend_from_slice(buf);
            buf.len()
        }
        fn write_ready(&self) {}
    }

    #[test]
    fn write_on_one_side_is_readable_on_the_other_after_drain() {
        let os = Arc::new(ManualOsFuncs::new());
        let (mut a, mut b) = loopback_pair(os.clone());
        let received = Arc::new(Mutex::new(Vec::new()));
        b.set_callback(Arc::new(CollectingEvents { out: Arc::clone(&received) }));
        let _ = a.open(Box::new(|_| {}));
        let _ = b.open(Box::new(|_| {}));
        b.set_read_callback_enable(true).unwrap();

        a.write_sg(b"hello", &[]).unwrap();
        os.drain_deferred();

        assert_eq!(&*received.lock().unwrap(), b"hello");
    }
}
