//! End-to-end scenarios from `spec.md` §8, driven over the loopback
//! transport with a deterministic `OsFuncs`.
use stackio_core::endpoint::{Endpoint, EndpointEvents, Event};
use stackio_core::error::ErrorKind;
use stackio_tck::{loopback_pair, LineDelimFilter, ManualOsFuncs};
use std::sync::{Arc, Mutex};

struct Capture {
    reads: Mutex<Vec<Vec<u8>>>,
}

impl Capture {
    fn new() -> Self {
        Self { reads: Mutex::new(Vec::new()) }
    }
}

impl EndpointEvents for Capture {
    fn on_event(&self, _endpoint: &Endpoint, event: Event<'_>) -> usize {
        match event {
            Event::Read { result: Ok(buf), .. } => {
                self.reads.lock().expect("capture lock poisoned").push(buf.to_vec());
                buf.len()
            }
            _ => 0,
        }
    }
}

fn open_and_drain(endpoint: &Endpoint, os: &ManualOsFuncs) {
    let done = Arc::new(Mutex::new(None));
    let done_clone = Arc::clone(&done);
    endpoint
        .open(Box::new(move |r| *done_clone.lock().expect("open result lock poisoned") = Some(r)))
        .expect("open should be accepted from Closed");
    os.drain_deferred();
    let result = done.lock().expect("open result lock poisoned").take();
    assert!(matches!(result, Some(Ok(()))), "open_done should report success");
}

/// Scenario 1: two `"hello\n"` writes arrive at the peer as two separate
/// read events, in order.
#[test]
fn happy_path_two_messages_arrive_as_two_read_events() {
    let os = Arc::new(ManualOsFuncs::new());
    let (client_ll, server_ll) = loopback_pair(Arc::clone(&os) as Arc<dyn stackio_core::OsFuncs>);

    let client = Endpoint::new(Box::new(client_ll), Some(Box::new(LineDelimFilter::default())), Arc::clone(&os) as _);
    let server = Endpoint::new(Box::new(server_ll), Some(Box::new(LineDelimFilter::default())), Arc::clone(&os) as _);

    let capture = Arc::new(Capture::new());
    server.set_event_sink(Arc::clone(&capture) as Arc<dyn EndpointEvents>);

    open_and_drain(&client, &os);
    open_and_drain(&server, &os);
    server.set_read_callback_enable(true).expect("enable read");

    client.write(b"hello\n", &[]).expect("first write");
    os.drain_deferred();
    client.write(b"hello\n", &[]).expect("second write");
    os.drain_deferred();

    let reads = capture.reads.lock().expect("capture lock poisoned");
    assert_eq!(reads.len(), 2);
    assert_eq!(reads[0], b"hello\n");
    assert_eq!(reads[1], b"hello\n");
}

/// Scenario 2: writing to a freshly-allocated (unopened) endpoint is
/// rejected with `NotReady` and never reaches the transport.
#[test]
fn write_before_open_is_rejected() {
    let os = Arc::new(ManualOsFuncs::new());
    let (client_ll, _server_ll) = loopback_pair(Arc::clone(&os) as Arc<dyn stackio_core::OsFuncs>);
    let client = Endpoint::new(Box::new(client_ll), None, os as Arc<dyn stackio_core::OsFuncs>);

    let err = client.write(b"hello", &[]).expect_err("write before open must fail");
    assert_eq!(err.kind(), ErrorKind::NotReady);
}

/// Scenario 4: closing while an open is in flight cancels it.
/// `open_done` fires with `Cancelled` before `close_done` fires.
#[test]
fn close_races_open_cancels_it() {
    let os = Arc::new(ManualOsFuncs::new());
    let (client_ll, _server_ll) = loopback_pair(Arc::clone(&os) as Arc<dyn stackio_core::OsFuncs>);
    let client = Endpoint::new(Box::new(client_ll), Some(Box::new(LineDelimFilter::default())), Arc::clone(&os) as _);

    let order = Arc::new(Mutex::new(Vec::new()));
    let open_order = Arc::clone(&order);
    let close_order = Arc::clone(&order);

    client
        .open(Box::new(move |r| {
            open_order.lock().expect("order lock poisoned").push(format!("open_done:{:?}", r.err().map(|e| e.kind())));
        }))
        .expect("open accepted");
    client
        .close(Box::new(move || {
            close_order.lock().expect("order lock poisoned").push("close_done".to_string());
        }))
        .expect("close accepted while opening");

    os.drain_deferred();

    let log = order.lock().expect("order lock poisoned").clone();
    assert_eq!(log.len(), 2);
    assert!(log[0].starts_with("open_done:Some(Cancelled)"), "got {:?}", log);
    assert_eq!(log[1], "close_done");
}
