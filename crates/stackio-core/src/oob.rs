//! Out-of-band send queue (`spec.md` §4.G).
//!
//! # Design background (Why)
//! Tool-layer code (a bridge utility, a control-plane client) sometimes
//! needs to inject priority bytes without racing an in-progress user
//! write. `spec.md` keeps this FIFO entirely inside the stack runtime
//! specifically because it is what exercises the write-ready path: a
//! short OOB write must resume exactly where it left off on the next
//! `WRITE_READY`, and a `send_done` callback must fire exactly once,
//! after the *whole* record is emitted, not per partial write.
//!
//! # Contract (What)
//! FIFO of pending records; enqueue at tail, dequeue at head. On each
//! `WRITE_READY`, if the head has bytes left, the Base Endpoint writes
//! them tagged `"oob"`; a short write advances the head in place without
//! popping it.
use bytes::Bytes;
use std::collections::VecDeque;

/// One pending out-of-band record.
struct Record {
    data: Bytes,
    sent: usize,
    done: Option<Box<dyn FnOnce() + Send>>,
}

/// FIFO of records awaiting transmission ahead of ordinary writes.
#[derive(Default)]
pub struct OobQueue {
    records: VecDeque<Record>,
}

impl OobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to the tail. `done`, if present, fires exactly
    /// once after every byte of `data` has been written.
    pub fn push(&mut self, data: Bytes, done: Option<Box<dyn FnOnce() + Send>>) {
        self.records.push_back(Record { data, sent: 0, done });
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The unsent suffix of the head record, or `None` if the queue is
    /// empty.
    pub fn head(&self) -> Option<&[u8]> {
        self.records.front().map(|r| &r.data[r.sent..])
    }

    /// Record that `n` bytes of the head record were written. Pops and
    /// runs `done` (outside any lock the caller may hold — the caller is
    /// responsible for that, as with every up-call in this crate) if the
    /// record is now fully sent. Returns the popped record's `done`
    /// callback, if the record completed, so the caller can invoke it
    /// after releasing the endpoint lock.
    #[must_use]
    pub fn advance(&mut self, n: usize) -> Option<Box<dyn FnOnce() + Send>> {
        let Some(record) = self.records.front_mut() else {
            return None;
        };
        record.sent += n;
        if record.sent >= record.data.len() {
            let record = self.records.pop_front().expect("front just checked");
            record.done
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn short_write_advances_head_in_place() {
        let mut q = OobQueue::new();
        q.push(Bytes::from_static(b"0123456789"), None);
        assert_eq!(q.head(), Some(&b"0123456789"[..]));
        assert!(q.advance(4).is_none());
        assert_eq!(q.head(), Some(&b"456789"[..]));
        assert!(!q.is_empty());
    }

    #[test]
    fn send_done_fires_once_after_full_record() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let mut q = OobQueue::new();
        q.push(
            Bytes::from_static(b"hello"),
            Some(Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(q.advance(3).is_none());
        let done = q.advance(2);
        assert!(done.is_some());
        done.unwrap()();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = OobQueue::new();
        q.push(Bytes::from_static(b"a"), None);
        q.push(Bytes::from_static(b"b"), None);
        assert_eq!(q.head(), Some(&b"a"[..]));
        let _ = q.advance(1);
        assert_eq!(q.head(), Some(&b"b"[..]));
    }
}
