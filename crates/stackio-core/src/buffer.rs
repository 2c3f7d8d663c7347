//! The single contiguous read buffer used by the FD Lower Layer.
//!
//! # Design background (Why)
//! `spec.md` §3 fixes the buffer's shape tightly: one contiguous region
//! of a fixed maximum size, with a current length and a read position,
//! and the invariant that a filter may consume any *prefix* of the
//! buffered bytes, leaving the remainder to be re-delivered on the next
//! read-enable. This is deliberately simpler than the pooled,
//! trait-object `ReadableBuffer`/`WritableBuffer` contracts the grounding
//! repo exposes for its Pipeline (`spark-core::buffer::{readable,
//! writable}`) — those exist to let arbitrary zero-copy/backing-store
//! strategies plug into a multi-stage pipeline. The FD LL has exactly one
//! concrete backing store (a `Vec<u8>` sized once at construction), so a
//! concrete struct is the right level of abstraction here; `Filter`
//! implementations above it still see byte slices, not this type.
//!
//! # Contract (What)
//! `0 <= position <= position + length <= capacity` holds after every
//! method call. `capacity == 0` is the "write-only" configuration named
//! in `spec.md` §4.D and §8: such a buffer never reports readable bytes
//! and a read-ready event is never armed for it.
use crate::error::{ErrorKind, Result, StackError};

/// A fixed-capacity contiguous byte buffer with a read cursor.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
    position: usize,
    length: usize,
}

impl Buffer {
    /// Allocate a buffer of the given capacity. `capacity == 0` is valid
    /// and denotes a write-only FD LL (`spec.md` §8 boundary behavior).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            capacity,
            position: 0,
            length: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes available to a reader right now.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The unconsumed suffix, from `position` for `length` bytes.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.position..self.position + self.length]
    }

    /// Space available for a fresh OS read: the region after the
    /// buffered-but-unconsumed suffix, up to `capacity`. Implementations
    /// that haven't fully drained old data (a short consumer read) must
    /// compact first via [`Buffer::compact`] before calling this, since
    /// the buffer does not wrap.
    pub fn writable_tail(&mut self) -> &mut [u8] {
        &mut self.data[self.position + self.length..self.capacity]
    }

    /// Record that `n` freshly read bytes landed in the slice returned by
    /// [`Buffer::writable_tail`].
    pub fn commit_write(&mut self, n: usize) -> Result<()> {
        if self.position + self.length + n > self.capacity {
            return Err(StackError::new(
                ErrorKind::Inval,
                "commit_write would overflow buffer capacity",
            ));
        }
        self.length += n;
        Ok(())
    }

    /// Consume `n` bytes as read by the filter/consumer, advancing the
    /// cursor. This is the "bytes-consumed" count a `Filter::ll_write`
    /// or FD LL read callback returns. `n` may be less than `length`: the
    /// remainder stays buffered and is re-offered on the next read-enable
    /// (`spec.md` §4.D, §8 "short user read").
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.length {
            return Err(StackError::new(
                ErrorKind::Inval,
                "consume() beyond buffered length",
            ));
        }
        self.position += n;
        self.length -= n;
        if self.length == 0 {
            self.position = 0;
        }
        Ok(())
    }

    /// Slide the unconsumed suffix back to offset zero, reclaiming the
    /// leading region for the next OS read. A no-op if already compacted
    /// or empty.
    pub fn compact(&mut self) {
        if self.position == 0 || self.length == 0 {
            if self.length == 0 {
                self.position = 0;
            }
            return;
        }
        self.data.copy_within(self.position..self.position + self.length, 0);
        self.position = 0;
    }

    /// Whether there is room for another OS read without compaction.
    pub fn has_write_room(&self) -> bool {
        self.position + self.length < self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_is_empty_with_full_capacity() {
        let buf = Buffer::with_capacity(16);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 16);
        assert!(buf.is_empty());
    }

    #[test]
    fn write_then_partial_consume_preserves_suffix() {
        let mut buf = Buffer::with_capacity(8);
        buf.writable_tail()[..5].copy_from_slice(b"hello");
        buf.commit_write(5).unwrap();
        assert_eq!(buf.readable(), b"hello");

        buf.consume(3).unwrap();
        assert_eq!(buf.readable(), b"lo");
    }

    #[test]
    fn zero_capacity_buffer_never_has_write_room() {
        let buf = Buffer::with_capacity(0);
        assert!(!buf.has_write_room());
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn compact_reclaims_consumed_prefix() {
        let mut buf = Buffer::with_capacity(4);
        buf.writable_tail()[..4].copy_from_slice(b"abcd");
        buf.commit_write(4).unwrap();
        buf.consume(2).unwrap();
        assert!(!buf.has_write_room());
        buf.compact();
        assert!(buf.has_write_room());
        assert_eq!(buf.readable(), b"cd");
    }

    #[test]
    fn consume_beyond_length_is_rejected() {
        let mut buf = Buffer::with_capacity(4);
        assert!(buf.consume(1).is_err());
    }
}
