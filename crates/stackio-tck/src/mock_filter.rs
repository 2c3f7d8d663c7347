//! Filters used to exercise the Base Endpoint without a real protocol.
//!
//! # Design background (Why)
//! `spec.md` §8 scenario 1 needs a msgdelim-shaped filter (one that
//! "preserves message boundaries") to demonstrate the round-trip
//! property without pulling in an actual framing crate; [`LineDelimFilter`]
//! is the minimal instance of that shape, splitting on `b'\n'` the way
//! the real msgdelim filter splits on a configurable delimiter.
//! [`PassthroughFilter`] is the other extreme: a filter that does
//! nothing, used by tests that only care about the LL/Base wiring.
use stackio_core::error::Result;
use stackio_core::filter::{Filter, FilterBaseCallback, Progress, Readiness};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// A filter that forwards bytes unchanged in both directions and
/// connects immediately. Used where a test needs "a filter is present"
/// without any protocol semantics.
#[derive(Default)]
pub struct PassthroughFilter {
    base: Option<Arc<dyn FilterBaseCallback>>,
}

impl Filter for PassthroughFilter {
    fn try_connect(&mut self, _deadline: Instant) -> Result<Progress> {
        Ok(Progress::Success)
    }

    fn try_disconnect(&mut self, _deadline: Instant) -> Result<Progress> {
        Ok(Progress::Success)
    }

    fn ul_write(
        &mut self,
        sg: &[u8],
        aux: &[&str],
        ll_emit: &mut dyn FnMut(&[u8], &[&str]) -> Result<usize>,
    ) -> Result<usize> {
        if sg.is_empty() {
            return Ok(0);
        }
        ll_emit(sg, aux)
    }

    fn ll_write(
        &mut self,
        buf: &[u8],
        aux: &[&str],
        ul_emit: &mut dyn FnMut(&[u8], &[&str]) -> Result<usize>,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        ul_emit(buf, aux)
    }

    fn readiness(&self) -> Readiness {
        Readiness::default()
    }

    fn setup(&mut self, base: Arc<dyn FilterBaseCallback>) -> Result<()> {
        self.base = Some(base);
        Ok(())
    }

    fn control(&mut self, _get: bool, _option: &str, _buf: &mut Vec<u8>) -> Result<()> {
        Err(stackio_core::error::StackError::from_kind(
            stackio_core::error::ErrorKind::NotSup,
        ))
    }
}

/// A minimal message-delimiter filter: buffers `ll_write` input and
/// emits one `ul_emit` call per complete `\n`-terminated line, the same
/// "transparent" framing semantics `spec.md` §8 attributes to msgdelim.
/// The write side is untouched — callers are expected to append their
/// own delimiter.
#[derive(Default)]
pub struct LineDelimFilter {
    base: Option<Arc<dyn FilterBaseCallback>>,
    pending: VecDeque<u8>,
    lines_ready: VecDeque<Vec<u8>>,
}

impl Filter for LineDelimFilter {
    fn try_connect(&mut self, _deadline: Instant) -> Result<Progress> {
        Ok(Progress::Success)
    }

    fn try_disconnect(&mut self, _deadline: Instant) -> Result<Progress> {
        Ok(Progress::Success)
    }

    fn ul_write(
        &mut self,
        sg: &[u8],
        aux: &[&str],
        ll_emit: &mut dyn FnMut(&[u8], &[&str]) -> Result<usize>,
    ) -> Result<usize> {
        if sg.is_empty() {
            return Ok(0);
        }
        ll_emit(sg, aux)
    }

    fn ll_write(
        &mut self,
        buf: &[u8],
        aux: &[&str],
        ul_emit: &mut dyn FnMut(&[u8], &[&str]) -> Result<usize>,
    ) -> Result<usize> {
        let consumed = if buf.is_empty() {
            0
        } else {
            self.pending.extend(buf.iter().copied());
            while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                self.lines_ready.push_back(line);
            }
            buf.len()
        };

        while let Some(line) = self.lines_ready.pop_front() {
            ul_emit(&line, aux)?;
        }
        Ok(consumed)
    }

    fn readiness(&self) -> Readiness {
        Readiness {
            ul_read_pending: !self.lines_ready.is_empty(),
            ..Readiness::default()
        }
    }

    fn setup(&mut self, base: Arc<dyn FilterBaseCallback>) -> Result<()> {
        self.base = Some(base);
        Ok(())
    }

    fn control(&mut self, _get: bool, _option: &str, _buf: &mut Vec<u8>) -> Result<()> {
        Err(stackio_core::error::StackError::from_kind(
            stackio_core::error::ErrorKind::NotSup,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_delim_splits_two_messages_in_one_buffer() {
        let mut filter = LineDelimFilter::default();
        let mut lines: Vec<Vec<u8>> = Vec::new();
        let mut sink = |data: &[u8], _aux: &[&str]| -> Result<usize> {
            lines.push(data.to_vec());
            Ok(data.len())
        };
        let consumed = filter.ll_write(b"hello\nworld\n", &[], &mut sink).unwrap();
        assert_eq!(consumed, 12);
        assert_eq!(lines, vec![b"hello\n".to_vec(), b"world\n".to_vec()]);
    }

    #[test]
    fn line_delim_holds_partial_line_until_newline_arrives() {
        let mut filter = LineDelimFilter::default();
        let mut lines: Vec<Vec<u8>> = Vec::new();
        let mut sink = |data: &[u8], _aux: &[&str]| -> Result<usize> {
            lines.push(data.to_vec());
            Ok(data.len())
        };
        filter.ll_write(b"hel", &[], &mut sink).unwrap();
        assert!(lines.is_empty());
        filter.ll_write(b"lo\n", &[], &mut sink).unwrap();
        assert_eq!(lines, vec![b"hello\n".to_vec()]);
    }
}
