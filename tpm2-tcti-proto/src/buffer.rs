//! A growable staging area for bytes that were received but not yet consumed as a whole packet.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// The default initial capacity of a [`ReassemblyBuffer`]. The buffer grows past this as needed.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// More bytes were requested than are currently buffered.
    #[error("requested {requested} bytes but only {available} are buffered")]
    NotEnoughData { requested: usize, available: usize },
}

/// An ordered byte sequence where bytes are only ever appended at the tail and removed from the
/// head.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    inner: BytesMut,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends bytes to the tail, growing the backing storage if needed.
    pub fn push(&mut self, chunk: &[u8]) {
        self.inner.extend_from_slice(chunk);
    }

    /// Returns the first `length` bytes without removing them.
    pub fn peek(&self, length: usize) -> Result<&[u8], BufferError> {
        self.ensure_available(length)?;
        Ok(&self.inner[..length])
    }

    /// Removes and returns the first `length` bytes.
    pub fn pop(&mut self, length: usize) -> Result<Bytes, BufferError> {
        self.ensure_available(length)?;
        Ok(self.inner.split_to(length).freeze())
    }

    /// The amount of bytes currently held.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn ensure_available(&self, length: usize) -> Result<(), BufferError> {
        match self.inner.len() >= length {
            true => Ok(()),
            false => Err(BufferError::NotEnoughData {
                requested: length,
                available: self.inner.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferError, ReassemblyBuffer};

    #[test]
    fn test_push_peek_pop() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.push(&[1, 2, 3]);
        buffer.push(&[4, 5]);

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.peek(2), Ok(&[1u8, 2][..]));
        assert_eq!(buffer.len(), 5);

        assert_eq!(buffer.pop(3).unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.peek(2), Ok(&[4u8, 5][..]));
    }

    #[test]
    fn test_not_enough_data() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.push(&[9, 9, 9]);

        let error = BufferError::NotEnoughData {
            requested: 4,
            available: 3,
        };
        assert_eq!(buffer.peek(4), Err(error));
        assert_eq!(buffer.pop(4), Err(error));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let mut buffer = ReassemblyBuffer::with_capacity(16);
        let chunk: Vec<u8> = (0..=255u8).collect();
        for _ in 0..1024 {
            buffer.push(&chunk);
        }

        assert_eq!(buffer.len(), 256 * 1024);
        let first = buffer.pop(300).unwrap();
        assert_eq!(first[0], 0);
        assert_eq!(first[255], 255);
        assert_eq!(first[256], 0);
        assert_eq!(buffer.peek(1).unwrap()[0], 44);
    }

    #[test]
    fn test_pop_zero() {
        let mut buffer = ReassemblyBuffer::new();
        assert!(buffer.pop(0).unwrap().is_empty());
        assert!(buffer.is_empty());
    }
}
