//! Fixed-capacity per-connection I/O buffers.
//!
//! Every buffer rests in *fill orientation*: bytes are appended at the end of
//! the filled region and the free space after it is available for the next
//! read. Consumers look at the filled region through [`IoBuffer::filled`] and
//! release what they used with [`IoBuffer::consume`], which compacts the
//! remainder back to the front. No operation ever leaves the buffer in any
//! other state, so reads, writes and decoding can be interleaved in any order.

use std::io::{self, Read, Write};

/// A fixed-size byte buffer with a single fill cursor.
///
/// The capacity never changes after construction. This is what bounds the
/// memory held by each connection and what turns a slow peer into
/// backpressure instead of unbounded growth.
pub struct IoBuffer {
    /// Backing storage, allocated once.
    data: Box<[u8]>,
    /// Number of bytes written and not yet consumed.
    len: usize,
}

impl IoBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes waiting to be consumed.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if there are no bytes waiting.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space left for appending.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// Check if at least one more byte can be appended.
    pub fn has_remaining(&self) -> bool {
        self.len < self.data.len()
    }

    /// The written, unconsumed bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Drop the first `n` filled bytes and move the rest to the front.
    ///
    /// # Panics
    /// Panics if `n` exceeds the number of filled bytes.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "consumed past the filled region");
        if n < self.len {
            self.data.copy_within(n..self.len, 0);
        }
        self.len -= n;
    }

    /// Free space to write into directly; follow with [`commit`](Self::commit).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Mark `n` bytes of the spare region as filled.
    ///
    /// # Panics
    /// Panics if `n` exceeds the free space.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.remaining(), "committed past capacity");
        self.len += n;
    }

    /// Append as much of `src` as fits, returning how many bytes were copied.
    #[cfg(test)]
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Perform one read from `reader` into the free space.
    ///
    /// `Ok(0)` means end-of-stream; callers must not call this on a full
    /// buffer, where a zero-length read would be ambiguous.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        debug_assert!(self.has_remaining(), "read into a full buffer");
        let n = reader.read(&mut self.data[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// Perform one write of the filled bytes to `writer`, compacting what
    /// remains unwritten.
    pub fn drain_into<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(&self.data[..self.len])?;
        self.consume(n);
        Ok(n)
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_put_and_consume() {
        let mut buf = IoBuffer::with_capacity(8);
        assert_eq!(buf.capacity(), 8);
        assert!(buf.is_empty());

        assert_eq!(buf.put_slice(b"hello"), 5);
        assert_eq!(buf.filled(), b"hello");
        assert_eq!(buf.remaining(), 3);

        buf.consume(2);
        assert_eq!(buf.filled(), b"llo");
        assert_eq!(buf.remaining(), 5);

        buf.consume(3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_put_slice_truncates_at_capacity() {
        let mut buf = IoBuffer::with_capacity(4);
        assert_eq!(buf.put_slice(b"abcdef"), 4);
        assert_eq!(buf.filled(), b"abcd");
        assert!(!buf.has_remaining());
        assert_eq!(buf.put_slice(b"x"), 0);
    }

    #[test]
    fn test_spare_and_commit() {
        let mut buf = IoBuffer::with_capacity(6);
        buf.put_slice(b"ab");
        buf.spare_mut()[..2].copy_from_slice(b"cd");
        buf.commit(2);
        assert_eq!(buf.filled(), b"abcd");
    }

    #[test]
    fn test_fill_from_reader() {
        let mut buf = IoBuffer::with_capacity(4);
        let mut reader = Cursor::new(b"abcdefg".to_vec());

        assert_eq!(buf.fill_from(&mut reader).unwrap(), 4);
        assert_eq!(buf.filled(), b"abcd");

        buf.consume(4);
        assert_eq!(buf.fill_from(&mut reader).unwrap(), 3);
        assert_eq!(buf.filled(), b"efg");

        buf.consume(3);
        assert_eq!(buf.fill_from(&mut reader).unwrap(), 0);
    }

    #[test]
    fn test_drain_into_partial_writer() {
        struct TwoBytes(Vec<u8>);
        impl Write for TwoBytes {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                let n = data.len().min(2);
                self.0.extend_from_slice(&data[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buf = IoBuffer::with_capacity(8);
        buf.put_slice(b"hello");
        let mut out = TwoBytes(Vec::new());

        assert_eq!(buf.drain_into(&mut out).unwrap(), 2);
        // Unwritten bytes are compacted to the front
        assert_eq!(buf.filled(), b"llo");
        assert_eq!(buf.remaining(), 5);

        buf.drain_into(&mut out).unwrap();
        buf.drain_into(&mut out).unwrap();
        assert!(buf.is_empty());
        assert_eq!(out.0, b"hello");
    }

    #[test]
    #[should_panic(expected = "consumed past the filled region")]
    fn test_consume_past_filled_panics() {
        let mut buf = IoBuffer::with_capacity(4);
        buf.put_slice(b"ab");
        buf.consume(3);
    }
}
