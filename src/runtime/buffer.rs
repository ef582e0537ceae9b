//! Per-connection buffers.
//!
//! Each connection owns one fixed-size read buffer and one growable write
//! buffer. The pair travels with the connection's work item, so exactly one
//! thread can touch it at a time. Messages longer than the read buffer are
//! truncated to its capacity.

use bytes::{Buf, BytesMut};

/// Read and write buffers of a single connection.
#[derive(Debug)]
pub struct ConnBuffers {
    /// Fixed-size read buffer.
    read: Box<[u8]>,
    /// Bytes currently held in the read buffer.
    filled: usize,
    /// Pending outbound bytes.
    write: BytesMut,
}

impl ConnBuffers {
    /// Create buffers with a read capacity of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            read: vec![0u8; size].into_boxed_slice(),
            filled: 0,
            write: BytesMut::with_capacity(size),
        }
    }

    /// Unfilled part of the read buffer.
    pub fn read_space(&mut self) -> &mut [u8] {
        &mut self.read[self.filled..]
    }

    /// Mark `n` more bytes of the read buffer as filled.
    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.read.len(), "read overflow");
        self.filled += n;
    }

    /// Whether the read buffer has no room left.
    pub fn is_read_full(&self) -> bool {
        self.filled == self.read.len()
    }

    /// Split borrow: the received message and the write buffer.
    pub fn message_and_output(&mut self) -> (&[u8], &mut BytesMut) {
        (&self.read[..self.filled], &mut self.write)
    }

    /// Bytes still waiting to be written.
    pub fn pending_write(&self) -> &[u8] {
        &self.write
    }

    /// Drop `n` bytes from the front of the write buffer after a write.
    pub fn advance_write(&mut self, n: usize) {
        self.write.advance(n);
    }

    /// Whether all outbound bytes have been written.
    pub fn is_flushed(&self) -> bool {
        self.write.is_empty()
    }

    /// Forget the current message.
    pub fn clear_read(&mut self) {
        self.filled = 0;
    }

    /// Reset both buffers.
    pub fn clear(&mut self) {
        self.filled = 0;
        self.write.clear();
    }
}
