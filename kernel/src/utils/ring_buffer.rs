//! Byte ring buffer backing pipes and the Interlink data streams.
//!
//! The primitive itself never blocks: callers opt into partial transfers,
//! and a full/empty ring reports `TryAgain` when a complete transfer was
//! demanded. One slot is kept free to distinguish full from empty.

use alloc::vec;
use alloc::vec::Vec;

use crate::buffer::TransactionalBuffer;
use crate::error::{SysError, SysResult};

pub struct RingBuffer {
    buffer: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl RingBuffer {
    pub fn new(size: usize) -> Self {
        debug_assert!(size >= 2);
        Self {
            buffer: vec![0; size],
            read_idx: 0,
            write_idx: 0,
        }
    }

    /// Bytes available to read.
    pub fn pending_bytes(&self) -> usize {
        if self.write_idx >= self.read_idx {
            self.write_idx - self.read_idx
        } else {
            self.buffer.len() - self.read_idx + self.write_idx
        }
    }

    /// Bytes that can be written before the ring is full.
    pub fn free_bytes(&self) -> usize {
        if self.write_idx >= self.read_idx {
            self.buffer.len() - self.write_idx + self.read_idx - 1
        } else {
            self.read_idx - self.write_idx - 1
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Drain the ring into `buffer`, filling it from offset 0.
    ///
    /// With `partial` unset the entire `buffer.size()` must be available or
    /// `TryAgain` is returned and nothing is consumed. Returns bytes read.
    pub fn read_to(
        &mut self,
        buffer: &mut dyn TransactionalBuffer,
        partial: bool,
    ) -> SysResult<usize> {
        if !partial && self.pending_bytes() < buffer.size() {
            return Err(SysError::TryAgain);
        }

        let mut bytes_read = 0;
        // At most two contiguous segments: [read..end) then [0..write).
        while self.pending_bytes() > 0 && bytes_read < buffer.size() {
            let segment = if self.write_idx >= self.read_idx {
                self.write_idx - self.read_idx
            } else {
                self.buffer.len() - self.read_idx
            };
            let to_read = segment.min(buffer.size() - bytes_read);
            buffer.write_from(&self.buffer[self.read_idx..self.read_idx + to_read], bytes_read)?;
            bytes_read += to_read;
            self.read_idx += to_read;
            if self.read_idx == self.buffer.len() {
                self.read_idx = 0;
            }
        }
        Ok(bytes_read)
    }

    /// Fill the ring from `buffer`, consuming it from offset 0.
    ///
    /// With `partial` unset the entire `buffer.size()` must fit or
    /// `TryAgain` is returned and nothing is copied. Returns bytes written.
    pub fn write_from(
        &mut self,
        buffer: &dyn TransactionalBuffer,
        partial: bool,
    ) -> SysResult<usize> {
        if !partial && self.free_bytes() < buffer.size() {
            return Err(SysError::TryAgain);
        }

        let mut bytes_written = 0;
        while self.free_bytes() > 0 && bytes_written < buffer.size() {
            let mut segment = if self.write_idx >= self.read_idx {
                self.buffer.len() - self.write_idx
            } else {
                self.read_idx - self.write_idx - 1
            };
            // The guard byte: never write the slot just before read_idx.
            if self.write_idx >= self.read_idx && self.read_idx == 0 {
                segment -= 1;
            }
            let to_write = segment.min(buffer.size() - bytes_written);
            if to_write == 0 {
                break;
            }
            let write_idx = self.write_idx;
            buffer.read_to(
                &mut self.buffer[write_idx..write_idx + to_write],
                bytes_written,
            )?;
            bytes_written += to_write;
            self.write_idx += to_write;
            if self.write_idx == self.buffer.len() {
                self.write_idx = 0;
            }
        }
        Ok(bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::KernelBuffer;

    #[test]
    fn fill_and_drain() {
        let mut ring = RingBuffer::new(8);
        assert_eq!(ring.pending_bytes(), 0);
        assert_eq!(ring.free_bytes(), 7);

        let mut data = *b"abcde";
        let src = KernelBuffer::new(&mut data);
        assert_eq!(ring.write_from(&src, false).unwrap(), 5);
        assert_eq!(ring.pending_bytes(), 5);

        let mut out = [0u8; 5];
        let mut dst = KernelBuffer::new(&mut out);
        assert_eq!(ring.read_to(&mut dst, false).unwrap(), 5);
        assert_eq!(&out, b"abcde");
        assert_eq!(ring.pending_bytes(), 0);
    }

    #[test]
    fn wrap_around() {
        let mut ring = RingBuffer::new(8);
        for round in 0..5 {
            let mut data = [round as u8; 5];
            let src = KernelBuffer::new(&mut data);
            assert_eq!(ring.write_from(&src, false).unwrap(), 5);
            let mut out = [0u8; 5];
            let mut dst = KernelBuffer::new(&mut out);
            assert_eq!(ring.read_to(&mut dst, false).unwrap(), 5);
            assert_eq!(out, [round as u8; 5]);
        }
    }

    #[test]
    fn full_transfer_demanded() {
        let mut ring = RingBuffer::new(8);
        let mut data = [0u8; 10];
        let src = KernelBuffer::new(&mut data);
        // Never fits: capacity leaves 7 usable bytes.
        assert_eq!(ring.write_from(&src, false), Err(SysError::TryAgain));
        // Partial write fills what it can.
        assert_eq!(ring.write_from(&src, true).unwrap(), 7);
        assert_eq!(ring.free_bytes(), 0);

        let mut small = [0u8; 3];
        let mut dst = KernelBuffer::new(&mut small);
        assert_eq!(ring.read_to(&mut dst, false).unwrap(), 3);
        assert_eq!(ring.pending_bytes(), 4);
    }

    #[test]
    fn empty_read_demanding_full_fails() {
        let mut ring = RingBuffer::new(8);
        let mut out = [0u8; 1];
        let mut dst = KernelBuffer::new(&mut out);
        assert_eq!(ring.read_to(&mut dst, false), Err(SysError::TryAgain));
        assert_eq!(ring.read_to(&mut dst, true).unwrap(), 0);
    }
}
