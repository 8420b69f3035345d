//! Kernel pipes.
//!
//! A pipe is a shared byte ring with one reader handle and one writer
//! handle. The ring primitive never blocks; blocking handles park the
//! calling process on the pipe's wait queue and are woken by the peer.

use alloc::sync::Arc;

use spin::Mutex;

use crate::buffer::TransactionalBuffer;
use crate::error::{SysError, SysResult};
use crate::utils::ring_buffer::RingBuffer;

use super::entity::SupportedOperations;
use super::WaitQueue;

const PIPE_DEFAULT_SIZE: usize = 4096;

pub struct Pipe {
    ring: Mutex<RingBuffer>,
    /// Parked readers waiting for bytes and writers waiting for space.
    waiters: WaitQueue,
}

impl Pipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(RingBuffer::new(PIPE_DEFAULT_SIZE)),
            waiters: WaitQueue::new(),
        })
    }

    /// Fill `buffer` completely from the pipe.
    pub fn read(&self, buffer: &mut dyn TransactionalBuffer, blocking: bool) -> SysResult<usize> {
        loop {
            let result = self.ring.lock().read_to(buffer, false);
            match result {
                Ok(read) => {
                    self.waiters.wake_all();
                    return Ok(read);
                }
                Err(SysError::TryAgain) if blocking => self.waiters.park_current(),
                Err(error) => return Err(error),
            }
        }
    }

    /// Drain `buffer` completely into the pipe.
    pub fn write(&self, buffer: &dyn TransactionalBuffer, blocking: bool) -> SysResult<usize> {
        loop {
            let result = self.ring.lock().write_from(buffer, false);
            match result {
                Ok(written) => {
                    self.waiters.wake_all();
                    return Ok(written);
                }
                Err(SysError::TryAgain) if blocking => self.waiters.park_current(),
                Err(error) => return Err(error),
            }
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.ring.lock().pending_bytes()
    }
}

/// One end of a pipe: reader xor writer.
pub struct PipeHandle {
    pipe: Arc<Pipe>,
    is_reader: bool,
    is_blocking: bool,
}

impl PipeHandle {
    pub fn reader(pipe: Arc<Pipe>, blocking: bool) -> Self {
        Self {
            pipe,
            is_reader: true,
            is_blocking: blocking,
        }
    }

    pub fn writer(pipe: Arc<Pipe>, blocking: bool) -> Self {
        Self {
            pipe,
            is_reader: false,
            is_blocking: blocking,
        }
    }

    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    pub(super) fn supported_operations(&self) -> SupportedOperations {
        if self.is_reader {
            SupportedOperations::READ
        } else {
            SupportedOperations::WRITE
        }
    }

    pub(super) fn read(&self, buffer: &mut dyn TransactionalBuffer) -> SysResult<usize> {
        if !self.is_reader {
            return Err(SysError::NotSupported);
        }
        self.pipe.read(buffer, self.is_blocking)
    }

    pub(super) fn write(&self, buffer: &dyn TransactionalBuffer) -> SysResult<usize> {
        if self.is_reader {
            return Err(SysError::NotSupported);
        }
        self.pipe.write(buffer, self.is_blocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::KernelBuffer;
    use crate::process::entity::{Entity, INVALID_OFFSET};

    #[test]
    fn echo_through_nonblocking_handles() {
        let pipe = Pipe::new();
        let reader = Entity::Pipe(PipeHandle::reader(pipe.clone(), false));
        let writer = Entity::Pipe(PipeHandle::writer(pipe.clone(), false));

        let mut out = *b"abc";
        let buffer = KernelBuffer::new(&mut out);
        assert_eq!(writer.write(INVALID_OFFSET, &buffer).unwrap(), 3);
        assert_eq!(pipe.pending_bytes(), 3);

        let mut data = [0u8; 3];
        let mut buffer = KernelBuffer::new(&mut data);
        assert_eq!(reader.read(INVALID_OFFSET, &mut buffer).unwrap(), 3);
        assert_eq!(&data, b"abc");
    }

    #[test]
    fn wrong_direction_is_refused() {
        let pipe = Pipe::new();
        let reader = Entity::Pipe(PipeHandle::reader(pipe.clone(), false));
        let writer = Entity::Pipe(PipeHandle::writer(pipe, false));

        assert_eq!(
            reader.supported_operations(),
            SupportedOperations::READ
        );
        let mut data = [0u8; 1];
        let buffer = KernelBuffer::new(&mut data);
        assert_eq!(
            reader.write(INVALID_OFFSET, &buffer),
            Err(SysError::NotSupported)
        );
        let mut data = [0u8; 1];
        let mut buffer = KernelBuffer::new(&mut data);
        assert_eq!(
            writer.read(INVALID_OFFSET, &mut buffer),
            Err(SysError::NotSupported)
        );
    }

    #[test]
    fn nonblocking_full_and_empty_report_again() {
        let pipe = Pipe::new();
        let reader = PipeHandle::reader(pipe.clone(), false);
        let writer = PipeHandle::writer(pipe, false);

        let mut data = [0u8; 1];
        let mut buffer = KernelBuffer::new(&mut data);
        assert_eq!(reader.read(&mut buffer), Err(SysError::TryAgain));

        // Demand more than the ring can ever hold.
        let mut huge = alloc::vec![0u8; PIPE_DEFAULT_SIZE];
        let buffer = KernelBuffer::new(&mut huge);
        assert_eq!(writer.write(&buffer), Err(SysError::TryAgain));
    }
}
