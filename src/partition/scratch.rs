//! Erase-block sized scratch buffers owned by one open partition.

use crate::error::{Error, Result};

/// The deepest nesting of scratch buffers any operation needs (e.g. rewriting a block's headers
/// through an offset overlay, which holds the block image while the overlay merges it into the
/// underlying physical block).
pub const SCRATCH_BUFFERS: usize = 2;

#[derive(Debug)]
pub(crate) struct ScratchPool {
    free: Vec<Box<[u8]>>,
    size: usize,
}

impl ScratchPool {
    pub fn new(size: usize) -> Self {
        let free = (0..SCRATCH_BUFFERS)
            .map(|_| vec![0u8; size].into_boxed_slice())
            .collect();
        Self { free, size }
    }

    pub fn acquire(&mut self) -> Result<Box<[u8]>> {
        self.free.pop().ok_or(Error::NoMemory {
            needed: self.size as u64,
            available: 0,
        })
    }

    pub fn release(&mut self, buf: Box<[u8]>) {
        debug_assert_eq!(buf.len(), self.size);
        self.free.push(buf);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[test]
fn test_pool_exhaustion() {
    let mut pool = ScratchPool::new(64);
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert!(matches!(pool.acquire(), Err(Error::NoMemory { .. })));
    pool.release(a);
    pool.release(b);
    assert_eq!(pool.available(), SCRATCH_BUFFERS);
}
