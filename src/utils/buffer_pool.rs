//! # Buffer Pool
//!
//! Pool of fixed-size frame buffers checked out by the framer.
//!
//! Every buffer has the same limit and a frame never grows beyond it. The pool
//! keeps at most `pool_size` idle buffers; extra buffers allocated under load
//! are freed when they come back, so idle memory stays at `pool_size *
//! buffer_size`.
//!
//! ## Usage
//! ```rust
//! use msgwire::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(2, 1024);
//! let mut buffer = pool.acquire();
//! assert!(buffer.try_extend(&[1, 2, 3]));
//! assert_eq!(buffer.remaining(), 1021);
//! drop(buffer); // returned to the pool
//! assert_eq!(pool.available(), 2);
//! ```

use std::sync::{Arc, Mutex};

/// A pooled buffer that returns itself to the pool when dropped
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    limit: usize,
    max_idle: usize,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PooledBuffer {
    /// Bytes that still fit
    pub fn remaining(&self) -> usize {
        self.limit - self.buffer.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Appends `bytes` if they fit, leaving the buffer untouched otherwise
    pub fn try_extend(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.buffer.extend_from_slice(bytes);
        true
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < self.max_idle {
                self.buffer.clear();
                pool.push(std::mem::take(&mut self.buffer));
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

/// Thread-safe pool of fixed-size buffers
#[derive(Debug, Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool holding `pool_size` buffers of `buffer_size` bytes each
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let pool = (0..pool_size)
            .map(|_| Vec::with_capacity(buffer_size))
            .collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            buffer_size,
            max_idle: pool_size,
        }
    }

    /// Acquire a buffer from the pool (or allocate a new one if pool is empty)
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));

        PooledBuffer {
            buffer,
            limit: self.buffer_size,
            max_idle: self.max_idle,
            pool: self.pool.clone(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the current number of available buffers in the pool
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let pool = BufferPool::new(10, 64);
        assert_eq!(pool.available(), 10);

        let mut buf = pool.acquire();
        assert_eq!(pool.available(), 9);

        assert!(buf.try_extend(&[42]));
        assert_eq!(buf[0], 42);

        drop(buf);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(1, 64);

        {
            let mut buf1 = pool.acquire();
            assert!(buf1.try_extend(b"test"));
            assert_eq!(buf1.len(), 4);
        }

        // Buffer should be returned and cleared
        let buf2 = pool.acquire();
        assert_eq!(buf2.len(), 0);
        assert_eq!(buf2.remaining(), 64);
    }

    #[test]
    fn test_buffer_pool_empty() {
        let pool = BufferPool::new(1, 64);
        let _buf1 = pool.acquire();
        let _buf2 = pool.acquire(); // Should allocate new

        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_idle_buffers_are_capped() {
        let pool = BufferPool::new(2, 64);
        let burst: Vec<_> = (0..10).map(|_| pool.acquire()).collect();
        assert_eq!(pool.available(), 0);

        drop(burst);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_buffer_never_exceeds_limit() {
        let pool = BufferPool::new(1, 8);
        let mut buf = pool.acquire();

        assert!(buf.try_extend(&[0u8; 6]));
        assert!(!buf.try_extend(&[0u8; 3]));
        assert_eq!(buf.len(), 6);
        assert!(buf.try_extend(&[0u8; 2]));
        assert_eq!(buf.remaining(), 0);
    }
}
