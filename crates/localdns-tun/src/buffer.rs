use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct PoolInner {
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
    closed: AtomicBool,
}

/// Recycles fixed-size packet buffers.
///
/// The pool grows on demand and never shrinks while running. Each
/// [`PooledBuffer`] has exactly one owner; dropping it hands the storage back.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                free: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Take a free buffer, allocating a new one if none is available.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = self.inner.free.lock().unwrap().pop();
        let data = match recycled {
            Some(data) => data,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.buffer_size]
            }
        };
        PooledBuffer {
            data,
            len: 0,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a buffer to the pool. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Buffers ever allocated and not yet drained.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Free all pooled storage. Buffers released afterwards are deallocated.
    pub fn drain(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.inner.free.lock().unwrap());
        self.inner.allocated.fetch_sub(drained.len(), Ordering::Relaxed);
        tracing::debug!(buffers = drained.len(), "buffer pool drained");
        drained.len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// Fixed-capacity byte storage owned by one packet at a time.
///
/// Derefs to the filled part (`..len`); [`PooledBuffer::spare_mut`] exposes the
/// full capacity for reads and in-place packet construction.
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole backing storage, regardless of the filled length.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len(), "length beyond buffer capacity");
        self.len = len;
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.pool.closed.load(Ordering::Acquire) {
            self.pool.allocated.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        let data = std::mem::take(&mut self.data);
        self.pool.free.lock().unwrap().push(data);
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outstanding_buffers_are_distinct() {
        let pool = BufferPool::new(64);
        let mut a = pool.acquire();
        let mut b = pool.acquire();

        assert_ne!(a.spare_mut().as_ptr(), b.spare_mut().as_ptr());
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_recycles_storage() {
        let pool = BufferPool::new(64);
        let mut a = pool.acquire();
        a.spare_mut()[..3].copy_from_slice(b"abc");
        a.set_len(3);
        let ptr = a.spare_mut().as_ptr();
        pool.release(a);
        assert_eq!(pool.available(), 1);

        let mut b = pool.acquire();
        assert_eq!(b.spare_mut().as_ptr(), ptr);
        assert_eq!(b.len(), 0);
        assert_eq!(b.capacity(), 64);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_drain_frees_storage() {
        let pool = BufferPool::new(32);
        let held = pool.acquire();
        pool.release(pool.acquire());

        assert_eq!(pool.drain(), 1);
        assert_eq!(pool.allocated(), 1);

        // released after drain: deallocated, not pooled
        drop(held);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_aliases() {
        let pool = BufferPool::new(16);
        let handles: Vec<_> = (0..8u8)
            .map(|id| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut buf = pool.acquire();
                        buf.set_len(16);
                        buf.fill(id);
                        std::thread::yield_now();
                        assert!(buf.iter().all(|b| *b == id));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.allocated() <= 8);
        assert_eq!(pool.available(), pool.allocated());
    }
}
