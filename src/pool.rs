use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

// Returned regions are recycled across clients; beyond this count they are
// handed back to the allocator instead.
const MAX_POOLED_BUFFERS: usize = 32;

static BUFFER_POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// A byte region rented from the process-wide pool. Dropping it returns the
/// region to the pool, so every exit path releases, panics included.
///
/// The region has a fixed length equal to its capacity; callers that need a
/// cursor layer one on top (see [`Assembler`]).
pub(crate) struct PooledBuf {
    data: Vec<u8>,
}

impl PooledBuf {
    /// Rents a region of at least `min_capacity` bytes, reusing a pooled one
    /// when any is large enough. Contents are unspecified.
    pub fn acquire(min_capacity: usize) -> Self {
        let reused = {
            let mut pool = BUFFER_POOL.lock().unwrap_or_else(|e| e.into_inner());
            let pos = pool.iter().position(|b| b.capacity() >= min_capacity);
            pos.map(|i| pool.swap_remove(i))
        };
        let mut data = reused.unwrap_or_else(|| Vec::with_capacity(min_capacity));
        // expose the whole allocation as the region
        data.resize(data.capacity(), 0);
        PooledBuf { data }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        if data.capacity() == 0 {
            return;
        }
        let mut pool = BUFFER_POOL.lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() < MAX_POOLED_BUFFERS {
            pool.push(data);
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Accumulates payload slices into one contiguous pooled region.
///
/// `append` grows by doubling through the pool, copying what was already
/// written and releasing the outgrown region. `reset` only rewinds the
/// cursor, so reusing the assembler between messages touches no memory.
pub(crate) struct Assembler {
    buf: PooledBuf,
    len: usize,
}

impl Assembler {
    pub fn with_capacity(capacity: usize) -> Self {
        Assembler {
            buf: PooledBuf::acquire(capacity.max(1)),
            len: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let needed = self.len + bytes.len();
        if needed > self.buf.len() {
            self.grow(needed);
        }
        self.buf[self.len..needed].copy_from_slice(bytes);
        self.len = needed;
    }

    fn grow(&mut self, needed: usize) {
        let mut capacity = self.buf.len().max(1);
        while capacity < needed {
            capacity *= 2;
        }
        let mut bigger = PooledBuf::acquire(capacity);
        bigger[..self.len].copy_from_slice(&self.buf[..self.len]);
        // the outgrown region goes back to the pool on drop
        self.buf = bigger;
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
