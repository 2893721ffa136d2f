//! Fixed-block pools.
//!
//! A [`Pool`] owns a fixed number of pre-built blocks. `acquire` pops a block
//! off a free list and `release` (or dropping the [`Pooled`] handle) pushes it
//! back. The free list is reserved up front, so neither path allocates, and
//! the lock is held only for a single push or pop. An empty free list fails
//! fast with [`TransportError::PoolExhausted`]; nothing ever waits for a block.
//!
//! Blocks are not scrubbed on release. A caller that needs a clean block asks
//! for one with `zero_fill`, which keeps the hot path free of redundant
//! memsets. Blocks that own other pooled resources give them back through
//! [`Block::recycle`] before returning to the free list.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, TransportError};

/// A reusable block that can be reset to a clean state.
///
/// `Default` supplies the placeholder left in a handle while its block
/// travels back to the free list; it should not allocate.
pub trait Block: Default + Send + 'static {
    /// Return the block to its initial contents.
    fn clear(&mut self);

    /// Drop anything the block holds on behalf of other pools. Runs on
    /// every release.
    fn recycle(&mut self) {}
}

impl Block for Box<[u8]> {
    fn clear(&mut self) {
        self.fill(0);
    }
}

/// A pool of fixed-capacity byte blocks.
pub type BufferPool = Pool<Box<[u8]>>;

/// A byte block checked out of a [`BufferPool`].
pub type WireBuffer = Pooled<Box<[u8]>>;

struct Shared<T> {
    name: &'static str,
    free: Mutex<Vec<T>>,
    total: usize,
    in_use: AtomicUsize,
}

/// Fixed-block allocator. Cloning yields another handle to the same blocks.
pub struct Pool<T: Block> {
    shared: Arc<Shared<T>>,
}

impl<T: Block> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Block> Pool<T> {
    /// Build a pool of `blocks` blocks, each produced by `make`.
    pub fn new(name: &'static str, blocks: usize, mut make: impl FnMut() -> T) -> Result<Self> {
        if blocks == 0 {
            return Err(TransportError::InvalidConfig(format!(
                "{name} pool needs at least one block"
            )));
        }

        let mut free = Vec::new();
        free.try_reserve_exact(blocks)
            .map_err(|_| TransportError::AllocationFailed { pool: name, blocks })?;
        free.extend((0..blocks).map(|_| make()));

        tracing::debug!(pool = name, blocks, "pool created");

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                free: Mutex::new(free),
                total: blocks,
                in_use: AtomicUsize::new(0),
            }),
        })
    }

    /// Take a block. Never blocks; fails when every block is handed out.
    pub fn acquire(&self, zero_fill: bool) -> Result<Pooled<T>> {
        let block = self.shared.free.lock().pop();
        let Some(mut block) = block else {
            return Err(TransportError::PoolExhausted {
                pool: self.shared.name,
            });
        };

        self.shared.in_use.fetch_add(1, Ordering::AcqRel);
        if zero_fill {
            block.clear();
        }

        Ok(Pooled {
            block,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Hand a block back. Equivalent to dropping it.
    pub fn release(&self, block: Pooled<T>) {
        drop(block);
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Total number of blocks owned by the pool.
    pub fn capacity(&self) -> usize {
        self.shared.total
    }

    /// Blocks currently checked out.
    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::Acquire)
    }

    /// Blocks ready to be acquired.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }
}

impl BufferPool {
    /// Build a pool of `blocks` zeroed byte blocks of `block_size` bytes.
    pub fn with_block_size(name: &'static str, blocks: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(TransportError::InvalidConfig(format!(
                "{name} pool block size must be non-zero"
            )));
        }
        Self::new(name, blocks, || vec![0u8; block_size].into_boxed_slice())
    }
}

impl<T: Block> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.total)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Exclusive handle to a pooled block. Returns the block on drop.
pub struct Pooled<T: Block> {
    block: T,
    shared: Arc<Shared<T>>,
}

impl<T: Block> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.block
    }
}

impl<T: Block> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.block
    }
}

impl<T: Block> Drop for Pooled<T> {
    fn drop(&mut self) {
        let mut block = mem::take(&mut self.block);
        block.recycle();
        // Decrement before the block is visible again so `in_use` never
        // exceeds `total`.
        self.shared.in_use.fetch_sub(1, Ordering::AcqRel);
        // Capacity was reserved for every block at construction, so this push
        // never reallocates.
        self.shared.free.lock().push(block);
    }
}

impl<T: Block + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.shared.name)
            .field("block", &self.block)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_tracks_usage() {
        let pool = BufferPool::with_block_size("wire", 2, 16).unwrap();
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.in_use(), 0);

        let a = pool.acquire(false).unwrap();
        let b = pool.acquire(true).unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);
        assert_eq!(a.len(), 16);

        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        drop(b);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn exhausted_pool_fails_fast_without_touching_live_blocks() {
        let pool = BufferPool::with_block_size("wire", 1, 8).unwrap();
        let mut held = pool.acquire(true).unwrap();
        held.copy_from_slice(&[7u8; 8]);

        let err = pool.acquire(true).unwrap_err();
        assert!(matches!(err, TransportError::PoolExhausted { pool: "wire" }));
        assert_eq!(&held[..], &[7u8; 8]);
        assert!(pool.in_use() <= pool.capacity());
    }

    #[test]
    fn zero_fill_only_on_request() {
        let pool = BufferPool::with_block_size("wire", 1, 4).unwrap();
        {
            let mut buf = pool.acquire(false).unwrap();
            buf.copy_from_slice(&[1, 2, 3, 4]);
        }

        let dirty = pool.acquire(false).unwrap();
        assert_eq!(&dirty[..], &[1, 2, 3, 4]);
        drop(dirty);

        let clean = pool.acquire(true).unwrap();
        assert_eq!(&clean[..], &[0, 0, 0, 0]);
    }

    #[derive(Default)]
    struct Holder {
        inner: Option<WireBuffer>,
    }

    impl Block for Holder {
        fn clear(&mut self) {
            self.inner = None;
        }

        fn recycle(&mut self) {
            self.inner = None;
        }
    }

    #[test]
    fn release_recycles_nested_blocks() {
        let buffers = BufferPool::with_block_size("wire", 1, 8).unwrap();
        let holders = Pool::new("holder", 1, Holder::default).unwrap();

        let mut holder = holders.acquire(false).unwrap();
        holder.inner = Some(buffers.acquire(false).unwrap());
        assert_eq!(buffers.in_use(), 1);

        drop(holder);
        assert_eq!(holders.in_use(), 0);
        assert_eq!(buffers.in_use(), 0);
        assert_eq!(buffers.available(), 1);
    }

    #[test]
    fn zero_blocks_is_rejected() {
        let err = BufferPool::with_block_size("wire", 0, 8).unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }

    #[test]
    fn blocks_released_from_other_threads_return_to_pool() {
        let pool = BufferPool::with_block_size("wire", 4, 32).unwrap();
        let blocks: Vec<_> = (0..4).map(|_| pool.acquire(false).unwrap()).collect();
        assert!(pool.acquire(false).is_err());

        std::thread::spawn(move || drop(blocks)).join().unwrap();
        assert_eq!(pool.in_use(), 0);
        assert!(pool.acquire(false).is_ok());
    }
}
