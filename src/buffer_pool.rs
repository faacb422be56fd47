//! Chunk buffer pool.
//!
//! Recycles the byte regions that carry chunk data so that sustained
//! throughput does not turn into allocator churn. Buffers travel inside
//! chunks; when the owning chunk is retired the [`PooledBuffer`] is dropped
//! and its allocation goes back to the pool (or is freed if the pool is full).
//!
//! The pool also counts live buffers. After an operation has drained,
//! [`BufferPool::outstanding`] must be zero; anything else is a leak.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

#[derive(Debug, Clone)]
pub struct BufferPool {
    recycler: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    default_capacity: usize,
    metrics: Arc<PoolMetricsInner>,
}

impl BufferPool {
    /// * `default_capacity` - capacity of freshly allocated buffers
    /// * `max_buffers` - how many idle buffers the pool keeps around
    pub fn new(default_capacity: usize, max_buffers: usize) -> Self {
        let (tx, rx) = bounded(max_buffers.max(1));
        Self {
            recycler: tx,
            receiver: rx,
            default_capacity,
            metrics: Arc::new(PoolMetricsInner::default()),
        }
    }

    /// Acquires an empty buffer with room for at least `min_capacity` bytes.
    pub fn acquire(&self, min_capacity: usize) -> PooledBuffer {
        let mut buffer = match self.receiver.try_recv() {
            Ok(mut buffer) => {
                buffer.clear();
                self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                self.metrics.created.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.default_capacity.max(min_capacity))
            }
        };
        if buffer.capacity() < min_capacity {
            buffer.reserve_exact(min_capacity);
        }
        self.metrics.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buffer,
            recycler: self.recycler.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.metrics.outstanding.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            created: self.metrics.created.load(Ordering::Relaxed),
            recycled: self.metrics.recycled.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }
}

/// A snapshot of buffer pool metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetricsSnapshot {
    /// Number of buffers allocated by the pool
    pub created: usize,
    /// Number of acquisitions served from a recycled buffer
    pub recycled: usize,
    /// Number of buffers freed because the pool was full
    pub dropped: usize,
    /// Number of buffers currently owned by chunks
    pub outstanding: usize,
}

#[derive(Debug, Default)]
struct PoolMetricsInner {
    created: AtomicUsize,
    recycled: AtomicUsize,
    dropped: AtomicUsize,
    outstanding: AtomicUsize,
}

/// A buffer allocated from a [`BufferPool`]; returned to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    recycler: Sender<Vec<u8>>,
    metrics: Arc<PoolMetricsInner>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        if let Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) =
            self.recycler.try_send(buffer)
        {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
