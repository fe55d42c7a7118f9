//! Typed free-list pools for push and pull snapshots.
//!
//! [`SnapshotPool`] hands out boxed buffers and takes them back after an
//! explicit [`Poolable::reset`]. Boxing keeps each buffer at a stable
//! address for its whole life, so the pipeline can move buffers through
//! channels without copying their contents and tests can observe reuse by
//! address.

use crossbeam_channel::{unbounded, Receiver, Sender};
use tether_core::Poolable;

/// Single-owner pool of reusable `T` buffers.
///
/// `alloc` and `free` take `&mut self`: only the owning side touches the
/// free list. Buffers consumed elsewhere come back through a [`Recycler`].
pub struct SnapshotPool<T: Poolable> {
    free: Vec<Box<T>>,
    returned_rx: Receiver<Box<T>>,
    returned_tx: Sender<Box<T>>,
    backing_allocations: usize,
    label: &'static str,
}

impl<T: Poolable> SnapshotPool<T> {
    /// Create an empty pool. `label` names the pool in trace output.
    pub fn new(label: &'static str) -> Self {
        let (returned_tx, returned_rx) = unbounded();
        Self {
            free: Vec::new(),
            returned_rx,
            returned_tx,
            backing_allocations: 0,
            label,
        }
    }

    /// Take a reset buffer, allocating a new one only if none is free.
    pub fn alloc(&mut self) -> Box<T> {
        self.collect_returned();
        match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.backing_allocations += 1;
                tracing::trace!(
                    pool = self.label,
                    backing = self.backing_allocations,
                    "pool grew"
                );
                Box::default()
            }
        }
    }

    /// Reset `buf` and return it to the free list.
    pub fn free(&mut self, mut buf: Box<T>) {
        buf.reset();
        self.free.push(buf);
    }

    /// A handle through which another thread can return buffers.
    pub fn recycler(&self) -> Recycler<T> {
        Recycler {
            tx: self.returned_tx.clone(),
        }
    }

    /// Number of distinct buffers this pool has ever allocated.
    pub fn backing_allocations(&self) -> usize {
        self.backing_allocations
    }

    /// Number of buffers currently free, including ones returned but not
    /// yet collected.
    pub fn available(&self) -> usize {
        self.free.len() + self.returned_rx.len()
    }

    /// Drop every free buffer and restart the backing count.
    ///
    /// Buffers still out on loan are unaffected; if they come back they
    /// are reused as usual.
    pub fn clear(&mut self) {
        self.collect_returned();
        self.free.clear();
        self.backing_allocations = 0;
    }

    fn collect_returned(&mut self) {
        self.free.extend(self.returned_rx.try_iter());
    }
}

impl<T: Poolable> std::fmt::Debug for SnapshotPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPool")
            .field("label", &self.label)
            .field("free", &self.free.len())
            .field("backing_allocations", &self.backing_allocations)
            .finish()
    }
}

/// Cross-thread return path into a [`SnapshotPool`].
///
/// Sending never blocks. If the owning pool has been dropped the buffer is
/// simply freed.
pub struct Recycler<T: Poolable> {
    tx: Sender<Box<T>>,
}

impl<T: Poolable> Recycler<T> {
    /// Reset `buf` and send it back to the owning pool.
    pub fn recycle(&self, mut buf: Box<T>) {
        buf.reset();
        let _ = self.tx.send(buf);
    }
}

impl<T: Poolable> Clone for Recycler<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
