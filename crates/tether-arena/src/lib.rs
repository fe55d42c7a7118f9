//! Pooled snapshot storage and generation-counted proxy slots for Tether.
//!
//! Two allocators live here:
//!
//! ```text
//! SnapshotPool<T>  (owned by one side of the pipeline)
//! ├── free list: Vec<Box<T>>      (reset buffers ready for reuse)
//! └── return channel ◄── Recycler<T> (held by the other side)
//!
//! ProxyArena       (owned by the producer side)
//! └── slots: Vec<Slot { generation, last known RigidState }>
//! ```
//!
//! A pool is only ever allocated from and drained by its owning side. The
//! side that consumes a buffer hands it back through a [`Recycler`], which
//! resets it before sending. The owner picks returned buffers up lazily on
//! its next `alloc`.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod pool;
pub mod proxy;

pub use error::ProxyError;
pub use pool::{Recycler, SnapshotPool};
pub use proxy::ProxyArena;
