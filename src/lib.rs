#![deny(missing_docs)]

//! Descriptor heap and transient resource heap allocators for GPU renderers.
//!
//! Descriptor slots are handed out by three kinds of managers:
//! - [`DescriptorManager`] for long-lived descriptors in one fixed-size heap,
//! - [`OfflineDescriptorManager`] for CPU-only staging descriptors in a
//!   growable pool of small heaps,
//! - [`OnlineDescriptorManager`] for per-frame descriptor tables in one large
//!   shader-visible heap, split into blocks that are recycled only once the
//!   GPU has signaled it is done with them.
//!
//! Transient textures and buffers are placed into shared memory heaps by a
//! [`TransientResourceAllocator`], which lets resources with disjoint pass
//! lifetimes alias the same bytes.
//!
//! All managers are thread-safe. The core is independent of any graphics API;
//! a Direct3D 12 backend is provided on Windows.
mod descriptor_heap;
mod descriptor_manager;
mod error;
mod offline;
mod online;
mod platform;
mod range_allocator;
mod resource;
mod transient;

#[cfg(windows)]
pub mod d3d12;

#[cfg(test)]
mod mock;

#[cfg(feature = "triomphe")]
pub(crate) use triomphe::Arc;

#[cfg(not(feature = "triomphe"))]
pub(crate) use std::sync::Arc;

pub use descriptor_heap::*;
pub use descriptor_manager::*;
pub use error::*;
pub use offline::*;
pub use online::*;
pub use platform::*;
pub use range_allocator::*;
pub use resource::*;
pub use transient::*;
