//! Shared-memory layer for Caisson.
//!
//! One memfd region of a fixed footprint backs every host object in the
//! store. [`ShmAllocator`] owns that region and carves aligned blocks out
//! of it; everything above this module addresses memory through
//! `(fd, map_size, offset)` triples so descriptors can be handed to other
//! processes.

mod allocator;

pub use allocator::{MapInfo, ShmAllocator, BLOCK_SIZE};
