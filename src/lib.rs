//! # Caisson
//!
//! The in-process object directory of a shared-memory object store.
//!
//! Caisson indexes immutable objects (data + metadata blobs) living in a
//! single memfd-backed shared-memory region of fixed size. It owns the
//! object lifecycle (create → seal → in-use → evict/delete), coordinates
//! LRU eviction against the bounded footprint, tracks per-client
//! references so in-use objects are never freed, and can spill evicted
//! objects to an external store and reconstruct them on demand.
//! Subscribers learn about seals, deletions, and evictions through a
//! bounded notification channel.
//!
//! ## What Caisson is not
//!
//! The crate deliberately stops at the directory boundary: the wire
//! protocol between clients and the store, the socket transport, and the
//! delivery of notifications to remote subscribers all live above it.
//! The directory is also not a durable database: its index lives and
//! dies with the process, and only the optional external store persists
//! anything.
//!
//! ## Quick Start
//!
//! ```rust
//! use caisson::prelude::*;
//!
//! // A store with a 1 MiB footprint, no external store, no subscriber.
//! let allocator = ShmAllocator::new("caisson", 1 << 20)?;
//! let directory = ObjectDirectory::new(allocator, None, None);
//!
//! let mut creator = Client::new(ClientId::next());
//! let id = ObjectId::from_u64(1);
//!
//! // Create, fill, and publish an object in one step.
//! directory.create_and_seal_object(id, true, b"payload", b"meta", &mut creator)?;
//!
//! // Another client looks it up and pins it.
//! let mut reader = Client::new(ClientId::next());
//! let found = directory.get_objects(&[id], &mut reader);
//! assert_eq!(found.sealed, vec![id]);
//! let descriptor = directory.register_sealed_object_to_client(id, &mut reader);
//! assert_eq!(descriptor.data_size, 7);
//!
//! directory.release_object(id, &mut reader);
//! directory.delete_object(id)?;
//! # Ok::<(), caisson::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod client;
pub mod directory;
pub mod error;
pub mod eviction;
pub mod external;
pub mod id;
pub mod memory;
pub mod notify;
pub mod object;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, ClientId};
    pub use crate::directory::{GetResult, ObjectDirectory};
    pub use crate::error::{Error, Result};
    pub use crate::external::{ExternalStore, MemoryExternalStore};
    pub use crate::id::ObjectId;
    pub use crate::memory::ShmAllocator;
    pub use crate::notify::{Notifier, ObjectNotification};
    pub use crate::object::{ObjectDescriptor, ObjectState};
}

pub use error::{Error, Result};
