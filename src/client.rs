//! Client records.
//!
//! A [`Client`] represents one connected consumer of the store. The record
//! is owned by the transport layer; the directory only borrows it to keep
//! the client's set of referenced objects in lock-step with the per-object
//! reference counts.

use crate::id::ObjectId;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique client ids.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies one connected client of the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ClientId(u64);

impl ClientId {
    /// Construct a client id from a raw value (e.g. a connection id
    /// assigned by the transport).
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Generate a fresh unique client id.
    pub fn next() -> Self {
        Self(CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Per-client state the directory keeps in sync with the object table.
///
/// The set of object ids here mirrors the reference counts on the entries:
/// an id is present iff this client contributes exactly one reference to
/// that object.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    pub(crate) object_ids: HashSet<ObjectId>,
}

impl Client {
    /// Create a record for a newly connected client.
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            object_ids: HashSet::new(),
        }
    }

    /// This client's id.
    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The objects this client currently references.
    pub fn object_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.object_ids.iter()
    }

    /// Whether this client currently references `id`.
    pub fn references(&self, id: &ObjectId) -> bool {
        self.object_ids.contains(id)
    }
}
