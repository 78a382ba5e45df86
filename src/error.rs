//! Error types for Caisson.

use crate::id::ObjectId;
use thiserror::Error;

/// Result type alias using Caisson's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Caisson operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An object with the same id is already present in the store.
    #[error("object {0} already exists")]
    ObjectExists(ObjectId),

    /// The object is not present in the object table.
    #[error("object {0} does not exist")]
    ObjectNonexistent(ObjectId),

    /// The object has not been sealed yet; the request was deferred.
    #[error("object {0} is not sealed")]
    ObjectNotSealed(ObjectId),

    /// The object is still referenced by clients; the request was deferred.
    #[error("object {0} is in use")]
    ObjectInUse(ObjectId),

    /// The shared-memory allocator could not satisfy the request.
    #[error("object store is full: cannot allocate object")]
    ObjectStoreFull,

    /// Shared-memory region setup failed.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// Eviction could not free enough space for the request.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Device objects are not supported by this build.
    #[error("device {0} is not supported (host objects only)")]
    DeviceUnsupported(u32),

    /// An object id had the wrong length.
    #[error("invalid object id: expected {expected} bytes, got {got}")]
    InvalidObjectId {
        /// Required id length in bytes.
        expected: usize,
        /// Length of the rejected input.
        got: usize,
    },

    /// The external store failed a put or get batch.
    #[error("external store error: {0}")]
    ExternalStore(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
