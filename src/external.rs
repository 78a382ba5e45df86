//! External store interface.
//!
//! An external store is an optional collaborator that durably holds the
//! payloads of evicted objects so they can be reconstructed later. The
//! interface is batch-oriented and synchronous; the directory calls it
//! while holding its lock, so implementations should be fast or the
//! deployment should accept the documented latency.

use crate::error::{Error, Result};
use crate::id::ObjectId;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable put/get of object payloads by id.
///
/// Both operations are all-or-nothing over their batch: a failed `get`
/// must leave every sink untouched so the caller can roll the batch back.
pub trait ExternalStore: Send + Sync {
    /// Durably persist `payloads[i]` under `ids[i]`.
    fn put(&self, ids: &[ObjectId], payloads: &[&[u8]]) -> Result<()>;

    /// Fill `sinks[i]` with the payload stored under `ids[i]`.
    ///
    /// # Errors
    ///
    /// An error for any missing id or size mismatch, in which case no
    /// sink has been written.
    fn get(&self, ids: &[ObjectId], sinks: &mut [&mut [u8]]) -> Result<()>;
}

/// In-memory external store.
///
/// Backs spill-and-reconstruct deployments that do not need durability
/// across restarts, and the crate's own round-trip tests.
#[derive(Debug, Default)]
pub struct MemoryExternalStore {
    blobs: Mutex<HashMap<ObjectId, Bytes>>,
}

impl MemoryExternalStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads currently held.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("external store lock poisoned").len()
    }

    /// Whether the store holds no payloads.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExternalStore for MemoryExternalStore {
    fn put(&self, ids: &[ObjectId], payloads: &[&[u8]]) -> Result<()> {
        assert_eq!(ids.len(), payloads.len(), "put batch lengths differ");
        let mut blobs = self.blobs.lock().expect("external store lock poisoned");
        for (id, payload) in ids.iter().zip(payloads) {
            blobs.insert(*id, Bytes::copy_from_slice(payload));
        }
        Ok(())
    }

    fn get(&self, ids: &[ObjectId], sinks: &mut [&mut [u8]]) -> Result<()> {
        assert_eq!(ids.len(), sinks.len(), "get batch lengths differ");
        let blobs = self.blobs.lock().expect("external store lock poisoned");

        // Validate the whole batch before touching any sink.
        let mut found = Vec::with_capacity(ids.len());
        for (id, sink) in ids.iter().zip(sinks.iter()) {
            let blob = blobs
                .get(id)
                .ok_or_else(|| Error::ExternalStore(format!("object {id} not in store")))?;
            if blob.len() != sink.len() {
                return Err(Error::ExternalStore(format!(
                    "object {id}: stored {} bytes, sink holds {}",
                    blob.len(),
                    sink.len()
                )));
            }
            found.push(blob.clone());
        }
        for (blob, sink) in found.iter().zip(sinks.iter_mut()) {
            sink.copy_from_slice(blob);
        }
        Ok(())
    }
}
