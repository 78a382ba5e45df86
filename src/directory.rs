//! The object directory.
//!
//! [`ObjectDirectory`] is the authoritative index of every object resident
//! in the shared-memory region. It owns the object table, the deletion
//! cache, the allocator, and the eviction policy, and it orchestrates all
//! lifecycle transitions (create, seal, get, evict, delete, abort,
//! disconnect) under one mutex. Because every mutation serializes under
//! that lock, subscribers observe notifications in the same total order as
//! the state transitions that produced them.
//!
//! External-store calls are synchronous and run while the lock is held;
//! deployments that need high concurrency either disable the external
//! store or interpose an asynchronous wrapper above this crate.

use crate::client::Client;
use crate::error::{Error, Result};
use crate::eviction::LruEvictionPolicy;
use crate::external::ExternalStore;
use crate::id::ObjectId;
use crate::memory::ShmAllocator;
use crate::notify::{Notifier, ObjectNotification};
use crate::object::{unix_time_secs, ObjectDescriptor, ObjectEntry, ObjectState};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Partition of a `get` request by object availability.
#[derive(Debug, Default)]
pub struct GetResult {
    /// Objects that are sealed and readable right now.
    pub sealed: Vec<ObjectId>,
    /// Objects that were evicted and have been refilled from the external
    /// store during this call.
    pub reconstructed: Vec<ObjectId>,
    /// Objects with no entry in the table, or not yet available.
    pub nonexistent: Vec<ObjectId>,
}

/// Read-only snapshot of one object's record.
#[derive(Debug, Clone, Copy)]
pub struct ObjectInfo {
    /// Lifecycle state.
    pub state: ObjectState,
    /// Data size in bytes.
    pub data_size: usize,
    /// Metadata size in bytes.
    pub metadata_size: usize,
    /// Number of clients currently referencing the object.
    pub ref_count: usize,
    /// Seconds from allocation to seal, or -1 if never sealed.
    pub construct_duration: i64,
}

/// Aggregate statistics about the store.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryStats {
    /// Entries in the object table (all states).
    pub objects: usize,
    /// Entries currently sealed.
    pub sealed: usize,
    /// Outstanding allocator bytes (block-aligned).
    pub allocated_bytes: usize,
    /// Fixed allocator capacity.
    pub footprint: usize,
}

struct Inner {
    /// Every live object, keyed by id.
    objects: HashMap<ObjectId, ObjectEntry>,
    /// Ids whose delete request was deferred (unsealed or in use).
    deletion_cache: HashSet<ObjectId>,
    eviction: LruEvictionPolicy,
    allocator: ShmAllocator,
    external: Option<Arc<dyn ExternalStore>>,
    notifier: Option<Notifier>,
}

/// The in-process index of a shared-memory object store.
///
/// All public operations take the directory mutex at entry and hold it
/// until return, including notification emission and external-store
/// round trips.
///
/// # Example
///
/// ```rust
/// use caisson::prelude::*;
///
/// let allocator = ShmAllocator::new("caisson", 1 << 20).unwrap();
/// let directory = ObjectDirectory::new(allocator, None, None);
///
/// let mut client = Client::new(ClientId::next());
/// let id = ObjectId::from_u64(1);
/// let desc = directory
///     .create_object(id, true, 100, 20, 0, &mut client)
///     .unwrap();
/// assert_eq!(desc.metadata_offset, desc.data_offset + 100);
///
/// directory.seal_objects(&[id]);
/// assert!(directory.contains_object(&id));
/// ```
pub struct ObjectDirectory {
    inner: Mutex<Inner>,
}

impl ObjectDirectory {
    /// Create a directory over `allocator`, optionally spilling evicted
    /// objects to `external` and publishing events through `notifier`.
    pub fn new(
        allocator: ShmAllocator,
        external: Option<Arc<dyn ExternalStore>>,
        notifier: Option<Notifier>,
    ) -> Self {
        let eviction = LruEvictionPolicy::new(allocator.footprint_limit());
        Self {
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                deletion_cache: HashSet::new(),
                eviction,
                allocator,
                external,
                notifier,
            }),
        }
    }

    /// Set or clear the per-client soft budget enforced on creation.
    pub fn set_per_client_quota(&self, quota: Option<usize>) {
        self.lock().eviction.set_client_quota(quota);
    }

    /// Create a new object and register `client` as its creator.
    ///
    /// Only the creator may complete `seal_objects` or `abort_object` for
    /// this object. With `evict_if_full`, idle sealed objects are evicted
    /// until the allocation fits.
    ///
    /// # Errors
    ///
    /// [`Error::ObjectExists`] if the id is already present,
    /// [`Error::DeviceUnsupported`] for `device_num > 0`, and
    /// [`Error::OutOfMemory`] when eviction cannot free enough space.
    ///
    /// # Panics
    ///
    /// Panics if `data_size + metadata_size` is 0.
    pub fn create_object(
        &self,
        id: ObjectId,
        evict_if_full: bool,
        data_size: usize,
        metadata_size: usize,
        device_num: u32,
        client: &mut Client,
    ) -> Result<ObjectDescriptor> {
        if device_num != 0 {
            return Err(Error::DeviceUnsupported(device_num));
        }
        let mut inner = self.lock();
        inner.create_object_internal(id, evict_if_full, data_size, metadata_size, client)?;
        Ok(inner.objects[&id].descriptor())
    }

    /// Create, fill, seal, and release an object in one step (host only).
    ///
    /// The creator's reference is released before returning, so the entry
    /// ends sealed and idle, exactly as if the client had created, sealed,
    /// and released it separately.
    pub fn create_and_seal_object(
        &self,
        id: ObjectId,
        evict_if_full: bool,
        data: &[u8],
        metadata: &[u8],
        client: &mut Client,
    ) -> Result<ObjectDescriptor> {
        let mut inner = self.lock();
        inner.create_object_internal(id, evict_if_full, data.len(), metadata.len(), client)?;
        let entry = inner
            .objects
            .get_mut(&id)
            .expect("entry was just inserted");
        let payload = entry.payload_mut();
        payload[..data.len()].copy_from_slice(data);
        payload[data.len()..].copy_from_slice(metadata);
        let descriptor = entry.descriptor();
        inner.seal_objects_internal(&[id]);
        let released = inner.remove_from_client_object_ids(id, client);
        assert!(released, "creator must hold the initial reference");
        Ok(descriptor)
    }

    /// Partition `ids` by availability, reconstructing evicted objects
    /// from the external store where possible.
    ///
    /// Sealed hits are reported but not referenced; callers that consume
    /// an object follow up with
    /// [`register_sealed_object_to_client`](Self::register_sealed_object_to_client).
    /// Reconstructed objects are already referenced by `client` (the
    /// reconstruction holds them alive); ids whose reconstruction failed
    /// are omitted so a later request may retry.
    pub fn get_objects(&self, ids: &[ObjectId], client: &mut Client) -> GetResult {
        let mut inner = self.lock();
        inner.get_objects_internal(ids, client)
    }

    /// Populate a descriptor and record `client` as a user of the object.
    ///
    /// # Panics
    ///
    /// Panics if the object is not in the table (caller bug: registration
    /// must follow a successful lookup).
    pub fn register_sealed_object_to_client(
        &self,
        id: ObjectId,
        client: &mut Client,
    ) -> ObjectDescriptor {
        let mut inner = self.lock();
        let descriptor = {
            let entry = inner
                .objects
                .get(&id)
                .unwrap_or_else(|| panic!("registering {id}: not in the object table"));
            entry.descriptor()
        };
        inner.add_client_ref_in_table(id, client);
        descriptor
    }

    /// Populate a descriptor for a reconstructed object without touching
    /// reference counts.
    ///
    /// # Panics
    ///
    /// Panics if the object is not in the table.
    pub fn mark_object_as_reconstructed(&self, id: ObjectId) -> ObjectDescriptor {
        let inner = self.lock();
        inner
            .objects
            .get(&id)
            .unwrap_or_else(|| panic!("marking {id}: not in the object table"))
            .descriptor()
    }

    /// Seal created objects, making them visible to readers.
    ///
    /// Emits one seal notification per object.
    ///
    /// # Panics
    ///
    /// Panics if any id is missing from the table or not in the created
    /// state.
    pub fn seal_objects(&self, ids: &[ObjectId]) {
        self.lock().seal_objects_internal(ids);
    }

    /// Drop `client`'s reference to `id`.
    ///
    /// Returns true if the client held a reference. When the last
    /// reference goes and a delete was pending, the object is deleted (or
    /// spilled, with an external store) immediately.
    pub fn release_object(&self, id: ObjectId, client: &mut Client) -> bool {
        self.lock().remove_from_client_object_ids(id, client)
    }

    /// Abort a sealed object, removing it from the store.
    ///
    /// Only the creator (recognized by its still-held reference) may
    /// abort; any other caller gets `false` and the entry is untouched.
    ///
    /// # Panics
    ///
    /// Panics if the object is not in the table or not sealed.
    pub fn abort_object(&self, id: ObjectId, client: &mut Client) -> bool {
        let mut inner = self.lock();
        let entry = inner
            .objects
            .get(&id)
            .unwrap_or_else(|| panic!("aborting {id}: not in the object table"));
        assert!(
            entry.state() == ObjectState::Sealed,
            "aborting {id}: object is not sealed"
        );
        if !client.object_ids.remove(&id) {
            return false;
        }
        inner.erase_object(id);
        true
    }

    /// Delete a sealed, unreferenced object and notify subscribers.
    ///
    /// # Errors
    ///
    /// [`Error::ObjectNonexistent`] if the id is unknown. An unsealed or
    /// still-referenced object is queued in the deletion cache and the
    /// call returns [`Error::ObjectNotSealed`] or [`Error::ObjectInUse`];
    /// the delete completes when the object next becomes eligible.
    pub fn delete_object(&self, id: ObjectId) -> Result<()> {
        let mut inner = self.lock();
        let Some(entry) = inner.objects.get(&id) else {
            return Err(Error::ObjectNonexistent(id));
        };
        let (state, refs) = (entry.state(), entry.ref_count());
        if state != ObjectState::Sealed {
            inner.deletion_cache.insert(id);
            return Err(Error::ObjectNotSealed(id));
        }
        if refs != 0 {
            inner.deletion_cache.insert(id);
            return Err(Error::ObjectInUse(id));
        }
        inner.eviction.remove_object(id);
        inner.erase_object(id);
        inner.notify(vec![ObjectNotification::deletion(id)]);
        Ok(())
    }

    /// Evict idle sealed objects until roughly `num_bytes` are freed.
    ///
    /// Returns the bytes actually selected, which may fall short when the
    /// idle set runs dry.
    pub fn evict_objects(&self, num_bytes: usize) -> Result<usize> {
        let mut inner = self.lock();
        let mut victims = Vec::new();
        let selected = inner.eviction.choose_objects_to_evict(num_bytes, &mut victims);
        inner.evict_objects_internal(&victims)?;
        Ok(selected)
    }

    /// Withdraw every reference `client` holds and abort its unsealed
    /// objects.
    pub fn disconnect_client(&self, client: &mut Client) {
        let mut inner = self.lock();
        tracing::debug!("disconnecting {}", client.id());
        inner.eviction.client_disconnected(client.id());

        let ids: Vec<ObjectId> = client.object_ids.iter().copied().collect();
        let mut sealed = Vec::new();
        for id in ids {
            match inner.objects.get(&id).map(ObjectEntry::state) {
                // The entry may already be gone (raced with a delete).
                None => {}
                Some(ObjectState::Sealed) => sealed.push(id),
                // Unsealed object from this creator: abort it outright.
                Some(_) => {
                    inner.erase_object(id);
                    client.object_ids.remove(&id);
                }
            }
        }
        // Second pass: releasing sealed objects may cascade into deferred
        // deletes, which is safe now that the table scan is done.
        for id in sealed {
            inner.remove_from_client_object_ids(id, client);
        }
    }

    /// Whether the object is visible to readers (sealed or evicted).
    pub fn contains_object(&self, id: &ObjectId) -> bool {
        let inner = self.lock();
        matches!(
            inner.objects.get(id).map(ObjectEntry::state),
            Some(ObjectState::Sealed) | Some(ObjectState::Evicted)
        )
    }

    /// Seal records for every currently sealed object.
    ///
    /// Lets a subscriber that connects late backfill its view of the
    /// store.
    pub fn sealed_objects_info(&self) -> Vec<ObjectNotification> {
        let inner = self.lock();
        inner
            .objects
            .iter()
            .filter(|(_, entry)| entry.state() == ObjectState::Sealed)
            .map(|(id, entry)| {
                ObjectNotification::sealed(*id, entry.data_size, entry.metadata_size)
            })
            .collect()
    }

    /// Snapshot one object's record, if present.
    pub fn object_info(&self, id: &ObjectId) -> Option<ObjectInfo> {
        let inner = self.lock();
        inner.objects.get(id).map(|entry| ObjectInfo {
            state: entry.state(),
            data_size: entry.data_size,
            metadata_size: entry.metadata_size,
            ref_count: entry.ref_count(),
            construct_duration: entry.construct_duration,
        })
    }

    /// Aggregate statistics about the store.
    pub fn stats(&self) -> DirectoryStats {
        let inner = self.lock();
        DirectoryStats {
            objects: inner.objects.len(),
            sealed: inner
                .objects
                .values()
                .filter(|e| e.state() == ObjectState::Sealed)
                .count(),
            allocated_bytes: inner.allocator.allocated(),
            footprint: inner.allocator.footprint_limit(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("directory lock poisoned")
    }
}

impl Inner {
    fn notify(&self, batch: Vec<ObjectNotification>) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(batch);
        }
    }

    fn create_object_internal(
        &mut self,
        id: ObjectId,
        evict_if_full: bool,
        data_size: usize,
        metadata_size: usize,
        client: &mut Client,
    ) -> Result<()> {
        tracing::debug!("creating object {}", id);
        if self.objects.contains_key(&id) {
            return Err(Error::ObjectExists(id));
        }
        let total = data_size + metadata_size;
        assert!(total > 0, "object size must be positive");

        let mut entry = ObjectEntry::new(data_size, metadata_size);
        self.allocate_memory(id, &mut entry, total, evict_if_full, client, true)
            .map_err(|err| match err {
                Error::ObjectStoreFull => {
                    Error::OutOfMemory(format!("cannot allocate object {id}"))
                }
                other => other,
            })?;
        self.objects.insert(id, entry);
        Ok(())
    }

    /// Allocate host memory for `entry`, evicting idle objects as needed.
    ///
    /// On success the eviction policy learns about the object and `client`
    /// holds the first reference. `entry` must not be in the table while
    /// this runs (evictions must not be able to select it).
    fn allocate_memory(
        &mut self,
        id: ObjectId,
        entry: &mut ObjectEntry,
        size: usize,
        evict_if_full: bool,
        client: &mut Client,
        is_create: bool,
    ) -> Result<()> {
        tracing::debug!("allocating {} bytes for object {}", size, id);

        // Free up the client's own LRU queue first if quota enforcement
        // is on.
        if evict_if_full {
            let mut quota_victims = Vec::new();
            let quota_ok = self.eviction.enforce_per_client_quota(
                client.id(),
                size,
                is_create,
                &mut quota_victims,
            );
            self.evict_objects_internal(&quota_victims)?;
            if !quota_ok {
                return Err(Error::OutOfMemory(format!(
                    "cannot assign enough quota to {}",
                    client.id()
                )));
            }
        }

        // Evict until there is enough space.
        loop {
            match entry.allocate(&mut self.allocator) {
                Ok(()) => {
                    // The policy learns about the object immediately before
                    // the reference lands, so it never has a window to
                    // evict it.
                    self.eviction.object_created(id, size, client.id(), is_create);
                    Self::add_client_ref(&mut self.eviction, id, entry, client);
                    return Ok(());
                }
                Err(Error::ObjectStoreFull) if evict_if_full => {
                    let mut victims = Vec::new();
                    let enough = self.eviction.require_space(size, &mut victims);
                    if victims.is_empty() {
                        // Accounting says there is room but the allocator
                        // still refuses (fragmentation): no further
                        // eviction can make progress.
                        return Err(Error::OutOfMemory(format!(
                            "cannot free space for object {id}"
                        )));
                    }
                    self.evict_objects_internal(&victims)?;
                    if !enough {
                        return Err(Error::OutOfMemory(format!(
                            "cannot free enough space for object {id}"
                        )));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn get_objects_internal(&mut self, ids: &[ObjectId], client: &mut Client) -> GetResult {
        let mut result = GetResult::default();
        let mut reconstructing = Vec::new();

        for &id in ids {
            match self.objects.get(&id).map(ObjectEntry::state) {
                None => result.nonexistent.push(id),
                Some(ObjectState::Sealed) => result.sealed.push(id),
                Some(ObjectState::Evicted) => {
                    // Only an external store can refill the payload.
                    if self.external.is_none() {
                        result.nonexistent.push(id);
                        continue;
                    }
                    // Detach the entry so the eviction triggered by its own
                    // allocation cannot select it.
                    let mut entry = self
                        .objects
                        .remove(&id)
                        .expect("entry state was just observed");
                    let size = entry.object_size();
                    match self.allocate_memory(id, &mut entry, size, true, client, false) {
                        Ok(()) => reconstructing.push(id),
                        Err(err) => {
                            // Leave the object evicted so a later request
                            // may retry; it is omitted from the response.
                            tracing::debug!("cannot reconstruct {}: {}", id, err);
                        }
                    }
                    self.objects.insert(id, entry);
                }
                // Created objects are not yet available to readers.
                Some(ObjectState::Created) => result.nonexistent.push(id),
            }
        }

        if !reconstructing.is_empty() {
            match self.refill_from_external(&reconstructing) {
                Ok(()) => {
                    let now = unix_time_secs();
                    for id in &reconstructing {
                        let entry = self
                            .objects
                            .get_mut(id)
                            .expect("reconstructed entry is in the table");
                        entry.state = ObjectState::Sealed;
                        entry.construct_duration =
                            now.saturating_sub(entry.create_time) as i64;
                    }
                    result.reconstructed = reconstructing;
                }
                Err(err) => {
                    tracing::warn!(
                        "external store get failed, rolling back {} objects: {}",
                        reconstructing.len(),
                        err
                    );
                    for &id in &reconstructing {
                        self.rollback_reconstruction(id, client);
                    }
                }
            }
        }
        result
    }

    /// Fill the freshly allocated blocks of `ids` from the external store
    /// in one batch.
    fn refill_from_external(&mut self, ids: &[ObjectId]) -> Result<()> {
        let store = self
            .external
            .clone()
            .expect("reconstruction requires an external store");
        let mut raw: Vec<(std::ptr::NonNull<u8>, usize)> = ids
            .iter()
            .map(|id| {
                let entry = &self.objects[id];
                let block = entry
                    .block
                    .expect("reconstructing entry must have memory backing");
                (block.ptr, entry.object_size())
            })
            .collect();
        // SAFETY: the ids are distinct, so the blocks are disjoint
        // allocations inside the live mapping; the directory lock gives
        // exclusive access.
        let mut sinks: Vec<&mut [u8]> = raw
            .iter_mut()
            .map(|(ptr, len)| unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), *len) })
            .collect();
        store.get(ids, &mut sinks)
    }

    /// Undo a successful `allocate_memory` after the external refill
    /// failed: drop the client reference, the policy charge, and the
    /// block, leaving the entry evicted.
    fn rollback_reconstruction(&mut self, id: ObjectId, client: &mut Client) {
        client.object_ids.remove(&id);
        self.eviction.remove_object(id);
        let entry = self
            .objects
            .get_mut(&id)
            .expect("rolled-back entry is in the table");
        entry.ref_count -= 1;
        entry.free(&mut self.allocator);
    }

    fn seal_objects_internal(&mut self, ids: &[ObjectId]) {
        tracing::debug!("sealing {} objects", ids.len());
        let mut batch = Vec::with_capacity(ids.len());
        let now = unix_time_secs();
        for id in ids {
            let entry = self
                .objects
                .get_mut(id)
                .unwrap_or_else(|| panic!("sealing {id}: not in the object table"));
            assert!(
                entry.state == ObjectState::Created,
                "sealing {id}: object is not in the created state"
            );
            entry.state = ObjectState::Sealed;
            entry.construct_duration = now.saturating_sub(entry.create_time) as i64;
            batch.push(ObjectNotification::sealed(
                *id,
                entry.data_size,
                entry.metadata_size,
            ));
        }
        self.notify(batch);
    }

    /// Evict the given sealed, unreferenced objects.
    ///
    /// With an external store, payloads are spilled first and the entries
    /// stay in the table in the evicted state. Without one, the entries
    /// are erased and a deletion notification is emitted per object.
    ///
    /// The caller has already detached the ids from the eviction policy;
    /// on spill failure they are handed back to it and the entries keep
    /// their memory.
    fn evict_objects_internal(&mut self, ids: &[ObjectId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        for id in ids {
            let entry = self
                .objects
                .get(id)
                .unwrap_or_else(|| panic!("evicting {id}: not in the object table"));
            assert!(
                entry.state() == ObjectState::Sealed,
                "evicting {id}: object is not sealed"
            );
            assert!(
                entry.ref_count() == 0,
                "evicting {id}: object is still referenced"
            );
        }

        if let Some(store) = self.external.clone() {
            tracing::debug!("spilling {} objects to the external store", ids.len());
            let put_result = {
                let payloads: Vec<&[u8]> =
                    ids.iter().map(|id| self.objects[id].payload()).collect();
                store.put(ids, &payloads)
            };
            if let Err(err) = put_result {
                for id in ids {
                    let size = self.objects[id].object_size();
                    self.eviction.restore(*id, size);
                }
                return Err(err);
            }
            for id in ids {
                let entry = self.objects.get_mut(id).expect("checked above");
                entry.free(&mut self.allocator);
            }
        } else {
            let mut batch = Vec::with_capacity(ids.len());
            for id in ids {
                tracing::debug!("evicting object {}", id);
                let mut entry = self.objects.remove(id).expect("checked above");
                entry.free(&mut self.allocator);
                batch.push(ObjectNotification::deletion(*id));
            }
            self.notify(batch);
        }
        Ok(())
    }

    /// Record `client` as a user of the (possibly detached) `entry`.
    fn add_client_ref(
        eviction: &mut LruEvictionPolicy,
        id: ObjectId,
        entry: &mut ObjectEntry,
        client: &mut Client,
    ) {
        // A client holds at most one reference per object.
        if !client.object_ids.insert(id) {
            return;
        }
        if entry.ref_count == 0 {
            eviction.begin_object_access(id, entry.object_size());
        }
        entry.ref_count += 1;
    }

    fn add_client_ref_in_table(&mut self, id: ObjectId, client: &mut Client) {
        let entry = self
            .objects
            .get_mut(&id)
            .expect("referenced object is in the table");
        Self::add_client_ref(&mut self.eviction, id, entry, client);
    }

    /// Drop `client`'s reference to `id`. Returns whether a reference was
    /// actually held. A last release either parks the object in the idle
    /// LRU or, when a delete is pending, completes the delete.
    fn remove_from_client_object_ids(&mut self, id: ObjectId, client: &mut Client) -> bool {
        if !client.object_ids.remove(&id) {
            return false;
        }
        // The entry may have been aborted out from under a stale
        // reference.
        let Some(entry) = self.objects.get_mut(&id) else {
            return true;
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let size = entry.object_size();
            if self.deletion_cache.remove(&id) {
                // A delete was deferred until this release: complete it
                // now instead of parking the object in the LRU.
                self.eviction.remove_object(id);
                if let Err(err) = self.evict_objects_internal(&[id]) {
                    tracing::warn!("deferred delete of {} abandoned: {}", id, err);
                }
            } else {
                self.eviction.end_object_access(id, size);
            }
        }
        true
    }

    /// Remove an entry outside the eviction path, returning its memory
    /// and dropping it from the policy and the deletion cache.
    fn erase_object(&mut self, id: ObjectId) {
        if let Some(mut entry) = self.objects.remove(&id) {
            if entry.block.is_some() {
                entry.free(&mut self.allocator);
            }
        }
        self.eviction.remove_object(id);
        self.deletion_cache.remove(&id);
    }
}
