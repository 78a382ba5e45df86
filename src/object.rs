//! Per-object records and client-facing descriptors.
//!
//! Each object resident in the store has one [`ObjectEntry`] in the
//! directory's table. The entry owns the object's identity-adjacent state
//! (sizes, lifecycle [`ObjectState`], reference count, timing) and the
//! allocation it occupies in the shared region. Clients never see entries;
//! they receive an [`ObjectDescriptor`] that locates the payload inside
//! the shared mapping.

use crate::error::{Error, Result};
use crate::memory::{MapInfo, ShmAllocator};
use rustix::fd::RawFd;
use std::ptr::NonNull;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch.
pub(crate) fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Lifecycle state of an object in the store.
///
/// There is no "aborted" state: aborted objects are removed from the
/// table outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Allocated and writable by its creator; not yet visible to readers.
    Created,
    /// Immutable and visible to readers.
    Sealed,
    /// Payload spilled to the external store; no memory backing.
    Evicted,
}

/// The shared-memory block an object occupies.
///
/// Present iff the object currently has memory backing (states `Created`
/// and `Sealed`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Block {
    /// Start of the object's memory within the shared region.
    pub ptr: NonNull<u8>,
    /// File descriptor of the mapping that contains `ptr`.
    pub fd: RawFd,
    /// Size of that mapping.
    pub map_size: usize,
    /// Byte offset of `ptr` within the mapping.
    pub offset: usize,
}

/// Descriptor returned to clients, locating an object in shared memory.
///
/// A client maps `(store_fd, map_size)` once and reads the payload at
/// `data_offset` / `metadata_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// File descriptor identifying the shared-memory mapping.
    pub store_fd: RawFd,
    /// Byte offset of the object data within the mapping.
    pub data_offset: usize,
    /// Byte offset of the metadata; always `data_offset + data_size`.
    pub metadata_offset: usize,
    /// Size of the data section in bytes.
    pub data_size: usize,
    /// Size of the metadata section in bytes.
    pub metadata_size: usize,
    /// 0 for host memory; >0 would identify an accelerator device.
    pub device_num: u32,
    /// Size of the mapping to map (0 for device objects).
    pub map_size: usize,
    /// Set once the descriptor has been populated from a live entry.
    pub initialized: bool,
}

/// Per-object record: sizes, lifecycle state, allocation, references,
/// timing.
#[derive(Debug)]
pub struct ObjectEntry {
    /// Lifecycle state.
    pub(crate) state: ObjectState,
    /// Size of the data section in bytes.
    pub(crate) data_size: usize,
    /// Size of the metadata section in bytes.
    pub(crate) metadata_size: usize,
    /// The block backing this object, if any. `None` iff `Evicted`.
    pub(crate) block: Option<Block>,
    /// 0 = host memory. Device objects are not supported by this build,
    /// so this is always 0; the field keeps descriptors wire-complete.
    pub(crate) device_num: u32,
    /// Number of distinct clients currently using this object.
    pub(crate) ref_count: usize,
    /// Wall-clock seconds at allocation.
    pub(crate) create_time: u64,
    /// -1 until sealed or reconstructed, then seal time minus create time.
    pub(crate) construct_duration: i64,
}

impl ObjectEntry {
    /// A fresh entry with no memory backing. The caller allocates before
    /// inserting it into the table.
    pub(crate) fn new(data_size: usize, metadata_size: usize) -> Self {
        Self {
            state: ObjectState::Created,
            data_size,
            metadata_size,
            block: None,
            device_num: 0,
            ref_count: 0,
            create_time: 0,
            construct_duration: -1,
        }
    }

    /// Total payload size (data + metadata).
    #[inline]
    pub fn object_size(&self) -> usize {
        self.data_size + self.metadata_size
    }

    /// Lifecycle state.
    #[inline]
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Number of clients currently referencing this object.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Request host memory for this object from the allocator.
    ///
    /// On success the entry moves to `Created` with a populated block and
    /// a fresh create timestamp. On failure the entry keeps its previous
    /// state and stays unbacked.
    ///
    /// # Errors
    ///
    /// [`Error::ObjectStoreFull`] when the allocator has no span large
    /// enough.
    pub(crate) fn allocate(&mut self, allocator: &mut ShmAllocator) -> Result<()> {
        assert!(self.block.is_none(), "object already has memory backing");
        let size = self.object_size();
        let ptr = allocator.memalign(size).ok_or(Error::ObjectStoreFull)?;
        let MapInfo {
            fd,
            map_size,
            offset,
        } = allocator.lookup(ptr);
        self.block = Some(Block {
            ptr,
            fd,
            map_size,
            offset,
        });
        self.state = ObjectState::Created;
        self.create_time = unix_time_secs();
        self.construct_duration = -1;
        Ok(())
    }

    /// Return this object's block to the allocator and mark it `Evicted`.
    ///
    /// Calling this on an unbacked entry is a caller bug and panics.
    pub(crate) fn free(&mut self, allocator: &mut ShmAllocator) {
        let block = self
            .block
            .take()
            .expect("freeing an object that has no memory backing");
        allocator.free(block.ptr, self.object_size());
        self.state = ObjectState::Evicted;
    }

    /// The full payload (data followed by metadata).
    ///
    /// Panics on an unbacked entry.
    pub(crate) fn payload(&self) -> &[u8] {
        let block = self
            .block
            .as_ref()
            .expect("reading an object that has no memory backing");
        // SAFETY: the block spans object_size() bytes inside the live
        // mapping, and the directory lock serializes access.
        unsafe { std::slice::from_raw_parts(block.ptr.as_ptr(), self.object_size()) }
    }

    /// Mutable view of the full payload.
    ///
    /// Panics on an unbacked entry.
    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        let size = self.object_size();
        let block = self
            .block
            .as_ref()
            .expect("writing an object that has no memory backing");
        // SAFETY: as in payload(); &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(block.ptr.as_ptr(), size) }
    }

    /// Populate a client-facing descriptor from this entry.
    ///
    /// Panics on an unbacked entry: descriptors only make sense for
    /// objects with memory backing.
    pub(crate) fn descriptor(&self) -> ObjectDescriptor {
        let block = self
            .block
            .as_ref()
            .expect("describing an object that has no memory backing");
        ObjectDescriptor {
            store_fd: block.fd,
            data_offset: block.offset,
            metadata_offset: block.offset + self.data_size,
            data_size: self.data_size,
            metadata_size: self.metadata_size,
            device_num: self.device_num,
            map_size: block.map_size,
            initialized: true,
        }
    }
}

// SAFETY: the block pointer targets the allocator's mapping, which outlives
// every entry (the directory owns both), and all entry access is serialized
// under the directory mutex.
unsafe impl Send for ObjectEntry {}
