//! LRU eviction policy.
//!
//! The policy tracks every object the directory has charged against the
//! footprint, split into an in-use set (referenced by at least one client,
//! never evictable) and an idle set ordered least-recently-used first. It
//! answers "free me N bytes" questions by selecting idle victims in LRU
//! order; the directory performs the actual evictions.
//!
//! The policy holds only ids and sizes, never entries, so there is no
//! ownership cycle with the object table.

use crate::client::ClientId;
use crate::id::ObjectId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy)]
struct IdleRef {
    seq: u64,
    size: usize,
}

/// Tracks idle vs in-use objects and chooses LRU eviction victims.
///
/// LRU order is kept with a monotonically increasing sequence number
/// stamped on every idle-set insertion: ascending sequence = least
/// recently used first. Sequence numbers are unique, which doubles as the
/// tie-break between objects that went idle in the same instant.
#[derive(Debug)]
pub struct LruEvictionPolicy {
    /// Footprint capacity the policy budgets against.
    capacity: usize,
    /// Bytes charged for all tracked objects (idle + in use).
    memory_used: usize,
    /// Next idle-insertion sequence number.
    seq: u64,
    /// Idle objects in LRU order (ascending seq).
    idle: BTreeMap<u64, ObjectId>,
    /// Reverse index for the idle set.
    index: HashMap<ObjectId, IdleRef>,
    /// Objects currently referenced by at least one client.
    in_use: HashMap<ObjectId, usize>,
    /// Creating client per object, for quota attribution.
    owners: HashMap<ObjectId, ClientId>,
    /// Bytes attributed to each client's created objects.
    usage: HashMap<ClientId, usize>,
    /// Optional per-client soft budget in bytes.
    quota: Option<usize>,
}

impl LruEvictionPolicy {
    /// A policy budgeting against `capacity` bytes, with quota
    /// enforcement disabled.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            memory_used: 0,
            seq: 0,
            idle: BTreeMap::new(),
            index: HashMap::new(),
            in_use: HashMap::new(),
            owners: HashMap::new(),
            usage: HashMap::new(),
            quota: None,
        }
    }

    /// Set or clear the per-client soft budget.
    pub fn set_client_quota(&mut self, quota: Option<usize>) {
        self.quota = quota;
    }

    /// Bytes currently charged against the footprint.
    #[inline]
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// Record a freshly allocated object as in use by `client`.
    ///
    /// `is_create` distinguishes a client creating a new object from one
    /// triggering a reconstruction; only creations are attributed for
    /// quota purposes.
    pub fn object_created(&mut self, id: ObjectId, size: usize, client: ClientId, is_create: bool) {
        self.memory_used += size;
        self.in_use.insert(id, size);
        if is_create {
            self.owners.insert(id, client);
            *self.usage.entry(client).or_insert(0) += size;
        }
    }

    /// Move an object from the idle set to the in-use set.
    ///
    /// No-op if the object is already in use (the creation path marks the
    /// object in use before the first reference lands).
    pub fn begin_object_access(&mut self, id: ObjectId, size: usize) {
        if let Some(idle_ref) = self.index.remove(&id) {
            self.idle.remove(&idle_ref.seq);
            self.in_use.insert(id, size);
        }
    }

    /// Move an object from the in-use set to the idle set.
    ///
    /// The object becomes the most recently used idle object.
    pub fn end_object_access(&mut self, id: ObjectId, size: usize) {
        self.in_use.remove(&id);
        self.push_idle(id, size);
    }

    /// Select idle objects so that `needed` bytes can be allocated.
    ///
    /// Victims accumulate in `out` in LRU order until they cover `needed`
    /// bytes or the idle set runs dry. Returns false only if the victims
    /// plus the unallocated headroom still cannot cover `needed`. Selected
    /// objects leave the policy's tracking; the caller must evict them.
    pub fn require_space(&mut self, needed: usize, out: &mut Vec<ObjectId>) -> bool {
        let headroom = self.capacity.saturating_sub(self.memory_used);
        let required = needed.saturating_sub(headroom);
        let selected = self.select_lru(needed, out);
        selected >= required
    }

    /// Enforce the per-client soft budget before `client` allocates
    /// `needed` more bytes.
    ///
    /// Disabled (always true) when no quota is configured or when the
    /// allocation is a reconstruction rather than a creation. Otherwise
    /// the client's own idle objects are selected in LRU order until its
    /// attributed usage plus `needed` fits the quota; returns false if
    /// that point cannot be reached.
    pub fn enforce_per_client_quota(
        &mut self,
        client: ClientId,
        needed: usize,
        is_create: bool,
        out: &mut Vec<ObjectId>,
    ) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        if !is_create {
            return true;
        }
        let mut used = self.usage.get(&client).copied().unwrap_or(0);
        if used + needed <= quota {
            return true;
        }

        let own: Vec<ObjectId> = self
            .idle
            .values()
            .copied()
            .filter(|id| self.owners.get(id) == Some(&client))
            .collect();
        for id in own {
            if used + needed <= quota {
                break;
            }
            let size = self.forget_idle(id);
            used = used.saturating_sub(size);
            out.push(id);
        }
        used + needed <= quota
    }

    /// Select idle objects covering at least `num_bytes` for an explicit
    /// eviction request.
    ///
    /// Returns the bytes selected, which may exceed `num_bytes` by up to
    /// one object (granularity) or fall short if the idle set runs dry.
    pub fn choose_objects_to_evict(&mut self, num_bytes: usize, out: &mut Vec<ObjectId>) -> usize {
        self.select_lru(num_bytes, out)
    }

    /// The object is being destroyed outside the eviction path (delete or
    /// abort). Idempotent.
    pub fn remove_object(&mut self, id: ObjectId) {
        if let Some(idle_ref) = self.index.remove(&id) {
            self.idle.remove(&idle_ref.seq);
            self.discharge(id, idle_ref.size);
        } else if let Some(size) = self.in_use.remove(&id) {
            self.discharge(id, size);
        }
    }

    /// Drop `client`'s quota attribution. Its idle objects stay in the
    /// global LRU as unattributed.
    pub fn client_disconnected(&mut self, client: ClientId) {
        self.usage.remove(&client);
        self.owners.retain(|_, owner| *owner != client);
    }

    /// Re-admit an object whose eviction was rolled back (failed spill).
    ///
    /// The object re-enters the idle set as most recently used, without
    /// owner attribution.
    pub fn restore(&mut self, id: ObjectId, size: usize) {
        self.memory_used += size;
        self.push_idle(id, size);
    }

    /// Walk the idle set in LRU order, removing victims until they cover
    /// `target` bytes. Returns the bytes selected.
    fn select_lru(&mut self, target: usize, out: &mut Vec<ObjectId>) -> usize {
        let mut selected = 0;
        while selected < target {
            let Some((&seq, &id)) = self.idle.iter().next() else {
                break;
            };
            self.idle.remove(&seq);
            let idle_ref = self
                .index
                .remove(&id)
                .expect("idle set and index out of sync");
            self.discharge(id, idle_ref.size);
            selected += idle_ref.size;
            out.push(id);
        }
        selected
    }

    fn push_idle(&mut self, id: ObjectId, size: usize) {
        self.seq += 1;
        self.idle.insert(self.seq, id);
        self.index.insert(id, IdleRef {
            seq: self.seq,
            size,
        });
    }

    /// Remove a specific idle object and return its size.
    fn forget_idle(&mut self, id: ObjectId) -> usize {
        let idle_ref = self
            .index
            .remove(&id)
            .expect("idle set and index out of sync");
        self.idle.remove(&idle_ref.seq);
        self.discharge(id, idle_ref.size);
        idle_ref.size
    }

    fn discharge(&mut self, id: ObjectId, size: usize) {
        self.memory_used -= size;
        if let Some(owner) = self.owners.remove(&id) {
            if let Some(used) = self.usage.get_mut(&owner) {
                *used = used.saturating_sub(size);
                if *used == 0 {
                    self.usage.remove(&owner);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ObjectId {
        ObjectId::from_u64(n)
    }

    fn client(n: u64) -> ClientId {
        ClientId::new(n)
    }

    /// Create an object and immediately let its reference go, so it lands
    /// in the idle set in call order.
    fn create_idle(policy: &mut LruEvictionPolicy, n: u64, size: usize) {
        policy.object_created(id(n), size, client(1), true);
        policy.end_object_access(id(n), size);
    }

    #[test]
    fn victims_follow_lru_order() {
        let mut policy = LruEvictionPolicy::new(256);
        create_idle(&mut policy, 1, 128);
        create_idle(&mut policy, 2, 128);

        let mut out = Vec::new();
        assert!(policy.require_space(128, &mut out));
        assert_eq!(out, vec![id(1)]);
        assert_eq!(policy.memory_used(), 128);
    }

    #[test]
    fn access_refreshes_lru_position() {
        let mut policy = LruEvictionPolicy::new(256);
        create_idle(&mut policy, 1, 64);
        create_idle(&mut policy, 2, 64);
        // Touch object 1: it becomes the most recently used idle object.
        policy.begin_object_access(id(1), 64);
        policy.end_object_access(id(1), 64);

        let mut out = Vec::new();
        policy.choose_objects_to_evict(64, &mut out);
        assert_eq!(out, vec![id(2)]);
    }

    #[test]
    fn in_use_objects_are_never_selected() {
        let mut policy = LruEvictionPolicy::new(256);
        policy.object_created(id(1), 128, client(1), true);
        create_idle(&mut policy, 2, 128);

        let mut out = Vec::new();
        // Only object 2 is idle; 256 bytes cannot be covered.
        assert!(!policy.require_space(256, &mut out));
        assert_eq!(out, vec![id(2)]);
    }

    #[test]
    fn require_space_accounts_for_headroom() {
        let mut policy = LruEvictionPolicy::new(256);
        create_idle(&mut policy, 1, 64);

        let mut out = Vec::new();
        // 128 needed, 192 free: no eviction strictly required, and the
        // single idle object cannot cover the full request anyway.
        assert!(policy.require_space(128, &mut out));
    }

    #[test]
    fn choose_over_selects_by_granularity() {
        let mut policy = LruEvictionPolicy::new(512);
        create_idle(&mut policy, 1, 128);
        create_idle(&mut policy, 2, 128);

        let mut out = Vec::new();
        let selected = policy.choose_objects_to_evict(130, &mut out);
        assert_eq!(selected, 256);
        assert_eq!(out, vec![id(1), id(2)]);
    }

    #[test]
    fn quota_prefers_own_idle_objects() {
        let mut policy = LruEvictionPolicy::new(1024);
        policy.set_client_quota(Some(256));
        // Client 1 owns an idle object; client 2's idle object is older.
        policy.object_created(id(9), 128, client(2), true);
        policy.end_object_access(id(9), 128);
        policy.object_created(id(1), 128, client(1), true);
        policy.end_object_access(id(1), 128);
        policy.object_created(id(2), 128, client(1), true);
        policy.end_object_access(id(2), 128);

        let mut out = Vec::new();
        assert!(policy.enforce_per_client_quota(client(1), 128, true, &mut out));
        // Client 1 was at 256/256; its own LRU object goes, client 2's stays.
        assert_eq!(out, vec![id(1)]);
    }

    #[test]
    fn quota_fails_when_in_use_objects_pin_the_budget() {
        let mut policy = LruEvictionPolicy::new(1024);
        policy.set_client_quota(Some(256));
        // Both objects stay in use: nothing is evictable.
        policy.object_created(id(1), 128, client(1), true);
        policy.object_created(id(2), 128, client(1), true);

        let mut out = Vec::new();
        assert!(!policy.enforce_per_client_quota(client(1), 128, true, &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn disconnect_keeps_objects_in_global_lru() {
        let mut policy = LruEvictionPolicy::new(256);
        create_idle(&mut policy, 1, 128);
        policy.client_disconnected(client(1));

        let mut out = Vec::new();
        assert!(policy.require_space(128, &mut out));
        assert_eq!(out, vec![id(1)]);
    }

    #[test]
    fn restore_reenters_idle_as_most_recent() {
        let mut policy = LruEvictionPolicy::new(256);
        create_idle(&mut policy, 1, 64);
        create_idle(&mut policy, 2, 64);

        let mut out = Vec::new();
        policy.choose_objects_to_evict(64, &mut out);
        assert_eq!(out, vec![id(1)]);

        policy.restore(id(1), 64);
        assert_eq!(policy.memory_used(), 128);
        let mut out = Vec::new();
        policy.choose_objects_to_evict(64, &mut out);
        assert_eq!(out, vec![id(2)]);
    }
}
