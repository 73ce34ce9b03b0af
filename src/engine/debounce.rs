use dashmap::DashSet;

use crate::model::{ClaimantId, ResourceId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub resource_id: ResourceId,
    pub claimant_id: ClaimantId,
}

impl DebounceKey {
    pub fn new(resource_id: ResourceId, claimant_id: ClaimantId) -> Self {
        Self {
            resource_id,
            claimant_id,
        }
    }
}

/// Per-(resource, claimant) in-process exclusion for reserve calls.
///
/// Short-circuits a second call while the first is still running. It has no
/// bearing on the capacity invariant, which rests on the store's conditioned
/// write alone; other processes are not covered.
#[derive(Debug, Default)]
pub struct DebounceGuard {
    held: DashSet<DebounceKey>,
}

impl DebounceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking. False if the key is already held.
    pub fn try_acquire(&self, key: DebounceKey) -> bool {
        self.held.insert(key)
    }

    /// Idempotent; safe to call whether or not the key is held.
    pub fn release(&self, key: &DebounceKey) {
        self.held.remove(key);
    }

    /// Acquire `key` for the lifetime of the returned permit.
    pub fn try_permit(&self, key: DebounceKey) -> Option<DebouncePermit<'_>> {
        if self.try_acquire(key.clone()) {
            Some(DebouncePermit { guard: self, key })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &DebounceKey) -> bool {
        self.held.contains(key)
    }

    pub fn in_flight(&self) -> usize {
        self.held.len()
    }
}

/// Releases its key on drop, including when the owning future is dropped mid-flight.
#[derive(Debug)]
pub struct DebouncePermit<'a> {
    guard: &'a DebounceGuard,
    key: DebounceKey,
}

impl DebouncePermit<'_> {
    pub fn key(&self) -> &DebounceKey {
        &self.key
    }
}

impl Drop for DebouncePermit<'_> {
    fn drop(&mut self) {
        self.guard.release(&self.key);
    }
}
