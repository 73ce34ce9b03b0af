use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Claim ids are minted fresh on every successful reservation.
pub type ClaimId = Ulid;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Opaque id of a reservable resource (an event).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque id of the actor holding (or trying to hold) a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimantId(String);

impl ClaimantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClaimantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClaimantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One actor's reservation on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub resource_id: ResourceId,
    pub claimant_id: ClaimantId,
    pub created_at: Ms,
}

impl Claim {
    pub fn new(resource_id: ResourceId, claimant_id: ClaimantId) -> Self {
        Self {
            id: Ulid::new(),
            resource_id,
            claimant_id,
            created_at: now_ms(),
        }
    }
}

/// A fixed-capacity resource and the claims currently held against it.
///
/// Claims are keyed by claimant, so the claimant set and the claim records
/// cannot drift apart and a claimant can never appear twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub name: Option<String>,
    /// Max concurrent claims. Always > 0.
    pub capacity: u32,
    pub claims: BTreeMap<ClaimantId, Claim>,
    /// Bumped on every applied mutation; the store's conflict marker.
    pub version: u64,
    pub updated_at: Ms,
}

impl Resource {
    pub fn new(id: ResourceId, name: Option<String>, capacity: u32) -> Self {
        Self {
            id,
            name,
            capacity,
            claims: BTreeMap::new(),
            version: 0,
            updated_at: now_ms(),
        }
    }

    pub fn claimants(&self) -> impl Iterator<Item = &ClaimantId> {
        self.claims.keys()
    }

    pub fn claimed(&self) -> usize {
        self.claims.len()
    }

    pub fn remaining(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.claims.len())
    }

    pub fn is_full(&self) -> bool {
        self.claims.len() >= self.capacity as usize
    }

    pub fn claim_for(&self, claimant_id: &ClaimantId) -> Option<&Claim> {
        self.claims.get(claimant_id)
    }

    /// Apply a claim event in place (caller holds the lock) and advance the version.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ClaimCreated { claim } => {
                self.claims.insert(claim.claimant_id.clone(), claim.clone());
            }
            Event::ClaimReleased { claimant_id, .. } => {
                self.claims.remove(claimant_id);
            }
            // Created/Deleted are handled at the map level, not here
            Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => return,
        }
        self.version += 1;
        self.updated_at = now_ms();
    }

    /// Minimal event list that recreates this resource on replay.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.claims.len() + 1);
        events.push(Event::ResourceCreated {
            id: self.id.clone(),
            name: self.name.clone(),
            capacity: self.capacity,
        });
        events.extend(
            self.claims
                .values()
                .map(|claim| Event::ClaimCreated { claim: claim.clone() }),
        );
        events
    }
}

/// Flat event records. This is the WAL record format and the
/// change-feed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: ResourceId,
        name: Option<String>,
        capacity: u32,
    },
    ResourceDeleted {
        id: ResourceId,
    },
    ClaimCreated {
        claim: Claim,
    },
    ClaimReleased {
        id: ClaimId,
        resource_id: ResourceId,
        claimant_id: ClaimantId,
    },
}

impl Event {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Event::ResourceCreated { id, .. } | Event::ResourceDeleted { id } => id,
            Event::ClaimCreated { claim } => &claim.resource_id,
            Event::ClaimReleased { resource_id, .. } => resource_id,
        }
    }
}

// ── Engine outcomes ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// A new claim was committed.
    Reserved(Claim),
    /// The claimant already held a slot; nothing was written.
    AlreadyReserved(Claim),
}

impl ReserveOutcome {
    pub fn claim(&self) -> &Claim {
        match self {
            ReserveOutcome::Reserved(c) | ReserveOutcome::AlreadyReserved(c) => c,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReserveOutcome::Reserved(_) => "reserved",
            ReserveOutcome::AlreadyReserved(_) => "already_reserved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The claim was removed.
    Released(Claim),
    /// The claimant held no slot; nothing was written.
    NotClaimed,
}

impl CancelOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CancelOutcome::Released(_) => "released",
            CancelOutcome::NotClaimed => "not_claimed",
        }
    }
}
