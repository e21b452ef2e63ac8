//! Exclusive ownership of hardware objects
//!
//! Encoders, crtcs and planes are claimed by the connector whose pipeline uses them,
//! connectors are reserved by the [`ResourceManager`](super::ResourceManager) once they
//! are assigned a display slot. An object has at most one owner at any time.

use std::collections::HashMap;

use super::registry::{ConnectorHandle, CrtcHandle, EncoderHandle, PlaneHandle};

/// Any claimable hardware object
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKey {
    Connector(ConnectorHandle),
    Encoder(EncoderHandle),
    Crtc(CrtcHandle),
    Plane(PlaneHandle),
}

impl From<ConnectorHandle> for ObjectKey {
    fn from(handle: ConnectorHandle) -> Self {
        ObjectKey::Connector(handle)
    }
}

impl From<EncoderHandle> for ObjectKey {
    fn from(handle: EncoderHandle) -> Self {
        ObjectKey::Encoder(handle)
    }
}

impl From<CrtcHandle> for ObjectKey {
    fn from(handle: CrtcHandle) -> Self {
        ObjectKey::Crtc(handle)
    }
}

impl From<PlaneHandle> for ObjectKey {
    fn from(handle: PlaneHandle) -> Self {
        ObjectKey::Plane(handle)
    }
}

/// Owner of a claimed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Claimant {
    /// The pipeline of a connector
    Connector(ConnectorHandle),
    /// The resource manager, reserving connectors for display slots
    Manager,
}

/// The object is already held by someone else
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{object:?} is already owned by {owner:?}")]
pub struct AlreadyOwned {
    /// The requested object
    pub object: ObjectKey,
    /// Its current owner
    pub owner: Claimant,
}

/// Owner bookkeeping of all hardware objects
#[derive(Debug, Default)]
pub struct OwnershipTracker {
    owners: HashMap<ObjectKey, Claimant>,
}

impl OwnershipTracker {
    /// Create an empty tracker
    pub fn new() -> OwnershipTracker {
        OwnershipTracker::default()
    }

    /// Claim `object` for `claimant`.
    ///
    /// Claiming an object already held by the same claimant succeeds.
    pub fn acquire(&mut self, object: impl Into<ObjectKey>, claimant: Claimant) -> Result<(), AlreadyOwned> {
        let object = object.into();
        match self.owners.get(&object) {
            Some(owner) if *owner != claimant => Err(AlreadyOwned { object, owner: *owner }),
            Some(_) => Ok(()),
            None => {
                self.owners.insert(object, claimant);
                Ok(())
            }
        }
    }

    /// Release `object`, a no-op if it is not held
    pub fn release(&mut self, object: impl Into<ObjectKey>) {
        self.owners.remove(&object.into());
    }

    /// Current owner of `object`
    pub fn owner_of(&self, object: impl Into<ObjectKey>) -> Option<Claimant> {
        self.owners.get(&object.into()).copied()
    }

    /// Whether `object` is held by anyone
    pub fn is_owned(&self, object: impl Into<ObjectKey>) -> bool {
        self.owners.contains_key(&object.into())
    }

    /// All objects held by `claimant`, sorted
    pub fn held_by(&self, claimant: Claimant) -> Vec<ObjectKey> {
        let mut objects: Vec<_> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == claimant)
            .map(|(object, _)| *object)
            .collect();
        objects.sort();
        objects
    }

    /// Release everything held by `claimant`
    pub fn release_all(&mut self, claimant: Claimant) {
        self.owners.retain(|_, owner| *owner != claimant);
    }

    /// Start a transaction of claims for `claimant`.
    ///
    /// Claims made through the transaction are rolled back when it is dropped without
    /// being committed.
    pub fn transaction(&mut self, claimant: Claimant) -> ClaimTransaction<'_> {
        ClaimTransaction {
            tracker: self,
            claimant,
            claimed: Vec::new(),
        }
    }
}

/// A set of claims that is either kept as a whole or rolled back
#[derive(Debug)]
pub struct ClaimTransaction<'a> {
    tracker: &'a mut OwnershipTracker,
    claimant: Claimant,
    claimed: Vec<ObjectKey>,
}

impl<'a> ClaimTransaction<'a> {
    /// Claim `object` as part of this transaction
    pub fn acquire(&mut self, object: impl Into<ObjectKey>) -> Result<(), AlreadyOwned> {
        let object = object.into();
        if self.tracker.owner_of(object) == Some(self.claimant) {
            return Ok(());
        }
        self.tracker.acquire(object, self.claimant)?;
        self.claimed.push(object);
        Ok(())
    }

    /// Whether `object` is held by anyone, this transaction included
    pub fn is_owned(&self, object: impl Into<ObjectKey>) -> bool {
        self.tracker.is_owned(object)
    }

    /// Roll back the claims made since `mark`, see [`ClaimTransaction::mark`]
    pub fn rollback_to(&mut self, mark: usize) {
        for object in self.claimed.drain(mark..) {
            self.tracker.release(object);
        }
    }

    /// Current position in the claim log
    pub fn mark(&self) -> usize {
        self.claimed.len()
    }

    /// Keep all claims
    pub fn commit(mut self) {
        self.claimed.clear();
    }
}

impl<'a> Drop for ClaimTransaction<'a> {
    fn drop(&mut self) {
        self.rollback_to(0);
    }
}
