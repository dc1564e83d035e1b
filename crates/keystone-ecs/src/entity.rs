//! Entity handles and the slab that stores per-entity records.
//!
//! The slab is the single source of truth for liveness: a handle is live
//! exactly when its slot holds a value and the slot's stamp equals the
//! handle's stamp. Removing a value bumps the stamp, so the old handle can
//! never resolve again. A slot whose stamp would wrap is retired instead of
//! being queued for reuse.

use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Handle to one entity of an [`EntityDomain`](crate::domain::EntityDomain).
///
/// Handles are cheap to copy, never reissued, and meaningless outside the
/// domain that returned them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    stamp: u32,
    slot: u32,
}

impl Entity {
    /// Handle for `slot` at `stamp`.
    #[inline]
    pub(crate) fn new(slot: u32, stamp: u32) -> Self {
        Self { stamp, slot }
    }

    /// Position of the entity's record in its domain.
    #[inline]
    pub fn index(self) -> u32 {
        self.slot
    }

    /// How many entities occupied this slot before this one.
    #[inline]
    pub fn generation(self) -> u32 {
        self.stamp
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity#{}.{}", self.slot, self.stamp)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.stamp)
    }
}

// ---------------------------------------------------------------------------
// EntitySlab
// ---------------------------------------------------------------------------

struct Slot<T> {
    stamp: u32,
    value: Option<T>,
}

/// Storage for one record per live entity, addressed by [`Entity`].
///
/// Vacated slots are reused oldest first, which spreads stamps evenly over
/// the slots.
pub(crate) struct EntitySlab<T> {
    slots: Vec<Slot<T>>,
    vacant: VecDeque<u32>,
    len: usize,
}

impl<T> Default for EntitySlab<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> EntitySlab<T> {
    /// An empty slab with room for `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            vacant: VecDeque::new(),
            len: 0,
        }
    }

    /// Store the record built by `make` under a fresh handle.
    pub fn insert_with(&mut self, make: impl FnOnce(Entity) -> T) -> Entity {
        let entity = match self.vacant.pop_front() {
            Some(slot) => Entity::new(slot, self.slots[slot as usize].stamp),
            None => {
                let slot = u32::try_from(self.slots.len())
                    .unwrap_or_else(|_| panic!("more than {} entity slots", u32::MAX));
                self.slots.push(Slot {
                    stamp: 0,
                    value: None,
                });
                Entity::new(slot, 0)
            }
        };
        self.slots[entity.slot as usize].value = Some(make(entity));
        self.len += 1;
        entity
    }

    /// Take the record out, invalidating `entity` for good.
    pub fn remove(&mut self, entity: Entity) -> Option<T> {
        let slot = self.slots.get_mut(entity.slot as usize)?;
        if slot.stamp != entity.stamp {
            return None;
        }
        let value = slot.value.take()?;
        self.len -= 1;
        // A slot with no stamps left is retired.
        if let Some(next) = slot.stamp.checked_add(1) {
            slot.stamp = next;
            self.vacant.push_back(entity.slot);
        }
        Some(value)
    }

    /// Record of a live `entity`.
    pub fn get(&self, entity: Entity) -> Option<&T> {
        let slot = self.slots.get(entity.slot as usize)?;
        if slot.stamp != entity.stamp {
            return None;
        }
        slot.value.as_ref()
    }

    /// Mutable record of a live `entity`.
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        let slot = self.slots.get_mut(entity.slot as usize)?;
        if slot.stamp != entity.stamp {
            return None;
        }
        slot.value.as_mut()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Live records in slot order.
    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter().filter_map(|s| s.value.as_ref())
    }

    /// Mutable live records in slot order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.slots.iter_mut().filter_map(|s| s.value.as_mut())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
