//! Systems and their per-entity entry caches.
//!
//! A system declares the components it needs through
//! [`EntitySystem::Components`]. For every active entity that owns all of
//! them, the domain keeps one [`Entry`] in the system's [`Entries`] list,
//! holding typed handles to that entity's components in declared order. The
//! entries are built when the entity starts matching and removed when it stops,
//! so a system iterates exactly its matched set with no filtering.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::component::{ComponentSet, RawHandle};
use crate::domain::EntityDomain;
use crate::entity::Entity;
use crate::state::{RenderTarget, StateStatus, StepContext};
use crate::EcsError;

// ---------------------------------------------------------------------------
// SystemId
// ---------------------------------------------------------------------------

/// Identifier of a system inside one domain. Never reused within a domain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub(crate) u32);

impl SystemId {
    /// Registration order of the system within its domain.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntitySystem
// ---------------------------------------------------------------------------

/// Logic that runs once per step over every entity owning
/// [`Self::Components`].
///
/// The lifecycle mirrors [`State`](crate::state::State) so the domain can
/// drive all systems uniformly. While `advance` runs, the system may freely
/// call back into the domain: membership changes that affect this system are
/// applied once `advance` returns, and entity deletions are reclaimed at the
/// end of the domain step.
pub trait EntitySystem: 'static {
    /// Required component types, in the order their handles appear in entries.
    type Components: ComponentSet;

    fn advance(
        &mut self,
        entries: &Entries<Self::Components>,
        domain: &mut EntityDomain,
        step: &StepContext,
    );

    fn render(
        &self,
        _entries: &Entries<Self::Components>,
        _domain: &EntityDomain,
        _target: &mut dyn RenderTarget,
    ) {
    }

    fn save_state(&self) -> Result<serde_json::Value, EcsError> {
        Ok(serde_json::Value::Null)
    }

    fn load_state(&mut self, _state: &serde_json::Value) -> Result<(), EcsError> {
        Ok(())
    }

    /// `Dead` systems are removed by the domain after their advance; `Ignore`
    /// systems are skipped.
    fn status(&self) -> StateStatus {
        StateStatus::Alive
    }

    /// Name used in logs and saved state.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

// ---------------------------------------------------------------------------
// Entry / Entries
// ---------------------------------------------------------------------------

/// One matched entity and its cached component handles.
pub struct Entry<C: ComponentSet> {
    entity: Entity,
    components: C::Handles,
}

impl<C: ComponentSet> Entry<C> {
    /// Entity this entry was built for.
    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// Handles in the order `C` declares its types.
    pub fn components(&self) -> &C::Handles {
        &self.components
    }
}

impl<C: ComponentSet> Clone for Entry<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: ComponentSet> Copy for Entry<C> {}

impl<C: ComponentSet> fmt::Debug for Entry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("entity", &self.entity)
            .field("components", &self.components)
            .finish()
    }
}

/// The live entry list of one system.
pub struct Entries<C: ComponentSet> {
    entries: Vec<Entry<C>>,
    /// Entity -> position in `entries`.
    positions: HashMap<Entity, usize>,
    /// Bumped on every insertion and removal.
    change_stamp: u64,
}

impl<C: ComponentSet> Entries<C> {
    /// An empty entry list.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            change_stamp: 0,
        }
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entity is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes whenever an entry is added or removed.
    pub fn change_stamp(&self) -> u64 {
        self.change_stamp
    }

    /// Entry of `entity`, if it is tracked.
    pub fn get(&self, entity: Entity) -> Option<&Entry<C>> {
        self.positions.get(&entity).map(|&pos| &self.entries[pos])
    }

    /// Whether `entity` is tracked.
    pub fn contains(&self, entity: Entity) -> bool {
        self.positions.contains_key(&entity)
    }

    /// Entries in their current order. Removal swaps the last entry into the gap.
    pub fn iter(&self) -> std::slice::Iter<'_, Entry<C>> {
        self.entries.iter()
    }

    /// The entries as a slice.
    pub fn as_slice(&self) -> &[Entry<C>] {
        &self.entries
    }

    /// Append an entry for `entity`. Replaces an existing one in place.
    pub(crate) fn new_entry(&mut self, entity: Entity, components: C::Handles) -> &Entry<C> {
        self.change_stamp += 1;
        let entry = Entry { entity, components };
        let pos = match self.positions.get(&entity) {
            Some(&pos) => {
                self.entries[pos] = entry;
                pos
            }
            None => {
                self.entries.push(entry);
                let pos = self.entries.len() - 1;
                self.positions.insert(entity, pos);
                pos
            }
        };
        &self.entries[pos]
    }

    /// Remove `entity`'s entry, moving the last entry into its place.
    pub(crate) fn delete_entry(&mut self, entity: Entity) -> bool {
        let Some(pos) = self.positions.remove(&entity) else {
            return false;
        };
        self.entries.swap_remove(pos);
        if let Some(moved) = self.entries.get(pos) {
            self.positions.insert(moved.entity, pos);
        }
        self.change_stamp += 1;
        true
    }
}

impl<C: ComponentSet> Default for Entries<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ComponentSet> fmt::Debug for Entries<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entries")
            .field("len", &self.entries.len())
            .field("change_stamp", &self.change_stamp)
            .finish()
    }
}

impl<'a, C: ComponentSet> IntoIterator for &'a Entries<C> {
    type Item = &'a Entry<C>;
    type IntoIter = std::slice::Iter<'a, Entry<C>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// ---------------------------------------------------------------------------
// SystemCell -- a system together with its entries, behind a vtable
// ---------------------------------------------------------------------------

/// A user system plus the entry list the domain maintains for it.
pub(crate) struct SystemCell<S: EntitySystem> {
    pub system: S,
    pub entries: Entries<S::Components>,
}

impl<S: EntitySystem> SystemCell<S> {
    /// Wrap `system` with an empty entry list.
    pub fn new(system: S) -> Self {
        Self {
            system,
            entries: Entries::new(),
        }
    }
}

/// Object-safe view of a [`SystemCell`] used by the domain.
pub(crate) trait ErasedSystem {
    fn name(&self) -> &str;
    fn insert_entry(&mut self, entity: Entity, handles: &[RawHandle]);
    fn remove_entry(&mut self, entity: Entity) -> bool;
    fn contains_entry(&self, entity: Entity) -> bool;
    fn entry_count(&self) -> usize;
    fn change_stamp(&self) -> u64;
    fn advance(&mut self, domain: &mut EntityDomain, step: &StepContext);
    fn render(&self, domain: &EntityDomain, target: &mut dyn RenderTarget);
    fn save_state(&self) -> Result<serde_json::Value, EcsError>;
    fn load_state(&mut self, state: &serde_json::Value) -> Result<(), EcsError>;
    fn status(&self) -> StateStatus;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<S: EntitySystem> ErasedSystem for SystemCell<S> {
    fn name(&self) -> &str {
        self.system.name()
    }

    fn insert_entry(&mut self, entity: Entity, handles: &[RawHandle]) {
        let components = <S::Components as ComponentSet>::handles_from_raw(handles);
        self.entries.new_entry(entity, components);
    }

    fn remove_entry(&mut self, entity: Entity) -> bool {
        self.entries.delete_entry(entity)
    }

    fn contains_entry(&self, entity: Entity) -> bool {
        self.entries.contains(entity)
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn change_stamp(&self) -> u64 {
        self.entries.change_stamp()
    }

    fn advance(&mut self, domain: &mut EntityDomain, step: &StepContext) {
        self.system.advance(&self.entries, domain, step);
    }

    fn render(&self, domain: &EntityDomain, target: &mut dyn RenderTarget) {
        self.system.render(&self.entries, domain, target);
    }

    fn save_state(&self) -> Result<serde_json::Value, EcsError> {
        self.system.save_state()
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<(), EcsError> {
        self.system.load_state(state)
    }

    fn status(&self) -> StateStatus {
        self.system.status()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
