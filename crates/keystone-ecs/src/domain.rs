//! The [`EntityDomain`] is the top-level container. It owns every entity,
//! one component factory per component type, the registered systems and the
//! event tables.
//!
//! Matching is incremental. Each component type remembers which systems need
//! it, so gaining or losing a component only re-checks those systems, and a
//! system added late scans the existing entities exactly once. An entity only
//! has entries in its systems while it is active.
//!
//! Entity and system deletion is deferred: [`EntityDomain::delete_entity`]
//! and [`EntityDomain::remove_system`] queue the removal and the end of
//! [`EntityDomain::step`] reclaims them. While a system is advancing, its
//! entry list is detached from the domain; membership changes that concern it
//! are queued and applied when its `advance` returns.

use std::any::Any;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::component::{
    all_distinct, Component, ComponentHandle, ComponentSet, ComponentTable, FactoryIndex,
    RawHandle,
};
use crate::config::DomainConfig;
use crate::entity::{Entity, EntitySlab};
use crate::event::{
    push_handler, remove_handler, EntityHandler, EventId, EventSlot, EventTable, HandlerId,
    HandlerList,
};
use crate::factory::{ComponentFactory, FactoryStats};
use crate::state::{RenderTarget, State, StateStatus, StepContext};
use crate::system::{Entries, EntitySystem, Entry, ErasedSystem, SystemCell, SystemId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Bookkeeping records
// ---------------------------------------------------------------------------

/// Everything the domain knows about one entity.
struct EntityEntry {
    handle: Entity,
    name: Option<String>,
    /// Bit `i % 64` set for every owned component type `i`.
    component_bits: u64,
    components: Vec<FactoryIndex>,
    /// Systems whose requirements this entity satisfies.
    systems: Vec<SystemId>,
    event_handlers: HandlerList<EntityHandler>,
    /// Cleared once deletion has been requested.
    valid: bool,
    active: bool,
}

impl EntityEntry {
    fn new(handle: Entity, name: &str) -> Self {
        Self {
            handle,
            name: (!name.is_empty()).then(|| name.to_owned()),
            component_bits: 0,
            components: Vec::new(),
            systems: Vec::new(),
            event_handlers: None,
            valid: true,
            active: false,
        }
    }
}

struct SystemEntry {
    name: String,
    /// `None` while the system is advancing.
    cell: Option<Box<dyn ErasedSystem>>,
    component_bits: u64,
    /// Required factories in declared order.
    factories: Vec<FactoryIndex>,
    valid: bool,
    /// Entities whose entries must be reconciled once `cell` is back.
    pending: Vec<Entity>,
}

/// Counters describing a domain, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    pub label: String,
    /// Entities not yet reclaimed, including those pending deletion.
    pub entities: usize,
    pub active_entities: usize,
    pub pending_deletion: usize,
    pub systems: usize,
    pub event_ids: usize,
    pub steps: u64,
    pub factories: Vec<FactoryStats>,
}

// ---------------------------------------------------------------------------
// EntityDomain
// ---------------------------------------------------------------------------

/// Owner of entities, component storage, systems and events.
pub struct EntityDomain {
    config: DomainConfig,
    entities: EntitySlab<EntityEntry>,
    /// Active entities by name, in activation order. The first one is what
    /// [`find_entity`](Self::find_entity) returns.
    names: HashMap<String, Vec<Entity>>,
    components: ComponentTable,
    /// Indexed by `SystemId`. Flushed systems leave a `None` behind and the
    /// vector is never compacted, since a `SystemId` is never reused. Walks
    /// over it therefore also visit removed slots.
    systems: Vec<Option<SystemEntry>>,
    events: EventTable,
    deleted_entities: Vec<Entity>,
    deleted_systems: Vec<SystemId>,
    advancing: bool,
    steps: u64,
    status: StateStatus,
    next_state: Option<Box<dyn State>>,
}

impl std::fmt::Debug for EntityDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDomain")
            .field("label", &self.config.label)
            .field("entity_count", &self.entities.len())
            .field("component_types", &self.components.len())
            .field("system_count", &self.system_count())
            .field("events", &self.events)
            .finish()
    }
}

impl Default for EntityDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityDomain {
    /// An empty domain with the default configuration.
    pub fn new() -> Self {
        Self::with_config(DomainConfig::default())
    }

    /// An empty domain sized and labelled by `config`.
    pub fn with_config(config: DomainConfig) -> Self {
        Self {
            entities: EntitySlab::with_capacity(config.entity_capacity),
            names: HashMap::new(),
            components: ComponentTable::new(),
            systems: Vec::new(),
            events: EventTable::new(),
            deleted_entities: Vec::new(),
            deleted_systems: Vec::new(),
            advancing: false,
            steps: 0,
            status: StateStatus::Alive,
            next_state: None,
            config,
        }
    }

    /// Configuration the domain was built with.
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    fn entry(&self, entity: Entity) -> Option<&EntityEntry> {
        self.entities.get(entity)
    }

    fn entry_mut(&mut self, entity: Entity) -> Option<&mut EntityEntry> {
        self.entities.get_mut(entity)
    }

    fn system_entry(&self, id: SystemId) -> Option<&SystemEntry> {
        self.systems.get(id.index())?.as_ref()
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create an inactive entity. An empty `name` means unnamed.
    pub fn create_entity(&mut self, name: &str) -> Entity {
        let entity = self
            .entities
            .insert_with(|entity| EntityEntry::new(entity, name));
        trace!(domain = %self.config.label, %entity, name, "entity created");
        entity
    }

    /// Create an inactive copy of `source` with clones of all its components.
    ///
    /// The copy inherits `source`'s system memberships, but gets its own
    /// entries (pointing at its own components) only once it is activated.
    pub fn clone_entity(&mut self, source: Entity, name: &str) -> Option<Entity> {
        let Some(src) = self.entry(source).filter(|e| e.valid) else {
            warn!(domain = %self.config.label, %source, "clone of unknown or deleted entity");
            return None;
        };
        let components = src.components.clone();
        let component_bits = src.component_bits;
        let systems = src.systems.clone();

        let entity = self.create_entity(name);
        for &index in &components {
            let cloned = self
                .components
                .entry_mut(index)
                .factory
                .clone_component(entity, source);
            debug_assert!(cloned.is_some(), "source lost a listed component");
        }
        let entry = self.entry_mut(entity)?;
        entry.component_bits = component_bits;
        entry.components = components;
        entry.systems = systems;
        Some(entity)
    }

    /// Make `entity` visible to its systems and to name lookup. Idempotent.
    pub fn activate_entity(&mut self, entity: Entity) -> bool {
        let Some(entry) = self.entry_mut(entity) else {
            warn!(%entity, "activate of unknown entity");
            return false;
        };
        if !entry.valid {
            warn!(%entity, "activate of deleted entity");
            return false;
        }
        if entry.active {
            return true;
        }
        entry.active = true;
        let name = entry.name.clone();
        let systems = entry.systems.clone();

        if let Some(name) = name {
            let holders = self.names.entry(name.clone()).or_default();
            if let Some(&existing) = holders.first() {
                warn!(
                    %name,
                    %existing,
                    %entity,
                    "name already taken by an active entity; lookups keep the earlier one"
                );
            }
            holders.push(entity);
        }
        for id in systems {
            self.register_entity_with_system(entity, id);
        }
        trace!(domain = %self.config.label, %entity, "entity activated");
        true
    }

    /// Withdraw `entity` from its systems and name lookup, keeping its
    /// components. Idempotent.
    pub fn deactivate_entity(&mut self, entity: Entity) -> bool {
        let Some(entry) = self.entry_mut(entity) else {
            warn!(%entity, "deactivate of unknown entity");
            return false;
        };
        if !entry.active {
            return true;
        }
        entry.active = false;
        let name = entry.name.clone();
        let systems = entry.systems.clone();

        if let Some(name) = name {
            if let MapEntry::Occupied(mut slot) = self.names.entry(name) {
                // The next holder in activation order inherits the name.
                slot.get_mut().retain(|&e| e != entity);
                if slot.get().is_empty() {
                    slot.remove();
                }
            }
        }
        for id in systems {
            self.unregister_entity_with_system(entity, id);
        }
        trace!(domain = %self.config.label, %entity, "entity deactivated");
        true
    }

    /// Deactivate `entity` and queue it for reclamation at the end of the
    /// current step. Components stay readable until then.
    pub fn delete_entity(&mut self, entity: Entity) -> bool {
        match self.entry(entity) {
            Some(entry) if entry.valid => {}
            Some(_) => return false,
            None => {
                warn!(%entity, "delete of unknown entity");
                return false;
            }
        }
        self.deactivate_entity(entity);
        if let Some(entry) = self.entry_mut(entity) {
            entry.valid = false;
        }
        self.deleted_entities.push(entity);
        trace!(domain = %self.config.label, %entity, "entity queued for deletion");
        true
    }

    /// Reclaim every entity queued by [`delete_entity`](Self::delete_entity),
    /// destroying its components. Returns how many were reclaimed.
    pub fn flush_deleted_entities(&mut self) -> usize {
        let deleted = std::mem::take(&mut self.deleted_entities);
        let mut reclaimed = 0;
        for entity in deleted {
            let Some(entry) = self.entities.remove(entity) else {
                continue;
            };
            debug_assert!(!entry.active, "deleted entity still active");
            for &factory in &entry.components {
                self.components.entry_mut(factory).factory.delete(entity);
            }
            reclaimed += 1;
        }
        if reclaimed > 0 {
            debug!(domain = %self.config.label, reclaimed, "deleted entities flushed");
        }
        reclaimed
    }

    // -- entity queries -----------------------------------------------------

    /// Whether `entity` exists and has not been deleted.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.entry(entity).is_some_and(|e| e.valid)
    }

    /// Whether `entity` is live and currently visible to its systems.
    pub fn is_active(&self, entity: Entity) -> bool {
        self.entry(entity).is_some_and(|e| e.active)
    }

    /// Name given at creation, active or not. `None` for unnamed entities.
    pub fn entity_name(&self, entity: Entity) -> Option<&str> {
        self.entry(entity)?.name.as_deref()
    }

    /// Active entity registered under `name`.
    pub fn find_entity(&self, name: &str) -> Option<Entity> {
        self.names.get(name)?.first().copied()
    }

    /// Entities not yet reclaimed, including those pending deletion.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Valid entities in slot order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities
            .values()
            .filter(|e| e.valid)
            .map(|e| e.handle)
    }

    // -- components ---------------------------------------------------------

    /// Attach a default `T` to `entity`, or return the one it already has.
    ///
    /// The first time the entity gains `T`, every system interested in `T`
    /// is checked for a new match. Returns `None` for unknown or deleted
    /// entities.
    pub fn add_component<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        if !self.is_valid(entity) {
            warn!(
                %entity,
                component = std::any::type_name::<T>(),
                "add_component on unknown or deleted entity"
            );
            return None;
        }
        let index = self.components.ensure::<T>();
        let factory = self.components.entry_mut(index);
        let bit = factory.bit;
        let (_, used_existing) = factory.factory.new_component(entity);
        if !used_existing {
            if let Some(entry) = self.entry_mut(entity) {
                entry.component_bits |= bit;
                entry.components.push(index);
            }
            self.register_entity_with_systems(entity, index);
        }
        self.components.get_mut::<T>(index, entity)
    }

    /// Detach and destroy `entity`'s `T`, leaving every system that required
    /// it. Returns whether a component was removed.
    pub fn delete_component<T: Component>(&mut self, entity: Entity) -> bool {
        let Some(index) = self.components.lookup::<T>() else {
            return false;
        };
        let Some(entry) = self.entry(entity) else {
            return false;
        };
        if !entry.components.contains(&index) {
            return false;
        }
        let old_bits = entry.component_bits;
        self.unregister_entity_with_systems(entity, index, old_bits);
        self.components.entry_mut(index).factory.delete(entity);

        if let Some(entry) = self.entry_mut(entity) {
            entry.components.retain(|&f| f != index);
            // Recomputed rather than cleared: the bit may be shared by an
            // aliased type the entity still owns.
            entry.component_bits = entry.components.iter().fold(0, |bits, f| bits | f.bit());
        }
        true
    }

    /// Component `T` of `entity`, if it has one.
    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.entry(entity)?;
        let index = self.components.lookup::<T>()?;
        self.components.get::<T>(index, entity)
    }

    /// Mutable counterpart of [`get_component`](Self::get_component).
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        self.entry(entity)?;
        let index = self.components.lookup::<T>()?;
        self.components.get_mut::<T>(index, entity)
    }

    /// Whether `entity` currently owns a `T`.
    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        match (self.entry(entity), self.components.lookup::<T>()) {
            (Some(entry), Some(index)) => entry.components.contains(&index),
            _ => false,
        }
    }

    /// Number of component types attached to `entity`.
    pub fn component_count(&self, entity: Entity) -> usize {
        self.entry(entity).map_or(0, |e| e.components.len())
    }

    /// `entity`'s component mask.
    pub fn component_bits(&self, entity: Entity) -> Option<u64> {
        self.entry(entity).map(|e| e.component_bits)
    }

    /// Factory storing `T`, if `T` has been used in this domain.
    pub fn factory<T: Component>(&self) -> Option<&ComponentFactory> {
        self.components.factory(self.components.lookup::<T>()?)
    }

    /// Counters for the factory of `T`; `None` before its first use.
    pub fn factory_stats<T: Component>(&self) -> Option<FactoryStats> {
        self.factory::<T>().map(ComponentFactory::stats)
    }

    /// Number of distinct component types used so far.
    pub fn component_type_count(&self) -> usize {
        self.components.len()
    }

    /// Component behind a handle, `None` once it has been deleted.
    pub fn resolve<T: Component>(&self, handle: ComponentHandle<T>) -> Option<&T> {
        self.components.resolve(handle)
    }

    /// Mutable counterpart of [`resolve`](Self::resolve).
    pub fn resolve_mut<T: Component>(&mut self, handle: ComponentHandle<T>) -> Option<&mut T> {
        self.components.resolve_mut(handle)
    }

    /// Shared references to all components of a system entry.
    pub fn fetch<C: ComponentSet>(&self, entry: &Entry<C>) -> Option<C::Refs<'_>> {
        C::fetch(&self.components, entry.components())
    }

    /// Exclusive references to all components of a system entry. `None` if
    /// any of them was deleted since the entry was built.
    pub fn fetch_mut<C: ComponentSet>(&mut self, entry: &Entry<C>) -> Option<C::Mut<'_>> {
        C::fetch_mut(&mut self.components, entry.components())
    }

    // -- systems ------------------------------------------------------------

    /// Register a system and match it against every existing entity.
    ///
    /// The declared component types must be distinct.
    pub fn add_system<S: EntitySystem>(&mut self, system: S) -> SystemId {
        debug_assert!(
            all_distinct(&<S::Components as ComponentSet>::type_ids()),
            "system `{}` lists a component type twice: {:?}",
            system.name(),
            <S::Components as ComponentSet>::type_names()
        );
        let factories = <S::Components as ComponentSet>::ensure_factories(&mut self.components);
        let component_bits = factories.iter().fold(0, |bits, f| bits | f.bit());
        let id = SystemId(self.systems.len() as u32);
        let name = system.name().to_owned();

        for &factory in &factories {
            self.components.entry_mut(factory).systems.push(id);
        }
        self.systems.push(Some(SystemEntry {
            name: name.clone(),
            cell: Some(Box::new(SystemCell::new(system))),
            component_bits,
            factories,
            valid: true,
            pending: Vec::new(),
        }));

        let candidates: Vec<Entity> = self.entities().collect();
        let matched = candidates
            .into_iter()
            .filter(|&entity| self.try_register_entity_with_system(entity, id))
            .count();
        debug!(domain = %self.config.label, system = %name, ?id, matched, "system added");
        id
    }

    /// Queue a system for removal at the end of the current step. It stops
    /// advancing immediately.
    pub fn remove_system(&mut self, id: SystemId) -> bool {
        let Some(system) = self.systems.get_mut(id.index()).and_then(Option::as_mut) else {
            return false;
        };
        if !system.valid {
            return false;
        }
        system.valid = false;
        self.deleted_systems.push(id);
        debug!(
            domain = %self.config.label,
            system = %system.name,
            ?id,
            "system queued for removal"
        );
        true
    }

    /// Drop every system queued by [`remove_system`](Self::remove_system).
    pub fn flush_deleted_systems(&mut self) -> usize {
        let deleted = std::mem::take(&mut self.deleted_systems);
        for id in &deleted {
            for entry in self.components.entries_mut() {
                entry.systems.retain(|s| s != id);
            }
            for entity in self.entities.values_mut() {
                entity.systems.retain(|s| s != id);
            }
            if let Some(slot) = self.systems.get_mut(id.index()) {
                *slot = None;
            }
        }
        if !deleted.is_empty() {
            debug!(domain = %self.config.label, removed = deleted.len(), "removed systems flushed");
        }
        deleted.len()
    }

    /// Record `system` on `entity` if the entity owns every required
    /// component, building its entry when the entity is active.
    ///
    /// The bitmask check is only a filter; membership is always confirmed
    /// against the factory list so aliased bits never produce a false match.
    pub fn try_register_entity_with_system(&mut self, entity: Entity, id: SystemId) -> bool {
        let Some(system) = self.system_entry(id).filter(|s| s.valid) else {
            return false;
        };
        let Some(entry) = self.entry(entity).filter(|e| e.valid) else {
            return false;
        };
        if entry.systems.contains(&id) {
            return true;
        }
        if system.component_bits & entry.component_bits != system.component_bits {
            return false;
        }
        if !system.factories.iter().all(|f| entry.components.contains(f)) {
            return false;
        }
        let active = entry.active;
        if let Some(entry) = self.entry_mut(entity) {
            entry.systems.push(id);
        }
        if active {
            self.register_entity_with_system(entity, id);
        }
        true
    }

    /// Offer `entity` to every system that needs the component in `factory`.
    fn register_entity_with_systems(&mut self, entity: Entity, factory: FactoryIndex) {
        let interested = self.components.entry(factory).systems.clone();
        for id in interested {
            self.try_register_entity_with_system(entity, id);
        }
    }

    /// Withdraw `entity` from every system that needs `factory` and was
    /// satisfied by `old_bits`.
    fn unregister_entity_with_systems(
        &mut self,
        entity: Entity,
        factory: FactoryIndex,
        old_bits: u64,
    ) {
        let interested = self.components.entry(factory).systems.clone();
        for id in interested {
            let Some(system) = self.system_entry(id) else {
                continue;
            };
            if system.component_bits & old_bits != system.component_bits {
                continue;
            }
            let Some(entry) = self.entry_mut(entity) else {
                return;
            };
            let Some(pos) = entry.systems.iter().position(|&s| s == id) else {
                continue;
            };
            entry.systems.remove(pos);
            if entry.active {
                self.unregister_entity_with_system(entity, id);
            }
        }
    }

    fn raw_handles(
        components: &ComponentTable,
        factories: &[FactoryIndex],
        entity: Entity,
    ) -> Option<Vec<RawHandle>> {
        factories
            .iter()
            .map(|&factory| {
                let slot = components.factory(factory)?.slot_of(entity)?;
                Some(RawHandle {
                    factory,
                    slot,
                    entity,
                })
            })
            .collect()
    }

    /// Build `entity`'s entry in system `id`.
    fn register_entity_with_system(&mut self, entity: Entity, id: SystemId) {
        let Some(system) = self.systems.get_mut(id.index()).and_then(Option::as_mut) else {
            return;
        };
        let Some(cell) = system.cell.as_mut() else {
            system.pending.push(entity);
            return;
        };
        match Self::raw_handles(&self.components, &system.factories, entity) {
            Some(handles) => cell.insert_entry(entity, &handles),
            None => debug_assert!(false, "matched entity {entity} is missing a required component"),
        }
    }

    /// Destroy `entity`'s entry in system `id`.
    fn unregister_entity_with_system(&mut self, entity: Entity, id: SystemId) {
        let Some(system) = self.systems.get_mut(id.index()).and_then(Option::as_mut) else {
            return;
        };
        match system.cell.as_mut() {
            Some(cell) => {
                cell.remove_entry(entity);
            }
            None => system.pending.push(entity),
        }
    }

    /// Bring system `id`'s entries in line with membership changes queued
    /// while it was advancing.
    fn reconcile_pending(&mut self, id: SystemId) {
        let pending = match self.systems.get_mut(id.index()).and_then(Option::as_mut) {
            Some(system) if !system.pending.is_empty() => std::mem::take(&mut system.pending),
            _ => return,
        };
        let mut seen = HashSet::with_capacity(pending.len());
        for entity in pending {
            if !seen.insert(entity) {
                continue;
            }
            let member = self
                .entry(entity)
                .is_some_and(|e| e.active && e.systems.contains(&id));
            let Some(system) = self.systems.get_mut(id.index()).and_then(Option::as_mut) else {
                return;
            };
            let Some(cell) = system.cell.as_mut() else {
                return;
            };
            // Rebuilt rather than kept: a component may have been replaced.
            cell.remove_entry(entity);
            if member {
                let handles = Self::raw_handles(&self.components, &system.factories, entity);
                if let Some(handles) = handles {
                    cell.insert_entry(entity, &handles);
                }
            }
        }
    }

    /// Typed access to a registered system.
    pub fn system<S: EntitySystem>(&self, id: SystemId) -> Option<&S> {
        let cell = self.system_entry(id)?.cell.as_deref()?;
        cell.as_any()
            .downcast_ref::<SystemCell<S>>()
            .map(|cell| &cell.system)
    }

    /// The system behind `id` as its concrete type. `None` while it advances.
    pub fn system_mut<S: EntitySystem>(&mut self, id: SystemId) -> Option<&mut S> {
        // Unboxed: `Box<dyn ErasedSystem>` is itself a `RenderTarget`.
        let cell = self.systems.get_mut(id.index())?.as_mut()?.cell.as_deref_mut()?;
        cell.as_any_mut()
            .downcast_mut::<SystemCell<S>>()
            .map(|cell| &mut cell.system)
    }

    /// Current entries of a system (unavailable while it is advancing).
    pub fn entries<S: EntitySystem>(&self, id: SystemId) -> Option<&Entries<S::Components>> {
        let cell = self.system_entry(id)?.cell.as_deref()?;
        cell.as_any()
            .downcast_ref::<SystemCell<S>>()
            .map(|cell| &cell.entries)
    }

    /// Number of entities the system currently tracks.
    pub fn entry_count(&self, id: SystemId) -> usize {
        self.system_entry(id)
            .and_then(|s| s.cell.as_ref())
            .map_or(0, |cell| cell.entry_count())
    }

    /// Whether system `id` currently holds an entry for `entity`.
    pub fn has_entry(&self, id: SystemId, entity: Entity) -> bool {
        self.system_entry(id)
            .and_then(|s| s.cell.as_ref())
            .is_some_and(|cell| cell.contains_entry(entity))
    }

    /// Counter bumped whenever system `id` gains or loses an entry.
    pub fn change_stamp(&self, id: SystemId) -> Option<u64> {
        Some(self.system_entry(id)?.cell.as_ref()?.change_stamp())
    }

    /// Systems registered and not queued for removal.
    pub fn system_count(&self) -> usize {
        self.systems.iter().flatten().filter(|s| s.valid).count()
    }

    /// Saved state of a single system.
    pub fn save_system_state(&self, id: SystemId) -> Result<Value, EcsError> {
        self.system_entry(id)
            .filter(|s| s.valid)
            .and_then(|s| s.cell.as_ref())
            .ok_or(EcsError::UnknownSystem(id))?
            .save_state()
    }

    /// Restore one system from what [`save_system_state`](Self::save_system_state) produced.
    pub fn load_system_state(&mut self, id: SystemId, state: &Value) -> Result<(), EcsError> {
        self.systems
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|s| s.valid)
            .and_then(|s| s.cell.as_mut())
            .ok_or(EcsError::UnknownSystem(id))?
            .load_state(state)
    }

    /// Type name the system was registered under.
    pub fn system_name(&self, id: SystemId) -> Option<&str> {
        self.system_entry(id).map(|s| s.name.as_str())
    }

    // -- events -------------------------------------------------------------

    /// Listen to `event` on every trigger. `None` only for [`EventId::NONE`].
    pub fn add_event_handler<F>(&mut self, event: EventId, handler: F) -> Option<HandlerId>
    where
        F: Fn(&mut EntityDomain, Option<Entity>, &dyn Any) + 'static,
    {
        let Some(slot) = self.events.resolve(event) else {
            warn!(?event, "handler for unresolvable event id");
            return None;
        };
        let id = self.events.next_handler_id();
        self.events.add_global(slot, id, Rc::new(handler));
        Some(id)
    }

    /// Listen to `event` only when it is triggered on `entity`.
    pub fn add_entity_event_handler<F>(
        &mut self,
        event: EventId,
        entity: Entity,
        handler: F,
    ) -> Option<HandlerId>
    where
        F: Fn(&mut EntityDomain, Option<Entity>, &dyn Any) + 'static,
    {
        if self.entry(entity).is_none() {
            warn!(?event, %entity, "handler for unknown entity");
            return None;
        }
        let Some(slot) = self.events.resolve(event) else {
            warn!(?event, "handler for unresolvable event id");
            return None;
        };
        let id = self.events.next_handler_id();
        let entry = self.entry_mut(entity)?;
        push_handler(
            &mut entry.event_handlers,
            EntityHandler {
                event: slot,
                id,
                handler: Rc::new(handler),
            },
        );
        Some(id)
    }

    /// Remove a global handler. Returns `false` if `id` is not registered for `event`.
    pub fn remove_event_handler(&mut self, event: EventId, id: HandlerId) -> bool {
        match self.events.find(event) {
            Some(slot) => self.events.remove_global(slot, id),
            None => false,
        }
    }

    /// Remove a handler attached to `entity`. Returns `false` if it is not there.
    pub fn remove_entity_event_handler(
        &mut self,
        event: EventId,
        entity: Entity,
        id: HandlerId,
    ) -> bool {
        let Some(slot) = self.events.find(event) else {
            return false;
        };
        let Some(entry) = self.entry_mut(entity) else {
            return false;
        };
        remove_handler(&mut entry.event_handlers, |h| h.event == slot && h.id == id)
    }

    /// Invoke every global handler of `event`.
    ///
    /// Returns `false` only if the id cannot be resolved; an event nobody
    /// listens to still returns `true`.
    pub fn trigger_event(&mut self, event: EventId, args: &dyn Any) -> bool {
        let Some(slot) = self.events.resolve(event) else {
            return false;
        };
        self.dispatch_global(slot, None, args);
        true
    }

    /// Invoke `entity`'s handlers for `event`, then every global handler.
    pub fn trigger_entity_event(&mut self, event: EventId, entity: Entity, args: &dyn Any) -> bool {
        let Some(slot) = self.events.resolve(event) else {
            return false;
        };
        let local = self.entry(entity).and_then(|e| e.event_handlers.clone());
        if let Some(list) = local {
            for h in list.iter().filter(|h| h.event == slot) {
                (h.handler)(self, Some(entity), args);
            }
        }
        self.dispatch_global(slot, Some(entity), args);
        true
    }

    fn dispatch_global(&mut self, slot: EventSlot, entity: Option<Entity>, args: &dyn Any) {
        let Some(list) = self.events.globals(slot) else {
            return;
        };
        trace!(event = ?self.events.id_of(slot), handlers = list.len(), "dispatching event");
        for h in list.iter() {
            (h.handler)(self, entity, args);
        }
    }

    /// Number of global handlers listening to `event`.
    pub fn event_handler_count(&self, event: EventId) -> usize {
        self.events.global_count(event)
    }

    /// Number of handlers `entity` has for `event`.
    pub fn entity_event_handler_count(&self, event: EventId, entity: Entity) -> usize {
        let (Some(slot), Some(entry)) = (self.events.find(event), self.entry(entity)) else {
            return 0;
        };
        entry
            .event_handlers
            .as_ref()
            .map_or(0, |list| list.iter().filter(|h| h.event == slot).count())
    }

    // -- stepping -----------------------------------------------------------

    /// Advance every system once, then reclaim deleted entities and systems.
    ///
    /// Systems run in registration order. A system added during the step
    /// first runs on the next step; a system reporting
    /// [`StateStatus::Dead`] is removed and an `Ignore`d one is skipped.
    pub fn step(&mut self, step: &StepContext) {
        if self.advancing {
            warn!(domain = %self.config.label, "nested step ignored");
            return;
        }
        self.advancing = true;
        let count = self.systems.len();
        for index in 0..count {
            let id = SystemId(index as u32);
            let status = match self.system_entry(id) {
                Some(system) if system.valid => system.cell.as_ref().map(|c| c.status()),
                _ => None,
            };
            match status {
                None | Some(StateStatus::Ignore) => continue,
                Some(StateStatus::Dead) => {
                    self.remove_system(id);
                    continue;
                }
                Some(StateStatus::Loading | StateStatus::Alive) => {}
            }
            let Some(mut cell) = self.systems[index].as_mut().and_then(|s| s.cell.take()) else {
                continue;
            };
            trace!(system = cell.name(), step = step.step, "advancing system");
            cell.advance(self, step);
            let dead = cell.status() == StateStatus::Dead;
            match self.systems[index].as_mut() {
                Some(system) => system.cell = Some(cell),
                // Flushed from inside its own advance.
                None => continue,
            }
            self.reconcile_pending(id);
            if dead {
                self.remove_system(id);
            }
        }
        self.advancing = false;
        self.flush_deleted_entities();
        self.flush_deleted_systems();
        self.steps += 1;
    }

    /// Completed steps.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Render every valid, non-ignored system in registration order.
    pub fn render_systems(&self, target: &mut dyn RenderTarget) {
        for system in self.systems.iter().flatten().filter(|s| s.valid) {
            if let Some(cell) = system.cell.as_ref() {
                if cell.status() != StateStatus::Ignore {
                    cell.render(self, target);
                }
            }
        }
    }

    /// Ask the driving game loop to switch to `next` after this step.
    pub fn request_transition(&mut self, next: Box<dyn State>) {
        self.next_state = Some(next);
    }

    /// Status reported to whatever drives the domain.
    pub fn set_status(&mut self, status: StateStatus) {
        self.status = status;
    }

    /// Snapshot of the domain's counters.
    pub fn stats(&self) -> DomainStats {
        DomainStats {
            label: self.config.label.clone(),
            entities: self.entities.len(),
            active_entities: self.entities.values().filter(|e| e.active).count(),
            pending_deletion: self.deleted_entities.len(),
            systems: self.system_count(),
            event_ids: self.events.len(),
            steps: self.steps,
            factories: self.components.stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

impl State for EntityDomain {
    fn advance(&mut self, step: &StepContext) -> Option<Box<dyn State>> {
        self.step(step);
        self.next_state.take()
    }

    fn render(&self, target: &mut dyn RenderTarget) {
        self.render_systems(target);
    }

    /// Saves each system's own state, in registration order. Entities are
    /// not part of the saved state.
    fn save_state(&self) -> Result<Value, EcsError> {
        let mut systems = Vec::new();
        for system in self.systems.iter().flatten().filter(|s| s.valid) {
            let state = match system.cell.as_ref() {
                Some(cell) => cell.save_state()?,
                None => Value::Null,
            };
            systems.push(json!({ "name": system.name, "state": state }));
        }
        Ok(json!({ "label": self.config.label, "systems": systems }))
    }

    fn load_state(&mut self, state: &Value) -> Result<(), EcsError> {
        let saved = state
            .get("systems")
            .and_then(Value::as_array)
            .ok_or_else(|| EcsError::StateFormat("missing `systems` array".to_owned()))?;
        let live: Vec<usize> = self
            .systems
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(|s| s.valid))
            .map(|(index, _)| index)
            .collect();
        if saved.len() != live.len() {
            return Err(EcsError::StateMismatch {
                expected: format!("{} systems", live.len()),
                found: format!("{} systems", saved.len()),
            });
        }
        for (&index, saved) in live.iter().zip(saved) {
            let name = saved
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| EcsError::StateFormat("system entry without a name".to_owned()))?;
            let Some(system) = self.systems[index].as_ref() else {
                continue;
            };
            if system.name != name {
                return Err(EcsError::StateMismatch {
                    expected: system.name.clone(),
                    found: name.to_owned(),
                });
            }
        }
        for (&index, saved) in live.iter().zip(saved) {
            let Some(cell) = self.systems[index].as_mut().and_then(|s| s.cell.as_mut()) else {
                return Err(EcsError::StateFormat("system is running".to_owned()));
            };
            cell.load_state(saved.get("state").unwrap_or(&Value::Null))?;
        }
        Ok(())
    }

    fn status(&self) -> StateStatus {
        self.status
    }
}

impl Drop for EntityDomain {
    fn drop(&mut self) {
        self.systems.clear();
        for entry in self.entities.values() {
            for &factory in &entry.components {
                self.components
                    .entry_mut(factory)
                    .factory
                    .delete(entry.handle);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
