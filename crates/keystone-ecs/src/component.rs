//! Component types, the per-domain component table, and typed handles.
//!
//! Every component type used in a domain gets a [`FactoryIndex`] the first
//! time it is touched. The index doubles as the type's *bit index*: bit
//! `index % 64` of an entity's component mask is set while the entity owns a
//! component of that type. Past [`MAX_COMPONENT_BITS`] distinct types the bits
//! alias, and exact membership checks against the factory lists take over.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::entity::Entity;
use crate::factory::{ComponentFactory, FactoryStats};
use crate::system::SystemId;

/// Number of distinct component types a domain can tell apart by bitmask
/// alone.
pub const MAX_COMPONENT_BITS: usize = 64;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Marker for payload types that can be stored in a domain.
///
/// Components are default-constructed in place when added and cloned when an
/// entity is cloned. Types without drop glue skip destruction entirely.
pub trait Component: Default + Clone + 'static {}

impl<T: Default + Clone + 'static> Component for T {}

// ---------------------------------------------------------------------------
// FactoryIndex
// ---------------------------------------------------------------------------

/// Per-domain identifier of a component type (and of its factory).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactoryIndex(pub(crate) u32);

impl FactoryIndex {
    /// Registration order of the component type within its domain.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Mask bit used for this type, `1 << (index % 64)`.
    #[inline]
    pub fn bit(self) -> u64 {
        1u64 << (self.index() % MAX_COMPONENT_BITS)
    }
}

impl fmt::Debug for FactoryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FactoryIndex({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Untyped reference to one component slot, validated against its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawHandle {
    pub factory: FactoryIndex,
    pub slot: u32,
    pub entity: Entity,
}

/// Typed reference to one component instance inside a domain.
///
/// A handle stays cheap to resolve for as long as the component lives: slot
/// memory is never moved. Once the component is deleted, resolving the handle
/// yields `None` even if the slot has been reused.
pub struct ComponentHandle<T> {
    raw: RawHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ComponentHandle<T> {
    /// Type the raw handle. The caller guarantees the factory stores `T`.
    pub(crate) fn from_raw(raw: RawHandle) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// The entity that owns the component.
    pub fn entity(&self) -> Entity {
        self.raw.entity
    }

    /// Global slot index inside the type's factory (`bucket * 256 + offset`).
    pub fn slot(&self) -> u32 {
        self.raw.slot
    }

    /// Factory the handle points into.
    pub fn factory(&self) -> FactoryIndex {
        self.raw.factory
    }
}

impl<T> Clone for ComponentHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ComponentHandle<T> {}

impl<T> PartialEq for ComponentHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for ComponentHandle<T> {}

impl<T> fmt::Debug for ComponentHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("type", &std::any::type_name::<T>())
            .field("factory", &self.raw.factory)
            .field("slot", &self.raw.slot)
            .field("entity", &self.raw.entity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentTable
// ---------------------------------------------------------------------------

/// One registered component type: its storage plus the systems that need it.
#[derive(Debug)]
pub(crate) struct ComponentFactoryEntry {
    pub factory: ComponentFactory,
    pub bit: u64,
    /// Systems whose required set includes this type.
    pub systems: Vec<SystemId>,
}

/// All component factories of a domain, keyed by Rust `TypeId`.
#[derive(Debug, Default)]
pub struct ComponentTable {
    by_type: HashMap<TypeId, FactoryIndex>,
    entries: Vec<ComponentFactoryEntry>,
}

impl ComponentTable {
    /// An empty table with no registered component types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index for `T`, creating its factory on first use.
    pub fn ensure<T: Component>(&mut self) -> FactoryIndex {
        if let Some(&index) = self.by_type.get(&TypeId::of::<T>()) {
            return index;
        }
        let index = FactoryIndex(self.entries.len() as u32);
        if index.index() == MAX_COMPONENT_BITS {
            tracing::warn!(
                component = std::any::type_name::<T>(),
                limit = MAX_COMPONENT_BITS,
                "component bit capacity exceeded; masks alias and matching uses exact checks"
            );
        }
        self.entries.push(ComponentFactoryEntry {
            factory: ComponentFactory::for_type::<T>(),
            bit: index.bit(),
            systems: Vec::new(),
        });
        self.by_type.insert(TypeId::of::<T>(), index);
        tracing::trace!(
            component = std::any::type_name::<T>(),
            ?index,
            "component factory created"
        );
        index
    }

    /// Index for `T` if it has been registered.
    pub fn lookup<T: 'static>(&self) -> Option<FactoryIndex> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Number of registered component types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no component type has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Factory registered under `index`, if any.
    pub fn factory(&self, index: FactoryIndex) -> Option<&ComponentFactory> {
        self.entries.get(index.index()).map(|e| &e.factory)
    }

    /// Per-factory counters, in registration order.
    pub fn stats(&self) -> Vec<FactoryStats> {
        self.entries.iter().map(|e| e.factory.stats()).collect()
    }

    /// Panics on an index this table never handed out.
    pub(crate) fn entry(&self, index: FactoryIndex) -> &ComponentFactoryEntry {
        &self.entries[index.index()]
    }

    /// Mutable counterpart of [`entry`](Self::entry).
    pub(crate) fn entry_mut(&mut self, index: FactoryIndex) -> &mut ComponentFactoryEntry {
        &mut self.entries[index.index()]
    }

    /// Every registered factory entry.
    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut ComponentFactoryEntry> {
        self.entries.iter_mut()
    }

    /// Typed view of `entity`'s component in factory `index`.
    pub(crate) fn get<T: 'static>(&self, index: FactoryIndex, entity: Entity) -> Option<&T> {
        let factory = self.factory(index)?;
        let ptr = factory.cast::<T>(factory.lookup(entity)?)?;
        // The slot is initialised and owned by `entity`; the borrow is tied to `self`.
        #[allow(unsafe_code)]
        unsafe {
            Some(&*ptr.as_ptr())
        }
    }

    /// Component `T` of `entity` when `index` stores `T`.
    pub(crate) fn get_mut<T: 'static>(
        &mut self,
        index: FactoryIndex,
        entity: Entity,
    ) -> Option<&mut T> {
        let factory = self.factory(index)?;
        let ptr = factory.cast::<T>(factory.lookup(entity)?)?;
        #[allow(unsafe_code)]
        unsafe {
            Some(&mut *ptr.as_ptr())
        }
    }

    /// Pointer behind a live handle, `None` once the component was deleted.
    pub(crate) fn resolve_ptr<T: 'static>(&self, handle: ComponentHandle<T>) -> Option<NonNull<T>> {
        let factory = self.factory(handle.raw.factory)?;
        let ptr = factory.resolve(handle.raw.slot, handle.raw.entity)?;
        factory.cast::<T>(ptr)
    }

    /// Follow a handle; `None` once its slot has been freed or reused.
    pub(crate) fn resolve<T: 'static>(&self, handle: ComponentHandle<T>) -> Option<&T> {
        let ptr = self.resolve_ptr(handle)?;
        #[allow(unsafe_code)]
        unsafe {
            Some(&*ptr.as_ptr())
        }
    }

    /// Mutable counterpart of [`resolve`](Self::resolve).
    pub(crate) fn resolve_mut<T: 'static>(&mut self, handle: ComponentHandle<T>) -> Option<&mut T> {
        let ptr = self.resolve_ptr(handle)?;
        #[allow(unsafe_code)]
        unsafe {
            Some(&mut *ptr.as_ptr())
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentSet -- the declared component list of a system
// ---------------------------------------------------------------------------

/// A tuple of distinct component types a system requires, in declared order.
///
/// Implemented for tuples of one to six [`Component`] types. The associated
/// `Handles` tuple is what each per-system entry stores.
pub trait ComponentSet: 'static {
    /// Number of component types in the set.
    const COUNT: usize;
    /// One [`ComponentHandle`] per type, in declared order.
    type Handles: Copy + fmt::Debug;
    /// Shared references to the components behind `Handles`.
    type Refs<'a>;
    /// Exclusive references to the components behind `Handles`.
    type Mut<'a>;

    /// Rust type ids in declared order.
    fn type_ids() -> Vec<TypeId>;
    /// Type names in declared order (diagnostics only).
    fn type_names() -> Vec<&'static str>;
    /// Factory indices in declared order, creating factories as needed.
    fn ensure_factories(table: &mut ComponentTable) -> Vec<FactoryIndex>;
    #[doc(hidden)]
    fn handles_from_raw(raw: &[RawHandle]) -> Self::Handles;
    #[doc(hidden)]
    fn fetch<'a>(table: &'a ComponentTable, handles: &Self::Handles) -> Option<Self::Refs<'a>>;
    #[doc(hidden)]
    fn fetch_mut<'a>(
        table: &'a mut ComponentTable,
        handles: &Self::Handles,
    ) -> Option<Self::Mut<'a>>;
}

/// Whether every factory in `indices` appears once.
pub(crate) fn all_distinct<T: PartialEq>(items: &[T]) -> bool {
    items
        .iter()
        .enumerate()
        .all(|(i, a)| items[i + 1..].iter().all(|b| a != b))
}

macro_rules! impl_component_set {
    ($count:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: Component),+> ComponentSet for ($($name,)+) {
            const COUNT: usize = $count;
            type Handles = ($(ComponentHandle<$name>,)+);
            type Refs<'a> = ($(&'a $name,)+);
            type Mut<'a> = ($(&'a mut $name,)+);

            fn type_ids() -> Vec<TypeId> {
                vec![$(TypeId::of::<$name>()),+]
            }

            fn type_names() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$name>()),+]
            }

            fn ensure_factories(table: &mut ComponentTable) -> Vec<FactoryIndex> {
                vec![$(table.ensure::<$name>()),+]
            }

            fn handles_from_raw(raw: &[RawHandle]) -> Self::Handles {
                debug_assert_eq!(
                    raw.len(),
                    Self::COUNT,
                    "entry built with the wrong number of component handles"
                );
                ($(ComponentHandle::<$name>::from_raw(raw[$idx]),)+)
            }

            fn fetch<'a>(
                table: &'a ComponentTable,
                handles: &Self::Handles,
            ) -> Option<Self::Refs<'a>> {
                Some(($(table.resolve(handles.$idx)?,)+))
            }

            fn fetch_mut<'a>(
                table: &'a mut ComponentTable,
                handles: &Self::Handles,
            ) -> Option<Self::Mut<'a>> {
                // Distinct factories means distinct slots, so the exclusive
                // references below never alias.
                if !all_distinct(&[$(handles.$idx.raw.factory),+]) {
                    return None;
                }
                let ptrs = ($(table.resolve_ptr(handles.$idx)?,)+);
                #[allow(unsafe_code)]
                unsafe {
                    Some(($(&mut *ptrs.$idx.as_ptr(),)+))
                }
            }
        }
    };
}

impl_component_set!(1; A: 0);
impl_component_set!(2; A: 0, B: 1);
impl_component_set!(3; A: 0, B: 1, C: 2);
impl_component_set!(4; A: 0, B: 1, C: 2, D: 3);
impl_component_set!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_component_set!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut table = ComponentTable::new();
        let a = table.ensure::<Pos>();
        let b = table.ensure::<Pos>();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup::<Pos>(), Some(a));
        assert_eq!(table.lookup::<Vel>(), None);
    }

    #[test]
    fn indices_are_assigned_in_order() {
        let mut table = ComponentTable::new();
        let p = table.ensure::<Pos>();
        let v = table.ensure::<Vel>();
        assert_eq!(p.index(), 0);
        assert_eq!(v.index(), 1);
        assert_eq!(p.bit(), 1);
        assert_eq!(v.bit(), 2);
    }

    #[test]
    fn bits_alias_past_capacity() {
        assert_eq!(FactoryIndex(3).bit(), FactoryIndex(67).bit());
        assert_eq!(FactoryIndex(63).bit(), 1 << 63);
    }

    #[test]
    fn component_set_declared_order() {
        type Set = (Vel, Pos);
        let mut table = ComponentTable::new();
        table.ensure::<Pos>();
        let factories = <Set as ComponentSet>::ensure_factories(&mut table);
        assert_eq!(factories, vec![FactoryIndex(1), FactoryIndex(0)]);
        assert_eq!(<Set as ComponentSet>::COUNT, 2);
        assert_eq!(
            <Set as ComponentSet>::type_ids(),
            vec![TypeId::of::<Vel>(), TypeId::of::<Pos>()]
        );
    }

    #[test]
    fn distinct_check() {
        assert!(all_distinct(&[1, 2, 3]));
        assert!(!all_distinct(&[1, 2, 1]));
        assert!(all_distinct::<u8>(&[]));
    }
}
