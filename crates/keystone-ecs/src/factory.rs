//! Slab storage for one component type.
//!
//! A [`ComponentFactory`] owns every instance of a single component type
//! across all entities of a domain. Instances live in fixed-capacity buckets
//! of [`BUCKET_SLOTS`] slots; a bucket is one zeroed allocation that is never
//! grown or moved, so a component's address is stable until it is deleted.
//! Freed slots go on a LIFO stack and are reused before any new slot is carved.
//!
//! # Safety
//!
//! Storage is type-erased. Every raw access goes through the
//! [`ComponentVtable`] captured for the concrete type when the factory was
//! created, and [`ComponentFactory::cast`] refuses to hand out a typed pointer
//! for any other type.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{self, Layout};
use std::any::TypeId;
use std::collections::HashMap;
use std::ptr::{self, NonNull};

use serde::Serialize;

use crate::component::Component;
use crate::entity::Entity;

/// Slots per bucket.
pub const BUCKET_SLOTS: usize = 256;

/// Minimum alignment of a bucket allocation.
const BUCKET_ALIGN: usize = 16;

// ---------------------------------------------------------------------------
// ComponentVtable -- type-erased operations for a component type
// ---------------------------------------------------------------------------

/// Function pointers for constructing, cloning and dropping values of one
/// component type in place.
///
/// `drop_fn` is `None` for types without drop glue; deleting such a
/// component is pure bookkeeping.
#[derive(Clone, Copy)]
pub struct ComponentVtable {
    /// Write `T::default()` into uninitialised memory.
    construct_fn: unsafe fn(*mut u8),
    /// Clone the value at `src` into uninitialised memory at `dst`.
    clone_fn: unsafe fn(*const u8, *mut u8),
    /// Drop a value in place.
    drop_fn: Option<unsafe fn(*mut u8)>,
    type_id: TypeId,
    type_name: &'static str,
    size: usize,
    align: usize,
}

impl std::fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentVtable")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("needs_drop", &self.drop_fn.is_some())
            .finish()
    }
}

impl ComponentVtable {
    /// Create a vtable for a concrete component type `T`.
    pub fn of<T: Component>() -> Self {
        unsafe fn construct_impl<T: Default>(dst: *mut u8) {
            ptr::write(dst as *mut T, T::default());
        }

        unsafe fn clone_impl<T: Clone>(src: *const u8, dst: *mut u8) {
            let value = &*(src as *const T);
            ptr::write(dst as *mut T, value.clone());
        }

        unsafe fn drop_impl<T>(ptr: *mut u8) {
            ptr::drop_in_place(ptr as *mut T);
        }

        Self {
            construct_fn: construct_impl::<T>,
            clone_fn: clone_impl::<T>,
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(drop_impl::<T>)
            } else {
                None
            },
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    /// Rust type name of the stored component.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Size of one component in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether deleting a value must run a destructor.
    pub fn needs_drop(&self) -> bool {
        self.drop_fn.is_some()
    }
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// One fixed block of `BUCKET_SLOTS` slots.
struct Bucket {
    data: NonNull<u8>,
    /// Slots carved from this bucket so far.
    carved: usize,
}

// ---------------------------------------------------------------------------
// FactoryStats
// ---------------------------------------------------------------------------

/// Occupancy snapshot of one factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactoryStats {
    pub type_name: &'static str,
    /// Components currently alive.
    pub live: usize,
    /// Slots carved from buckets (live + free).
    pub carved: usize,
    /// Slots waiting on the free list.
    pub free: usize,
    pub buckets: usize,
}

// ---------------------------------------------------------------------------
// ComponentFactory
// ---------------------------------------------------------------------------

/// Type-erased slab allocator and owner for all instances of one component
/// type, addressed by [`Entity`].
pub struct ComponentFactory {
    vtable: ComponentVtable,
    /// Bucket allocation layout; `None` for zero-sized types.
    bucket_layout: Option<Layout>,
    buckets: Vec<Bucket>,
    /// Freed slot indices, most recent last.
    free_slots: Vec<u32>,
    /// Entity -> slot index.
    used: HashMap<Entity, u32>,
    /// Slot index -> owning entity, `None` while the slot is free.
    owners: Vec<Option<Entity>>,
}

impl std::fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("vtable", &self.vtable)
            .field("live", &self.used.len())
            .field("buckets", &self.buckets.len())
            .field("free", &self.free_slots.len())
            .finish()
    }
}

impl ComponentFactory {
    /// Create an empty factory for `T`.
    pub fn for_type<T: Component>() -> Self {
        Self::new(ComponentVtable::of::<T>())
    }

    /// Create an empty factory from a vtable.
    pub fn new(vtable: ComponentVtable) -> Self {
        let bucket_layout = (vtable.size > 0).then(|| {
            vtable
                .size
                .checked_mul(BUCKET_SLOTS)
                .and_then(|size| {
                    Layout::from_size_align(size, vtable.align.max(BUCKET_ALIGN)).ok()
                })
                .unwrap_or_else(|| {
                    panic!("component `{}` is too large for a bucket", vtable.type_name)
                })
        });
        Self {
            vtable,
            bucket_layout,
            buckets: Vec::new(),
            free_slots: Vec::new(),
            used: HashMap::new(),
            owners: Vec::new(),
        }
    }

    /// Function table for the stored type.
    pub fn vtable(&self) -> &ComponentVtable {
        &self.vtable
    }

    /// `size_of::<T>()` of the stored type.
    pub fn data_size(&self) -> usize {
        self.vtable.size
    }

    /// Number of live components.
    pub fn len(&self) -> usize {
        self.used.len()
    }

    /// Whether no component is alive.
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Buckets allocated so far. Buckets are never released before drop.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Freed slots waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.free_slots.len()
    }

    /// Snapshot of the factory's counters.
    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            type_name: self.vtable.type_name,
            live: self.used.len(),
            carved: self.owners.len(),
            free: self.free_slots.len(),
            buckets: self.buckets.len(),
        }
    }

    // -- allocation ---------------------------------------------------------

    /// Address of slot `index`. The slot must have been carved.
    fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        let index = index as usize;
        let bucket = &self.buckets[index / BUCKET_SLOTS];
        if self.vtable.size == 0 {
            return bucket.data;
        }
        #[allow(unsafe_code)]
        unsafe {
            // In bounds: offset < BUCKET_SLOTS and the bucket holds BUCKET_SLOTS slots.
            NonNull::new_unchecked(
                bucket
                    .data
                    .as_ptr()
                    .add((index % BUCKET_SLOTS) * self.vtable.size),
            )
        }
    }

    fn grow(&mut self) {
        let data = match self.bucket_layout {
            Some(layout) => {
                #[allow(unsafe_code)]
                let raw = unsafe { alloc::alloc_zeroed(layout) };
                match NonNull::new(raw) {
                    Some(data) => data,
                    None => alloc::handle_alloc_error(layout),
                }
            }
            None => dangling_aligned(self.vtable.align),
        };
        self.buckets.push(Bucket { data, carved: 0 });
        tracing::trace!(
            component = self.vtable.type_name,
            buckets = self.buckets.len(),
            "component bucket added"
        );
    }

    /// Take a slot index: the most recently freed one, else the next slot of
    /// the tail bucket (adding a bucket when it is full).
    fn allocate_index(&mut self) -> u32 {
        if let Some(index) = self.free_slots.pop() {
            return index;
        }
        let tail_full = self
            .buckets
            .last()
            .map_or(true, |bucket| bucket.carved == BUCKET_SLOTS);
        if tail_full {
            self.grow();
        }
        let ordinal = self.buckets.len() - 1;
        let bucket = &mut self.buckets[ordinal];
        let index = ordinal * BUCKET_SLOTS + bucket.carved;
        bucket.carved += 1;
        self.owners.push(None);
        debug_assert_eq!(self.owners.len(), index + 1);
        index as u32
    }

    fn claim(&mut self, entity: Entity, index: u32) {
        self.used.insert(entity, index);
        self.owners[index as usize] = Some(entity);
    }

    // -- public operations --------------------------------------------------

    /// Construct a default component for `entity`.
    ///
    /// If `entity` already owns one, it is returned untouched and the flag is
    /// `true`.
    pub fn new_component(&mut self, entity: Entity) -> (NonNull<u8>, bool) {
        if let Some(&index) = self.used.get(&entity) {
            return (self.slot_ptr(index), true);
        }
        let index = self.allocate_index();
        let ptr = self.slot_ptr(index);
        #[allow(unsafe_code)]
        unsafe {
            (self.vtable.construct_fn)(ptr.as_ptr());
        }
        self.claim(entity, index);
        (ptr, false)
    }

    /// Give `entity` a copy of `source`'s component.
    ///
    /// Returns `None` if `entity` already owns a component or `source` owns
    /// none.
    pub fn clone_component(&mut self, entity: Entity, source: Entity) -> Option<NonNull<u8>> {
        if self.used.contains_key(&entity) {
            return None;
        }
        let source_index = *self.used.get(&source)?;
        let index = self.allocate_index();
        // Buckets never move, so the source address survives the allocation.
        let src = self.slot_ptr(source_index);
        let dst = self.slot_ptr(index);
        #[allow(unsafe_code)]
        unsafe {
            (self.vtable.clone_fn)(src.as_ptr(), dst.as_ptr());
        }
        self.claim(entity, index);
        Some(dst)
    }

    /// Erased pointer to `entity`'s component.
    pub fn lookup(&self, entity: Entity) -> Option<NonNull<u8>> {
        self.used.get(&entity).map(|&index| self.slot_ptr(index))
    }

    /// Slot index of `entity`'s component.
    pub fn slot_of(&self, entity: Entity) -> Option<u32> {
        self.used.get(&entity).copied()
    }

    /// Current owner of slot `index`.
    pub fn owner_of(&self, index: u32) -> Option<Entity> {
        self.owners.get(index as usize).copied().flatten()
    }

    /// Pointer to slot `index` if it is still owned by `entity`.
    pub fn resolve(&self, index: u32, entity: Entity) -> Option<NonNull<u8>> {
        (self.owner_of(index)? == entity).then(|| self.slot_ptr(index))
    }

    /// Destroy `entity`'s component and recycle its slot.
    pub fn delete(&mut self, entity: Entity) -> bool {
        let Some(index) = self.used.remove(&entity) else {
            return false;
        };
        if let Some(drop_fn) = self.vtable.drop_fn {
            let ptr = self.slot_ptr(index);
            #[allow(unsafe_code)]
            unsafe {
                drop_fn(ptr.as_ptr());
            }
        }
        self.owners[index as usize] = None;
        self.free_slots.push(index);
        true
    }

    /// Recover a typed pointer from an erased one; `None` if `T` is not the
    /// stored type.
    pub fn cast<T: 'static>(&self, ptr: NonNull<u8>) -> Option<NonNull<T>> {
        (TypeId::of::<T>() == self.vtable.type_id).then(|| ptr.cast::<T>())
    }

    /// Typed shared view of `entity`'s component.
    pub fn get<T: 'static>(&self, entity: Entity) -> Option<&T> {
        let ptr = self.cast::<T>(self.lookup(entity)?)?;
        #[allow(unsafe_code)]
        unsafe {
            Some(&*ptr.as_ptr())
        }
    }

    /// Typed exclusive view of `entity`'s component.
    pub fn get_mut<T: 'static>(&mut self, entity: Entity) -> Option<&mut T> {
        let ptr = self.cast::<T>(self.lookup(entity)?)?;
        #[allow(unsafe_code)]
        unsafe {
            Some(&mut *ptr.as_ptr())
        }
    }
}

fn dangling_aligned(align: usize) -> NonNull<u8> {
    NonNull::new(align as *mut u8).unwrap_or(NonNull::dangling())
}

impl Drop for ComponentFactory {
    fn drop(&mut self) {
        let leaked = self.used.len();
        if leaked > 0 {
            tracing::error!(
                component = self.vtable.type_name,
                leaked,
                "component factory dropped with live components"
            );
            if let Some(drop_fn) = self.vtable.drop_fn {
                for index in self.used.values() {
                    let ptr = self.slot_ptr(*index);
                    #[allow(unsafe_code)]
                    unsafe {
                        drop_fn(ptr.as_ptr());
                    }
                }
            }
        }
        if let Some(layout) = self.bucket_layout {
            for bucket in &self.buckets {
                #[allow(unsafe_code)]
                unsafe {
                    alloc::dealloc(bucket.data.as_ptr(), layout);
                }
            }
        }
        if !std::thread::panicking() {
            debug_assert_eq!(
                leaked, 0,
                "every component must be deleted before its factory is dropped"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Pod16 {
        a: u64,
        b: u64,
    }

    #[derive(Debug, Default, Clone)]
    struct Tracked {
        drops: Option<Rc<Cell<u32>>>,
        name: String,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            if let Some(drops) = &self.drops {
                drops.set(drops.get() + 1);
            }
        }
    }

    fn e(i: u32) -> Entity {
        Entity::new(i, 0)
    }

    fn clear(factory: &mut ComponentFactory, count: u32) {
        for i in 0..count {
            factory.delete(e(i));
        }
    }

    #[test]
    fn new_returns_existing_on_second_call() {
        let mut factory = ComponentFactory::for_type::<Pod16>();
        let (first, existed) = factory.new_component(e(0));
        assert!(!existed);
        let (second, existed) = factory.new_component(e(0));
        assert!(existed);
        assert_eq!(first, second);
        assert_eq!(factory.len(), 1);
        clear(&mut factory, 1);
    }

    #[test]
    fn new_component_is_default_constructed() {
        let mut factory = ComponentFactory::for_type::<Tracked>();
        factory.new_component(e(0));
        let value = factory.get::<Tracked>(e(0)).unwrap();
        assert!(value.name.is_empty());
        assert!(value.drops.is_none());
        clear(&mut factory, 1);
    }

    #[test]
    fn slots_are_sixteen_byte_aligned_and_stable() {
        let mut factory = ComponentFactory::for_type::<u8>();
        let (first, _) = factory.new_component(e(0));
        assert_eq!(first.as_ptr() as usize % BUCKET_ALIGN, 0);
        for i in 1..600 {
            factory.new_component(e(i));
        }
        for i in (1..600).step_by(3) {
            factory.delete(e(i));
        }
        assert_eq!(factory.lookup(e(0)), Some(first));
        clear(&mut factory, 600);
    }

    #[test]
    fn freed_slot_reused_lifo_without_new_bucket() {
        let mut factory = ComponentFactory::for_type::<Pod16>();
        for i in 0..BUCKET_SLOTS as u32 {
            factory.new_component(e(i));
        }
        assert_eq!(factory.bucket_count(), 1);

        let freed_a = factory.slot_of(e(10)).unwrap();
        let freed_b = factory.slot_of(e(20)).unwrap();
        factory.delete(e(10));
        factory.delete(e(20));

        factory.new_component(e(1000));
        factory.new_component(e(1001));
        assert_eq!(factory.slot_of(e(1000)), Some(freed_b));
        assert_eq!(factory.slot_of(e(1001)), Some(freed_a));
        assert_eq!(factory.bucket_count(), 1);

        factory.new_component(e(1002));
        assert_eq!(factory.bucket_count(), 2);
        assert_eq!(factory.slot_of(e(1002)), Some(BUCKET_SLOTS as u32));

        clear(&mut factory, BUCKET_SLOTS as u32);
        factory.delete(e(1000));
        factory.delete(e(1001));
        factory.delete(e(1002));
    }

    #[test]
    fn clone_copies_value_and_respects_existing() {
        let mut factory = ComponentFactory::for_type::<Pod16>();
        factory.new_component(e(0));
        *factory.get_mut::<Pod16>(e(0)).unwrap() = Pod16 { a: 7, b: 9 };

        assert!(factory.clone_component(e(1), e(0)).is_some());
        assert_eq!(factory.get::<Pod16>(e(1)), Some(&Pod16 { a: 7, b: 9 }));
        // Already owned: no-op.
        assert!(factory.clone_component(e(1), e(0)).is_none());
        // Missing source: no-op.
        assert!(factory.clone_component(e(2), e(5)).is_none());
        assert!(factory.lookup(e(2)).is_none());
        clear(&mut factory, 2);
    }

    #[test]
    fn delete_runs_destructor_once() {
        let drops = Rc::new(Cell::new(0));
        let mut factory = ComponentFactory::for_type::<Tracked>();
        factory.new_component(e(0));
        factory.get_mut::<Tracked>(e(0)).unwrap().drops = Some(drops.clone());
        assert!(factory.delete(e(0)));
        assert_eq!(drops.get(), 1);
        assert!(!factory.delete(e(0)));
        assert_eq!(drops.get(), 1);
        assert_eq!(factory.lookup(e(0)), None);
    }

    #[test]
    fn drop_destroys_leftovers_then_asserts() {
        let drops = Rc::new(Cell::new(0));
        let mut factory = ComponentFactory::for_type::<Tracked>();
        factory.new_component(e(0));
        factory.new_component(e(1));
        factory.get_mut::<Tracked>(e(1)).unwrap().drops = Some(drops.clone());
        assert!(factory.delete(e(0)));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            drop(factory);
        }));
        // The leftover is destroyed exactly once before the debug assertion fires.
        assert_eq!(drops.get(), 1);
        assert_eq!(result.is_err(), cfg!(debug_assertions));
    }

    #[test]
    fn resolve_rejects_reused_slot() {
        let mut factory = ComponentFactory::for_type::<Pod16>();
        factory.new_component(e(0));
        let slot = factory.slot_of(e(0)).unwrap();
        factory.delete(e(0));
        factory.new_component(e(1));
        assert_eq!(factory.slot_of(e(1)), Some(slot));
        assert!(factory.resolve(slot, e(0)).is_none());
        assert!(factory.resolve(slot, e(1)).is_some());
        clear(&mut factory, 2);
    }

    #[test]
    fn cast_checks_type() {
        let mut factory = ComponentFactory::for_type::<Pod16>();
        let (ptr, _) = factory.new_component(e(0));
        assert!(factory.cast::<Pod16>(ptr).is_some());
        assert!(factory.cast::<u32>(ptr).is_none());
        assert!(factory.get::<u32>(e(0)).is_none());
        clear(&mut factory, 1);
    }

    #[test]
    fn zero_sized_components_use_no_storage() {
        #[derive(Debug, Default, Clone)]
        struct Marker;

        let mut factory = ComponentFactory::for_type::<Marker>();
        for i in 0..300 {
            factory.new_component(e(i));
        }
        assert_eq!(factory.len(), 300);
        assert_eq!(factory.bucket_count(), 2);
        assert!(factory.get::<Marker>(e(299)).is_some());
        clear(&mut factory, 300);
    }

    #[test]
    fn pod_types_skip_destructor() {
        assert!(!ComponentVtable::of::<Pod16>().needs_drop());
        assert!(ComponentVtable::of::<Tracked>().needs_drop());
    }
}
