//! Named events with global and per-entity listeners.
//!
//! Event names are hashed into 64-bit [`EventId`]s. Each distinct id that has
//! ever been registered or triggered gets an [`EventSlot`]; global listeners
//! hang off the slot and per-entity listeners live on the entity, tagged with
//! the slot they belong to.
//!
//! Listener lists are shared `Rc<Vec<_>>` values mutated copy-on-write, so a
//! dispatch in progress keeps iterating the list it started with even when a
//! handler adds or removes listeners.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::domain::EntityDomain;
use crate::entity::Entity;

// ---------------------------------------------------------------------------
// EventId
// ---------------------------------------------------------------------------

/// Hashed event name, treated as a collision-free key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    /// Reserved id that never resolves.
    pub const NONE: EventId = EventId(0);

    /// Hash an event name (first 8 bytes of its BLAKE3 digest).
    pub fn from_name(name: &str) -> Self {
        let digest = blake3::hash(name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        match u64::from_le_bytes(bytes) {
            0 => EventId(1),
            raw => EventId(raw),
        }
    }

    /// Rebuild an id from [`to_raw`](Self::to_raw).
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The 64-bit value behind the id.
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({:#018x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Cookie returned when a handler is registered, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

/// Callback invoked on dispatch with the domain, the target entity (if the
/// event was raised on one) and the event payload.
pub type EventHandler = Rc<dyn Fn(&mut EntityDomain, Option<Entity>, &dyn Any)>;

/// Position of an event id in the domain's event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EventSlot(u32);

#[derive(Clone)]
pub(crate) struct GlobalHandler {
    pub id: HandlerId,
    pub handler: EventHandler,
}

#[derive(Clone)]
pub(crate) struct EntityHandler {
    pub event: EventSlot,
    pub id: HandlerId,
    pub handler: EventHandler,
}

/// Shared, lazily allocated, copy-on-write handler list.
pub(crate) type HandlerList<T> = Option<Rc<Vec<T>>>;

/// Append to a copy-on-write list; dispatches already in progress keep their snapshot.
pub(crate) fn push_handler<T: Clone>(list: &mut HandlerList<T>, handler: T) {
    Rc::make_mut(list.get_or_insert_with(Default::default)).push(handler);
}

/// Remove the first handler matching `pred`; returns whether one was found.
pub(crate) fn remove_handler<T: Clone>(
    list: &mut HandlerList<T>,
    pred: impl Fn(&T) -> bool,
) -> bool {
    let Some(shared) = list else {
        return false;
    };
    let Some(pos) = shared.iter().position(|h| pred(h)) else {
        return false;
    };
    Rc::make_mut(shared).remove(pos);
    true
}

// ---------------------------------------------------------------------------
// EventTable
// ---------------------------------------------------------------------------

struct EventHandlerEntry {
    id: EventId,
    handlers: HandlerList<GlobalHandler>,
}

/// All event ids seen by a domain and their global handlers.
#[derive(Default)]
pub(crate) struct EventTable {
    by_id: HashMap<EventId, EventSlot>,
    entries: Vec<EventHandlerEntry>,
    next_handler: u64,
}

impl fmt::Debug for EventTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTable")
            .field("events", &self.entries.len())
            .field("next_handler", &self.next_handler)
            .finish()
    }
}

impl EventTable {
    /// A table with no events and no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `id`, created on first use. `None` only for [`EventId::NONE`].
    pub fn resolve(&mut self, id: EventId) -> Option<EventSlot> {
        if id == EventId::NONE {
            return None;
        }
        if let Some(&slot) = self.by_id.get(&id) {
            return Some(slot);
        }
        let slot = EventSlot(self.entries.len() as u32);
        self.entries.push(EventHandlerEntry { id, handlers: None });
        self.by_id.insert(id, slot);
        Some(slot)
    }

    /// Existing slot for `id`, without creating one.
    pub fn find(&self, id: EventId) -> Option<EventSlot> {
        self.by_id.get(&id).copied()
    }

    /// Fresh cookie, unique within this table.
    pub fn next_handler_id(&mut self) -> HandlerId {
        self.next_handler += 1;
        HandlerId(self.next_handler)
    }

    /// Register a global handler for the event in `slot`.
    pub fn add_global(&mut self, slot: EventSlot, id: HandlerId, handler: EventHandler) {
        push_handler(
            &mut self.entries[slot.0 as usize].handlers,
            GlobalHandler { id, handler },
        );
    }

    /// Remove a global handler. Returns `false` if `id` is unknown.
    pub fn remove_global(&mut self, slot: EventSlot, id: HandlerId) -> bool {
        remove_handler(&mut self.entries[slot.0 as usize].handlers, |h| h.id == id)
    }

    /// Shared snapshot of the global list for dispatch.
    pub fn globals(&self, slot: EventSlot) -> Option<Rc<Vec<GlobalHandler>>> {
        self.entries[slot.0 as usize].handlers.clone()
    }

    /// Number of global handlers registered for `id`.
    pub fn global_count(&self, id: EventId) -> usize {
        self.find(id)
            .and_then(|slot| self.entries[slot.0 as usize].handlers.as_ref())
            .map_or(0, |list| list.len())
    }

    /// Number of distinct event ids seen.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Event id stored in `slot`.
    pub fn id_of(&self, slot: EventSlot) -> EventId {
        self.entries[slot.0 as usize].id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
