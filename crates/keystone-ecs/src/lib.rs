//! Keystone ECS -- an entity domain with slab-stored components, incrementally
//! matched systems and named events.
//!
//! An [`EntityDomain`](domain::EntityDomain) owns entities, one slab
//! [`ComponentFactory`](factory::ComponentFactory) per component type, the
//! registered systems and the event tables. Systems declare the component
//! types they need; whenever an active entity comes to own all of them, the
//! domain builds a cached entry with typed handles for that system, so each
//! step a system walks exactly its matched entities.
//!
//! # Quick Start
//!
//! ```
//! use keystone_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! struct Movement;
//!
//! impl EntitySystem for Movement {
//!     type Components = (Position, Velocity);
//!
//!     fn advance(
//!         &mut self,
//!         entries: &Entries<Self::Components>,
//!         domain: &mut EntityDomain,
//!         step: &StepContext,
//!     ) {
//!         for entry in entries {
//!             if let Some((pos, vel)) = domain.fetch_mut(entry) {
//!                 pos.x += vel.dx * step.dt as f32;
//!                 pos.y += vel.dy * step.dt as f32;
//!             }
//!         }
//!     }
//! }
//!
//! let mut domain = EntityDomain::new();
//! domain.add_system(Movement);
//!
//! let ball = domain.create_entity("ball");
//! domain.add_component::<Position>(ball);
//! domain.add_component::<Velocity>(ball).unwrap().dx = 2.0;
//! domain.activate_entity(ball);
//!
//! domain.step(&StepContext::new(0, 0.5));
//! assert_eq!(domain.get_component::<Position>(ball), Some(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod config;
pub mod domain;
pub mod entity;
pub mod event;
#[allow(unsafe_code)]
pub mod factory;
pub mod state;
pub mod system;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by fallible domain operations.
///
/// Structural misuse (unknown entities, double registration) is not an
/// error: those calls log a warning and return `None`/`false`.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// No live system has this id.
    #[error("unknown system {0:?}")]
    UnknownSystem(crate::system::SystemId),

    /// Saved state does not line up with the systems currently registered.
    #[error("saved state does not match the domain: expected {expected}, found {found}")]
    StateMismatch { expected: String, found: String },

    /// Saved state has the wrong shape.
    #[error("malformed saved state: {0}")]
    StateFormat(String),

    /// A system's state could not be encoded or decoded.
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{
        Component, ComponentHandle, ComponentSet, FactoryIndex, MAX_COMPONENT_BITS,
    };
    pub use crate::config::DomainConfig;
    pub use crate::domain::{DomainStats, EntityDomain};
    pub use crate::entity::Entity;
    pub use crate::event::{EventHandler, EventId, HandlerId};
    pub use crate::factory::{ComponentFactory, FactoryStats, BUCKET_SLOTS};
    pub use crate::state::{RenderTarget, State, StateStatus, StepContext};
    pub use crate::system::{Entries, Entry, EntitySystem, SystemId};
    pub use crate::EcsError;
}
