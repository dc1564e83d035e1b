//! Keystone Engine -- fixed-timestep driver and process setup for
//! [`keystone_ecs`] domains.
//!
//! The [`Runner`](runner::Runner) advances any [`State`](keystone_ecs::state::State),
//! most often an [`EntityDomain`](keystone_ecs::domain::EntityDomain), once
//! per fixed step and follows the transitions states hand back.
//!
//! # Quick Start
//!
//! ```
//! use keystone_engine::prelude::*;
//!
//! #[derive(Debug, Default, Clone)]
//! struct Score(u32);
//!
//! struct Scoring;
//!
//! impl EntitySystem for Scoring {
//!     type Components = (Score,);
//!
//!     fn advance(
//!         &mut self,
//!         entries: &Entries<Self::Components>,
//!         domain: &mut EntityDomain,
//!         _step: &StepContext,
//!     ) {
//!         for entry in entries {
//!             if let Some((score,)) = domain.fetch_mut(entry) {
//!                 score.0 += 1;
//!             }
//!         }
//!     }
//! }
//!
//! let mut domain = EntityDomain::new();
//! domain.add_system(Scoring);
//! let player = domain.create_entity("player");
//! domain.add_component::<Score>(player);
//! domain.activate_entity(player);
//!
//! let config = RunnerConfig { max_steps: Some(100), ..Default::default() };
//! let mut runner = Runner::new(Box::new(domain), config).unwrap();
//! assert_eq!(runner.run(), 100);
//! ```

#![deny(unsafe_code)]

pub mod error;
pub mod logging;
pub mod runner;

/// Re-export the ECS crate for convenience.
pub use keystone_ecs;

pub use error::EngineError;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use keystone_ecs::prelude::*;

    pub use crate::error::EngineError;
    pub use crate::logging::init_tracing;
    pub use crate::runner::{Runner, RunnerConfig, StepDiagnostics, StepOutcome};
}
