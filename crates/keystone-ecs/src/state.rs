//! The generic lifecycle contract shared by game-loop states and systems.
//!
//! An external game loop drives a [`State`] once per step: [`State::advance`]
//! may hand back the state to switch to, [`State::render`] draws into an
//! opaque target, and [`State::status`] tells the loop whether the state is
//! still worth driving. [`EntityDomain`](crate::domain::EntityDomain)
//! implements this trait, so a whole domain can be run like any other state.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::EcsError;

/// Lifecycle status reported by a state or system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StateStatus {
    /// Still preparing; advanced but not expected to render anything useful.
    Loading,
    /// Running normally.
    #[default]
    Alive,
    /// Finished; the owner should drop it.
    Dead,
    /// Temporarily skipped by its owner.
    Ignore,
}

/// Per-step input handed to [`State::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepContext {
    /// Number of steps completed before this one.
    pub step: u64,
    /// Fixed time step in seconds.
    pub dt: f64,
}

impl StepContext {
    /// Context for step number `step` of length `dt` seconds.
    pub fn new(step: u64, dt: f64) -> Self {
        Self { step, dt }
    }

    /// Simulation time at the start of this step, `step * dt`.
    pub fn time(&self) -> f64 {
        self.step as f64 * self.dt
    }
}

/// Anything a state can render into. Renderers downcast to their own type.
pub trait RenderTarget {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> RenderTarget for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A unit of work driven by a game loop.
pub trait State {
    /// Run one step. Returning `Some` asks the loop to switch to that state.
    fn advance(&mut self, step: &StepContext) -> Option<Box<dyn State>>;

    fn render(&self, _target: &mut dyn RenderTarget) {}

    /// Capture resumable state as JSON.
    fn save_state(&self) -> Result<serde_json::Value, EcsError> {
        Ok(serde_json::Value::Null)
    }

    /// Restore state captured by [`save_state`](Self::save_state).
    fn load_state(&mut self, _state: &serde_json::Value) -> Result<(), EcsError> {
        Ok(())
    }

    fn status(&self) -> StateStatus {
        StateStatus::Alive
    }
}
