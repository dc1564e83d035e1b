//! Fixed-timestep driver for a [`State`].
//!
//! The [`Runner`] owns the current state and advances it once per step with a
//! [`StepContext`] carrying the step number and the fixed time step. A state
//! may hand back a successor from `advance`; the runner switches to it before
//! the next step. A state reporting [`StateStatus::Dead`] ends the run and an
//! [`StateStatus::Ignore`]d one is not advanced.
//!
//! Simulation time is computed as `step_count * fixed_dt`, never accumulated.
//!
//! # Example
//!
//! ```
//! use keystone_engine::prelude::*;
//!
//! let domain = EntityDomain::new();
//! let mut runner = Runner::new(Box::new(domain), RunnerConfig::default()).unwrap();
//! runner.run_steps(10);
//! assert_eq!(runner.step_count(), 10);
//! ```

use std::time::{Duration, Instant};

use keystone_ecs::state::{RenderTarget, State, StateStatus, StepContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// RunnerConfig
// ---------------------------------------------------------------------------

/// Configuration for the fixed-timestep runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Fixed time step in seconds. Must be positive and finite.
    pub fixed_dt: f64,
    /// Upper bound on steps taken by [`Runner::run`]. `None` runs until the
    /// state dies.
    pub max_steps: Option<u64>,
}

impl Default for RunnerConfig {
    /// 60 Hz, unbounded.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            max_steps: None,
        }
    }
}

impl RunnerConfig {
    /// Reject a `fixed_dt` that is not positive and finite.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.fixed_dt > 0.0 && self.fixed_dt.is_finite()) {
            return Err(EngineError::InvalidConfig(format!(
                "fixed_dt must be positive and finite, got {}",
                self.fixed_dt
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// What a single [`Runner::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The state advanced and stays current.
    Advanced,
    /// The state advanced and handed over to a successor.
    Transitioned,
    /// The state is ignored; nothing ran.
    Skipped,
    /// The state is dead; nothing ran.
    Finished,
}

/// Timing of the last step.
#[derive(Debug, Clone, Default)]
pub struct StepDiagnostics {
    /// Step number handed to the state, if it advanced.
    pub step: Option<u64>,
    /// Wall-clock time spent in `advance`.
    pub advance_time: Duration,
    /// Total time for the step including the transition.
    pub total_time: Duration,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct Runner {
    state: Box<dyn State>,
    config: RunnerConfig,
    step_counter: u64,
    transitions: u64,
    last_diagnostics: StepDiagnostics,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("step_counter", &self.step_counter)
            .field("transitions", &self.transitions)
            .field("status", &self.state.status())
            .finish()
    }
}

impl Runner {
    /// Drive `state` with `config`, which is validated first.
    pub fn new(state: Box<dyn State>, config: RunnerConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            state,
            config,
            step_counter: 0,
            transitions: 0,
            last_diagnostics: StepDiagnostics::default(),
        })
    }

    /// Advance the current state once.
    pub fn step(&mut self) -> StepOutcome {
        let start = Instant::now();
        match self.state.status() {
            StateStatus::Dead => return StepOutcome::Finished,
            StateStatus::Ignore => {
                self.last_diagnostics = StepDiagnostics {
                    step: None,
                    advance_time: Duration::ZERO,
                    total_time: start.elapsed(),
                };
                return StepOutcome::Skipped;
            }
            StateStatus::Loading | StateStatus::Alive => {}
        }

        let ctx = StepContext::new(self.step_counter, self.config.fixed_dt);
        let next = self.state.advance(&ctx);
        let advance_time = start.elapsed();
        self.step_counter += 1;

        let outcome = match next {
            Some(next) => {
                self.state = next;
                self.transitions += 1;
                debug!(step = ctx.step, transitions = self.transitions, "state transition");
                StepOutcome::Transitioned
            }
            None => StepOutcome::Advanced,
        };
        self.last_diagnostics = StepDiagnostics {
            step: Some(ctx.step),
            advance_time,
            total_time: start.elapsed(),
        };
        outcome
    }

    /// Step until the state dies or `max_steps` calls have been made.
    /// Returns the number of steps that advanced the state.
    pub fn run(&mut self) -> u64 {
        let before = self.step_counter;
        let mut calls = 0u64;
        while self.config.max_steps.map_or(true, |max| calls < max) {
            calls += 1;
            if self.step() == StepOutcome::Finished {
                break;
            }
        }
        let advanced = self.step_counter - before;
        info!(advanced, total = self.step_counter, "run finished");
        advanced
    }

    /// Step `count` times unless the state dies first.
    pub fn run_steps(&mut self, count: u64) -> u64 {
        let before = self.step_counter;
        for _ in 0..count {
            if self.step() == StepOutcome::Finished {
                break;
            }
        }
        self.step_counter - before
    }

    /// Render the current state unless it is being ignored.
    pub fn render(&self, target: &mut dyn RenderTarget) {
        if self.state.status() != StateStatus::Ignore {
            self.state.render(target);
        }
    }

    /// Serialized form of the current state.
    pub fn save_state(&self) -> Result<serde_json::Value, EngineError> {
        Ok(self.state.save_state()?)
    }

    /// Restore the current state from [`save_state`](Self::save_state) output.
    pub fn load_state(&mut self, state: &serde_json::Value) -> Result<(), EngineError> {
        Ok(self.state.load_state(state)?)
    }

    // -- accessors ----------------------------------------------------------

    /// The state currently being driven.
    pub fn state(&self) -> &dyn State {
        self.state.as_ref()
    }

    /// Mutable access to the state currently being driven.
    pub fn state_mut(&mut self) -> &mut dyn State {
        self.state.as_mut()
    }

    /// Whether the current state reported `Dead`.
    pub fn is_finished(&self) -> bool {
        self.state.status() == StateStatus::Dead
    }

    /// Steps that advanced a state so far.
    pub fn step_count(&self) -> u64 {
        self.step_counter
    }

    /// Simulated seconds, computed as steps times `fixed_dt`.
    pub fn sim_time(&self) -> f64 {
        self.step_counter as f64 * self.config.fixed_dt
    }

    /// Seconds per step.
    pub fn fixed_dt(&self) -> f64 {
        self.config.fixed_dt
    }

    /// Number of successor states switched to so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Timing of the most recent step.
    pub fn last_diagnostics(&self) -> &StepDiagnostics {
        &self.last_diagnostics
    }

    /// Configuration the runner was built with.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
