//! Headless bouncing-balls demo: balls move inside a box, bounce off the walls
//! and burn out after a number of bounces.
//!
//! Run with:
//!   cargo run --example bouncing_balls -p keystone-engine
//!
//! Set `RUST_LOG=debug` to watch systems and flushes.

use std::cell::Cell;
use std::rc::Rc;

use anyhow::Context;
use keystone_engine::prelude::*;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

const WIDTH: f64 = 800.0;
const HEIGHT: f64 = 600.0;
const MAX_BOUNCES: u32 = 5;

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct Position {
    x: f64,
    y: f64,
}

#[derive(Debug, Default, Clone)]
struct Velocity {
    dx: f64,
    dy: f64,
}

#[derive(Debug, Default, Clone)]
struct Bounces(u32);

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

struct Movement;

impl EntitySystem for Movement {
    type Components = (Position, Velocity);

    fn advance(
        &mut self,
        entries: &Entries<Self::Components>,
        domain: &mut EntityDomain,
        step: &StepContext,
    ) {
        for entry in entries {
            if let Some((pos, vel)) = domain.fetch_mut(entry) {
                pos.x += vel.dx * step.dt;
                pos.y += vel.dy * step.dt;
            }
        }
    }

    fn name(&self) -> &str {
        "movement"
    }
}

/// Reflects balls off the walls and raises a `bounce` event on each hit.
struct Walls {
    bounce: EventId,
}

impl EntitySystem for Walls {
    type Components = (Position, Velocity);

    fn advance(
        &mut self,
        entries: &Entries<Self::Components>,
        domain: &mut EntityDomain,
        _step: &StepContext,
    ) {
        for entry in entries {
            let hit = match domain.fetch_mut(entry) {
                Some((pos, vel)) => {
                    let mut hit = false;
                    if pos.x < 0.0 || pos.x > WIDTH {
                        vel.dx = -vel.dx;
                        pos.x = pos.x.clamp(0.0, WIDTH);
                        hit = true;
                    }
                    if pos.y < 0.0 || pos.y > HEIGHT {
                        vel.dy = -vel.dy;
                        pos.y = pos.y.clamp(0.0, HEIGHT);
                        hit = true;
                    }
                    hit
                }
                None => false,
            };
            if hit {
                domain.trigger_entity_event(self.bounce, entry.entity(), &());
            }
        }
    }

    fn name(&self) -> &str {
        "walls"
    }
}

/// Ends the scene once every ball has burnt out.
struct Scene {
    balls: Rc<Cell<usize>>,
}

impl EntitySystem for Scene {
    type Components = (Bounces,);

    fn advance(
        &mut self,
        entries: &Entries<Self::Components>,
        domain: &mut EntityDomain,
        _step: &StepContext,
    ) {
        self.balls.set(entries.len());
        if entries.is_empty() {
            domain.set_status(StateStatus::Dead);
        }
    }

    fn name(&self) -> &str {
        "scene"
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn build_domain(balls: usize, seed: u64, remaining: Rc<Cell<usize>>) -> EntityDomain {
    let mut domain = EntityDomain::with_config(DomainConfig {
        label: "bouncing-balls".to_owned(),
        entity_capacity: balls,
    });
    let bounce = EventId::from_name("bounce");
    domain.add_system(Movement);
    domain.add_system(Walls { bounce });
    domain.add_system(Scene { balls: remaining });

    // Count bounces and burn out a ball after MAX_BOUNCES.
    domain.add_event_handler(bounce, |domain, ball, _| {
        let Some(ball) = ball else { return };
        let burnt = domain
            .get_component_mut::<Bounces>(ball)
            .map(|b| {
                b.0 += 1;
                b.0 >= MAX_BOUNCES
            })
            .unwrap_or(false);
        if burnt {
            tracing::debug!(%ball, "ball burnt out");
            domain.delete_entity(ball);
        }
    });

    let mut rng = Pcg64::seed_from_u64(seed);
    let template = domain.create_entity("template");
    domain.add_component::<Position>(template);
    domain.add_component::<Velocity>(template);
    domain.add_component::<Bounces>(template);

    for i in 0..balls {
        let Some(ball) = domain.clone_entity(template, &format!("ball-{i}")) else {
            continue;
        };
        if let Some(pos) = domain.get_component_mut::<Position>(ball) {
            pos.x = rng.gen_range(0.0..WIDTH);
            pos.y = rng.gen_range(0.0..HEIGHT);
        }
        if let Some(vel) = domain.get_component_mut::<Velocity>(ball) {
            vel.dx = rng.gen_range(-400.0..400.0);
            vel.dy = rng.gen_range(-400.0..400.0);
        }
        domain.activate_entity(ball);
    }
    domain.delete_entity(template);
    domain
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config =
        RunnerConfig::from_json_str(r#"{ "fixed_dt": 0.016666666666666666, "max_steps": 36000 }"#)
            .context("loading runner config")?;
    let remaining = Rc::new(Cell::new(0));
    let domain = build_domain(64, 7, Rc::clone(&remaining));
    let mut runner = Runner::new(Box::new(domain), config)?;

    let max_steps = runner.config().max_steps.unwrap_or(u64::MAX);
    while !runner.is_finished() && runner.step_count() < max_steps {
        runner.run_steps(600);
        println!(
            "t={:>6.1}s  balls={:>3}  last step {:?}",
            runner.sim_time(),
            remaining.get(),
            runner.last_diagnostics().total_time
        );
    }

    let saved = runner.save_state().context("saving final state")?;
    println!("{}", serde_json::to_string_pretty(&saved)?);
    Ok(())
}
