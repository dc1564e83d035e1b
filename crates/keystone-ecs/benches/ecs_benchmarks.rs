//! Factory churn and system iteration benchmarks.
//!
//! Run with: `cargo bench --bench ecs_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use keystone_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Benchmark component types
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
struct Health(u32);

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
}

struct Decay;

impl EntitySystem for Decay {
    type Components = (Health,);

    fn advance(
        &mut self,
        entries: &Entries<Self::Components>,
        domain: &mut EntityDomain,
        _step: &StepContext,
    ) {
        for entry in entries {
            if let Some((health,)) = domain.fetch_mut(entry) {
                health.0 = health.0.saturating_sub(1);
            }
        }
    }
}

fn populated_domain(count: usize) -> (EntityDomain, Vec<Entity>) {
    let mut domain = EntityDomain::new();
    domain.add_system(Movement);
    domain.add_system(Decay);
    let entities = (0..count)
        .map(|i| {
            let e = domain.create_entity("");
            domain.add_component::<Position>(e);
            if let Some(vel) = domain.add_component::<Velocity>(e) {
                vel.dx = 1.0;
                vel.dy = -1.0;
            }
            if i % 2 == 0 {
                if let Some(health) = domain.add_component::<Health>(e) {
                    health.0 = 1000;
                }
            }
            domain.activate_entity(e);
            e
        })
        .collect();
    (domain, entities)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("domain_step");
    for count in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let (mut domain, _) = populated_domain(count);
            let mut n = 0;
            b.iter(|| {
                domain.step(&StepContext::new(n, 1.0 / 60.0));
                n += 1;
            });
        });
    }
    group.finish();
}

fn bench_component_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("component_churn");
    for count in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let (mut domain, mut entities) = populated_domain(count);
            entities.shuffle(&mut Pcg64::seed_from_u64(0x5eed));
            b.iter(|| {
                for &e in &entities {
                    domain.delete_component::<Velocity>(e);
                }
                for &e in &entities {
                    black_box(domain.add_component::<Velocity>(e));
                }
            });
        });
    }
    group.finish();
}

fn bench_entity_lifecycle(c: &mut Criterion) {
    c.bench_function("create_activate_delete_1000", |b| {
        let (mut domain, _) = populated_domain(0);
        b.iter(|| {
            for _ in 0..1_000 {
                let e = domain.create_entity("");
                domain.add_component::<Position>(e);
                domain.add_component::<Velocity>(e);
                domain.activate_entity(e);
                domain.delete_entity(e);
            }
            black_box(domain.flush_deleted_entities());
        });
    });
}

criterion_group!(benches, bench_step, bench_component_churn, bench_entity_lifecycle);
criterion_main!(benches);
