//! End-to-end scenarios for entity matching, component storage and deferred
//! deletion.

use keystone_ecs::prelude::*;
use serde_json::{json, Value};

// -- Component types --------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq)]
struct A(u32);

#[derive(Debug, Default, Clone, PartialEq)]
struct B(u32);

#[derive(Debug, Default, Clone, PartialEq)]
struct Name(String);

// -- Systems ----------------------------------------------------------------

/// Requires `A` and `B`; records which entities it saw each step.
#[derive(Default)]
struct Pairs {
    seen: Vec<Vec<Entity>>,
}

impl EntitySystem for Pairs {
    type Components = (A, B);

    fn advance(
        &mut self,
        entries: &Entries<Self::Components>,
        _domain: &mut EntityDomain,
        _step: &StepContext,
    ) {
        self.seen.push(entries.iter().map(Entry::entity).collect());
    }
}

/// Deletes every entity it visits, then reads the components back.
#[derive(Default)]
struct Reaper {
    readable_after_delete: usize,
}

impl EntitySystem for Reaper {
    type Components = (A,);

    fn advance(
        &mut self,
        entries: &Entries<Self::Components>,
        domain: &mut EntityDomain,
        _step: &StepContext,
    ) {
        for entry in entries {
            domain.delete_entity(entry.entity());
        }
        for entry in entries {
            if domain.fetch(entry).is_some() {
                self.readable_after_delete += 1;
            }
        }
    }
}

/// Strips `A` from every entity it visits.
#[derive(Default)]
struct Stripper {
    fetched_after_strip: usize,
}

impl EntitySystem for Stripper {
    type Components = (A,);

    fn advance(
        &mut self,
        entries: &Entries<Self::Components>,
        domain: &mut EntityDomain,
        _step: &StepContext,
    ) {
        for entry in entries {
            domain.delete_component::<A>(entry.entity());
            if domain.fetch_mut(entry).is_some() {
                self.fetched_after_strip += 1;
            }
        }
    }
}

/// Counts its own steps and persists the count.
#[derive(Default)]
struct Ticker {
    steps: u64,
    lifetime: Option<u64>,
}

impl EntitySystem for Ticker {
    type Components = (Name,);

    fn advance(
        &mut self,
        _entries: &Entries<Self::Components>,
        _domain: &mut EntityDomain,
        _step: &StepContext,
    ) {
        self.steps += 1;
    }

    fn save_state(&self) -> Result<Value, EcsError> {
        Ok(json!({ "steps": self.steps }))
    }

    fn load_state(&mut self, state: &Value) -> Result<(), EcsError> {
        self.steps = state["steps"]
            .as_u64()
            .ok_or_else(|| EcsError::StateFormat("steps".to_owned()))?;
        Ok(())
    }

    fn status(&self) -> StateStatus {
        match self.lifetime {
            Some(lifetime) if self.steps >= lifetime => StateStatus::Dead,
            _ => StateStatus::Alive,
        }
    }

    fn name(&self) -> &str {
        "ticker"
    }
}

/// Registers a `Ticker` the first time it runs.
#[derive(Default)]
struct Installer {
    installed: Option<SystemId>,
}

impl EntitySystem for Installer {
    type Components = (Name,);

    fn advance(
        &mut self,
        _entries: &Entries<Self::Components>,
        domain: &mut EntityDomain,
        _step: &StepContext,
    ) {
        if self.installed.is_none() {
            self.installed = Some(domain.add_system(Ticker::default()));
        }
    }
}

fn step(domain: &mut EntityDomain) {
    let n = domain.steps();
    domain.step(&StepContext::new(n, 1.0 / 60.0));
}

// -- Scenarios --------------------------------------------------------------

#[test]
fn entry_follows_component_set() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Pairs::default());

    let e = domain.create_entity("e");
    domain.add_component::<A>(e);
    domain.activate_entity(e);
    assert_eq!(domain.entry_count(id), 0);

    domain.add_component::<B>(e);
    assert_eq!(domain.entry_count(id), 1);
    assert!(domain.has_entry(id, e));

    assert!(domain.delete_component::<A>(e));
    assert_eq!(domain.entry_count(id), 0);
    assert!(!domain.has_component::<A>(e));
    assert!(domain.has_component::<B>(e));

    step(&mut domain);
    assert_eq!(domain.system::<Pairs>(id).unwrap().seen, vec![Vec::<Entity>::new()]);
}

#[test]
fn readding_a_component_changes_nothing() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Pairs::default());
    let e = domain.create_entity("");
    domain.add_component::<A>(e).unwrap().0 = 7;
    domain.add_component::<B>(e);
    domain.activate_entity(e);
    let stamp = domain.change_stamp(id);

    assert_eq!(domain.add_component::<A>(e).unwrap().0, 7);
    assert_eq!(domain.change_stamp(id), stamp);
    assert_eq!(domain.entry_count(id), 1);
    assert_eq!(domain.factory_stats::<A>().unwrap().live, 1);
}

#[test]
fn three_hundred_entities_fill_two_buckets() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Pairs::default());
    let mut entities = Vec::new();
    for i in 0..300 {
        let e = domain.create_entity("");
        domain.add_component::<A>(e).unwrap().0 = i;
        domain.add_component::<B>(e);
        domain.activate_entity(e);
        entities.push(e);
    }

    let stats = domain.factory_stats::<A>().unwrap();
    assert_eq!(stats.buckets, 2);
    assert_eq!(stats.live, 300);

    let entries = domain.entries::<Pairs>(id).unwrap();
    assert_eq!(entries.len(), 300);
    let last = entries.get(entities[299]).unwrap();
    let (a, _) = *last.components();
    assert_eq!(a.slot(), BUCKET_SLOTS as u32 + 43);
    assert_eq!(domain.resolve(a), Some(&A(299)));

    for (i, &e) in entities.iter().enumerate() {
        let (a, _) = *domain.entries::<Pairs>(id).unwrap().get(e).unwrap().components();
        assert_eq!(a.slot() as usize, i);
        assert_eq!(domain.resolve(a).map(|a| a.0), Some(i as u32));
    }
}

#[test]
fn freed_slots_are_reused_last_in_first_out() {
    let mut domain = EntityDomain::new();
    let entities: Vec<Entity> = (0..BUCKET_SLOTS)
        .map(|_| {
            let e = domain.create_entity("");
            domain.add_component::<A>(e);
            e
        })
        .collect();
    assert_eq!(domain.factory_stats::<A>().unwrap().buckets, 1);

    let slot = |domain: &EntityDomain, e: Entity| domain.factory::<A>().unwrap().slot_of(e);
    let first = slot(&domain, entities[10]);
    let second = slot(&domain, entities[20]);
    domain.delete_component::<A>(entities[10]);
    domain.delete_component::<A>(entities[20]);

    let x = domain.create_entity("");
    let y = domain.create_entity("");
    domain.add_component::<A>(x);
    domain.add_component::<A>(y);
    assert_eq!(slot(&domain, x), second);
    assert_eq!(slot(&domain, y), first);
    // No new bucket once freed capacity is reused.
    assert_eq!(domain.factory_stats::<A>().unwrap().buckets, 1);
}

#[test]
fn component_address_is_stable_across_growth() {
    let mut domain = EntityDomain::new();
    let e = domain.create_entity("");
    let before: *const A = domain.add_component::<A>(e).unwrap();
    for _ in 0..1000 {
        let other = domain.create_entity("");
        domain.add_component::<A>(other);
    }
    let after: *const A = domain.get_component::<A>(e).unwrap();
    assert_eq!(before, after);
}

#[test]
fn deleted_entities_stay_readable_until_step_ends() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Reaper::default());
    for _ in 0..5 {
        let e = domain.create_entity("");
        domain.add_component::<A>(e);
        domain.activate_entity(e);
    }

    step(&mut domain);
    assert_eq!(domain.system::<Reaper>(id).unwrap().readable_after_delete, 5);
    assert_eq!(domain.entity_count(), 0);
    assert_eq!(domain.entry_count(id), 0);
    assert_eq!(domain.factory_stats::<A>().unwrap().live, 0);
}

#[test]
fn component_deleted_mid_advance_is_not_resolved() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Stripper::default());
    for _ in 0..3 {
        let e = domain.create_entity("");
        domain.add_component::<A>(e);
        domain.activate_entity(e);
    }

    step(&mut domain);
    assert_eq!(domain.system::<Stripper>(id).unwrap().fetched_after_strip, 0);
    assert_eq!(domain.entry_count(id), 0);
    assert_eq!(domain.entity_count(), 3);
}

#[test]
fn stale_handle_does_not_resolve_to_reused_slot() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Pairs::default());
    let old = domain.create_entity("");
    domain.add_component::<A>(old);
    domain.add_component::<B>(old);
    domain.activate_entity(old);
    let (handle, _) = *domain.entries::<Pairs>(id).unwrap().get(old).unwrap().components();

    domain.delete_entity(old);
    domain.flush_deleted_entities();

    let new = domain.create_entity("");
    domain.add_component::<A>(new).unwrap().0 = 99;
    assert_eq!(domain.factory::<A>().unwrap().slot_of(new), Some(handle.slot()));
    assert_eq!(domain.resolve(handle), None);
    assert_ne!(new, old);
    assert_eq!(new.index(), old.index());
}

#[test]
fn clone_gets_fresh_entry_on_activation() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Pairs::default());
    let source = domain.create_entity("source");
    domain.add_component::<A>(source).unwrap().0 = 3;
    domain.add_component::<B>(source).unwrap().0 = 4;
    domain.activate_entity(source);

    let copy = domain.clone_entity(source, "copy").unwrap();
    assert!(!domain.is_active(copy));
    assert_eq!(domain.entry_count(id), 1);
    assert_eq!(domain.get_component::<A>(copy), Some(&A(3)));

    domain.activate_entity(copy);
    assert_eq!(domain.entry_count(id), 2);
    let entries = domain.entries::<Pairs>(id).unwrap();
    let (src_a, _) = *entries.get(source).unwrap().components();
    let (copy_a, copy_b) = *entries.get(copy).unwrap().components();
    assert_ne!(src_a.slot(), copy_a.slot());
    assert_eq!(copy_a.entity(), copy);

    domain.get_component_mut::<A>(copy).unwrap().0 = 30;
    assert_eq!(domain.get_component::<A>(source), Some(&A(3)));
    assert_eq!(domain.resolve(copy_b), Some(&B(4)));
    assert_eq!(domain.find_entity("copy"), Some(copy));
}

#[test]
fn system_added_during_step_runs_next_step() {
    let mut domain = EntityDomain::new();
    let installer = domain.add_system(Installer::default());
    step(&mut domain);
    let ticker = domain.system::<Installer>(installer).unwrap().installed.unwrap();
    assert_eq!(domain.system::<Ticker>(ticker).unwrap().steps, 0);
    step(&mut domain);
    assert_eq!(domain.system::<Ticker>(ticker).unwrap().steps, 1);
    assert_eq!(domain.system_count(), 2);
}

#[test]
fn dead_system_is_removed_after_advance() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Ticker {
        steps: 0,
        lifetime: Some(2),
    });
    step(&mut domain);
    assert!(domain.system::<Ticker>(id).is_some());
    step(&mut domain);
    assert!(domain.system::<Ticker>(id).is_none());
    assert_eq!(domain.system_count(), 0);
    assert!(matches!(
        domain.save_system_state(id),
        Err(EcsError::UnknownSystem(missing)) if missing == id
    ));
}

#[test]
fn save_and_load_follow_system_order() {
    let mut domain = EntityDomain::new();
    let id = domain.add_system(Ticker::default());
    step(&mut domain);
    step(&mut domain);
    let saved = domain.save_state().unwrap();
    assert_eq!(saved["systems"][0]["name"], "ticker");
    assert_eq!(saved["systems"][0]["state"]["steps"], 2);

    let mut restored = EntityDomain::new();
    let restored_id = restored.add_system(Ticker::default());
    restored.load_state(&saved).unwrap();
    assert_eq!(restored.system::<Ticker>(restored_id).unwrap().steps, 2);
    assert_eq!(domain.system::<Ticker>(id).unwrap().steps, 2);

    let mut mismatched = EntityDomain::new();
    mismatched.add_system(Pairs::default());
    assert!(matches!(
        mismatched.load_state(&saved),
        Err(EcsError::StateMismatch { .. })
    ));
    assert!(matches!(
        restored.load_state(&json!({})),
        Err(EcsError::StateFormat(_))
    ));
}

#[test]
fn transition_request_is_handed_to_the_loop() {
    let mut domain = EntityDomain::new();
    domain.request_transition(Box::new(EntityDomain::new()));
    assert!(domain.advance(&StepContext::default()).is_some());
    assert!(domain.advance(&StepContext::default()).is_none());
}

#[test]
fn render_reaches_every_system() {
    struct Drawn;

    impl EntitySystem for Drawn {
        type Components = (A,);

        fn advance(
            &mut self,
            _: &Entries<Self::Components>,
            _: &mut EntityDomain,
            _: &StepContext,
        ) {}

        fn render(
            &self,
            entries: &Entries<Self::Components>,
            domain: &EntityDomain,
            target: &mut dyn RenderTarget,
        ) {
            let Some(lines) = target.as_any_mut().downcast_mut::<Vec<u32>>() else {
                return;
            };
            for entry in entries {
                if let Some((a,)) = domain.fetch(entry) {
                    lines.push(a.0);
                }
            }
        }
    }

    let mut domain = EntityDomain::new();
    domain.add_system(Drawn);
    let e = domain.create_entity("");
    domain.add_component::<A>(e).unwrap().0 = 12;
    domain.activate_entity(e);

    let mut frame: Vec<u32> = Vec::new();
    domain.render(&mut frame);
    assert_eq!(frame, vec![12]);
}
