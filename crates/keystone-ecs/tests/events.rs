//! Event dispatch order and handler bookkeeping.

use std::cell::RefCell;
use std::rc::Rc;

use keystone_ecs::prelude::*;

#[derive(Debug, Default, Clone)]
struct Health(i32);

type Log = Rc<RefCell<Vec<String>>>;

fn recorder(
    log: &Log,
    label: &'static str,
) -> impl Fn(&mut EntityDomain, Option<Entity>, &dyn std::any::Any) + 'static {
    let log = Rc::clone(log);
    move |_, _, _| log.borrow_mut().push(label.to_owned())
}

#[test]
fn entity_handlers_fire_before_global_handlers() {
    let mut domain = EntityDomain::new();
    let hit = EventId::from_name("hit");
    let e = domain.create_entity("target");
    let log = Log::default();

    domain.add_event_handler(hit, recorder(&log, "global-1")).unwrap();
    domain.add_entity_event_handler(hit, e, recorder(&log, "entity-1")).unwrap();
    domain.add_event_handler(hit, recorder(&log, "global-2")).unwrap();
    domain.add_entity_event_handler(hit, e, recorder(&log, "entity-2")).unwrap();

    assert!(domain.trigger_entity_event(hit, e, &()));
    assert_eq!(*log.borrow(), ["entity-1", "entity-2", "global-1", "global-2"]);

    log.borrow_mut().clear();
    assert!(domain.trigger_event(hit, &()));
    assert_eq!(*log.borrow(), ["global-1", "global-2"]);
}

#[test]
fn entity_handlers_only_match_their_event() {
    let mut domain = EntityDomain::new();
    let hit = EventId::from_name("hit");
    let heal = EventId::from_name("heal");
    let e = domain.create_entity("");
    let log = Log::default();

    domain.add_entity_event_handler(heal, e, recorder(&log, "heal")).unwrap();
    domain.trigger_entity_event(hit, e, &());
    assert!(log.borrow().is_empty());
    assert_eq!(domain.entity_event_handler_count(heal, e), 1);
    assert_eq!(domain.entity_event_handler_count(hit, e), 0);
}

#[test]
fn payload_and_target_reach_the_handler() {
    let mut domain = EntityDomain::new();
    let damage = EventId::from_name("damage");
    let e = domain.create_entity("");
    domain.add_component::<Health>(e).unwrap().0 = 10;

    domain
        .add_entity_event_handler(damage, e, |domain, target, args| {
            let (Some(target), Some(amount)) = (target, args.downcast_ref::<i32>()) else {
                return;
            };
            if let Some(health) = domain.get_component_mut::<Health>(target) {
                health.0 -= amount;
            }
        })
        .unwrap();

    domain.trigger_entity_event(damage, e, &3i32);
    domain.trigger_entity_event(damage, e, &"ignored");
    assert_eq!(domain.get_component::<Health>(e).unwrap().0, 7);
}

#[test]
fn none_event_never_dispatches() {
    let mut domain = EntityDomain::new();
    let e = domain.create_entity("");
    let log = Log::default();
    assert!(domain.add_event_handler(EventId::NONE, recorder(&log, "x")).is_none());
    assert!(!domain.trigger_event(EventId::NONE, &()));
    assert!(!domain.trigger_entity_event(EventId::NONE, e, &()));
    assert!(log.borrow().is_empty());
}

#[test]
fn unknown_entity_still_reaches_globals() {
    let mut domain = EntityDomain::new();
    let ping = EventId::from_name("ping");
    let log = Log::default();
    domain.add_event_handler(ping, recorder(&log, "global")).unwrap();

    let gone = domain.create_entity("");
    domain.delete_entity(gone);
    domain.flush_deleted_entities();

    assert!(domain.trigger_entity_event(ping, gone, &()));
    assert_eq!(*log.borrow(), ["global"]);
    assert!(domain.add_entity_event_handler(ping, gone, recorder(&log, "x")).is_none());
}

#[test]
fn event_without_handlers_returns_true() {
    let mut domain = EntityDomain::new();
    assert!(domain.trigger_event(EventId::from_name("silence"), &()));
}

#[test]
fn removal_uses_the_returned_cookie() {
    let mut domain = EntityDomain::new();
    let tick = EventId::from_name("tick");
    let e = domain.create_entity("");
    let log = Log::default();

    let a = domain.add_event_handler(tick, recorder(&log, "a")).unwrap();
    let b = domain.add_event_handler(tick, recorder(&log, "b")).unwrap();
    let local = domain.add_entity_event_handler(tick, e, recorder(&log, "local")).unwrap();
    assert_ne!(a, b);

    assert!(domain.remove_event_handler(tick, a));
    assert!(!domain.remove_event_handler(tick, a));
    assert!(!domain.remove_event_handler(EventId::from_name("never-seen"), b));
    assert!(domain.remove_entity_event_handler(tick, e, local));
    assert!(!domain.remove_entity_event_handler(tick, e, local));

    domain.trigger_entity_event(tick, e, &());
    assert_eq!(*log.borrow(), ["b"]);
    assert_eq!(domain.event_handler_count(tick), 1);
}

#[test]
fn handlers_added_during_dispatch_wait_for_next_trigger() {
    let mut domain = EntityDomain::new();
    let spawn = EventId::from_name("spawn");
    let log = Log::default();

    let inner_log = Rc::clone(&log);
    domain
        .add_event_handler(spawn, move |domain, _, _| {
            inner_log.borrow_mut().push("outer".to_owned());
            domain.add_event_handler(spawn, recorder(&inner_log, "inner"));
        })
        .unwrap();

    domain.trigger_event(spawn, &());
    assert_eq!(*log.borrow(), ["outer"]);
    assert_eq!(domain.event_handler_count(spawn), 2);

    log.borrow_mut().clear();
    domain.trigger_event(spawn, &());
    assert_eq!(*log.borrow(), ["outer", "inner"]);
}

#[test]
fn handler_removed_during_dispatch_still_finishes_current_round() {
    let mut domain = EntityDomain::new();
    let boom = EventId::from_name("boom");
    let log = Log::default();
    let victim: Rc<RefCell<Option<HandlerId>>> = Rc::default();

    let killer_victim = Rc::clone(&victim);
    domain
        .add_event_handler(boom, move |domain, _, _| {
            if let Some(id) = killer_victim.borrow_mut().take() {
                domain.remove_event_handler(boom, id);
            }
        })
        .unwrap();
    *victim.borrow_mut() = domain.add_event_handler(boom, recorder(&log, "victim"));

    domain.trigger_event(boom, &());
    assert_eq!(*log.borrow(), ["victim"]);
    domain.trigger_event(boom, &());
    assert_eq!(*log.borrow(), ["victim"]);
}

#[test]
fn handler_may_delete_its_target() {
    let mut domain = EntityDomain::new();
    let die = EventId::from_name("die");
    let e = domain.create_entity("");
    domain.add_component::<Health>(e);
    domain.activate_entity(e);

    domain
        .add_entity_event_handler(die, e, |domain, target, _| {
            if let Some(target) = target {
                domain.delete_entity(target);
            }
        })
        .unwrap();

    assert!(domain.trigger_entity_event(die, e, &()));
    assert!(!domain.is_valid(e));
    domain.step(&StepContext::default());
    assert_eq!(domain.entity_count(), 0);
}
