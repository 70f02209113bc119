use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use archetype_store::{
    AccessDeclaration, AccessGuard, AccessMode, Bundle, ChunkID, ComponentID, Entity, Query, StoreError,
    TypeRegistry, ViolationPolicy, World, WorldConfig,
};

#[derive(Clone, Copy, Debug, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Velocity {
    dx: f32,
    dy: f32,
}

static INIT: Once = Once::new();

fn registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::shared();
    INIT.call_once(|| {
        registry.register::<Position>().unwrap();
        registry.register::<Velocity>().unwrap();
    });
    registry
}

fn world_with(policy: ViolationPolicy) -> World {
    let config = WorldConfig::default().with_violation_policy(policy);
    World::with_config(registry(), config).unwrap()
}

fn write(chunk: ChunkID, component: ComponentID) -> AccessDeclaration {
    AccessDeclaration::new(chunk, component, AccessMode::Write)
}

fn read(chunk: ChunkID, component: ComponentID) -> AccessDeclaration {
    AccessDeclaration::new(chunk, component, AccessMode::Read)
}

#[test]
fn conflicting_accesses_are_ordered_by_declaration() {
    let guard = AccessGuard::new(ViolationPolicy::FailFast);

    let w1 = guard.request_access(&[write(0, 1)]);
    let w2 = guard.request_access(&[write(0, 1)]);
    assert!(w1.dependencies().is_empty());
    assert_eq!(w2.dependencies(), &[w1.id()], "write after write");

    guard.complete_access(&w1);
    guard.complete_access(&w2);

    let r1 = guard.request_access(&[read(0, 1)]);
    let r2 = guard.request_access(&[read(0, 1)]);
    assert!(r2.dependencies().is_empty(), "readers never wait on readers");

    let w3 = guard.request_access(&[write(0, 1)]);
    let mut deps = w3.dependencies().to_vec();
    deps.sort_unstable();
    assert_eq!(deps, vec![r1.id(), r2.id()], "write after read");

    let r3 = guard.request_access(&[read(0, 1)]);
    assert_eq!(r3.dependencies(), &[w3.id()], "read after write");

    for token in [&r1, &r2, &w3, &r3] {
        guard.complete_access(token);
    }
    assert_eq!(guard.outstanding(), 0);
}

#[test]
fn disjoint_pairs_are_unordered() {
    let guard = AccessGuard::new(ViolationPolicy::FailFast);

    let a = guard.request_access(&[write(0, 1), write(1, 2)]);
    let b = guard.request_access(&[write(0, 2), write(1, 1)]);
    let c = guard.request_access(&[write(2, 1)]);
    assert!(b.dependencies().is_empty());
    assert!(c.dependencies().is_empty());

    guard.complete_access(&a);
    guard.complete_access(&b);
    guard.complete_access(&c);
}

#[test]
fn duplicate_declarations_collapse_to_the_strongest_mode() {
    let guard = AccessGuard::new(ViolationPolicy::FailFast);

    let token = guard.request_access(&[read(3, 0), write(3, 0), read(3, 0)]);
    assert_eq!(token.declarations().len(), 1);
    assert_eq!(token.declarations()[0].mode, AccessMode::Write);
    guard.complete_access(&token);
}

#[test]
fn direct_checkout_fails_until_completion() {
    let guard = AccessGuard::new(ViolationPolicy::FailFast);

    let token = guard.request_access(&[write(5, 0)]);
    let violation = guard.checkout_for_direct_access(5, 0, AccessMode::Read).unwrap_err();
    assert_eq!(violation.held, AccessMode::Write);
    assert_eq!(violation.requested, AccessMode::Read);
    assert!(guard.checkout_for_direct_access(5, 1, AccessMode::Write).is_ok(), "other columns are free");

    guard.complete_access(&token);
    assert!(guard.is_complete(&token));
    assert!(guard.checkout_for_direct_access(5, 0, AccessMode::Write).is_ok());

    // Completing twice is harmless.
    guard.complete_access(&token);
}

#[test]
fn read_tokens_allow_direct_reads_only() {
    let guard = AccessGuard::new(ViolationPolicy::FailFast);

    let token = guard.request_access(&[read(9, 4)]);
    assert!(guard.checkout_for_direct_access(9, 4, AccessMode::Read).is_ok());
    assert!(guard.checkout_for_direct_access(9, 4, AccessMode::Write).is_err());
    guard.complete_access(&token);
}

#[test]
fn wait_for_dependencies_blocks_until_completion() {
    let guard = Arc::new(AccessGuard::new(ViolationPolicy::FailFast));

    let first = guard.request_access(&[write(0, 0)]);
    let second = guard.request_access(&[write(0, 0)]);
    let finished = Arc::new(AtomicBool::new(false));

    let worker = {
        let guard = guard.clone();
        let finished = finished.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            finished.store(true, Ordering::SeqCst);
            guard.complete_access(&first);
        })
    };

    guard.wait_for_dependencies(&second);
    assert!(finished.load(Ordering::SeqCst), "waited for the earlier writer");
    guard.complete_access(&second);
    worker.join().unwrap();
}

fn chunk_of(world: &World, entity: Entity) -> ChunkID {
    let location = world.location(entity).unwrap();
    world.archetype(location.archetype).unwrap().chunk(location.chunk).unwrap().id()
}

#[test]
fn reporting_world_rejects_racing_direct_access() {
    let mut world = world_with(ViolationPolicy::Report);
    let registry = world.registry().clone();
    let position = registry.id_of::<Position>().unwrap();

    let e = world.spawn(Bundle::new().with(&registry, Position { x: 1.0, y: 2.0 }).unwrap()).unwrap();
    let chunk = chunk_of(&world, e);

    let guard = world.guard().clone();
    let token = guard.request_access(&[write(chunk, position)]);

    assert!(matches!(world.get::<Position>(e), Err(StoreError::ConcurrentAccessViolation(_))));
    assert!(matches!(world.destroy(e), Err(StoreError::ConcurrentAccessViolation(_))));
    assert!(world.exists(e), "a refused destroy leaves the entity alive");

    guard.complete_access(&token);
    assert_eq!(*world.get::<Position>(e).unwrap(), Position { x: 1.0, y: 2.0 });
    world.destroy(e).unwrap();
}

#[test]
#[should_panic(expected = "concurrent access violation")]
fn fail_fast_world_panics_on_racing_direct_access() {
    let mut world = world_with(ViolationPolicy::FailFast);
    let position = world.registry().id_of::<Position>().unwrap();

    let e = world.create_with(&[position]).unwrap();
    let token = world.guard().request_access(&[write(chunk_of(&world, e), position)]);

    let _ = world.get::<Position>(e);
    world.guard().complete_access(&token);
}

#[test]
fn held_reference_delays_a_writing_batch() {
    let mut world = world_with(ViolationPolicy::FailFast);
    let registry = world.registry().clone();
    let position = registry.id_of::<Position>().unwrap();

    let e = world.spawn(Bundle::new().with(&registry, Position { x: 1.0, y: 2.0 }).unwrap()).unwrap();
    let mut writer = Query::compile(&[], &[], &[(position, AccessMode::Write)]);
    let released = AtomicBool::new(false);

    thread::scope(|scope| {
        let held = world.get::<Position>(e).unwrap();
        assert_eq!(world.guard().outstanding(), 1, "the reference holds a read access");

        let (world, writer, released) = (&world, &mut writer, &released);
        let worker = scope.spawn(move || {
            let mut batch = world.schedule(writer);
            assert_eq!(batch.token().dependencies().len(), 1, "the batch depends on the held read");
            for view in batch.chunks() {
                assert!(released.load(Ordering::SeqCst), "the batch wrote under a live reference");
                view.write::<Position>(position).unwrap()[0].x = 99.0;
            }
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(*held, Position { x: 1.0, y: 2.0 });
        released.store(true, Ordering::SeqCst);
        drop(held);
        worker.join().unwrap();
    });

    assert_eq!(world.get::<Position>(e).unwrap().x, 99.0);
    assert_eq!(world.guard().outstanding(), 0);
}

#[test]
fn synchronizing_world_waits_for_outstanding_access() {
    let mut world = world_with(ViolationPolicy::Synchronize);
    let registry = world.registry().clone();
    let position = registry.id_of::<Position>().unwrap();
    let velocity = registry.id_of::<Velocity>().unwrap();

    let e = world.create_with(&[position, velocity]).unwrap();
    let chunk = chunk_of(&world, e);

    let guard = world.guard().clone();
    let token = guard.request_access(&[read(chunk, velocity)]);
    let released = Arc::new(AtomicBool::new(false));

    let worker = {
        let guard = guard.clone();
        let released = released.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            guard.complete_access(&token);
        })
    };

    world.remove_component::<Velocity>(e).unwrap();
    assert!(released.load(Ordering::SeqCst), "the structural change waited for the reader");
    assert!(!world.has(e, velocity).unwrap());
    worker.join().unwrap();
}

#[test]
fn untouched_chunks_are_not_synchronized() {
    let mut world = world_with(ViolationPolicy::FailFast);
    let registry = world.registry().clone();
    let position = registry.id_of::<Position>().unwrap();
    let velocity = registry.id_of::<Velocity>().unwrap();

    let busy = world.create_with(&[position, velocity]).unwrap();
    let idle = world.create_with(&[position]).unwrap();
    let chunk = chunk_of(&world, busy);

    let token = world.guard().request_access(&[write(chunk, position)]);
    world.destroy(idle).unwrap();
    assert!(world.exists(busy));
    world.guard().complete_access(&token);
}

#[test]
fn default_policy_follows_build_profile() {
    let expected = if cfg!(debug_assertions) { ViolationPolicy::FailFast } else { ViolationPolicy::Synchronize };
    assert_eq!(ViolationPolicy::default(), expected);
}
