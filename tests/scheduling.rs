use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use archetype_store::{
    make_stages, run_schedule, AccessMode, AccessSets, Bundle, Command, CommandBuffer, ComponentValue, FnJob, Job,
    Query, Signature, StoreError, TypeRegistry, World,
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

#[derive(Clone, Copy, Debug, PartialEq)]
struct Energy(f32);

static INIT: Once = Once::new();

fn registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::shared();
    INIT.call_once(|| {
        registry.register::<Position>().unwrap();
        registry.register::<Velocity>().unwrap();
        registry.register::<Energy>().unwrap();
    });
    registry
}

fn access(read: &[u16], write: &[u16]) -> AccessSets {
    AccessSets { read: Signature::from_ids(read), write: Signature::from_ids(write) }
}

fn noop(id: u32, sets: AccessSets) -> Box<dyn Job> {
    Box::new(FnJob::new(id, sets, |_: &World| {}))
}

#[test]
fn stages_separate_conflicting_jobs() {
    let jobs = vec![
        noop(3, access(&[1], &[])),
        noop(0, access(&[0], &[1])),
        noop(1, access(&[0], &[])),
        noop(2, access(&[], &[2])),
    ];
    let stages = make_stages(jobs);

    let ids: Vec<Vec<u32>> = stages.iter().map(|s| s.jobs.iter().map(|j| j.id()).collect()).collect();
    assert_eq!(ids, vec![vec![0, 1, 2], vec![3]]);
}

#[test]
fn readers_share_a_stage() {
    let jobs = (0..8).map(|i| noop(i, access(&[0, 1], &[]))).collect();
    assert_eq!(make_stages(jobs).len(), 1);
}

#[test]
fn command_buffer_applies_in_order() {
    let registry = registry();
    let velocity = registry.id_of::<Velocity>().unwrap();
    let mut world = World::new(registry.clone());
    let existing = world.spawn(Bundle::new().with(&registry, Position { x: 0.0, y: 0.0 }).unwrap()).unwrap();

    let mut buffer = CommandBuffer::new();
    buffer.spawn(Bundle::new().with(&registry, Energy(5.0)).unwrap());
    buffer.add(existing, ComponentValue::new(&registry, Velocity { dx: 1.0, dy: 0.0 }).unwrap());
    buffer.remove(existing, velocity);
    buffer.add(existing, ComponentValue::new(&registry, Energy(2.0)).unwrap());
    assert_eq!(buffer.len(), 4);

    let created = buffer.apply(&mut world).unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(*world.get::<Energy>(created[0]).unwrap(), Energy(5.0));
    assert!(!world.has(existing, velocity).unwrap());
    assert_eq!(*world.get::<Energy>(existing).unwrap(), Energy(2.0));
}

#[test]
fn command_buffer_stops_at_the_first_error() {
    let registry = registry();
    let mut world = World::new(registry.clone());
    let e = world.spawn(Bundle::new().with(&registry, Energy(1.0)).unwrap()).unwrap();

    let mut buffer = CommandBuffer::new();
    buffer.destroy(e);
    buffer.destroy(e);
    buffer.spawn(Bundle::new().with(&registry, Energy(9.0)).unwrap());

    assert!(matches!(buffer.apply(&mut world), Err(StoreError::InvalidHandle(_))));
    assert!(world.is_empty(), "commands after the failure are dropped");
}

#[test]
fn schedule_runs_jobs_and_applies_deferred_commands() {
    let registry = registry();
    let position = registry.id_of::<Position>().unwrap();
    let velocity = registry.id_of::<Velocity>().unwrap();
    let energy = registry.id_of::<Energy>().unwrap();
    let mut world = World::new(registry.clone());

    for i in 0..100 {
        let bundle = Bundle::new()
            .with(&registry, Position { x: 0.0, y: 0.0 })
            .unwrap()
            .with(&registry, Velocity { dx: 1.0, dy: i as f32 })
            .unwrap()
            .with(&registry, Energy(i as f32))
            .unwrap();
        world.spawn(bundle).unwrap();
    }

    let runs = Arc::new(AtomicUsize::new(0));

    let integrate = {
        let runs = runs.clone();
        FnJob::new(0, access(&[velocity], &[position]), move |world: &World| {
            runs.fetch_add(1, Ordering::SeqCst);
            world
                .par_for_each_read_write::<Velocity, Position, _>(|v, p| {
                    p.x += v.dx;
                    p.y += v.dy;
                })
                .unwrap();
        })
    };

    let cull = {
        let runs = runs.clone();
        FnJob::new(1, access(&[energy], &[]), move |world: &World| {
            runs.fetch_add(1, Ordering::SeqCst);
            let mut query = Query::compile(&[], &[], &[(energy, AccessMode::Read)]);
            let mut batch = world.schedule(&mut query);
            for view in batch.chunks() {
                let levels = view.read::<Energy>(energy).unwrap_or(&[]);
                for (entity, level) in view.entities().iter().zip(levels) {
                    if level.0 < 10.0 {
                        world.defer(Command::Destroy { entity: *entity });
                    }
                }
            }
        })
    };

    let stages = make_stages(vec![Box::new(integrate), Box::new(cull)]);
    assert_eq!(stages.len(), 1, "disjoint jobs share a stage");

    run_schedule(&mut world, &stages).unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(world.len(), 90);
    for e in world.entities().collect::<Vec<_>>() {
        let p = *world.get::<Position>(e).unwrap();
        let energy = world.get::<Energy>(e).unwrap().0;
        assert_eq!(p.x, 1.0);
        assert_eq!(p.y, energy);
    }
    assert_eq!(world.guard().outstanding(), 0);
}
