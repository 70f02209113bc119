use std::collections::HashSet;
use std::sync::{Arc, Once};

use archetype_store::{
    AccessMode, Bundle, ComponentID, Query, QueryBuilder, QueryDesc, StoreError, TypeRegistry, World,
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
struct Frozen;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Mass(f64);

/// Never registered.
struct Ghost;

static INIT: Once = Once::new();

fn registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::shared();
    INIT.call_once(|| {
        registry.register::<Position>().unwrap();
        registry.register::<Velocity>().unwrap();
        registry.register::<Frozen>().unwrap();
        registry.register::<Mass>().unwrap();
    });
    registry
}

fn ids(registry: &TypeRegistry) -> (ComponentID, ComponentID, ComponentID, ComponentID) {
    (
        registry.id_of::<Position>().unwrap(),
        registry.id_of::<Velocity>().unwrap(),
        registry.id_of::<Frozen>().unwrap(),
        registry.id_of::<Mass>().unwrap(),
    )
}

#[test]
fn archetypes_are_singletons_per_component_set() {
    let registry = registry();
    let (position, velocity, frozen, _) = ids(&registry);
    let mut world = World::new(registry.clone());

    let a = world.archetype_for(&[position, velocity, frozen]).unwrap();
    let b = world.archetype_for(&[frozen, position, velocity]).unwrap();
    let c = world.archetype_for(&[velocity, frozen, position, velocity]).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c, "duplicate ids collapse to the same set");

    let archetype = world.archetype(a).unwrap();
    let mut sorted = archetype.types().to_vec();
    sorted.sort_unstable();
    assert_eq!(archetype.types(), sorted.as_slice(), "types are kept sorted");
}

#[test]
fn cache_picks_up_new_archetypes_without_duplicates() {
    let registry = registry();
    let (position, velocity, frozen, mass) = ids(&registry);
    let mut world = World::new(registry.clone());

    let mut query = Query::compile(&[position], &[], &[]);
    assert!(query.matching_archetypes(world.archetypes()).is_empty());

    let first = world.archetype_for(&[position]).unwrap();
    assert_eq!(query.matching_archetypes(world.archetypes()), &[first]);

    let sets: [&[ComponentID]; 5] = [
        &[position, velocity],
        &[velocity],
        &[position, frozen],
        &[position, velocity, mass],
        &[mass],
    ];
    let mut expected = vec![first];
    for set in sets {
        let id = world.archetype_for(set).unwrap();
        if set.contains(&position) {
            expected.push(id);
        }
    }
    // Re-resolving an existing set creates nothing new.
    world.archetype_for(&[velocity, position]).unwrap();

    let matched = query.matching_archetypes(world.archetypes()).to_vec();
    assert_eq!(matched, expected);
    assert_eq!(matched.iter().collect::<HashSet<_>>().len(), matched.len());
    assert_eq!(query.cached_version(), world.archetypes().creation_version());

    // A second call with nothing new is a no-op.
    assert_eq!(query.matching_archetypes(world.archetypes()), expected.as_slice());
}

#[test]
fn exclusion_filters_archetypes() {
    let registry = registry();
    let (position, velocity, frozen, _) = ids(&registry);
    let mut world = World::new(registry.clone());

    let moving = world.create_with(&[position, velocity]).unwrap();
    let frozen_entity = world.create_with(&[position, velocity, frozen]).unwrap();

    let mut query = Query::compile(&[position, velocity], &[frozen], &[]);
    let chunks = query.matching_chunks(world.archetypes());
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].archetype, world.location(moving).unwrap().archetype);
    assert_ne!(chunks[0].archetype, world.location(frozen_entity).unwrap().archetype);
    assert_eq!(query.entity_count(world.archetypes()), 1);
}

#[test]
fn intents_imply_inclusion_and_write_wins() {
    let registry = registry();
    let (position, velocity, _, mass) = ids(&registry);

    let query = Query::compile(
        &[mass],
        &[],
        &[(velocity, AccessMode::Read), (position, AccessMode::Write), (velocity, AccessMode::Write)],
    );
    assert!(query.include().has(position));
    assert!(query.include().has(velocity));
    assert!(query.include().has(mass));

    let mode = |c: ComponentID| query.intents().iter().find(|&&(id, _)| id == c).map(|&(_, m)| m);
    assert_eq!(mode(position), Some(AccessMode::Write));
    assert_eq!(mode(velocity), Some(AccessMode::Write));
    assert_eq!(mode(mass), Some(AccessMode::Read));

    let sets = query.access_sets();
    assert!(sets.write.has(position) && sets.write.has(velocity));
    assert!(sets.read.has(mass) && !sets.read.has(position));
}

#[test]
fn builder_and_descriptor_compile_the_same_query() {
    let registry = registry();
    let (position, velocity, frozen, _) = ids(&registry);

    let built = QueryBuilder::new()
        .read::<Velocity>()
        .write::<Position>()
        .without::<Frozen>()
        .build(&registry)
        .unwrap();
    let described = Query::from_desc(&QueryDesc {
        include: vec![],
        exclude: vec![frozen],
        intents: vec![(velocity, AccessMode::Read), (position, AccessMode::Write)],
    });

    assert_eq!(built.include(), described.include());
    assert_eq!(built.exclude(), described.exclude());
    assert_eq!(built.intents(), described.intents());
}

#[test]
fn builder_rejects_unregistered_types() {
    let registry = registry();
    let result = QueryBuilder::new().read::<Position>().write::<Ghost>().build(&registry);
    assert!(matches!(result, Err(StoreError::TypeNotRegistered(_))));
}

#[test]
fn chunk_views_expose_typed_columns() {
    let registry = registry();
    let (position, velocity, _, _) = ids(&registry);
    let mut world = World::new(registry.clone());

    for i in 0..10 {
        let bundle = Bundle::new()
            .with(&registry, Position { x: i as f32, y: 0.0 })
            .unwrap()
            .with(&registry, Velocity { dx: 1.0, dy: 0.5 })
            .unwrap();
        world.spawn(bundle).unwrap();
    }

    let mut query = Query::compile(&[], &[], &[(velocity, AccessMode::Read), (position, AccessMode::Write)]);
    {
        let mut batch = world.schedule(&mut query);
        assert_eq!(batch.len(), 1);
        for view in batch.chunks() {
            assert_eq!(view.len(), 10);
            assert!(view.read::<Position>(position).is_none(), "write column is not readable through read()");
            assert!(view.write::<Velocity>(velocity).is_none(), "read column is not writable");
            assert!(view.write::<Mass>(position).is_none(), "wrong type is refused");

            let (velocities, positions) = view.read_write::<Velocity, Position>(velocity, position).unwrap();
            for (p, v) in positions.iter_mut().zip(velocities) {
                p.x += v.dx;
                p.y += v.dy;
            }
            assert_eq!(view.entities().len(), 10);
        }
    }

    for e in world.entities().collect::<Vec<_>>() {
        let p = world.get::<Position>(e).unwrap();
        assert_eq!(p.y, 0.5);
        assert!(p.x >= 1.0);
    }
}

#[test]
fn par_for_each_read_write_visits_every_entity() {
    let registry = registry();
    let (position, velocity, _, _) = ids(&registry);
    let mut world = World::new(registry.clone());

    let entities: Vec<_> = (0..5_000).map(|_| world.create_with(&[position, velocity]).unwrap()).collect();
    for &e in &entities {
        world.get_mut::<Velocity>(e).unwrap().dx = 2.0;
    }

    world
        .par_for_each_read_write::<Velocity, Position, _>(|v, p| {
            p.x += v.dx;
        })
        .unwrap();

    for &e in &entities {
        assert_eq!(world.get::<Position>(e).unwrap().x, 2.0);
    }
    assert_eq!(world.guard().outstanding(), 0, "batch access completed on drop");
}
