#![allow(dead_code)]

use std::sync::{Arc, Once};

use archetype_store::{Bundle, StoreResult, TypeRegistry, World};

pub const AGENTS_SMALL: usize = 10_000;
pub const AGENTS_MED: usize = 100_000;

#[derive(Clone, Copy)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

#[derive(Clone, Copy)]
pub struct Velocity {
    pub dx: f32,
    pub dy: f32,
}

#[derive(Clone, Copy)]
pub struct Wealth {
    pub value: f32,
}

static INIT: Once = Once::new();

pub fn registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::shared();
    INIT.call_once(|| {
        for result in [
            registry.register::<Position>(),
            registry.register::<Velocity>(),
            registry.register::<Wealth>(),
        ] {
            result.expect("component registration failed in benchmark");
        }
        registry.freeze();
    });
    registry
}

pub fn setup_world(agent_count: usize) -> StoreResult<World> {
    let registry = registry();
    let mut world = World::new(registry.clone());

    for i in 0..agent_count {
        let bundle = Bundle::new()
            .with(&registry, Position { x: 0.0, y: 0.0 })?
            .with(&registry, Velocity { dx: 1.0, dy: 0.5 })?;
        let bundle = if i % 2 == 0 { bundle.with(&registry, Wealth { value: 100.0 })? } else { bundle };
        world.spawn(bundle)?;
    }
    Ok(world)
}
