use std::collections::HashSet;
use std::sync::Arc;

use archetype_store::engine::error::RegistryError;
use archetype_store::{
    Bundle, ComponentTraits, ComponentValue, StoreError, TypeKey, TypeNotRegisteredError, TypeRegistry, World,
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

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Team(String);

#[test]
fn registration_is_idempotent() {
    let registry = TypeRegistry::new();
    let first = registry.register::<Position>().unwrap();
    let second = registry.register::<Position>().unwrap();
    assert_eq!(first, second);
    assert_eq!(registry.len(), 1);

    let other = registry.register::<Velocity>().unwrap();
    assert_ne!(first, other);
    assert_eq!(registry.id_of::<Velocity>().unwrap(), other);
}

#[test]
fn metadata_describes_the_type() {
    let registry = TypeRegistry::new();
    let position = registry.register::<Position>().unwrap();
    let team = registry.register_shared::<Team>().unwrap();

    let desc = registry.metadata(position).unwrap();
    assert_eq!(desc.size, 8);
    assert_eq!(desc.align, 4);
    assert!(!desc.is_managed());
    assert!(desc.matches_type::<Position>());
    assert!(desc.expect_type::<Velocity>().is_err());

    let desc = registry.metadata(team).unwrap();
    assert!(desc.is_managed(), "String owns heap memory");
    assert!(desc.traits.eq_fn.is_some());
    assert!(desc.traits.hash_fn.is_some());

    let (a, b, c) = (Team("red".into()), Team("red".into()), Team("blue".into()));
    // SAFETY: all three point at live `Team` values.
    unsafe {
        let ptr = |t: &Team| t as *const Team as *const u8;
        assert_eq!(desc.values_equal(ptr(&a), ptr(&b)), Some(true));
        assert_eq!(desc.values_equal(ptr(&a), ptr(&c)), Some(false));
        assert_eq!(desc.hash_value(ptr(&a)), desc.hash_value(ptr(&b)));
    }
}

#[test]
fn unknown_types_are_reported() {
    let registry = TypeRegistry::new();
    assert!(matches!(registry.id_of::<Position>(), Err(StoreError::TypeNotRegistered(TypeNotRegisteredError::Type(_)))));
    assert!(matches!(registry.metadata(7), Err(StoreError::TypeNotRegistered(TypeNotRegisteredError::Id(7)))));

    let mut world = World::new(Arc::new(registry));
    assert!(matches!(world.create_with(&[3]), Err(StoreError::TypeNotRegistered(_))));
}

#[test]
fn frozen_registry_rejects_new_types_only() {
    let registry = TypeRegistry::new();
    let position = registry.register::<Position>().unwrap();
    registry.freeze();
    assert!(registry.is_frozen());

    assert_eq!(registry.register::<Position>().unwrap(), position, "known types still resolve");
    assert!(matches!(
        registry.register::<Velocity>(),
        Err(StoreError::Registry(RegistryError::Frozen { .. }))
    ));
}

#[test]
fn raw_registration_validates_layout() {
    let registry = TypeRegistry::new();

    let bad_align = registry.register_raw(TypeKey::Stable(1), "bad_align", 8, 3, ComponentTraits::PLAIN);
    assert!(matches!(bad_align, Err(StoreError::Registry(RegistryError::InvalidLayout { .. }))));

    let bad_size = registry.register_raw(TypeKey::Stable(2), "bad_size", 6, 4, ComponentTraits::PLAIN);
    assert!(matches!(bad_size, Err(StoreError::Registry(RegistryError::InvalidLayout { .. }))));

    let ok = registry.register_raw(TypeKey::Stable(3), "vec3", 12, 4, ComponentTraits::PLAIN).unwrap();
    assert_eq!(registry.id_of_key(TypeKey::Stable(3)), Some(ok));
    assert_eq!(registry.metadata(ok).unwrap().name, "vec3");
}

#[test]
fn raw_components_accept_byte_values() {
    let registry = Arc::new(TypeRegistry::new());
    let vec3 = registry.register_raw(TypeKey::Stable(0xfeed), "vec3", 12, 4, ComponentTraits::PLAIN).unwrap();
    let mut world = World::new(registry.clone());

    let bytes: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|f| f.to_le_bytes()).collect();
    let mut bundle = Bundle::new();
    bundle.insert(ComponentValue::from_bytes(&registry, vec3, &bytes).unwrap());
    let e = world.spawn(bundle).unwrap();
    assert!(world.has(e, vec3).unwrap());

    assert!(matches!(
        ComponentValue::from_bytes(&registry, vec3, &bytes[..8]),
        Err(StoreError::TypeMismatch(_))
    ));
}

#[test]
fn ids_are_dense_and_distinct() {
    let registry = TypeRegistry::new();
    let ids: Vec<_> = (0..32u64)
        .map(|k| registry.register_raw(TypeKey::Stable(k), "raw", 4, 4, ComponentTraits::PLAIN).unwrap())
        .collect();
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 32);
    assert_eq!(*ids.iter().max().unwrap() as usize, 31);
}

#[test]
fn shared_registry_serves_many_worlds() {
    let registry = Arc::new(TypeRegistry::new());
    let position = registry.register::<Position>().unwrap();

    let mut a = World::new(registry.clone());
    let mut b = World::new(registry.clone());
    let ea = a.create_with(&[position]).unwrap();
    let eb = b.create_with(&[position]).unwrap();
    assert_eq!(ea, eb, "handles are per world");
    assert!(Arc::ptr_eq(a.registry(), b.registry()));
}
