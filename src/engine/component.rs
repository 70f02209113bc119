//! # Type Registry
//!
//! Assigns stable [`ComponentID`] values to component types and records the
//! size, alignment and trait metadata the untyped chunk storage needs.
//!
//! ## Purpose
//! Storage operates on raw byte columns. Everything it needs to know about a
//! type (how many bytes, how aligned, whether a value owns resources that must
//! be released, how to compare shared values) lives in a [`ComponentDesc`]
//! produced here.
//!
//! ## Design
//! - The registry is an explicit context object ([`TypeRegistry`]) shared as
//!   `Arc<TypeRegistry>` by any number of worlds; [`TypeRegistry::shared`]
//!   returns a process-wide default for convenience call sites.
//! - Types are keyed by a [`TypeKey`]: either a Rust `TypeId` (generic
//!   registration) or a caller-chosen stable `u64` (raw registration by size,
//!   alignment and traits).
//! - Registration is idempotent per key; the first call wins.
//! - The registry can be frozen to prevent late registrations.
//!
//! ## Concurrency
//! The registry is append-only and read-mostly. It is protected by a
//! `parking_lot::RwLock`; archetypes copy the descriptors they need at
//! creation so hot paths never touch the lock.

use std::alloc::Layout;
use std::any::{type_name, Any, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::mem::{align_of, needs_drop, size_of};
use std::ptr;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::debug;

use crate::engine::error::{
    CapacityError, CapacityResource, RegistryError, StoreResult, TypeMismatchError,
    TypeNotRegisteredError,
};
use crate::engine::types::{ComponentID, COMPONENT_CAP};

/// Marker for Rust types storable as components.
pub trait Component: 'static + Send + Sync {}

impl<T: 'static + Send + Sync> Component for T {}

/// Releases resources owned by a value in place.
pub type DropFn = unsafe fn(*mut u8);
/// Compares two values of the same component type.
pub type EqFn = unsafe fn(*const u8, *const u8) -> bool;
/// Hashes a value of a component type.
pub type HashFn = unsafe fn(*const u8) -> u64;

/// Behavioural metadata of a component type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComponentTraits {
    /// Explicit destruction for values owning heap or external resources.
    pub drop_fn: Option<DropFn>,
    /// Equality used to deduplicate shared component values.
    pub eq_fn: Option<EqFn>,
    /// Hash used to deduplicate shared component values.
    pub hash_fn: Option<HashFn>,
}

impl ComponentTraits {
    /// Plain data: no destruction, no shared-value functions.
    pub const PLAIN: ComponentTraits = ComponentTraits { drop_fn: None, eq_fn: None, hash_fn: None };

    /// Returns `true` if values require explicit destruction.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.drop_fn.is_some()
    }
}

/// Identity under which a type is registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKey {
    /// A Rust type registered through the generic API.
    Rust(TypeId),
    /// An externally described type registered by layout.
    Stable(u64),
}

/// Describes a registered component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentDesc {
    /// Runtime identifier assigned by the registry.
    pub component_id: ComponentID,
    /// Human-readable name for diagnostics.
    pub name: &'static str,
    /// Registration identity.
    pub key: TypeKey,
    /// Byte size of one value.
    pub size: usize,
    /// Alignment of one value.
    pub align: usize,
    /// Destruction and shared-value behaviour.
    pub traits: ComponentTraits,
}

impl ComponentDesc {
    /// Returns `true` if this descriptor was registered for Rust type `T`.
    #[inline]
    pub fn matches_type<T: 'static>(&self) -> bool {
        self.key == TypeKey::Rust(TypeId::of::<T>())
    }

    /// Fails with [`TypeMismatchError`] unless this descriptor describes `T`.
    pub fn expect_type<T: 'static>(&self) -> Result<(), TypeMismatchError> {
        if self.matches_type::<T>() {
            Ok(())
        } else {
            Err(TypeMismatchError { expected: self.name, actual: type_name::<T>() })
        }
    }

    /// Returns `true` if values require explicit destruction.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.traits.is_managed()
    }

    /// Runs the registered destruction on the value at `value`.
    ///
    /// # Safety
    /// `value` must point to an initialized, suitably aligned value of this
    /// component type that is not used afterwards.
    #[inline]
    pub unsafe fn drop_value(&self, value: *mut u8) {
        if let Some(drop_fn) = self.traits.drop_fn {
            // SAFETY: forwarded caller contract.
            unsafe { drop_fn(value) }
        }
    }

    /// Compares two values with the registered equality, if any.
    ///
    /// # Safety
    /// Both pointers must reference initialized values of this type.
    pub unsafe fn values_equal(&self, a: *const u8, b: *const u8) -> Option<bool> {
        // SAFETY: forwarded caller contract.
        self.traits.eq_fn.map(|eq| unsafe { eq(a, b) })
    }

    /// Hashes a value with the registered hash, if any.
    ///
    /// # Safety
    /// `value` must reference an initialized value of this type.
    pub unsafe fn hash_value(&self, value: *const u8) -> Option<u64> {
        // SAFETY: forwarded caller contract.
        self.traits.hash_fn.map(|hash| unsafe { hash(value) })
    }
}

impl std::fmt::Display for ComponentDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ComponentDesc {{ id: {}, name: {}, size: {}, align: {} }}",
            self.component_id, self.name, self.size, self.align
        )
    }
}

unsafe fn drop_erased<T>(value: *mut u8) {
    // SAFETY: installed only for columns of `T`; caller upholds `drop_value`.
    unsafe { ptr::drop_in_place(value.cast::<T>()) }
}

unsafe fn eq_erased<T: Eq>(a: *const u8, b: *const u8) -> bool {
    // SAFETY: installed only for columns of `T`.
    unsafe { *a.cast::<T>() == *b.cast::<T>() }
}

unsafe fn hash_erased<T: Hash>(value: *const u8) -> u64 {
    let mut hasher = DefaultHasher::new();
    // SAFETY: installed only for columns of `T`.
    unsafe { (*value.cast::<T>()).hash(&mut hasher) };
    hasher.finish()
}

struct RegistryInner {
    by_key: HashMap<TypeKey, ComponentID>,
    by_id: Vec<ComponentDesc>,
    frozen: bool,
}

/// Process-wide mapping between component types and compact ids.
///
/// ## Invariants
/// - Every entry in `by_key` has a matching `by_id[id]`.
/// - Ids are dense, assigned sequentially, and below `COMPONENT_CAP`.
/// - Descriptors never change after registration.

pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED_REGISTRY: OnceLock<Arc<TypeRegistry>> = OnceLock::new();

impl TypeRegistry {
    /// Creates an empty, unfrozen registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_key: HashMap::new(),
                by_id: Vec::new(),
                frozen: false,
            }),
        }
    }

    /// Returns the lazily created process-wide registry.
    pub fn shared() -> Arc<TypeRegistry> {
        SHARED_REGISTRY.get_or_init(|| Arc::new(TypeRegistry::new())).clone()
    }

    /// Registers a type by layout and returns its id.
    ///
    /// ## Behavior
    /// - If `key` is already registered, returns the existing id; the
    ///   metadata of the first registration is kept.
    /// - Otherwise validates the layout and assigns the next id.
    ///
    /// ## Errors
    /// - [`RegistryError::Frozen`] after [`freeze`](Self::freeze).
    /// - [`RegistryError::InvalidLayout`] if `align` is not a power of two or
    ///   `size` overflows when padded to `align`.
    /// - `CapacityExceeded` once `COMPONENT_CAP` types exist.

    pub fn register_raw(
        &self,
        key: TypeKey,
        name: &'static str,
        size: usize,
        align: usize,
        traits: ComponentTraits,
    ) -> StoreResult<ComponentID> {
        if let Some(&existing) = self.inner.read().by_key.get(&key) {
            return Ok(existing);
        }

        let mut inner = self.inner.write();
        if let Some(&existing) = inner.by_key.get(&key) {
            return Ok(existing);
        }

        if inner.frozen {
            return Err(RegistryError::Frozen { name }.into());
        }

        if Layout::from_size_align(size, align).is_err() || size % align != 0 {
            return Err(RegistryError::InvalidLayout { name, size, align }.into());
        }

        if inner.by_id.len() >= COMPONENT_CAP {
            return Err(CapacityError {
                resource: CapacityResource::Components,
                requested: inner.by_id.len() as u64 + 1,
                limit: COMPONENT_CAP as u64,
            }
            .into());
        }

        let component_id = inner.by_id.len() as ComponentID;
        inner.by_id.push(ComponentDesc { component_id, name, key, size, align, traits });
        inner.by_key.insert(key, component_id);
        debug!(component_id, name, size, align, managed = traits.is_managed(), "registered component type");
        Ok(component_id)
    }

    /// Registers Rust type `T` and returns its id.
    pub fn register<T: Component>(&self) -> StoreResult<ComponentID> {
        let traits = ComponentTraits {
            drop_fn: needs_drop::<T>().then_some(drop_erased::<T> as DropFn),
            ..ComponentTraits::PLAIN
        };
        self.register_raw(TypeKey::Rust(TypeId::of::<T>()), type_name::<T>(), size_of::<T>(), align_of::<T>(), traits)
    }

    /// Registers `T` with equality and hashing for shared-value deduplication.
    pub fn register_shared<T: Component + Eq + Hash>(&self) -> StoreResult<ComponentID> {
        let traits = ComponentTraits {
            drop_fn: needs_drop::<T>().then_some(drop_erased::<T> as DropFn),
            eq_fn: Some(eq_erased::<T>),
            hash_fn: Some(hash_erased::<T>),
        };
        self.register_raw(TypeKey::Rust(TypeId::of::<T>()), type_name::<T>(), size_of::<T>(), align_of::<T>(), traits)
    }

    /// Returns the descriptor of `component_id`.
    pub fn metadata(&self, component_id: ComponentID) -> StoreResult<ComponentDesc> {
        self.inner
            .read()
            .by_id
            .get(component_id as usize)
            .copied()
            .ok_or_else(|| TypeNotRegisteredError::Id(component_id).into())
    }

    /// Returns the id registered for Rust type `T`.
    pub fn id_of<T: 'static>(&self) -> StoreResult<ComponentID> {
        self.id_of_key(TypeKey::Rust(TypeId::of::<T>()))
            .ok_or_else(|| TypeNotRegisteredError::Type(type_name::<T>()).into())
    }

    /// Returns the id registered under `key`, if any.
    pub fn id_of_key(&self, key: TypeKey) -> Option<ComponentID> {
        self.inner.read().by_key.get(&key).copied()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Returns `true` if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prevents any further registration.
    pub fn freeze(&self) {
        self.inner.write().frozen = true;
    }

    /// Returns `true` once [`freeze`](Self::freeze) was called.
    pub fn is_frozen(&self) -> bool {
        self.inner.read().frozen
    }
}

enum Payload {
    Typed {
        value: Box<dyn Any + Send>,
        write: unsafe fn(Box<dyn Any + Send>, *mut u8),
    },
    Bytes(Vec<u8>),
}

unsafe fn write_erased<T: 'static>(value: Box<dyn Any + Send>, destination: *mut u8) {
    if let Ok(value) = value.downcast::<T>() {
        // SAFETY: caller guarantees `destination` is an aligned slot of `T`.
        unsafe { ptr::write(destination.cast::<T>(), *value) }
    }
}

/// A type-erased owned component value tagged with its component id.
///
/// Used by bundles, deferred commands, and typed structural changes to move a
/// value into chunk storage without knowing its type at the call site.

pub struct ComponentValue {
    component_id: ComponentID,
    key: TypeKey,
    name: &'static str,
    size: usize,
    payload: Payload,
}

impl ComponentValue {
    /// Wraps a typed value; `T` must be registered in `registry`.
    pub fn new<T: Component>(registry: &TypeRegistry, value: T) -> StoreResult<Self> {
        let component_id = registry.id_of::<T>()?;
        Ok(Self {
            component_id,
            key: TypeKey::Rust(TypeId::of::<T>()),
            name: type_name::<T>(),
            size: size_of::<T>(),
            payload: Payload::Typed { value: Box::new(value), write: write_erased::<T> },
        })
    }

    /// Wraps raw bytes for a plain-data component.
    ///
    /// ## Errors
    /// - `TypeNotRegistered` if `component_id` is unknown.
    /// - `TypeMismatch` if `bytes.len()` differs from the registered size.
    /// - `ValueRequired` if the type owns resources.
    pub fn from_bytes(registry: &TypeRegistry, component_id: ComponentID, bytes: &[u8]) -> StoreResult<Self> {
        let desc = registry.metadata(component_id)?;
        if desc.is_managed() {
            return Err(crate::engine::error::StoreError::ValueRequired { component: component_id, name: desc.name });
        }
        if bytes.len() != desc.size {
            return Err(TypeMismatchError { expected: desc.name, actual: "byte slice of a different length" }.into());
        }
        Ok(Self {
            component_id,
            key: desc.key,
            name: desc.name,
            size: desc.size,
            payload: Payload::Bytes(bytes.to_vec()),
        })
    }

    /// Component this value belongs to.
    #[inline]
    pub fn component_id(&self) -> ComponentID {
        self.component_id
    }

    /// Registration identity of the wrapped value.
    #[inline]
    pub fn key(&self) -> TypeKey {
        self.key
    }

    /// Confirms the value fits `registry`'s column for its component id.
    ///
    /// A value built against another registry may carry an id that names a
    /// different type there.
    ///
    /// ## Errors
    /// - `TypeNotRegistered` if the id is unknown to `registry`.
    /// - `TypeMismatch` if the registered key or size differs.
    pub fn check(&self, registry: &TypeRegistry) -> StoreResult<ComponentDesc> {
        let desc = registry.metadata(self.component_id)?;
        if desc.key != self.key || desc.size != self.size {
            return Err(TypeMismatchError { expected: desc.name, actual: self.name }.into());
        }
        Ok(desc)
    }

    /// Moves the value into `destination`.
    ///
    /// # Safety
    /// `destination` must be a suitably aligned, writable slot for this
    /// component that currently holds no live value.
    pub(crate) unsafe fn write_into(self, destination: *mut u8) {
        match self.payload {
            // SAFETY: forwarded caller contract.
            Payload::Typed { value, write } => unsafe { write(value, destination) },
            // SAFETY: length checked in `from_bytes`; slot is writable.
            Payload::Bytes(bytes) => unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), destination, bytes.len())
            },
        }
    }
}

/// A set of component values used to spawn an entity in one step.
#[derive(Default)]
pub struct Bundle {
    values: Vec<ComponentValue>,
}

impl Bundle {
    /// Creates an empty bundle.
    #[inline]
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Adds a value, replacing any earlier value of the same component.
    pub fn insert(&mut self, value: ComponentValue) -> &mut Self {
        self.values.retain(|v| v.component_id != value.component_id);
        self.values.push(value);
        self
    }

    /// Adds a typed value registered in `registry`.
    pub fn with<T: Component>(mut self, registry: &TypeRegistry, value: T) -> StoreResult<Self> {
        self.insert(ComponentValue::new(registry, value)?);
        Ok(self)
    }

    /// Component ids present in the bundle.
    pub fn component_ids(&self) -> Vec<ComponentID> {
        self.values.iter().map(|v| v.component_id).collect()
    }

    /// Returns `true` if the bundle holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn into_values(self) -> Vec<ComponentValue> {
        self.values
    }
}
