//! # Concurrency Guard
//!
//! Declared-access bookkeeping for chunk column memory.
//!
//! ## Purpose
//!
//! Jobs touch chunk columns through raw pointers with no locking on the hot
//! path. Safety comes from declaring, up front, which `(chunk, component)`
//! pairs a job reads or writes:
//!
//! - Accesses to disjoint pairs are unordered and may run concurrently.
//! - Accesses to the same pair where at least one writes are ordered by
//!   declaration order: the later token depends on the earlier one.
//! - Direct (non-job) callers check out a pair and fail, or wait, while a
//!   conflicting job access is outstanding.
//!
//! ## State
//!
//! Each declared pair has a [`SafetyHandle`] listing the outstanding writer and
//! reader accesses on it. Dependencies of a new access are the outstanding
//! accesses it conflicts with; since they were all issued earlier, the
//! wait-for relation is acyclic by construction.
//!
//! ## Blocking
//!
//! [`AccessGuard::wait_for_dependencies`] and [`AccessGuard::synchronize`] are the
//! only blocking calls. They park on a condition variable signalled by
//! [`AccessGuard::complete_access`]; there is no spinning.
//!
//! ## Violation policy
//!
//! A conflicting direct access is a race in the calling code. Under
//! [`ViolationPolicy::FailFast`] (the default in debug builds) it is logged at
//! `error` level and the calling thread panics. Under
//! [`ViolationPolicy::Report`] it is logged the same way and returned as
//! [`ConcurrentAccessViolation`] for callers that handle races themselves.
//! Under [`ViolationPolicy::Synchronize`] (the default in release builds) it is
//! logged at `warn` level and the caller waits for the conflicting accesses to
//! complete. The unordered access never happens.
//!
//! [`AccessGuard::checkout_for_direct_access`] ignores the policy and always
//! reports the violation as an error.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::engine::error::ConcurrentAccessViolation;
use crate::engine::types::{AccessMode, ChunkID, ComponentID};

/// Identifier of one granted access.
pub type AccessID = u64;

/// What to do when a direct access conflicts with an outstanding job access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Log at `error` level and panic.
    FailFast,
    /// Log at `error` level and return the violation.
    Report,
    /// Log at `warn` level and wait for the conflicting accesses.
    Synchronize,
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ViolationPolicy::FailFast
        } else {
            ViolationPolicy::Synchronize
        }
    }
}

/// One `(chunk, component, mode)` entry of a job's access declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccessDeclaration {
    /// Target chunk.
    pub chunk: ChunkID,
    /// Target column.
    pub component: ComponentID,
    /// Requested mode.
    pub mode: AccessMode,
}

impl AccessDeclaration {
    /// Shorthand constructor.
    #[inline]
    pub fn new(chunk: ChunkID, component: ComponentID, mode: AccessMode) -> Self {
        Self { chunk, component, mode }
    }
}

/// Completion token of a granted access.
///
/// Carries the ids of the earlier accesses that must complete before the
/// holder may touch the declared columns.
#[derive(Debug)]
pub struct AccessToken {
    id: AccessID,
    dependencies: Box<[AccessID]>,
    declarations: Box<[AccessDeclaration]>,
}

impl AccessToken {
    /// Id of this access.
    #[inline]
    pub fn id(&self) -> AccessID {
        self.id
    }

    /// Earlier accesses this one must wait for.
    #[inline]
    pub fn dependencies(&self) -> &[AccessID] {
        &self.dependencies
    }

    /// Normalized declarations: one entry per pair, `Write` winning over `Read`.
    #[inline]
    pub fn declarations(&self) -> &[AccessDeclaration] {
        &self.declarations
    }
}

/// Outstanding accesses on one `(chunk, component)` pair.
#[derive(Debug, Default)]
struct SafetyHandle {
    writers: Vec<AccessID>,
    readers: Vec<AccessID>,
}

impl SafetyHandle {
    fn conflicts(&self, mode: AccessMode) -> Vec<AccessID> {
        match mode {
            AccessMode::Read => self.writers.clone(),
            AccessMode::Write => self.writers.iter().chain(self.readers.iter()).copied().collect(),
        }
    }

    fn held(&self) -> AccessMode {
        if self.writers.is_empty() { AccessMode::Read } else { AccessMode::Write }
    }

    fn is_idle(&self) -> bool {
        self.writers.is_empty() && self.readers.is_empty()
    }
}

#[derive(Default)]
struct GuardState {
    handles: HashMap<(ChunkID, ComponentID), SafetyHandle>,
    outstanding: HashMap<AccessID, Box<[(ChunkID, ComponentID)]>>,
    next_id: AccessID,
}

impl GuardState {
    /// Registers `declarations` as one outstanding access; returns its id and
    /// the outstanding accesses it conflicts with.
    fn grant(&mut self, declarations: &[AccessDeclaration]) -> (AccessID, Vec<AccessID>) {
        let id = self.next_id;
        self.next_id += 1;

        let mut dependencies = Vec::new();
        for declaration in declarations {
            let handle = self.handles.entry((declaration.chunk, declaration.component)).or_default();
            dependencies.extend(handle.conflicts(declaration.mode));
            match declaration.mode {
                AccessMode::Read => handle.readers.push(id),
                AccessMode::Write => handle.writers.push(id),
            }
        }
        dependencies.sort_unstable();
        dependencies.dedup();

        let pairs = declarations.iter().map(|d| (d.chunk, d.component)).collect();
        self.outstanding.insert(id, pairs);
        (id, dependencies)
    }

    fn conflicts(&self, chunk: ChunkID, component: ComponentID, mode: AccessMode) -> Option<(Vec<AccessID>, AccessMode)> {
        let handle = self.handles.get(&(chunk, component))?;
        let conflicts = handle.conflicts(mode);
        (!conflicts.is_empty()).then(|| (conflicts, handle.held()))
    }
}

/// Tracks declared job accesses and arbitrates direct accesses.
///
/// Shared as `Arc<AccessGuard>` between the world and job threads.

pub struct AccessGuard {
    state: Mutex<GuardState>,
    completed: Condvar,
    policy: ViolationPolicy,
}

impl Default for AccessGuard {
    fn default() -> Self {
        Self::new(ViolationPolicy::default())
    }
}

impl AccessGuard {
    /// Creates an idle guard.
    pub fn new(policy: ViolationPolicy) -> Self {
        Self { state: Mutex::new(GuardState::default()), completed: Condvar::new(), policy }
    }

    /// Policy applied by [`acquire_direct`](Self::acquire_direct).
    #[inline]
    pub fn policy(&self) -> ViolationPolicy {
        self.policy
    }

    /// Grants an access and returns its token.
    ///
    /// For every declared pair, the token depends on each outstanding access
    /// with a conflicting mode (Write-Write, Read-Write, Write-Read). This call
    /// never blocks.
    pub fn request_access(&self, declarations: &[AccessDeclaration]) -> AccessToken {
        let mut normalized: Vec<AccessDeclaration> = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            match normalized.iter_mut().find(|d| d.chunk == declaration.chunk && d.component == declaration.component) {
                Some(existing) if declaration.mode == AccessMode::Write => existing.mode = AccessMode::Write,
                Some(_) => {}
                None => normalized.push(*declaration),
            }
        }

        let (id, dependencies) = self.state.lock().grant(&normalized);
        trace!(access = id, pairs = normalized.len(), dependencies = dependencies.len(), "access granted");

        AccessToken {
            id,
            dependencies: dependencies.into_boxed_slice(),
            declarations: normalized.into_boxed_slice(),
        }
    }

    /// Marks an access finished and wakes waiters. Completing twice is a no-op.
    pub fn complete_access(&self, token: &AccessToken) {
        self.complete_id(token.id);
    }

    pub(crate) fn complete_id(&self, id: AccessID) {
        let mut state = self.state.lock();
        let Some(pairs) = state.outstanding.remove(&id) else { return };
        for pair in pairs.iter() {
            if let Some(handle) = state.handles.get_mut(pair) {
                handle.writers.retain(|&a| a != id);
                handle.readers.retain(|&a| a != id);
                if handle.is_idle() {
                    state.handles.remove(pair);
                }
            }
        }
        drop(state);
        trace!(access = id, "access completed");
        self.completed.notify_all();
    }

    /// Returns `true` once the token's access was completed.
    pub fn is_complete(&self, token: &AccessToken) -> bool {
        !self.state.lock().outstanding.contains_key(&token.id)
    }

    /// Number of accesses granted but not completed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Blocks until every dependency of `token` has completed.
    pub fn wait_for_dependencies(&self, token: &AccessToken) {
        let mut state = self.state.lock();
        while token.dependencies.iter().any(|d| state.outstanding.contains_key(d)) {
            self.completed.wait(&mut state);
        }
    }

    /// Fails if an outstanding job access on `(chunk, component)` conflicts
    /// with `mode`.
    pub fn checkout_for_direct_access(
        &self,
        chunk: ChunkID,
        component: ComponentID,
        mode: AccessMode,
    ) -> Result<(), ConcurrentAccessViolation> {
        match self.state.lock().conflicts(chunk, component, mode) {
            Some((_, held)) => Err(ConcurrentAccessViolation { chunk, component, requested: mode, held }),
            None => Ok(()),
        }
    }

    /// Blocks until no outstanding job access on `(chunk, component)`
    /// conflicts with `mode`.
    pub fn synchronize(&self, chunk: ChunkID, component: ComponentID, mode: AccessMode) {
        let mut state = self.state.lock();
        while state.conflicts(chunk, component, mode).is_some() {
            self.completed.wait(&mut state);
        }
    }

    /// Direct checkout under the configured [`ViolationPolicy`].
    ///
    /// # Panics
    /// On a conflict under [`ViolationPolicy::FailFast`].
    pub fn acquire_direct(
        &self,
        chunk: ChunkID,
        component: ComponentID,
        mode: AccessMode,
    ) -> Result<(), ConcurrentAccessViolation> {
        let Err(violation) = self.checkout_for_direct_access(chunk, component, mode) else {
            return Ok(());
        };
        match self.policy {
            ViolationPolicy::FailFast => {
                error!(%violation, "direct access raced an outstanding job access");
                panic!("{violation}");
            }
            ViolationPolicy::Report => {
                error!(%violation, "direct access raced an outstanding job access");
                Err(violation)
            }
            ViolationPolicy::Synchronize => {
                warn!(%violation, "direct access raced an outstanding job access; waiting");
                self.synchronize(chunk, component, mode);
                Ok(())
            }
        }
    }

    /// Checks out `(chunk, component)` for reading and keeps the read
    /// outstanding until the returned id is completed.
    ///
    /// Later write accesses on the pair depend on it, so a job cannot write
    /// the column while a direct reference into it is alive.
    pub(crate) fn hold_direct_read(&self, chunk: ChunkID, component: ComponentID) -> Result<AccessID, ConcurrentAccessViolation> {
        loop {
            self.acquire_direct(chunk, component, AccessMode::Read)?;
            let mut state = self.state.lock();
            // A writer may have been granted between the checkout and the lock.
            if state.conflicts(chunk, component, AccessMode::Read).is_none() {
                let (id, _) = state.grant(&[AccessDeclaration::new(chunk, component, AccessMode::Read)]);
                trace!(access = id, chunk, component, "direct read held");
                return Ok(id);
            }
        }
    }
}

/// Shared reference to a component value obtained through direct access.
///
/// Holds a read access on the value's `(chunk, component)` pair for its whole
/// lifetime: a [`QueryBatch`](crate::engine::query::QueryBatch) writing that
/// column waits until every such reference is dropped.
pub struct ComponentRef<'w, T> {
    guard: &'w AccessGuard,
    access: AccessID,
    value: &'w T,
}

impl<'w, T> ComponentRef<'w, T> {
    pub(crate) fn new(guard: &'w AccessGuard, access: AccessID, value: &'w T) -> Self {
        Self { guard, access, value }
    }
}

impl<T> Deref for ComponentRef<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for ComponentRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T> Drop for ComponentRef<'_, T> {
    fn drop(&mut self) {
        self.guard.complete_id(self.access);
    }
}
