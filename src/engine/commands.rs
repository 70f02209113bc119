//! # Commands
//!
//! Deferred structural changes.
//!
//! ## Purpose
//! Job code runs against `&World` and cannot change structure. It records
//! [`Command`]s instead, either in its own [`CommandBuffer`] or through
//! [`World::defer`], and the commands are applied at the next synchronization
//! point with `&mut World`.
//!
//! ## Invariants
//! - Commands are applied in recording order.
//! - Application stops at the first failing command; the remaining commands
//!   are dropped and the error is returned.

use tracing::debug;

use crate::engine::component::{Bundle, ComponentValue};
use crate::engine::entity::Entity;
use crate::engine::error::StoreResult;
use crate::engine::types::{ArchetypeID, ComponentID};
use crate::engine::world::World;

/// A deferred structural change.
pub enum Command {
    /// Creates an entity from a bundle of values.
    Spawn {
        /// Values of the new entity.
        bundle: Bundle,
    },

    /// Creates a zero-initialized entity in an archetype.
    Create {
        /// Target archetype.
        archetype: ArchetypeID,
    },

    /// Destroys an entity.
    Destroy {
        /// Entity to remove.
        entity: Entity,
    },

    /// Adds (or overwrites) a component value.
    Add {
        /// Target entity.
        entity: Entity,
        /// Value to store; carries its component id.
        value: ComponentValue,
    },

    /// Removes a component, dropping its value.
    Remove {
        /// Target entity.
        entity: Entity,
        /// Component to remove.
        component: ComponentID,
    },
}

/// An ordered list of deferred commands.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self { commands: Vec::new() }
    }

    /// Appends a command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Records a spawn.
    pub fn spawn(&mut self, bundle: Bundle) {
        self.push(Command::Spawn { bundle });
    }

    /// Records a destruction.
    pub fn destroy(&mut self, entity: Entity) {
        self.push(Command::Destroy { entity });
    }

    /// Records a component addition.
    pub fn add(&mut self, entity: Entity, value: ComponentValue) {
        self.push(Command::Add { entity, value });
    }

    /// Records a component removal.
    pub fn remove(&mut self, entity: Entity, component: ComponentID) {
        self.push(Command::Remove { entity, component });
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Applies every command to `world` in order.
    ///
    /// Returns the entities created by `Spawn` and `Create` commands.
    pub fn apply(self, world: &mut World) -> StoreResult<Vec<Entity>> {
        if !self.commands.is_empty() {
            debug!(commands = self.commands.len(), "applying deferred commands");
        }
        let mut created = Vec::new();
        for command in self.commands {
            match command {
                Command::Spawn { bundle } => created.push(world.spawn(bundle)?),
                Command::Create { archetype } => created.push(world.create(archetype)?),
                Command::Destroy { entity } => world.destroy(entity)?,
                Command::Add { entity, value } => world.add_component_value(entity, value)?,
                Command::Remove { entity, component } => world.remove_component_raw(entity, component)?,
            }
        }
        Ok(created)
    }
}
