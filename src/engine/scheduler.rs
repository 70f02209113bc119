//! Job staging and execution.
//!
//! This module is responsible for:
//! * grouping jobs into stages based on declared access compatibility,
//! * running the jobs of a stage in parallel using Rayon,
//! * applying deferred structural commands between stages.
//!
//! ## Scheduling model
//!
//! Jobs are assigned to **stages** such that:
//! * jobs within the same stage do **not** conflict on component access,
//! * all jobs in a stage may run in parallel,
//! * stages are executed sequentially.
//!
//! Within a stage, jobs still request chunk access through the world's
//! concurrency guard, so a job that under-declares its access is ordered by
//! its tokens rather than racing.

use rayon::prelude::*;

use crate::engine::error::StoreResult;
use crate::engine::types::AccessSets;
use crate::engine::world::World;

/// Stable job identifier used to order staging.
pub type JobID = u32;

/// A unit of parallel work with a declared access set.
pub trait Job: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> JobID;

    /// Components the job reads and writes.
    fn access(&self) -> AccessSets;

    /// Runs the job against the world.
    fn run(&self, world: &World);
}

/// A [`Job`] backed by a closure.
pub struct FnJob<F> {
    id: JobID,
    access: AccessSets,
    body: F,
}

impl<F> FnJob<F>
where
    F: Fn(&World) + Send + Sync,
{
    /// Wraps `body` with its declared access.
    pub fn new(id: JobID, access: AccessSets, body: F) -> Self {
        Self { id, access, body }
    }
}

impl<F> Job for FnJob<F>
where
    F: Fn(&World) + Send + Sync,
{
    fn id(&self) -> JobID {
        self.id
    }

    fn access(&self) -> AccessSets {
        self.access.clone()
    }

    fn run(&self, world: &World) {
        (self.body)(world)
    }
}

/// A group of jobs that can be executed in parallel.
///
/// ## Invariants
/// * All jobs within a `Stage` have **non-conflicting access sets**.
///
/// Stages themselves must be executed sequentially.

pub struct Stage {
    /// Jobs scheduled to run in this stage.
    pub jobs: Vec<Box<dyn Job>>,
}

/// Partitions jobs into parallel execution stages.
///
/// ## Algorithm
/// Jobs are processed in id order and assigned greedily to the first stage
/// where they conflict with no job already placed; otherwise a new stage is
/// opened. Sorting by id keeps stage construction reproducible.

pub fn make_stages(mut jobs: Vec<Box<dyn Job>>) -> Vec<Stage> {
    let mut stages: Vec<Stage> = Vec::new();

    jobs.sort_by_key(|job| job.id());

    'next_job: for job in jobs {
        let access = job.access();
        for stage in stages.iter_mut() {
            let conflict = stage.jobs.iter().any(|other| access.conflicts_with(&other.access()));
            if !conflict {
                stage.jobs.push(job);
                continue 'next_job;
            }
        }
        stages.push(Stage { jobs: vec![job] });
    }
    stages
}

/// Runs stages in order, applying deferred commands before and after each.

pub fn run_schedule(world: &mut World, stages: &[Stage]) -> StoreResult<()> {
    for stage in stages {
        world.apply_deferred()?;

        let shared: &World = world;
        stage.jobs.par_iter().for_each(|job| job.run(shared));

        world.apply_deferred()?;
    }
    Ok(())
}
