use std::sync::Arc;

use console::style;
use tracing::info;

use crate::config::{BuildConfig, SchedulerConfig};
use crate::engine::{RayonDispatcher, RunReport, Scheduler, TaskId};
use crate::error::BuildError;
use crate::project::{ProjectFence, ProjectLookup, SolutionWriter};
use crate::setup::Setup;

/// The bundled pipeline, wired into a scheduler but not yet run.
///
/// Keep it around after [`Pipeline::run`] to inspect the grown graph through
/// [`Pipeline::scheduler`].
pub struct Pipeline {
    scheduler: Scheduler,
    root: TaskId,
    solution: String,
}

impl Pipeline {
    pub fn new(build: &BuildConfig, config: SchedulerConfig) -> Result<Self, BuildError> {
        let threads = config.threads;
        let scheduler = Scheduler::new(config);

        if let Some(threads) = threads {
            scheduler.bind_all(Arc::new(RayonDispatcher::with_threads(threads)?));
        }

        for language in &build.languages {
            scheduler.register(ProjectLookup::new(language.clone()));
        }
        scheduler.register(ProjectFence::new(build.solution.clone()));
        scheduler.register(SolutionWriter::new(build.out_dir.clone()));

        let root = scheduler.spawn(Setup::new(build.paths.iter().cloned()));

        Ok(Self {
            scheduler,
            root,
            solution: build.solution.clone(),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn run(&self) -> Result<RunReport, BuildError> {
        eprintln!(
            "Running {} for solution {}.",
            style("kiln").red(),
            style(&self.solution).blue()
        );

        let report = self.scheduler.await_completion(&[self.root]);

        if !report.success {
            return Err(BuildError::Failed {
                errors: report.errors,
            });
        }

        info!(elapsed = ?report.elapsed, "build finished");
        Ok(report)
    }
}

/// Discovers the projects under `build.paths` and writes the solution
/// manifest.
pub fn build(build: &BuildConfig, config: SchedulerConfig) -> Result<RunReport, BuildError> {
    Pipeline::new(build, config)?.run()
}
