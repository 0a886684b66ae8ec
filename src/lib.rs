#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod build;
mod config;
mod core;
pub mod engine;
mod error;
pub mod project;
pub mod setup;
pub mod tags;
mod utils;

pub use crate::build::{Pipeline, build};
pub use crate::config::{BuildConfig, Language, SchedulerConfig};
pub use crate::core::{DataType, Dynamic, Flags, Tier};
pub use crate::engine::{
    Blueprint, Dispatcher, FnTask, Job, Journal, Pin, PinKind, PinSpec, Prototype, PrototypeId,
    RayonDispatcher, Readiness, Registry, RunReport, Scheduler, Severity, Snapshot, Task,
    TaskContext, TaskExecution, TaskId, TaskState, TaskSummary, from_fn,
};
pub use crate::error::*;
pub use crate::project::{Project, ProjectFence, ProjectLookup, Solution, SolutionWriter};
pub use crate::setup::{Setup, SourceDir};
