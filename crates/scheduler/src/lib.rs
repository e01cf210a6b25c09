//! Pod scheduler driven by resource offers.
//!
//! Pods waiting in the orchestration store are matched against offers from a
//! resource manager and launched as tasks on the offering agents.

pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod testing;

pub use domain::scheduler::{DriverEvent, PodUpdate, ScheduleOutcome, SchedulerCore, SchedulerHandle};
