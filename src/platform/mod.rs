//! Adapters to the hosting platform: workload discovery and dump jobs.

pub mod directory;
pub mod jobs;
