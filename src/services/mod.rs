//! Backup lifecycle: scheduling, per-run orchestration, streaming transfer,
//! metadata records and retention.

pub mod backup_repository;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;
pub mod transfer;
