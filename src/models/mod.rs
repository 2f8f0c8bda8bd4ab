//! Core data models for the backup service.
//!
//! `Backup` maps onto the `backups` table via `sqlx::FromRow`; `Workload` is a
//! read-only view fetched from the platform on every run and never persisted.

pub mod backup;
pub mod workload;
