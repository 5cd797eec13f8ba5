//! `monoops` runs, resources, deploys and backs up a fleet of projects on a single host.
//!
//! # Overview
//!
//! monoops keeps a set of project directories alive and operable from one place. It handles:
//! - Process lifecycle with port allocation and health monitoring
//! - Resource limits, usage history, prediction and auto-scaling
//! - Build, test and deploy pipelines with rollback and blue-green cycles
//! - Full and incremental backups with verification, retention and cron schedules
//! - Named environments whose variables feed every other component
//!
//! # Architecture
//!
//! - **Launcher**: detects the project type, allocates ports, spawns and supervises the process
//! - **Resources**: computes limits, applies them through the first working enforcer, samples usage
//! - **Deployment**: runs stages in an isolated workspace and records every attempt
//! - **Backup**: archives project files with manifests that make incrementals and restores exact
//! - **Environment**: owns variable sets and enforces a single active environment per project
//!
//! Components resolve projects through a [`registry::ProjectRegistry`] and report changes to a
//! [`registry::AuditStore`]; [`management::Monoops`] wires the default implementations together.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use monoops::{config::Settings, management::Monoops};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load_default().await?;
//!     let monoops = Monoops::from_settings(settings, "/srv/projects");
//!
//!     let info = monoops.get_launcher().start("shop", Some("staging"), None).await?;
//!     println!("shop is running as pid {}", info.pid);
//!
//!     let backup = monoops.get_backups().backup_project("shop", true, vec![]).await?;
//!     println!("backup {} is {}", backup.id, backup.status);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`backup`] - Backup archives, restore, verification, retention and scheduling
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Host settings and per-project config files
//! - [`deployment`] - Deployment pipelines, health checks and rollback
//! - [`environment`] - Environment variable sets
//! - [`launcher`] - Process lifecycle and port allocation
//! - [`management`] - Component wiring
//! - [`registry`] - Project lookup and audit persistence
//! - [`resources`] - Resource allocation and monitoring
//! - [`runtime`] - Process supervision and host inspection
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod backup;
pub mod cli;
pub mod config;
pub mod deployment;
pub mod environment;
pub mod launcher;
pub mod management;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod utils;

pub use error::*;
