//! # shared-config-manager core
//!
//! The distributed synchronization engine behind the HTTP surface: a
//! master node reads an authoritative declaration of configuration
//! sources, materializes them into on-disk trees and broadcasts refresh
//! events; slave nodes pull the published content as tarballs and serve
//! the same control surface.
//!
//! ## Modules
//!
//! - [`registry`] — the reconciler and the live engine registry
//! - [`sources`] — the per-kind source engines (git, rsync, rclone)
//! - [`fetch`] — the slave pull-by-tarball protocol
//! - [`tarball`] — tarball creation for the serving side
//! - [`status`] — status exchange over the broadcast bus
//! - [`watch`] — drift detector and config-file watcher
//! - [`error`] — the error kinds and their containment policy

pub mod error;
mod fetch;
pub mod registry;
pub mod sources;
pub mod status;
pub mod tarball;
pub mod watch;

pub use error::{Error, Result};
pub use registry::Registry;
pub use sources::SourceEngine;
