//! Source engines, polymorphic over the provider kinds.
//!
//! [`engine::SourceEngine`] owns the behavior every kind shares (target
//! path, refresh/fetch state machine, copy step, template evaluation,
//! stats redaction); the per-kind modules supply the provider-specific
//! refresh.

pub mod engine;
pub mod git;
mod rclone;
mod rsync;
pub mod ssh;

pub use engine::SourceEngine;
pub use git::{GITSTATS_FILE, GitStats, read_gitstats};
pub use rclone::redact_config;
