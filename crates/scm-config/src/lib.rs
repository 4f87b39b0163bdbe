//! Settings and master-config schema for shared-config-manager.
//!
//! Three families of types live here:
//!
//! - [`Settings`] — the per-node knobs, loaded from `SCM_`-prefixed
//!   environment variables.
//! - [`SourceDeclaration`] and [`MasterConfig`] — the authoritative
//!   description of what every node should materialize. Declarations
//!   compare structurally; the reconciler diffs them by value.
//! - [`SourceStatus`] / [`SlaveStatus`] — the redacted view of a source
//!   that nodes exchange over the broadcast bus.

mod declaration;
mod settings;
mod status;

pub use declaration::{
    MASTER_ID, MasterConfig, MasterDeclaration, MasterDocument, SourceAuth, SourceDeclaration,
    SourceKind, TemplateEngineConfig, TemplateEngineKind, parse_master_document,
};
pub use settings::Settings;
pub use status::{MASK, SlaveStatus, SourceStatus, TemplateEngineStatus, mask_sensitive};
