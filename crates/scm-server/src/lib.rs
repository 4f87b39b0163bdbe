//! HTTP control surface of shared-config-manager.
//!
//! Every node, master or slave, serves the same router: refresh triggers,
//! status aggregation and the tarball endpoint the slave fetch protocol
//! pulls from. The binary entry point lives in `main.rs`.

pub mod handlers;

pub use handlers::{AppState, router};
