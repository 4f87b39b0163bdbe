//! Error kinds of the core.
//!
//! Errors are contained to the smallest unit that can carry on: per file
//! for templates, per source for refreshes, per slave for broadcasts. The
//! HTTP surface maps these variants onto status codes.

use thiserror::Error;

/// One of the failure modes of the core.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid credential.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Unknown source id, including ids filtered out on this node.
    #[error("unknown id {0}")]
    NotFound(String),

    /// Malformed config or disallowed request.
    #[error("{0}")]
    BadRequest(String),

    /// Subprocess or network failure against an external provider.
    #[error("provider error: {0:#}")]
    Provider(anyhow::Error),

    /// Slave-side tarball pull failed after all retries.
    #[error("fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    /// At least one engine failed to load during a reconcile.
    #[error("reconcile finished with {errors} sources failing")]
    Reconcile {
        /// Number of sources that failed to load.
        errors: usize,
    },

    /// Anything else.
    #[error("{0:#}")]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Other(error)
    }
}

/// Result alias of the core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_id() {
        assert_eq!(Error::NotFound("s1".to_string()).to_string(), "unknown id s1");
    }

    #[test]
    fn provider_error_keeps_the_chain() {
        let inner = anyhow::anyhow!("git exited with 128").context("refresh of s1 failed");
        let message = Error::Provider(inner).to_string();
        assert!(message.contains("refresh of s1 failed"));
        assert!(message.contains("git exited with 128"));
    }
}
