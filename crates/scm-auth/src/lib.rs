//! Identity extraction for the HTTP control surface.
//!
//! Three credentials are recognized:
//!
//! - the shared internal secret, carried in `X-Scm-Secret`, which grants
//!   full (master-level) access and is how slaves authenticate tarball
//!   pulls;
//! - a GitHub webhook signature in `X-Hub-Signature-256`, verified with
//!   HMAC-SHA256 over the raw request body, which grants the
//!   `github_webhook` identity (enough to refresh any existing source, but
//!   the id must exist);
//! - OAuth browser sessions, handled entirely by an external layer and out
//!   of scope here: an unauthenticated browser request simply comes out as
//!   [`Identity::Anonymous`].

use anyhow::{Result, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the shared internal secret.
pub const SCM_SECRET_HEADER: &str = "X-Scm-Secret";

/// Header carrying the webhook payload signature.
pub const GITHUB_SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Header carrying the kind of a webhook event.
pub const GITHUB_EVENT_HEADER: &str = "X-GitHub-Event";

type HmacSha256 = Hmac<Sha256>;

/// The caller of an endpoint, as far as the core can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Shared internal secret: full access.
    Admin,
    /// Valid `X-Hub-Signature-256`: may refresh existing sources.
    GithubWebhook,
    /// No recognized credential.
    Anonymous,
}

impl Identity {
    /// Whether the caller holds the master-level credential.
    pub fn is_admin(&self) -> bool {
        matches!(self, Identity::Admin)
    }

    /// Whether the caller may act on an existing source.
    ///
    /// The webhook identity bypasses the per-source ACL but not id
    /// existence; anonymous callers are rejected.
    pub fn can_access_source(&self) -> bool {
        matches!(self, Identity::Admin | Identity::GithubWebhook)
    }

    /// Whether the caller may use the all-sources and status endpoints.
    pub fn can_access_master(&self) -> bool {
        matches!(self, Identity::Admin | Identity::GithubWebhook)
    }
}

/// Verify a `X-Hub-Signature-256` value against the raw request body.
///
/// The comparison runs through [`Mac::verify_slice`], which is constant
/// time: a digest differing only in its last byte costs as much to reject
/// as one differing in the first.
pub fn verify_webhook_signature(
    signature: Option<&str>,
    secret: &[u8],
    body: &[u8],
) -> Result<()> {
    let digest = signature
        .and_then(|value| value.strip_prefix("sha256="))
        .and_then(|value| hex::decode(value).ok())
        .ok_or_else(|| anyhow!("no valid signature found"))?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| anyhow!("invalid webhook secret"))?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| anyhow!("signature mismatch"))
}

/// Compute the `sha256=<hex>` signature of a body, for tests and clients.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| anyhow!("invalid webhook secret"))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Extract the caller identity from the request credentials.
///
/// The shared secret wins over the webhook signature; an unset secret on
/// the node side never matches.
pub fn identify(
    scm_secret: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    configured_secret: Option<&str>,
    github_secret: Option<&str>,
) -> Identity {
    if let (Some(provided), Some(expected)) = (scm_secret, configured_secret)
        && !expected.is_empty()
        && provided == expected
    {
        return Identity::Admin;
    }

    if let Some(secret) = github_secret
        && !secret.is_empty()
        && verify_webhook_signature(signature, secret.as_bytes(), body).is_ok()
    {
        return Identity::GithubWebhook;
    }

    Identity::Anonymous
}
