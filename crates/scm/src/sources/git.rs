//! Git source engine: shared depth-1 clones, sparse checkouts, `.gitstats`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use scm_config::SourceDeclaration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::sources::engine::SourceEngine;

/// Name of the per-source stats file published into the target.
pub const GITSTATS_FILE: &str = ".gitstats";

/// Content of `.gitstats`: what the checkout points at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitStats {
    /// `git rev-parse HEAD` of the published checkout.
    pub hash: String,
    /// Tags pointing at HEAD.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Read the stats file of a published source, if any.
pub async fn read_gitstats(target: &Path) -> Option<GitStats> {
    let raw = tokio::fs::read_to_string(target.join(GITSTATS_FILE)).await.ok()?;
    serde_json::from_str(&raw).ok()
}

pub(crate) async fn refresh(engine: &SourceEngine) -> Result<()> {
    let declaration = engine
        .declaration()
        .context("git refresh on an engine without a declaration")?;

    if let Err(error) = checkout(engine, declaration).await {
        // A broken clone (shallow gaps, lock leftovers) is not worth
        // diagnosing: throw it away and clone once more.
        let dir = clone_path(engine, declaration);
        if dir.is_dir() {
            warn!(
                "checkout of {} failed ({error:#}), recloning from scratch",
                engine.id()
            );
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("failed to remove {}", dir.display()))?;
            checkout(engine, declaration).await?;
        } else {
            return Err(error);
        }
    }

    let copy_dir = match &declaration.sub_dir {
        Some(sub_dir) => clone_path(engine, declaration).join(sub_dir),
        None => clone_path(engine, declaration),
    };
    engine
        .copy(&copy_dir.display().to_string(), &[".git"])
        .await?;

    write_gitstats(engine, declaration).await
}

async fn checkout(engine: &SourceEngine, declaration: &SourceDeclaration) -> Result<()> {
    let dir = clone_path(engine, declaration);
    let repo = declaration.repo.as_deref().context("missing repo")?;
    let branch = declaration.branch();

    if dir.join(".git").is_dir() {
        info!("fetching a new version of {repo}");
        scm_process::run_command_in_dir("git", &["fetch", "--depth", "1", "origin", branch], &dir)
            .await?
            .ok()?;
        scm_process::run_command_in_dir("git", &["checkout", branch], &dir)
            .await?
            .ok()?;
        scm_process::run_command_in_dir(
            "git",
            &["reset", "--hard", &format!("origin/{branch}")],
            &dir,
        )
        .await?
        .ok()?;
    } else if declaration.sparse() {
        let sub_dir = declaration.sub_dir.as_deref().context("missing sub_dir")?;
        info!("cloning {repo} (sparse)");
        tokio::fs::create_dir_all(clone_root())
            .await
            .context("failed to create the clone root")?;
        scm_process::run_command(
            "git",
            &[
                "clone",
                "--branch",
                branch,
                "--depth",
                "1",
                "--filter=blob:none",
                "--sparse",
                repo,
                &dir.display().to_string(),
            ],
        )
        .await?
        .ok()?;
        scm_process::run_command_in_dir("git", &["sparse-checkout", "set", sub_dir], &dir)
            .await?
            .ok()?;
    } else {
        info!("cloning {repo}");
        tokio::fs::create_dir_all(clone_root())
            .await
            .context("failed to create the clone root")?;
        scm_process::run_command(
            "git",
            &[
                "clone",
                "--branch",
                branch,
                "--depth",
                "1",
                repo,
                &dir.display().to_string(),
            ],
        )
        .await?
        .ok()?;
    }
    Ok(())
}

async fn write_gitstats(engine: &SourceEngine, declaration: &SourceDeclaration) -> Result<()> {
    let dir = clone_path(engine, declaration);

    let hash = scm_process::run_command_in_dir("git", &["rev-parse", "HEAD"], &dir)
        .await?
        .ok()?
        .stdout
        .trim()
        .to_string();
    let tags = scm_process::run_command_in_dir("git", &["tag", "--points-at", "HEAD"], &dir)
        .await?
        .ok()?
        .stdout
        .lines()
        .map(str::to_string)
        .filter(|tag| !tag.is_empty())
        .collect();

    let stats = GitStats { hash, tags };
    let path = engine.target_path().join(GITSTATS_FILE);
    tokio::fs::write(&path, serde_json::to_vec(&stats)?)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Root under which all clones live.
fn clone_root() -> PathBuf {
    std::env::temp_dir().join("scm-git")
}

/// Where the clone of an engine lives.
///
/// Plain clones are shared between sources tracking the same repo, keyed
/// by the URL-safe base64 of the repo URL; a sparse checkout is scoped to
/// its source id since its content depends on `sub_dir`.
pub(crate) fn clone_path(engine: &SourceEngine, declaration: &SourceDeclaration) -> PathBuf {
    if declaration.sparse() {
        clone_root().join(format!("sparse-{}", engine.id()))
    } else {
        let repo = declaration.repo.as_deref().unwrap_or_default();
        clone_root().join(URL_SAFE_NO_PAD.encode(repo))
    }
}

/// Remove the clone directory of an engine (master only).
pub(crate) async fn delete_clone(engine: &SourceEngine) {
    let Some(declaration) = engine.declaration() else {
        return;
    };
    let dir = clone_path(engine, declaration);
    if dir.is_dir()
        && let Err(error) = tokio::fs::remove_dir_all(&dir).await
    {
        warn!("failed to remove the clone {}: {error}", dir.display());
    }
}
