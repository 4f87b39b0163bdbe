//! SSH key management for git and rsync sources.
//!
//! A declaration may embed a private key; the engine installs it under
//! `~/.ssh/<id>.key` and registers it in `~/.ssh/config` so git and rsync
//! pick it up. Keys are removed with their engine and never show up in
//! stats.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

fn ssh_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".ssh"))
}

fn key_path(id: &str) -> Result<PathBuf> {
    Ok(ssh_dir()?.join(format!("{id}.key")))
}

/// Install the private key of a source.
pub(crate) async fn install_key(id: &str, key: &str) -> Result<()> {
    let dir = ssh_dir()?;
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let path = key_path(id)?;
    tokio::fs::write(&path, key)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    set_private_mode(&path).await?;

    let config = dir.join("config");
    let line = format!("IdentityFile {}\n", path.display());
    let current = tokio::fs::read_to_string(&config).await.unwrap_or_default();
    if !current.contains(line.trim_end()) {
        tokio::fs::write(&config, format!("{current}{line}"))
            .await
            .with_context(|| format!("failed to update {}", config.display()))?;
    }
    Ok(())
}

/// Remove the key of a source and its `IdentityFile` line.
pub(crate) async fn remove_key(id: &str) -> Result<()> {
    let path = key_path(id)?;
    if !path.is_file() {
        return Ok(());
    }
    tokio::fs::remove_file(&path)
        .await
        .with_context(|| format!("failed to remove {}", path.display()))?;

    let config = ssh_dir()?.join("config");
    let line = format!("IdentityFile {}", path.display());
    if let Ok(current) = tokio::fs::read_to_string(&config).await {
        let kept: String = current
            .lines()
            .filter(|candidate| candidate.trim_end() != line)
            .map(|candidate| format!("{candidate}\n"))
            .collect();
        tokio::fs::write(&config, kept)
            .await
            .with_context(|| format!("failed to update {}", config.display()))?;
    }
    Ok(())
}

/// Bootstrap `~/.ssh` from a mounted `~/.ssh2`, fixing the modes.
///
/// Deployment mounts read-only key material under `~/.ssh2`; ssh itself
/// refuses group-readable keys, so they are copied with tight modes.
pub async fn prepare() -> Result<()> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    let other = PathBuf::from(&home).join(".ssh2");
    if !other.is_dir() {
        return Ok(());
    }

    info!("preparing ~/.ssh from ~/.ssh2");
    let ssh = PathBuf::from(&home).join(".ssh");
    scm_process::run_command(
        "rsync",
        &[
            "--recursive",
            "--copy-links",
            "--chmod=D0700,F0600",
            &format!("{}/", other.display()),
            &format!("{}/", ssh.display()),
        ],
    )
    .await
    .context("failed to run rsync")?
    .ok()
    .context("failed to prepare ~/.ssh")?;
    Ok(())
}

#[cfg(unix)]
async fn set_private_mode(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .await
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
async fn set_private_mode(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
