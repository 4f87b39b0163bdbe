//! Tarball creation for the `/tarball/{id}` endpoint.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

use crate::sources::GITSTATS_FILE;

/// Top-level entries of a source directory, `.gitstats` moved to the end.
///
/// `tar` archives entries in argument order and the extraction on the
/// destination touches them in that order, so `.gitstats` landing last
/// means a slave only advertises the new hash once the content is there.
pub fn ordered_entries(path: &Path) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    let mut dir = std::fs::read_dir(path)
        .with_context(|| format!("failed to list {}", path.display()))?;
    while let Some(entry) = dir.next().transpose()? {
        entries.push(entry.file_name().to_string_lossy().to_string());
    }
    entries.sort();

    if let Some(position) = entries.iter().position(|entry| entry == GITSTATS_FILE) {
        let gitstats = entries.remove(position);
        entries.push(gitstats);
    }
    Ok(entries)
}

/// Spawn `tar --create --gzip` over the entries, stdout piped.
pub fn spawn_tar(path: &Path, entries: &[String]) -> Result<Child> {
    let mut command = Command::new("tar");
    command
        .arg("--create")
        .arg("--gzip")
        .args(entries)
        .current_dir(path)
        .stdout(std::process::Stdio::piped());
    command.spawn().context("failed to spawn tar")
}
