//! Slave fetch protocol: pull a source tarball from the master.
//!
//! The target directory is deleted and recreated before the extraction, so
//! an interrupted fetch leaves either nothing or the complete new content,
//! never a partial overlay on the previous one. `tar` consumes the HTTP
//! body as it streams in and back-pressures on the network side.

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use scm_retry::calculate_delay;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::sources::SourceEngine;

/// Pull the tarball of an engine, with retry and constant backoff.
pub(crate) async fn fetch_tarball(engine: &SourceEngine) -> Result<()> {
    let settings = engine.settings();
    let url = settings.tarball_url(engine.id())?;
    let retry = settings.retry_config();

    let mut attempt = 1;
    loop {
        match try_fetch(engine, &url).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt < retry.max_attempts => {
                warn!(
                    "fetch of {} failed (attempt {attempt}/{}): {error:#}",
                    engine.id(),
                    retry.max_attempts
                );
                tokio::time::sleep(calculate_delay(&retry, attempt)).await;
                attempt += 1;
            }
            Err(error) => {
                return Err(error.context(format!(
                    "fetch of {} failed after {} attempts",
                    engine.id(),
                    retry.max_attempts
                )));
            }
        }
    }
}

async fn try_fetch(engine: &SourceEngine, url: &str) -> Result<()> {
    info!("fetching {} from {url}", engine.id());

    let client = reqwest::Client::builder()
        .build()
        .context("failed to create the HTTP client")?;
    let mut request = client.get(url);
    if let Some(secret) = &engine.settings().secret {
        request = request.header(scm_auth::SCM_SECRET_HEADER, secret);
    }
    let response = request
        .send()
        .await
        .context("tarball request failed")?
        .error_for_status()
        .context("tarball request rejected")?;

    let target = engine.target_path();
    if target.is_dir() {
        tokio::fs::remove_dir_all(&target)
            .await
            .with_context(|| format!("failed to clear {}", target.display()))?;
    }
    tokio::fs::create_dir_all(&target)
        .await
        .with_context(|| format!("failed to create {}", target.display()))?;

    let mut child = Command::new("tar")
        .args([
            "--extract",
            "--gzip",
            "--no-same-owner",
            "--no-same-permissions",
            "--touch",
            "--no-overwrite-dir",
        ])
        .current_dir(&target)
        .stdin(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .context("failed to spawn tar")?;

    let mut stdin = child.stdin.take().context("no stdin handle for tar")?;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("tarball stream interrupted")?;
        stdin
            .write_all(&chunk)
            .await
            .context("failed to feed tar")?;
    }
    drop(stdin);

    let output = child.wait_with_output().await.context("failed to run tar")?;
    if !output.status.success() {
        bail!(
            "tar exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
