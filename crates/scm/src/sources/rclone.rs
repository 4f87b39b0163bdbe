//! Rclone source engine: sync a configured remote into the target.
//!
//! The declaration carries the body of an rclone remote definition; it is
//! written to a per-id config file as the `[remote]` section. The first
//! install syncs into a `.tmp` sibling and atomically renames it into
//! position, later refreshes sync in place.

use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::info;

use crate::sources::engine::SourceEngine;

static CONFIG_FILTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"((?:access_key_id|secret_access_key) *= ).*").expect("valid regex")
});

/// Hide the two S3 credentials of an rclone remote config.
pub fn redact_config(config: &str) -> String {
    let replacement = format!("${{1}}{}", scm_config::MASK);
    CONFIG_FILTER_RE
        .replace_all(config, replacement.as_str())
        .to_string()
}

/// Where the remote definition of a source is written.
pub(crate) fn config_path(id: &str) -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("rclone")
        .join(format!("{id}.conf")))
}

/// Write the `[remote]` config file of a source.
pub(crate) async fn install_config(id: &str, config: &str) -> Result<()> {
    let path = config_path(id)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&path, format!("[remote]\n{config}"))
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub(crate) async fn refresh(engine: &SourceEngine) -> Result<()> {
    let declaration = engine
        .declaration()
        .context("rclone refresh without a declaration")?;
    let target = engine.target_path();
    let config = config_path(engine.id())?;

    // Only the first install goes through a temporary sibling; once the
    // target exists, rclone syncs in place.
    let was_here = target.is_dir();
    let sync_target = if was_here {
        target.clone()
    } else {
        target.with_extension("tmp")
    };
    tokio::fs::create_dir_all(&sync_target)
        .await
        .with_context(|| format!("failed to create {}", sync_target.display()))?;

    let mut args: Vec<String> = vec![
        "sync".to_string(),
        "--verbose".to_string(),
        "--config".to_string(),
        config.display().to_string(),
    ];
    for exclude in &declaration.excludes {
        args.push(format!("--exclude={exclude}"));
    }
    args.push(format!(
        "remote:{}",
        declaration.sub_dir.as_deref().unwrap_or_default()
    ));
    args.push(sync_target.display().to_string());

    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    info!("syncing {} with rclone", engine.id());
    scm_process::run_command("rclone", &args)
        .await
        .context("failed to run rclone")?
        .ok()
        .with_context(|| format!("rclone sync of {} failed", engine.id()))?;

    if !was_here {
        tokio::fs::rename(&sync_target, &target)
            .await
            .with_context(|| format!("failed to move {} into place", sync_target.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_config_hides_the_credentials() {
        let config = "type = s3\naccess_key_id = AKIA123\nsecret_access_key = abc/def\nregion = eu-1";
        let redacted = redact_config(config);
        assert!(redacted.contains("access_key_id = •••"));
        assert!(redacted.contains("secret_access_key = •••"));
        assert!(redacted.contains("region = eu-1"));
        assert!(!redacted.contains("AKIA123"));
        assert!(!redacted.contains("abc/def"));
    }

    #[test]
    fn redact_config_keeps_other_lines() {
        let config = "type = http\nurl = http://example.com/";
        assert_eq!(redact_config(config), config);
    }

    #[test]
    fn install_config_prepends_the_remote_section() {
        let td = tempfile::tempdir().expect("tempdir");
        temp_env::with_var("HOME", Some(td.path().as_os_str()), || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            runtime.block_on(async {
                install_config("s1", "type = http\nurl = http://example.com/\n")
                    .await
                    .expect("install");
            });

            let content = std::fs::read_to_string(
                td.path().join(".config/rclone/s1.conf"),
            )
            .expect("read");
            assert!(content.starts_with("[remote]\ntype = http\n"));
        });
    }
}
