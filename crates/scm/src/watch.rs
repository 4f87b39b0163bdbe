//! Watchers: drift detection across slaves and the config-file watcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use scm_config::{MasterDocument, SourceStatus, parse_master_document};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{FLAG_READY, FLAG_SOURCE_ERROR, Registry};
use crate::sources::SourceEngine;
use crate::status::{self, SLAVE_FETCH};

/// Whether the slave views of one source call for a corrective refresh.
///
/// Any responding slave without a hash, or any two slaves disagreeing,
/// means the fleet drifted from the master.
pub fn statuses_need_refresh(statuses: &[Option<SourceStatus>]) -> bool {
    let mut seen: Option<&str> = None;
    for status in statuses.iter().flatten() {
        if status.filtered == Some(true) {
            continue;
        }
        let Some(hash) = status.hash.as_deref() else {
            warn!(
                "no hash in slave {:?} status -> refresh",
                status.hostname.as_deref()
            );
            return true;
        };
        match seen {
            None => seen = Some(hash),
            Some(previous) if previous != hash => {
                warn!(
                    "hash in slave {:?} is different from other slaves -> refresh",
                    status.hostname.as_deref()
                );
                return true;
            }
            Some(_) => {}
        }
    }
    false
}

async fn watch_source(
    registry: &Arc<Registry>,
    id: &str,
    engine: &Arc<SourceEngine>,
) -> Result<()> {
    let statuses = status::source_status(
        registry.bus(),
        id,
        registry.settings().broadcast_timeout(),
    )
    .await?;
    if statuses_need_refresh(&statuses) {
        engine
            .refresh()
            .await
            .map_err(|error| anyhow::anyhow!("{error}"))?;
        registry
            .bus()
            .publish(SLAVE_FETCH, serde_json::json!({ "source_id": id }))
            .await?;
    }
    Ok(())
}

/// Drift detector: every `watch_source_interval`, compare the slave views
/// of every active source and trigger corrective refreshes.
///
/// Errors are isolated per source; the loop never stops. The task is
/// aborted on shutdown.
pub fn spawn_drift_detector(registry: Arc<Registry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(registry.settings().watch_interval()).await;
            debug!("watching the sources");
            let mut has_error = false;
            for (id, engine) in registry.active_snapshot().await {
                if engine.is_master() {
                    continue;
                }
                debug!("watching the source {id}");
                if let Err(error) = watch_source(&registry, &id, &engine).await {
                    registry.update_flag(FLAG_SOURCE_ERROR).await;
                    warn!("error while watching the source {id}: {error:#}");
                    has_error = true;
                }
            }
            if !has_error {
                registry.update_flag(FLAG_READY).await;
            }
        }
    })
}

fn is_relevant(kind: &notify::EventKind) -> bool {
    use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind};
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Remove(_)
            | EventKind::Create(_)
    )
}

async fn watch_config(registry: Arc<Registry>, path: PathBuf) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Event>(16);
    let mut watcher = notify::recommended_watcher(
        move |result: std::result::Result<notify::Event, notify::Error>| {
            if let Ok(event) = result {
                let _ = tx.blocking_send(event);
            }
        },
    )
    .context("failed to create the file watcher")?;
    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", path.display()))?;

    while let Some(event) = rx.recv().await {
        debug!("file watcher event: {:?}", event.kind);
        if !is_relevant(&event.kind) {
            continue;
        }

        // Editors write in bursts; settle, then drain what queued up.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while rx.try_recv().is_ok() {}

        // A replaced file is a new inode, the watch has to move onto it.
        let _ = watcher.unwatch(&path);
        if let Err(error) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!("failed to re-watch {}: {error}", path.display());
        }

        info!("reload the master config from the config file");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(error) => {
                warn!("failed to read {}: {error}", path.display());
                continue;
            }
        };
        match parse_master_document(&content) {
            Ok(MasterDocument::Inline(mut config)) => {
                config.standalone = true;
                if let Err(error) = registry.reconcile(&config).await {
                    error!("reconcile after a config change failed: {error}");
                }
            }
            Ok(MasterDocument::Declared(_)) => {
                warn!("the watched config file no longer holds inline sources, ignoring");
            }
            Err(error) => warn!("invalid master config: {error:#}"),
        }
    }
    Ok(())
}

/// Watch the master config file and reconcile on close-after-write or
/// inode replacement. The task is aborted on shutdown.
pub fn spawn_config_watcher(registry: Arc<Registry>, path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = watch_config(registry, path).await {
            error!("config watcher failed: {error:#}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scm_broadcast::{Broadcaster, Handler, Params};
    use scm_config::{MasterConfig, Settings, SourceDeclaration, SourceKind};
    use tokio::sync::mpsc;

    fn status(hostname: &str, hash: Option<&str>, filtered: bool) -> Option<SourceStatus> {
        Some(SourceStatus {
            hostname: Some(hostname.to_string()),
            hash: hash.map(str::to_string),
            filtered: filtered.then_some(true),
            ..SourceStatus::default()
        })
    }

    #[test]
    fn agreement_needs_no_refresh() {
        let statuses = vec![
            status("node1", Some("abc"), false),
            status("node2", Some("abc"), false),
        ];
        assert!(!statuses_need_refresh(&statuses));
    }

    #[test]
    fn missing_hash_needs_refresh() {
        let statuses = vec![
            status("node1", Some("abc"), false),
            status("node2", None, false),
        ];
        assert!(statuses_need_refresh(&statuses));
    }

    #[test]
    fn disagreement_needs_refresh() {
        let statuses = vec![
            status("node1", Some("abc"), false),
            status("node2", Some("def"), false),
        ];
        assert!(statuses_need_refresh(&statuses));
    }

    #[test]
    fn filtered_and_absent_slaves_are_ignored() {
        let statuses = vec![
            status("node1", Some("abc"), false),
            status("node2", None, true),
            None,
        ];
        assert!(!statuses_need_refresh(&statuses));
    }

    #[test]
    fn no_responders_needs_no_refresh() {
        assert!(!statuses_need_refresh(&[]));
        assert!(!statuses_need_refresh(&[None, None]));
    }

    struct DivergentSlave;

    #[async_trait]
    impl Handler for DivergentSlave {
        async fn handle(&self, _params: Params) -> Option<Params> {
            serde_json::to_value(SourceStatus {
                hostname: Some("other-node".to_string()),
                hash: Some("divergent".to_string()),
                ..SourceStatus::default()
            })
            .ok()
        }
    }

    struct FetchRecorder {
        tx: mpsc::UnboundedSender<Params>,
    }

    #[async_trait]
    impl Handler for FetchRecorder {
        async fn handle(&self, params: Params) -> Option<Params> {
            let _ = self.tx.send(params);
            None
        }
    }

    #[tokio::test]
    async fn drift_triggers_refresh_and_slave_fetch() {
        if !scm_process::command_exists("git") || !scm_process::command_exists("rsync") {
            eprintln!("git or rsync is not installed, skipping");
            return;
        }
        let td = tempfile::tempdir().expect("tempdir");

        // A local repo the source tracks.
        let repo = td.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("file"), "content").expect("write");
        for args in [
            vec!["init", "-b", "master", "."],
            vec!["config", "user.email", "you@example.com"],
            vec!["config", "user.name", "Your Name"],
            vec!["add", "."],
            vec!["commit", "-m", "Initial commit"],
        ] {
            let result = scm_process::run_command_in_dir("git", &args, &repo)
                .await
                .expect("git");
            assert!(result.success, "git {args:?} failed: {}", result.stderr);
        }

        let mut settings = Settings::default();
        settings.target = td.path().join("config");
        settings.master_target = td.path().join("master_config");
        let bus: Arc<dyn Broadcaster> = Arc::new(scm_broadcast::LocalBroadcaster::new());
        let registry = Registry::new(Arc::new(settings), Arc::clone(&bus));
        crate::status::register_handlers(&bus, &registry)
            .await
            .expect("handlers");

        let mut declaration = SourceDeclaration::new(SourceKind::Git);
        declaration.repo = Some(repo.display().to_string());
        let mut config = MasterConfig::default();
        config.sources.insert("s1".to_string(), declaration);
        registry.reconcile(&config).await.expect("reconcile");

        // One extra "slave" disagrees on the hash, and a recorder watches
        // for the corrective fan-out.
        bus.subscribe(crate::status::GET_SOURCE_STATUS, Arc::new(DivergentSlave))
            .await
            .expect("subscribe");
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(SLAVE_FETCH, Arc::new(FetchRecorder { tx }))
            .await
            .expect("subscribe");

        let engine = registry.get_source("s1").await.expect("engine");
        let before = engine.refreshes();
        watch_source(&registry, "s1", &engine)
            .await
            .expect("watch source");

        assert_eq!(engine.refreshes(), before + 1);
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timely")
            .expect("event");
        assert_eq!(event["source_id"], "s1");
    }
}
