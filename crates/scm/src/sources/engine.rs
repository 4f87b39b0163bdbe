//! The common source engine: paths, refresh/fetch, copy step, templates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result as AnyResult};
use scm_config::{Settings, SourceDeclaration, SourceKind, SourceStatus};
use scm_template::TemplateEngine;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fetch;
use crate::sources::{git, rclone, rsync, ssh};

/// Runtime instantiation of a source declaration.
///
/// An engine owns its `target_path` and reflects exactly one declaration;
/// when a declaration changes, the reconciler deletes the engine and
/// creates a fresh one. The refresh lock serializes the engine's own
/// long-running work so a per-id refresh can never race a reconcile of
/// the same id.
pub struct SourceEngine {
    id: String,
    declaration: Option<SourceDeclaration>,
    is_master: bool,
    settings: Arc<Settings>,
    templates: Vec<TemplateEngine>,
    loaded: AtomicBool,
    refreshes: AtomicU64,
    refresh_lock: Mutex<()>,
}

impl SourceEngine {
    /// Create an engine for a declaration, installing its credentials.
    pub async fn new(
        id: &str,
        declaration: SourceDeclaration,
        is_master: bool,
        settings: Arc<Settings>,
    ) -> AnyResult<Self> {
        declaration.validate(id)?;

        if let Some(key) = &declaration.ssh_key {
            ssh::install_key(id, key).await?;
        }
        if declaration.kind == SourceKind::Rclone
            && let Some(config) = &declaration.config
        {
            rclone::install_config(id, config).await?;
        }

        let prefixes = settings.env_prefixes();
        let templates = declaration
            .template_engines
            .iter()
            .map(|config| TemplateEngine::new(id, config, &prefixes))
            .collect();

        Ok(Self {
            id: id.to_string(),
            declaration: Some(declaration),
            is_master,
            settings,
            templates,
            loaded: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
        })
    }

    /// The synthetic master engine of an inline (standalone) config.
    ///
    /// It exists so the master id resolves on the HTTP surface; it has no
    /// provider and refreshing it is a no-op.
    pub fn synthetic_master(settings: Arc<Settings>) -> Self {
        Self {
            id: scm_config::MASTER_ID.to_string(),
            declaration: None,
            is_master: true,
            settings,
            templates: Vec::new(),
            loaded: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn declaration(&self) -> Option<&SourceDeclaration> {
        self.declaration.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Provider kind name, `master` for the synthetic engine.
    pub fn kind_name(&self) -> String {
        match &self.declaration {
            Some(declaration) => declaration.kind.to_string(),
            None => "master".to_string(),
        }
    }

    /// Whether the engine published its content at least once.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Number of completed refreshes/fetches.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Where the engine publishes its content.
    ///
    /// Relative `target_dir` values land under the per-role root; absolute
    /// ones override it.
    pub fn target_path(&self) -> PathBuf {
        let root = self.settings.target_root(self.is_master);
        match self
            .declaration
            .as_ref()
            .and_then(|declaration| declaration.target_dir.as_deref())
        {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => root.join(dir),
            None => root.join(&self.id),
        }
    }

    /// Master-side update from the upstream provider.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.do_refresh().await.map_err(Error::Provider)?;
        self.evaluate_templates().await;
        self.loaded.store(true, Ordering::SeqCst);
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Slave-side update: pull the tarball published by the master.
    pub async fn fetch(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        if self.declaration.is_some() {
            fetch::fetch_tarball(self).await.map_err(Error::Fetch)?;
        }
        self.evaluate_templates().await;
        self.loaded.store(true, Ordering::SeqCst);
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Refresh on the master, fetch on a slave.
    ///
    /// The master engine itself always refreshes: the config directory is
    /// what a slave bootstraps from, so it comes straight from the
    /// provider.
    pub async fn refresh_or_fetch(&self) -> Result<()> {
        if self.settings.is_master() || self.is_master {
            self.refresh().await
        } else {
            self.fetch().await
        }
    }

    async fn do_refresh(&self) -> AnyResult<()> {
        match self.declaration.as_ref().map(|declaration| declaration.kind) {
            None => Ok(()),
            Some(SourceKind::Git) => git::refresh(self).await,
            Some(SourceKind::Rsync) => rsync::refresh(self).await,
            Some(SourceKind::Rclone) => rclone::refresh(self).await,
        }
    }

    /// Run the template engines over the published tree.
    ///
    /// The file list is enumerated once and handed to every engine in
    /// declaration order, so engines never see each other's output. A
    /// master that serves slaves skips expansion entirely: templates run
    /// near the point of consumption.
    async fn evaluate_templates(&self) {
        if self.templates.is_empty() || self.settings.is_master_with_slaves() {
            return;
        }

        let root = self.target_path();
        let files = enumerate_files(&root);
        for engine in &self.templates {
            let failures = engine.evaluate(&root, &files).await;
            if failures > 0 {
                warn!(
                    "template expansion of {} left {failures} files unexpanded",
                    self.id
                );
            }
        }
    }

    /// Copy step: publish `source` into the target path with rsync.
    ///
    /// Deletion on the destination is mandatory so files emitted for a
    /// removed template disappear with it.
    pub(crate) async fn copy(&self, source: &str, extra_excludes: &[&str]) -> AnyResult<()> {
        let dest = self.target_path();
        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;

        let mut args: Vec<String> = [
            "--recursive",
            "--links",
            "--devices",
            "--specials",
            "--delete",
            "--verbose",
            "--checksum",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        if let Some(declaration) = &self.declaration {
            for exclude in &declaration.excludes {
                args.push(format!("--exclude={exclude}"));
            }
        }
        for exclude in extra_excludes {
            args.push(format!("--exclude={exclude}"));
        }
        args.push(format!("{}/", source.trim_end_matches('/')));
        args.push(dest.display().to_string());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        scm_process::run_command("rsync", &args)
            .await
            .context("failed to run rsync")?
            .ok()
            .with_context(|| format!("rsync into {} failed", dest.display()))?;
        Ok(())
    }

    /// Remove everything the engine owns on disk.
    ///
    /// Best effort: a failing removal is logged, the engine is dropped
    /// from the registry regardless.
    pub async fn delete(&self) {
        let target = self.target_path();
        if target.is_dir()
            && let Err(error) = tokio::fs::remove_dir_all(&target).await
        {
            warn!("failed to remove {}: {error}", target.display());
        }

        if let Some(declaration) = &self.declaration {
            if declaration.kind == SourceKind::Git && self.settings.is_master() {
                git::delete_clone(self).await;
            }
            if declaration.ssh_key.is_some()
                && let Err(error) = ssh::remove_key(&self.id).await
            {
                warn!("failed to remove the ssh key of {}: {error:#}", self.id);
            }
        }

        info!("deleted source {}", self.id);
    }

    /// Redacted status of the engine.
    pub async fn stats(&self) -> SourceStatus {
        let mut status = match &self.declaration {
            Some(declaration) => SourceStatus::from_declaration(declaration),
            None => SourceStatus::default(),
        };
        status.template_engines = self.templates.iter().map(TemplateEngine::status).collect();

        if let Some(declaration) = &self.declaration {
            if declaration.kind == SourceKind::Rclone {
                status.config = status.config.as_deref().map(rclone::redact_config);
            }
            if declaration.kind == SourceKind::Git
                && let Some(gitstats) = git::read_gitstats(&self.target_path()).await
            {
                status.hash = Some(gitstats.hash);
                status.tags = gitstats.tags;
            }
        }

        status
    }
}

/// All regular files under `root`, relative and sorted.
pub(crate) fn enumerate_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}
