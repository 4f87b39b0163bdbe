//! The registry and its reconciler: the only mutator of the live set of
//! source engines.
//!
//! Reconciles are strictly serialized by a dedicated mutex; the engine
//! maps are behind a read/write lock that is only held for the map
//! operation itself, never across subprocess work. Readers therefore see
//! either the old or the new engine for an id, never a half-constructed
//! one, and a per-id refresh synchronizes with a reconcile of the same id
//! through the engine's own refresh lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result as AnyResult};
use scm_broadcast::Broadcaster;
use scm_config::{
    MASTER_ID, MasterConfig, MasterDocument, Settings, SourceDeclaration, SourceStatus,
    parse_master_document,
};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::sources::{SourceEngine, ssh};
use crate::status::SLAVE_FETCH;

/// File name of the master config inside the master source.
pub const MASTER_CONFIG_FILE: &str = "shared_config_manager.yaml";

/// Readiness flag values written to `$TMPDIR/status`.
pub const FLAG_LOADING: &str = "LOADING";
pub const FLAG_READY: &str = "READY";
pub const FLAG_ERROR: &str = "ERROR";
pub const FLAG_SOURCE_ERROR: &str = "SOURCE_ERROR";

#[derive(Default)]
struct Maps {
    active: HashMap<String, Arc<SourceEngine>>,
    filtered: HashMap<String, Arc<SourceEngine>>,
}

/// Owner of the live engines and of the synthetic master engine.
pub struct Registry {
    settings: Arc<Settings>,
    bus: Arc<dyn Broadcaster>,
    reconcile_lock: tokio::sync::Mutex<()>,
    maps: tokio::sync::RwLock<Maps>,
    master: tokio::sync::RwLock<Option<Arc<SourceEngine>>>,
    standalone: AtomicBool,
}

impl Registry {
    /// Create an empty registry; [`Registry::init`] loads the config.
    pub fn new(settings: Arc<Settings>, bus: Arc<dyn Broadcaster>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            bus,
            reconcile_lock: tokio::sync::Mutex::new(()),
            maps: tokio::sync::RwLock::new(Maps::default()),
            master: tokio::sync::RwLock::new(None),
            standalone: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn bus(&self) -> &Arc<dyn Broadcaster> {
        &self.bus
    }

    /// Whether the config was passed inline (no self-fetch).
    pub fn standalone(&self) -> bool {
        self.standalone.load(Ordering::SeqCst)
    }

    /// Load the master config and bring the engines up.
    ///
    /// Returns whether the config came from the watched file, so the
    /// caller can start the file watcher.
    pub async fn init(self: &Arc<Self>) -> AnyResult<bool> {
        self.update_flag(FLAG_LOADING).await;
        ssh::prepare().await?;
        crate::status::register_handlers(&self.bus, self).await?;

        let (content, from_file) = match &self.settings.master_config {
            Some(inline) => {
                info!("load the master config from the environment");
                (inline.clone(), false)
            }
            None => {
                info!(
                    "load the master config from {}",
                    self.settings.master_config_file.display()
                );
                let content = tokio::fs::read_to_string(&self.settings.master_config_file)
                    .await
                    .with_context(|| {
                        format!(
                            "failed to read {}",
                            self.settings.master_config_file.display()
                        )
                    })?;
                (content, true)
            }
        };

        match parse_master_document(&content)? {
            MasterDocument::Inline(mut config) => {
                info!("the master config is inline");
                config.standalone = true;
                self.standalone.store(true, Ordering::SeqCst);
                *self.master.write().await =
                    Some(Arc::new(SourceEngine::synthetic_master(Arc::clone(
                        &self.settings,
                    ))));
                // Engines load in the background so the HTTP surface and
                // the bus come up immediately.
                let registry = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(error) = registry.reconcile(&config).await {
                        error!("initial load failed: {error}");
                    }
                });
            }
            MasterDocument::Declared(master) => {
                self.standalone.store(master.standalone, Ordering::SeqCst);
                let engine = Arc::new(
                    SourceEngine::new(
                        MASTER_ID,
                        master.declaration,
                        true,
                        Arc::clone(&self.settings),
                    )
                    .await?,
                );
                *self.master.write().await = Some(Arc::clone(&engine));
                info!("initial loading of the master config");
                engine
                    .refresh_or_fetch()
                    .await
                    .map_err(|error| anyhow::anyhow!("{error}"))?;
                info!("loading of the master config finished");
                if !master.standalone {
                    let registry = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(error) = registry.reload_master_config().await {
                            error!("initial reconcile failed: {error}");
                        }
                    });
                }
            }
        }
        Ok(from_file)
    }

    /// Re-read `shared_config_manager.yaml` from the master source and
    /// reconcile.
    pub async fn reload_master_config(self: &Arc<Self>) -> Result<()> {
        let master = self
            .master
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::BadRequest("master source not initialized".to_string()))?;
        let path = master.target_path().join(MASTER_CONFIG_FILE);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
            .map_err(Error::Other)?;
        let config: MasterConfig = serde_yaml::from_str(&content)
            .context("invalid master config")
            .map_err(|error| Error::BadRequest(format!("{error:#}")))?;
        self.reconcile(&config).await
    }

    /// Make the live engine set match `config`.
    ///
    /// A config declaring the reserved `master` id is rejected before any
    /// state changes. Engine load failures are counted, not fatal: on a
    /// mixed first pass one full retry runs before the readiness flag
    /// settles.
    pub async fn reconcile(self: &Arc<Self>, config: &MasterConfig) -> Result<()> {
        if config.sources.contains_key(MASTER_ID) {
            return Err(Error::BadRequest(format!(
                "a source cannot have the \"{MASTER_ID}\" id"
            )));
        }

        let _guard = self.reconcile_lock.lock().await;
        info!("reading the master config");

        let (success, mut errors) = self.reconcile_pass(config).await;
        if errors > 0 && success > 0 {
            info!("retrying the reconcile once after a mixed first pass");
            (_, errors) = self.reconcile_pass(config).await;
        }

        if errors > 0 {
            self.update_flag(FLAG_ERROR).await;
            Err(Error::Reconcile { errors })
        } else {
            self.update_flag(FLAG_READY).await;
            Ok(())
        }
    }

    async fn reconcile_pass(self: &Arc<Self>, config: &MasterConfig) -> (usize, usize) {
        let (keep, filtered_out) = self.partition(&config.sources);

        // Filtered engines are constructed (discoverable) but never
        // refreshed (not materialized).
        let mut filtered = HashMap::new();
        for (id, declaration) in filtered_out {
            match SourceEngine::new(id, declaration.clone(), false, Arc::clone(&self.settings))
                .await
            {
                Ok(engine) => {
                    filtered.insert(id.to_string(), Arc::new(engine));
                }
                Err(error) => warn!("cannot build the filtered source {id}: {error:#}"),
            }
        }
        self.maps.write().await.filtered = filtered;

        let to_delete: Vec<(String, Arc<SourceEngine>)> = {
            let maps = self.maps.read().await;
            maps.active
                .iter()
                .filter(|(id, _)| !keep.contains_key(id.as_str()))
                .map(|(id, engine)| (id.clone(), Arc::clone(engine)))
                .collect()
        };
        for (id, engine) in to_delete {
            self.maps.write().await.active.remove(&id);
            engine.delete().await;
        }

        let mut success = 0;
        let mut errors = 0;
        for (id, declaration) in keep {
            let existing = self.maps.read().await.active.get(id).cloned();
            if let Some(existing) = existing {
                if existing.declaration() == Some(declaration) {
                    debug!("source {id} didn't change, not reloading it");
                    continue;
                }
                info!("change detected in source {id}, reloading it");
                // Delete first so the old content cannot leak into the new.
                self.maps.write().await.active.remove(id);
                existing.delete().await;
            } else {
                info!("new source detected: {id}");
            }

            match SourceEngine::new(
                id,
                declaration.clone(),
                self.settings.is_master(),
                Arc::clone(&self.settings),
            )
            .await
            {
                Ok(engine) => {
                    let engine = Arc::new(engine);
                    self.maps
                        .write()
                        .await
                        .active
                        .insert(id.to_string(), Arc::clone(&engine));
                    match engine.refresh_or_fetch().await {
                        Ok(()) => success += 1,
                        Err(error) => {
                            error!("cannot load the {id} config: {error}");
                            errors += 1;
                        }
                    }
                }
                Err(error) => {
                    error!("cannot create the {id} source: {error:#}");
                    errors += 1;
                }
            }
        }
        (success, errors)
    }

    /// Split the declared sources by the node-local tag filter.
    ///
    /// The master always sees everything; the filter only applies on
    /// slaves.
    fn partition<'config>(
        &self,
        sources: &'config BTreeMap<String, SourceDeclaration>,
    ) -> (
        BTreeMap<&'config str, &'config SourceDeclaration>,
        BTreeMap<&'config str, &'config SourceDeclaration>,
    ) {
        let Some(filter) = self
            .settings
            .tag_filter
            .as_deref()
            .filter(|_| self.settings.is_slave)
        else {
            return (
                sources
                    .iter()
                    .map(|(id, declaration)| (id.as_str(), declaration))
                    .collect(),
                BTreeMap::new(),
            );
        };

        let mut keep = BTreeMap::new();
        let mut filtered = BTreeMap::new();
        for (id, declaration) in sources {
            if declaration.has_tag(filter) {
                keep.insert(id.as_str(), declaration);
            } else {
                filtered.insert(id.as_str(), declaration);
            }
        }
        (keep, filtered)
    }

    /// Refresh one source, as triggered by the HTTP surface.
    ///
    /// The local node updates first, then every subscriber is told to
    /// pull; the call never waits for the slaves.
    pub async fn refresh(self: &Arc<Self>, id: &str) -> Result<()> {
        info!("reloading the {id} config");
        let (engine, _filtered) = self
            .get_source_with_filtered(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        engine.refresh_or_fetch().await?;
        if engine.is_master() && !self.standalone() {
            self.reload_master_config().await?;
        }
        self.bus
            .publish(SLAVE_FETCH, serde_json::json!({ "source_id": id }))
            .await
            .map_err(Error::Other)?;
        Ok(())
    }

    /// Handle a `slave_fetch` event on this node.
    ///
    /// Errors are contained here: a failing fetch leaves the engine
    /// unloaded and the drift detector retries on its next pass.
    pub async fn slave_fetch(self: &Arc<Self>, id: &str) {
        let Some((engine, filtered)) = self.get_source_with_filtered(id).await else {
            error!("unknown id {id}");
            return;
        };
        if filtered && self.settings.is_slave {
            info!("the reloading of the {id} config is filtered");
            return;
        }
        info!("reloading the {id} config from event");
        if !engine.is_master() || self.settings.master_dispatch {
            if let Err(error) = engine.fetch().await {
                error!("failed to fetch {id}: {error}");
                return;
            }
        }
        if engine.is_master()
            && !self.standalone()
            && let Err(error) = self.reload_master_config().await
        {
            error!("failed to reload the master config: {error}");
        }
    }

    /// Look up an active source or the master engine.
    pub async fn get_source(&self, id: &str) -> Option<Arc<SourceEngine>> {
        if let Some(master) = self.master.read().await.as_ref()
            && master.id() == id
        {
            return Some(Arc::clone(master));
        }
        self.maps.read().await.active.get(id).cloned()
    }

    /// Look up a source, falling back to the filtered map.
    pub async fn get_source_with_filtered(
        &self,
        id: &str,
    ) -> Option<(Arc<SourceEngine>, bool)> {
        if let Some(engine) = self.get_source(id).await {
            return Some((engine, false));
        }
        self.maps
            .read()
            .await
            .filtered
            .get(id)
            .cloned()
            .map(|engine| (engine, true))
    }

    /// Whether an id exists only as a filtered engine on this node.
    pub async fn is_filtered(&self, id: &str) -> bool {
        self.maps.read().await.filtered.contains_key(id)
    }

    /// Ids of every discoverable source (active and filtered, no master).
    pub async fn source_ids(&self) -> Vec<String> {
        let maps = self.maps.read().await;
        let mut ids: Vec<String> = maps
            .active
            .keys()
            .chain(maps.filtered.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// The active engines, for the drift detector.
    pub async fn active_snapshot(&self) -> Vec<(String, Arc<SourceEngine>)> {
        let maps = self.maps.read().await;
        let mut engines: Vec<(String, Arc<SourceEngine>)> = maps
            .active
            .iter()
            .map(|(id, engine)| (id.clone(), Arc::clone(engine)))
            .collect();
        engines.sort_by(|a, b| a.0.cmp(&b.0));
        engines
    }

    /// Local stats of the active sources plus the master engine.
    pub async fn stats(&self) -> BTreeMap<String, SourceStatus> {
        let engines = self.active_snapshot().await;
        let mut stats = BTreeMap::new();
        for (id, engine) in engines {
            stats.insert(id, engine.stats().await);
        }
        if let Some(master) = self.master.read().await.clone() {
            stats.insert(master.id().to_string(), master.stats().await);
        }
        stats
    }

    /// Publish the readiness flag for the deployment's health checks.
    pub async fn update_flag(&self, value: &str) {
        let path = std::env::temp_dir().join("status");
        if let Err(error) = tokio::fs::write(&path, value).await {
            warn!("failed to write the status flag {}: {error}", path.display());
        }
    }
}
