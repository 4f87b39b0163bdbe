//! Template expansion for materialized sources.
//!
//! Two strategies walk the files of a freshly published source:
//!
//! - [`TemplateEngineKind::Hbs`] renders `*.hbs` files with handlebars;
//! - [`TemplateEngineKind::Shell`] pipes `*.tmpl` files through `envsubst`.
//!
//! By default a template is emitted beside its input with the template
//! extension stripped. With `dest_sub_dir`, every enumerated file is
//! mirrored under the subdirectory instead — templates expanded, the rest
//! copied verbatim — so a source can keep its raw and expanded trees apart.
//!
//! The file list is enumerated once, before any engine runs, and handed to
//! every engine of the source in declaration order; engines never see each
//! other's emitted files. A failing file is logged and counted, the
//! remaining files proceed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use handlebars::Handlebars;
use scm_config::{TemplateEngineConfig, TemplateEngineKind, TemplateEngineStatus, mask_sensitive};
use tracing::{info, warn};

/// One configured template-expansion step of a source.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    source_id: String,
    config: TemplateEngineConfig,
    data: BTreeMap<String, String>,
}

impl TemplateEngine {
    /// Build an engine for a source.
    ///
    /// With `environment_variables`, env vars whose name starts with one of
    /// `env_prefixes` become template data; explicit `data` entries win.
    pub fn new(source_id: &str, config: &TemplateEngineConfig, env_prefixes: &[String]) -> Self {
        let mut data = if config.environment_variables {
            filtered_env(env_prefixes)
        } else {
            BTreeMap::new()
        };
        data.extend(config.data.clone());

        Self {
            source_id: source_id.to_string(),
            config: config.clone(),
            data,
        }
    }

    /// Engine kind.
    pub fn kind(&self) -> TemplateEngineKind {
        self.config.kind
    }

    /// Expand the templates among `files` (paths relative to `root`).
    ///
    /// Returns the number of files that failed; failures never abort the
    /// remaining files.
    pub async fn evaluate(&self, root: &Path, files: &[PathBuf]) -> usize {
        let mut failures = 0;
        let extension = self.config.kind.extension();

        for file in files {
            if let Some(dest) = &self.config.dest_sub_dir {
                // Never mirror the destination into itself.
                if file.starts_with(dest) {
                    continue;
                }
                let is_template = file.extension().is_some_and(|ext| ext == extension);
                let target = if is_template {
                    root.join(dest).join(file.with_extension(""))
                } else {
                    root.join(dest).join(file)
                };
                let result = if is_template {
                    self.expand_file(&root.join(file), &target).await
                } else {
                    copy_file(&root.join(file), &target).await
                };
                if let Err(error) = result {
                    warn!(
                        "failed applying the {} template of {} on {}: {error:#}",
                        self.config.kind.extension(),
                        self.source_id,
                        file.display()
                    );
                    failures += 1;
                }
            } else {
                if !file.extension().is_some_and(|ext| ext == extension) {
                    continue;
                }
                info!("evaluating template: {}", file.display());
                if let Err(error) = self
                    .expand_file(&root.join(file), &root.join(file.with_extension("")))
                    .await
                {
                    warn!(
                        "failed applying the {} template of {} on {}: {error:#}",
                        self.config.kind.extension(),
                        self.source_id,
                        file.display()
                    );
                    failures += 1;
                }
            }
        }

        failures
    }

    async fn expand_file(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        match self.config.kind {
            TemplateEngineKind::Hbs => {
                let template = tokio::fs::read_to_string(src)
                    .await
                    .with_context(|| format!("failed to read {}", src.display()))?;
                // These are config files, not HTML: keep values verbatim.
                let mut handlebars = Handlebars::new();
                handlebars.register_escape_fn(handlebars::no_escape);
                let rendered = handlebars
                    .render_template(&template, &self.data)
                    .with_context(|| format!("failed to render {}", src.display()))?;
                tokio::fs::write(dst, rendered)
                    .await
                    .with_context(|| format!("failed to write {}", dst.display()))?;
            }
            TemplateEngineKind::Shell => {
                let input = tokio::fs::read(src)
                    .await
                    .with_context(|| format!("failed to read {}", src.display()))?;
                let env: Vec<(String, String)> = self
                    .data
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                let result = scm_process::run_command_filter("envsubst", &[], &env, &input)
                    .await
                    .with_context(|| format!("failed to run envsubst on {}", src.display()))?;
                result.ok()?;
                tokio::fs::write(dst, result.stdout)
                    .await
                    .with_context(|| format!("failed to write {}", dst.display()))?;
            }
        }
        Ok(())
    }

    /// Redacted status of the engine for the broadcast replies.
    pub fn status(&self) -> TemplateEngineStatus {
        TemplateEngineStatus {
            kind: self.config.kind,
            data: mask_sensitive(&self.data),
        }
    }
}

async fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

/// Environment variables exposed to templates, by name prefix.
pub fn filtered_env(prefixes: &[String]) -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(name, _)| prefixes.iter().any(|prefix| name.starts_with(prefix)))
        .collect()
}
