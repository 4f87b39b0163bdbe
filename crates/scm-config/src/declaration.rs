//! The master config document and its source declarations.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Reserved id of the synthetic master source.
pub const MASTER_ID: &str = "master";

/// Provider kind of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A git repository, checked out at depth 1.
    Git,
    /// An rsync endpoint.
    Rsync,
    /// A remote synced with rclone (object stores, HTTP trees, ...).
    Rclone,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Git => write!(f, "git"),
            SourceKind::Rsync => write!(f, "rsync"),
            SourceKind::Rclone => write!(f, "rclone"),
        }
    }
}

/// Template engine kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateEngineKind {
    /// Handlebars text templates (`*.hbs`).
    Hbs,
    /// Shell substitution through `envsubst` (`*.tmpl`).
    Shell,
}

impl TemplateEngineKind {
    /// File extension the engine picks up.
    pub fn extension(&self) -> &'static str {
        match self {
            TemplateEngineKind::Hbs => "hbs",
            TemplateEngineKind::Shell => "tmpl",
        }
    }
}

/// One template-expansion step of a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateEngineConfig {
    /// Engine kind.
    #[serde(rename = "type")]
    pub kind: TemplateEngineKind,
    /// Emit under this subdirectory instead of beside the inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_sub_dir: Option<String>,
    /// Expose the filtered process environment to the templates.
    #[serde(default)]
    pub environment_variables: bool,
    /// Static template data, overriding environment entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

/// Per-source authorization predicate, evaluated by the OAuth layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceAuth {
    /// Repository whose collaborators get access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_repository: Option<String>,
    /// Minimum access level on that repository.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_access_type: Option<String>,
}

/// Declaration of one source, keyed by a stable id in the master config.
///
/// Declarations are compared structurally: the reconciler only reloads a
/// source whose declaration actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDeclaration {
    /// Provider kind.
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Target directory, absolute or relative to the per-role root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_dir: Option<String>,
    /// Repository URL (git).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Branch to track (git, defaults to `master`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Publish only this subdirectory of the checkout (git).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_dir: Option<String>,
    /// Use a sparse checkout when `sub_dir` is set (git, defaults to true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
    /// Private SSH key installed for this source (git, rsync).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    /// Origin of the copy (rsync).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Remote configuration body (rclone).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Glob patterns excluded from copy steps, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    /// Tags used by the per-slave filter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Template-expansion steps, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_engines: Vec<TemplateEngineConfig>,
    /// Authorization predicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<SourceAuth>,
}

impl SourceDeclaration {
    /// A minimal declaration of the given kind, for builders and tests.
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            target_dir: None,
            repo: None,
            branch: None,
            sub_dir: None,
            sparse: None,
            ssh_key: None,
            source: None,
            config: None,
            excludes: Vec::new(),
            tags: Vec::new(),
            template_engines: Vec::new(),
            auth: None,
        }
    }

    /// The branch a git source tracks.
    pub fn branch(&self) -> &str {
        self.branch.as_deref().unwrap_or("master")
    }

    /// Whether a git source uses a per-id sparse checkout.
    pub fn sparse(&self) -> bool {
        self.sub_dir.is_some() && self.sparse.unwrap_or(true)
    }

    /// Whether the declaration carries the given filter tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|candidate| candidate == tag)
    }

    /// Check the kind-specific required fields.
    pub fn validate(&self, id: &str) -> Result<()> {
        match self.kind {
            SourceKind::Git => {
                if self.repo.is_none() {
                    bail!("git source {id} is missing the repo");
                }
            }
            SourceKind::Rsync => {
                if self.source.is_none() {
                    bail!("rsync source {id} is missing the source");
                }
            }
            SourceKind::Rclone => {
                if self.config.is_none() {
                    bail!("rclone source {id} is missing the config");
                }
            }
        }
        Ok(())
    }
}

/// The authoritative set of sources, as decoded from the master config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Declared sources, keyed by id.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceDeclaration>,
    /// Set when the config was passed inline and no self-fetch happens.
    #[serde(default)]
    pub standalone: bool,
}

/// The master config document, when it is itself fetched from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterDeclaration {
    /// How to fetch the directory containing `shared_config_manager.yaml`.
    #[serde(flatten)]
    pub declaration: SourceDeclaration,
    /// Do not reload the master config after the initial fetch.
    #[serde(default)]
    pub standalone: bool,
}

/// A parsed master config document.
///
/// The document either carries the sources inline, or declares where to
/// fetch them from (a self-referential source declaration).
#[derive(Debug, Clone, PartialEq)]
pub enum MasterDocument {
    /// Inline `sources` map.
    Inline(MasterConfig),
    /// Self-referential declaration of the config directory.
    Declared(MasterDeclaration),
}

/// Decode a master config document from YAML.
pub fn parse_master_document(yaml: &str) -> Result<MasterDocument> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).context("invalid master config YAML")?;
    if value.get("sources").is_some() {
        let config: MasterConfig =
            serde_yaml::from_value(value).context("invalid inline master config")?;
        Ok(MasterDocument::Inline(config))
    } else {
        let declaration: MasterDeclaration =
            serde_yaml::from_value(value).context("invalid master source declaration")?;
        Ok(MasterDocument::Declared(declaration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_declaration() -> SourceDeclaration {
        let mut declaration = SourceDeclaration::new(SourceKind::Git);
        declaration.repo = Some("https://example.com/config.git".to_string());
        declaration
    }

    #[test]
    fn branch_defaults_to_master() {
        let declaration = git_declaration();
        assert_eq!(declaration.branch(), "master");

        let mut other = git_declaration();
        other.branch = Some("prod".to_string());
        assert_eq!(other.branch(), "prod");
    }

    #[test]
    fn sparse_requires_sub_dir() {
        let mut declaration = git_declaration();
        assert!(!declaration.sparse());

        declaration.sub_dir = Some("apps".to_string());
        assert!(declaration.sparse());

        declaration.sparse = Some(false);
        assert!(!declaration.sparse());
    }

    #[test]
    fn structural_equality_drives_diff() {
        let a = git_declaration();
        let mut b = git_declaration();
        assert_eq!(a, b);

        b.branch = Some("prod".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn validate_kind_specific_fields() {
        assert!(git_declaration().validate("s1").is_ok());
        assert!(SourceDeclaration::new(SourceKind::Git).validate("s1").is_err());
        assert!(SourceDeclaration::new(SourceKind::Rsync).validate("s1").is_err());
        assert!(SourceDeclaration::new(SourceKind::Rclone).validate("s1").is_err());
    }

    #[test]
    fn parse_inline_document() {
        let yaml = r#"
sources:
  s1:
    type: git
    repo: https://example.com/config.git
    branch: master
    tags: [prod]
"#;
        match parse_master_document(yaml).expect("parse") {
            MasterDocument::Inline(config) => {
                assert!(!config.standalone);
                let s1 = config.sources.get("s1").expect("s1");
                assert_eq!(s1.kind, SourceKind::Git);
                assert!(s1.has_tag("prod"));
            }
            MasterDocument::Declared(_) => panic!("expected an inline document"),
        }
    }

    #[test]
    fn parse_declared_document() {
        let yaml = r#"
type: git
repo: https://example.com/config.git
standalone: true
"#;
        match parse_master_document(yaml).expect("parse") {
            MasterDocument::Declared(master) => {
                assert!(master.standalone);
                assert_eq!(master.declaration.kind, SourceKind::Git);
            }
            MasterDocument::Inline(_) => panic!("expected a declared document"),
        }
    }

    #[test]
    fn declaration_yaml_round_trip() {
        let mut declaration = git_declaration();
        declaration.template_engines.push(TemplateEngineConfig {
            kind: TemplateEngineKind::Shell,
            dest_sub_dir: None,
            environment_variables: true,
            data: BTreeMap::from([("param".to_string(), "value".to_string())]),
        });

        let yaml = serde_yaml::to_string(&declaration).expect("serialize");
        let back: SourceDeclaration = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(declaration, back);
    }

    #[test]
    fn unset_fields_are_not_serialized() {
        let yaml = serde_yaml::to_string(&git_declaration()).expect("serialize");
        assert!(yaml.contains("type: git"));
        assert!(!yaml.contains("ssh_key"));
        assert!(!yaml.contains("excludes"));
    }
}
