//! `sources.yaml`: origin tag -> trust tier assignment.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use ecal_core::TrustTier;
use serde::Deserialize;
use tracing::info;

pub const REGISTRY_FILE: &str = "sources.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub source: String,
    pub tier: TrustTier,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), sources = registry.sources.len(), "source registry loaded");
        Ok(registry)
    }

    /// `None` when the workspace has no registry file.
    pub fn load_from_workspace(root: &Path) -> Result<Option<Self>> {
        let path = root.join(REGISTRY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    pub fn tier_overrides(&self) -> BTreeMap<String, TrustTier> {
        self.sources
            .iter()
            .map(|entry| (entry.source.clone(), entry.tier))
            .collect()
    }

    pub fn tier_of(&self, source: &str) -> Option<TrustTier> {
        self.sources
            .iter()
            .find(|entry| entry.source == source)
            .map(|entry| entry.tier)
    }
}
