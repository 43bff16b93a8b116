// Fanout configuration
// Trees take their split thresholds from the key/value types unless a
// `TreeConfig` overrides them. Child nodes created by splits inherit the
// configuration of the node they were split from.

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::contracts::{KeyOrdering, ValueCodec};

/// Split thresholds; `None` falls back to the type defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default)]
    pub max_leaf_size: Option<usize>,
    #[serde(default)]
    pub max_internal_size: Option<usize>,
}

/// Resolved thresholds for one key/value instantiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub leaf: usize,
    pub internal: usize,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    tree: TreeConfig,
}

impl TreeConfig {
    pub fn new(max_leaf_size: Option<usize>, max_internal_size: Option<usize>) -> Self {
        Self {
            max_leaf_size,
            max_internal_size,
        }
    }

    /// Parse a `[tree]` table from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(content).context("invalid tree configuration")?;
        file.tree.validate()?;
        Ok(file.tree)
    }

    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Override thresholds from `PBTREES_MAX_LEAF_SIZE` and
    /// `PBTREES_MAX_INTERNAL_SIZE`
    pub fn with_env_overrides(mut self) -> anyhow::Result<Self> {
        if let Ok(leaf) = std::env::var("PBTREES_MAX_LEAF_SIZE") {
            self.max_leaf_size = Some(leaf.parse().context("PBTREES_MAX_LEAF_SIZE")?);
        }
        if let Ok(internal) = std::env::var("PBTREES_MAX_INTERNAL_SIZE") {
            self.max_internal_size =
                Some(internal.parse().context("PBTREES_MAX_INTERNAL_SIZE")?);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(leaf) = self.max_leaf_size {
            ensure!(leaf >= 1, "max_leaf_size must be at least 1, got {leaf}");
        }
        if let Some(internal) = self.max_internal_size {
            ensure!(
                internal >= 2,
                "max_internal_size must be at least 2, got {internal}"
            );
        }
        Ok(())
    }

    /// Thresholds for `K`/`V`, with type defaults filling the gaps
    pub fn limits<K: KeyOrdering, V: ValueCodec>(&self) -> Limits {
        Limits {
            leaf: self.max_leaf_size.unwrap_or_else(K::bucket_size_for::<V>).max(1),
            internal: self.max_internal_size.unwrap_or(K::TREE_SIZE).max(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Object;

    #[test]
    fn test_type_defaults() {
        let config = TreeConfig::default();
        assert_eq!(config.limits::<i64, i64>(), Limits { leaf: 120, internal: 500 });
        assert_eq!(config.limits::<i64, Object>(), Limits { leaf: 60, internal: 500 });
        assert_eq!(config.limits::<Object, Object>(), Limits { leaf: 30, internal: 250 });
    }

    #[test]
    fn test_toml_parsing() {
        let config = TreeConfig::from_toml_str("[tree]\nmax_leaf_size = 3\n").unwrap();
        assert_eq!(config.max_leaf_size, Some(3));
        assert_eq!(config.max_internal_size, None);
        assert_eq!(config.limits::<i32, i32>().internal, 500);

        assert!(TreeConfig::from_toml_str("[tree]\nmax_internal_size = 1\n").is_err());
        assert_eq!(TreeConfig::from_toml_str("").unwrap(), TreeConfig::default());
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pbtrees.toml");
        std::fs::write(&path, "[tree]\nmax_leaf_size = 8\nmax_internal_size = 4\n")?;
        let config = TreeConfig::from_file(&path)?;
        assert_eq!(config, TreeConfig::new(Some(8), Some(4)));
        assert!(TreeConfig::from_file(dir.path().join("missing.toml")).is_err());
        Ok(())
    }
}
