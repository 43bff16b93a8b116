// Builder Patterns
// Fluent builders for tree configuration, populated containers and key
// ranges. Builders validate eagerly and report problems as anyhow errors.

use anyhow::{ensure, Context, Result};
use std::path::Path;

use crate::btree::{BTree, KeyRange, TreeSet};
use crate::config::TreeConfig;
use crate::contracts::{KeyOrdering, ValueCodec};

/// Fluent builder for `TreeConfig`
#[derive(Debug, Clone, Default)]
pub struct TreeConfigBuilder {
    config: TreeConfig,
    use_env: bool,
}

impl TreeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a TOML file with a `[tree]` table
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            config: TreeConfig::from_file(path)?,
            use_env: false,
        })
    }

    /// Maximum number of items in a leaf bucket before it splits
    pub fn max_leaf_size(mut self, size: usize) -> Result<Self> {
        ensure!(size >= 1, "max_leaf_size must be at least 1, got {size}");
        self.config.max_leaf_size = Some(size);
        Ok(self)
    }

    /// Maximum number of children of an interior node before it splits
    pub fn max_internal_size(mut self, size: usize) -> Result<Self> {
        ensure!(
            size >= 2,
            "max_internal_size must be at least 2, got {size}"
        );
        self.config.max_internal_size = Some(size);
        Ok(self)
    }

    /// Apply `PBTREES_*` environment overrides at build time
    pub fn with_env_overrides(mut self) -> Self {
        self.use_env = true;
        self
    }

    pub fn build(self) -> Result<TreeConfig> {
        let config = if self.use_env {
            self.config
                .with_env_overrides()
                .context("invalid environment override")?
        } else {
            self.config
        };
        config.validate()?;
        Ok(config)
    }
}

/// Fluent builder for populated trees and tree sets
pub struct TreeBuilder<K: KeyOrdering, V: ValueCodec> {
    config: TreeConfig,
    items: Vec<(K, V)>,
}

impl<K: KeyOrdering, V: ValueCodec> TreeBuilder<K, V> {
    pub fn new() -> Self {
        Self {
            config: TreeConfig::default(),
            items: Vec::new(),
        }
    }

    pub fn config(mut self, config: TreeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn item(mut self, key: K, value: V) -> Self {
        self.items.push((key, value));
        self
    }

    pub fn items(mut self, items: impl IntoIterator<Item = (K, V)>) -> Self {
        self.items.extend(items);
        self
    }

    /// Build the tree; later duplicates overwrite earlier ones
    pub fn build(self) -> Result<BTree<K, V>> {
        self.config.validate()?;
        let count = self.items.len();
        let tree = BTree::with_config(self.config);
        tree.update(self.items)
            .with_context(|| format!("failed to populate tree with {count} items"))?;
        Ok(tree)
    }
}

impl<K: KeyOrdering, V: ValueCodec> Default for TreeBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyOrdering> TreeBuilder<K, ()> {
    /// Build a key-only tree from the collected keys
    pub fn build_set(self) -> Result<TreeSet<K>> {
        self.config.validate()?;
        let set = TreeSet::with_config(self.config);
        set.update(self.items.into_iter().map(|(key, _)| key))
            .context("failed to populate tree set")?;
        Ok(set)
    }
}

/// Fluent builder for `KeyRange`
pub struct RangeBuilder<K> {
    min: Option<K>,
    max: Option<K>,
    exclude_min: bool,
    exclude_max: bool,
}

impl<K: KeyOrdering> RangeBuilder<K> {
    pub fn new() -> Self {
        Self {
            min: None,
            max: None,
            exclude_min: false,
            exclude_max: false,
        }
    }

    pub fn min(mut self, key: K) -> Self {
        self.min = Some(key);
        self
    }

    pub fn max(mut self, key: K) -> Self {
        self.max = Some(key);
        self
    }

    pub fn exclude_min(mut self) -> Self {
        self.exclude_min = true;
        self
    }

    pub fn exclude_max(mut self) -> Self {
        self.exclude_max = true;
        self
    }

    /// Build the range. Bounds that cannot be compared are rejected here so
    /// the error surfaces before any traversal.
    pub fn build(self) -> Result<KeyRange<K>> {
        for key in self.min.iter().chain(self.max.iter()) {
            ensure!(key.supports(), "key {key:?} has no usable ordering");
        }
        let mut range = KeyRange::all();
        if let Some(min) = self.min {
            range = range.min(min);
        }
        if let Some(max) = self.max {
            range = range.max(max);
        }
        if self.exclude_min {
            range = range.exclude_min();
        }
        if self.exclude_max {
            range = range.exclude_max();
        }
        Ok(range)
    }
}

impl<K: KeyOrdering> Default for RangeBuilder<K> {
    fn default() -> Self {
        Self::new()
    }
}
