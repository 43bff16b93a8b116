// Wrapper Components
// High-level wrappers over the containers: TracedTree logs and counts every
// operation, CountedTree keeps a Length in step with the tree so the size is
// known without walking the buckets.

use anyhow::{Context, Result};
use std::cell::Cell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::btree::{BTree, KeyRange, Length};
use crate::config::TreeConfig;
use crate::contracts::{KeyOrdering, ValueCodec};
use crate::error::BTreeError;
use crate::observability::*;

/// Tree wrapper that adds tracing to all operations
pub struct TracedTree<K: KeyOrdering, V: ValueCodec> {
    inner: BTree<K, V>,
    trace_id: Uuid,
    operation_count: Cell<u64>,
}

impl<K: KeyOrdering, V: ValueCodec> TracedTree<K, V> {
    pub fn new(inner: BTree<K, V>) -> Self {
        let trace_id = Uuid::new_v4();
        info!("[{}] Tracing tree operations", trace_id);
        Self {
            inner,
            trace_id,
            operation_count: Cell::new(0),
        }
    }

    pub fn with_config(config: TreeConfig) -> Self {
        Self::new(BTree::with_config(config))
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count.get()
    }

    pub fn inner(&self) -> &BTree<K, V> {
        &self.inner
    }

    pub fn into_inner(self) -> BTree<K, V> {
        self.inner
    }

    fn context(&self, operation: &str) -> OperationContext {
        self.operation_count.set(self.operation_count.get() + 1);
        OperationContext::in_trace(self.trace_id, operation)
    }

    fn finish<T>(&self, ctx: &OperationContext, op: Operation, result: Result<T>) -> Result<T> {
        log_operation(ctx, &op, &result);
        if let Err(e) = &result {
            log_error_with_context(e, ctx);
        }
        result
    }

    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        let ctx = self.context("tree.insert");
        let op = Operation::Insert {
            key: format!("{key:?}"),
        };
        let result = self
            .inner
            .insert(key, value)
            .context("Failed to insert key");
        self.finish(&ctx, op, result)
    }

    pub fn set(&self, key: K, value: V) -> Result<()> {
        let ctx = self.context("tree.set");
        let op = Operation::Insert {
            key: format!("{key:?}"),
        };
        let result = self.inner.set(key, value).context("Failed to set key");
        self.finish(&ctx, op, result)
    }

    /// Look up a key; a missing key is `Ok(None)`, not an error
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let ctx = self.context("tree.get");
        let result = match self.inner.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(BTreeError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to look up key")),
        };
        let op = Operation::Lookup {
            key: format!("{key:?}"),
            found: matches!(result, Ok(Some(_))),
        };
        self.finish(&ctx, op, result)
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        let ctx = self.context("tree.remove");
        let op = Operation::Delete {
            key: format!("{key:?}"),
        };
        let result = self.inner.remove(key).context("Failed to remove key");
        self.finish(&ctx, op, result)
    }

    /// Collect the items of a range
    pub fn range(&self, range: &KeyRange<K>) -> Result<Vec<(K, V)>> {
        let ctx = self.context("tree.range");
        let result = self
            .inner
            .items(range)
            .and_then(|view| view.to_items())
            .context("Failed to scan range");
        let op = Operation::RangeScan {
            result_count: result.as_ref().map(Vec::len).unwrap_or(0),
        };
        debug!("[{}] range scan returned {:?}", self.trace_id, op);
        self.finish(&ctx, op, result)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.inner.is_empty()?)
    }

    pub fn check(&self) -> Result<()> {
        let ctx = self.context("tree.check");
        let result = self
            .inner
            .check()
            .and_then(|()| self.inner.check_values())
            .context("Tree failed its structural check");
        let items = self.inner.len().unwrap_or(0);
        self.finish(&ctx, Operation::Check { items }, result)
    }
}

/// Tree paired with a persistent Length that tracks its size
pub struct CountedTree<K: KeyOrdering, V: ValueCodec> {
    tree: BTree<K, V>,
    length: Length,
}

impl<K: KeyOrdering, V: ValueCodec> CountedTree<K, V> {
    pub fn new(tree: BTree<K, V>) -> Result<Self> {
        let count = tree.len()?;
        let length = Length::new(i64::try_from(count).context("tree too large to count")?);
        Ok(Self { tree, length })
    }

    /// Reattach a tree to a counter that was persisted alongside it
    pub fn from_parts(tree: BTree<K, V>, length: Length) -> Self {
        Self { tree, length }
    }

    pub fn tree(&self) -> &BTree<K, V> {
        &self.tree
    }

    pub fn length(&self) -> &Length {
        &self.length
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self.length.value()?)
    }

    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        let added = self.tree.insert(key, value)?;
        if added {
            self.length.change(1)?;
        }
        Ok(added)
    }

    pub fn set(&self, key: K, value: V) -> Result<()> {
        let existed = self.tree.contains(&key)?;
        self.tree.set(key, value)?;
        if !existed {
            self.length.change(1)?;
        }
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.tree.remove(key)?;
        self.length.change(-1)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        self.length.set(0)?;
        Ok(())
    }
}
