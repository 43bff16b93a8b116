// Public containers
// `BTree` and `TreeSet` are rooted trees; `Bucket` and `Set` are standalone
// leaves with the same item API. All of them are cheap handles: cloning one
// shares the underlying persistent node.

use std::cmp::Ordering;
use std::rc::Rc;

use super::bucket::{BucketData, BucketHandle, SetOutcome};
use super::check;
use super::conflict::{resolve_bucket_conflict, resolve_tree_conflict};
use super::items::{Entry, RangeView, Span, TreeIter, ViewKind};
use super::tree::{self, TreeData, TreeHandle};
use crate::config::TreeConfig;
use crate::contracts::{KeyOrdering, MergeCursor, MergeSource, ValueCodec, WeightedValue};
use crate::error::{BTreeError, Result};
use crate::persistence::{DataManager, Handle, MemoryJar, NodeBody};
use crate::state::{Datum, NodeKind, Oid};

/// Optional bounds for range queries
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange<K> {
    pub(crate) min: Option<K>,
    pub(crate) max: Option<K>,
    pub(crate) exclude_min: bool,
    pub(crate) exclude_max: bool,
}

impl<K> Default for KeyRange<K> {
    fn default() -> Self {
        Self::all()
    }
}

impl<K> KeyRange<K> {
    /// Unbounded range
    pub fn all() -> Self {
        Self {
            min: None,
            max: None,
            exclude_min: false,
            exclude_max: false,
        }
    }

    /// Inclusive range `[min, max]`
    pub fn between(min: K, max: K) -> Self {
        Self::all().min(min).max(max)
    }

    pub fn min(mut self, key: K) -> Self {
        self.min = Some(key);
        self
    }

    pub fn max(mut self, key: K) -> Self {
        self.max = Some(key);
        self
    }

    /// Skip the smallest key in range (`min` itself when it is given)
    pub fn exclude_min(mut self) -> Self {
        self.exclude_min = true;
        self
    }

    /// Skip the largest key in range (`max` itself when it is given)
    pub fn exclude_max(mut self) -> Self {
        self.exclude_max = true;
        self
    }

    pub fn lower(&self) -> Option<&K> {
        self.min.as_ref()
    }

    pub fn upper(&self) -> Option<&K> {
        self.max.as_ref()
    }

    pub fn excludes_min(&self) -> bool {
        self.exclude_min
    }

    pub fn excludes_max(&self) -> bool {
        self.exclude_max
    }
}

fn swallow_not_found<T>(result: Result<T>, default: T) -> Result<T> {
    match result {
        Err(err) if err.is_key_not_found() => Ok(default),
        other => other,
    }
}

/// Items with value >= `min`, largest value first
fn by_value_items<K, V, I>(entries: I, min: V) -> Result<Vec<(V, K)>>
where
    V: WeightedValue,
    I: Iterator<Item = Result<Entry<K, V>>>,
{
    let mut result = Vec::new();
    for entry in entries {
        if let Some((key, value)) = entry?.into_item() {
            if value >= min {
                result.push((V::normalize(value, min), key));
            }
        }
    }
    result.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
    result.reverse();
    Ok(result)
}

fn tree_view<K: KeyOrdering, V: ValueCodec>(
    root: &TreeHandle<K, V>,
    range: &KeyRange<K>,
    kind: ViewKind,
) -> Result<RangeView<K, V>> {
    let span = tree::range_search(
        root,
        range.min.as_ref(),
        range.max.as_ref(),
        range.exclude_min,
        range.exclude_max,
    )?;
    RangeView::new(span, kind)
}

fn tree_iter<K: KeyOrdering, V: ValueCodec>(
    root: &TreeHandle<K, V>,
    kind: ViewKind,
) -> Result<TreeIter<K, V>> {
    let span = tree::range_search(root, None, None, false, false)?;
    TreeIter::new(span.as_ref(), kind)
}

fn tree_state<K: KeyOrdering, V: ValueCodec>(root: &TreeHandle<K, V>) -> Result<Datum> {
    let pin = root.use_node()?;
    let state = pin.body()?.to_state();
    state
}

fn tree_set_state<K: KeyOrdering, V: ValueCodec>(
    root: &TreeHandle<K, V>,
    state: &Datum,
) -> Result<()> {
    let jar = root.jar();
    let pin = root.use_node()?;
    pin.body_mut()?.set_state(state, jar.as_ref())?;
    pin.changed()
}

fn new_tree<K: KeyOrdering, V: ValueCodec>(
    noval: bool,
    config: TreeConfig,
    state: Option<&Datum>,
    jar: Option<Rc<dyn DataManager>>,
) -> Result<TreeHandle<K, V>> {
    let mut body = TreeData::new(noval, config);
    if let Some(state) = state {
        body.set_state(state, jar.as_ref())?;
    }
    Ok(Handle::new(body))
}

fn load_tree<K: KeyOrdering, V: ValueCodec>(
    jar: &MemoryJar,
    oid: Oid,
    kind: NodeKind,
    config: Option<TreeConfig>,
) -> Result<TreeHandle<K, V>> {
    let root: TreeHandle<K, V> = jar.get(oid, kind)?;
    if let Some(config) = config {
        root.unloaded_body_mut()?.set_config(config);
    }
    Ok(root)
}

fn bucket_set<K: KeyOrdering, V: ValueCodec>(
    node: &BucketHandle<K, V>,
    key: K,
    value: Option<V>,
    unique: bool,
) -> Result<SetOutcome> {
    let pin = node.use_node()?;
    let outcome = pin.body_mut()?.set(key, value, unique)?;
    if outcome.is_changed() {
        pin.changed()?;
    }
    Ok(outcome)
}

fn bucket_read<K, V, T, F>(node: &BucketHandle<K, V>, f: F) -> Result<T>
where
    K: KeyOrdering,
    V: ValueCodec,
    F: FnOnce(&BucketData<K, V>) -> Result<T>,
{
    let pin = node.use_node()?;
    let body = pin.body()?;
    let result = f(&body);
    result
}

fn bucket_view<K: KeyOrdering, V: ValueCodec>(
    node: &BucketHandle<K, V>,
    range: &KeyRange<K>,
    kind: ViewKind,
) -> Result<RangeView<K, V>> {
    let offsets = bucket_read(node, |body| {
        body.range_offsets(
            range.min.as_ref(),
            range.max.as_ref(),
            range.exclude_min,
            range.exclude_max,
        )
    })?;
    let span = offsets.map(|(first_offset, last_offset)| Span {
        first: node.clone(),
        first_offset,
        last: node.clone(),
        last_offset,
    });
    RangeView::new(span, kind)
}

fn bucket_iter<K: KeyOrdering, V: ValueCodec>(
    node: &BucketHandle<K, V>,
    kind: ViewKind,
) -> Result<TreeIter<K, V>> {
    let len = bucket_read(node, |body| Ok(body.len()))?;
    let span = len.checked_sub(1).map(|last_offset| Span {
        first: node.clone(),
        first_offset: 0,
        last: node.clone(),
        last_offset,
    });
    TreeIter::new(span.as_ref(), kind)
}

fn new_bucket<K: KeyOrdering, V: ValueCodec>(
    noval: bool,
    state: Option<&Datum>,
    jar: Option<Rc<dyn DataManager>>,
) -> Result<BucketHandle<K, V>> {
    let mut body = BucketData::new(noval);
    if let Some(state) = state {
        body.set_state(state, jar.as_ref())?;
    }
    Ok(Handle::new(body))
}

fn bucket_set_state<K: KeyOrdering, V: ValueCodec>(
    node: &BucketHandle<K, V>,
    state: &Datum,
) -> Result<()> {
    let jar = node.jar();
    let pin = node.use_node()?;
    pin.body_mut()?.set_state(state, jar.as_ref())?;
    pin.changed()
}

fn bucket_clear<K: KeyOrdering, V: ValueCodec>(node: &BucketHandle<K, V>) -> Result<()> {
    let pin = node.use_node()?;
    let was_empty = {
        let mut body = pin.body_mut()?;
        let was_empty = body.is_empty() && body.next.is_none();
        body.clear();
        was_empty
    };
    if !was_empty {
        pin.changed()?;
    }
    Ok(())
}

/// Membership test where a key that cannot be compared is simply absent
fn lenient_contains(result: Result<bool>) -> Result<bool> {
    match result {
        Err(err) if err.is_comparison() => Ok(false),
        other => other,
    }
}

fn is_disjoint<K, V2, F>(other: &dyn MergeSource<K, V2>, mut contains: F) -> Result<bool>
where
    K: KeyOrdering,
    V2: ValueCodec,
    F: FnMut(&K) -> Result<bool>,
{
    for item in other.merge_cursor()? {
        let (key, _) = item?;
        if lenient_contains(contains(&key))? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn keys_only<'a, K, V, W>(iter: TreeIter<K, W>) -> MergeCursor<'a, K, V>
where
    K: KeyOrdering,
    V: ValueCodec,
    W: ValueCodec,
{
    Box::new(
        iter.merge_items()
            .map(|item| item.map(|(key, _)| (key, None))),
    )
}

/// Persistent mapping organized as a B+Tree
#[derive(Debug, Clone)]
pub struct BTree<K: KeyOrdering, V: ValueCodec> {
    root: TreeHandle<K, V>,
}

impl<K: KeyOrdering, V: ValueCodec> Default for BTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyOrdering, V: ValueCodec> BTree<K, V> {
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default())
    }

    pub fn with_config(config: TreeConfig) -> Self {
        Self {
            root: Handle::new(TreeData::new(false, config)),
        }
    }

    pub fn from_handle(root: TreeHandle<K, V>) -> Self {
        Self { root }
    }

    pub fn from_items(items: impl IntoIterator<Item = (K, V)>) -> Result<Self> {
        let tree = Self::new();
        tree.update(items)?;
        Ok(tree)
    }

    /// Rebuild from a state produced by `to_state`
    pub fn from_state(state: &Datum) -> Result<Self> {
        Ok(Self {
            root: new_tree(false, TreeConfig::default(), Some(state), None)?,
        })
    }

    /// Rebuild from a state whose references resolve through `jar`
    pub fn from_state_in(state: &Datum, jar: Rc<dyn DataManager>) -> Result<Self> {
        Ok(Self {
            root: new_tree(false, TreeConfig::default(), Some(state), Some(jar))?,
        })
    }

    /// Stored tree, loaded lazily on first use
    pub fn load(jar: &MemoryJar, oid: Oid) -> Result<Self> {
        Ok(Self {
            root: load_tree(jar, oid, NodeKind::Tree, None)?,
        })
    }

    /// Stored tree with explicit thresholds for nodes loaded from now on
    pub fn load_with_config(jar: &MemoryJar, oid: Oid, config: TreeConfig) -> Result<Self> {
        Ok(Self {
            root: load_tree(jar, oid, NodeKind::Tree, Some(config))?,
        })
    }

    pub fn handle(&self) -> &TreeHandle<K, V> {
        &self.root
    }

    pub fn is_ghost(&self) -> bool {
        self.root.is_ghost()
    }

    pub fn ghostify_if_idle(&self, force: bool) -> bool {
        self.root.ghostify_if_idle(force)
    }

    pub fn to_state(&self) -> Result<Datum> {
        tree_state(&self.root)
    }

    pub fn set_state(&self, state: &Datum) -> Result<()> {
        tree_set_state(&self.root, state)
    }

    pub fn get(&self, key: &K) -> Result<V> {
        tree::get(&self.root, key)
    }

    pub fn get_or(&self, key: &K, default: V) -> Result<V> {
        swallow_not_found(self.get(key), default)
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.has_key(key)? > 0)
    }

    /// Depth at which `key` lives, 0 when absent
    pub fn has_key(&self, key: &K) -> Result<usize> {
        tree::has_key(&self.root, key)
    }

    pub fn set(&self, key: K, value: V) -> Result<()> {
        tree::set(&self.root, &key, Some(value), false)?;
        Ok(())
    }

    /// Insert only if absent; true when the key was added
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        Ok(tree::set(&self.root, &key, Some(value), true)?.changes_size())
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        tree::set(&self.root, key, None, false)?;
        Ok(())
    }

    pub fn pop(&self, key: &K) -> Result<V> {
        let value = self.get(key)?;
        self.remove(key)?;
        Ok(value)
    }

    pub fn pop_or(&self, key: &K, default: V) -> Result<V> {
        swallow_not_found(self.pop(key), default)
    }

    /// Value for `key`, storing `default` first if the key is absent
    pub fn setdefault(&self, key: K, default: V) -> Result<V> {
        match self.get(&key) {
            Err(err) if err.is_key_not_found() => {
                self.set(key, default.clone())?;
                Ok(default)
            }
            other => other,
        }
    }

    /// Remove and return the first item
    pub fn popitem(&self) -> Result<(K, V)> {
        let (key, value) = match self.iter()?.next() {
            Some(entry) => entry?
                .into_item()
                .ok_or_else(|| BTreeError::InvalidState("expected an item".to_string()))?,
            None => return Err(BTreeError::KeyNotFound("popitem(): empty tree".to_string())),
        };
        self.remove(&key)?;
        Ok((key, value))
    }

    pub fn update(&self, items: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        for (key, value) in items {
            self.set(key, value)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        tree::clear(&self.root)
    }

    pub fn len(&self) -> Result<usize> {
        tree::len(&self.root)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(tree::first_bucket(&self.root)?.is_none())
    }

    /// Smallest key, or the smallest key >= `bound`
    pub fn min_key(&self, bound: Option<&K>) -> Result<K> {
        tree::extreme_key(&self.root, bound, true)
    }

    /// Largest key, or the largest key <= `bound`
    pub fn max_key(&self, bound: Option<&K>) -> Result<K> {
        tree::extreme_key(&self.root, bound, false)
    }

    pub fn keys(&self, range: &KeyRange<K>) -> Result<RangeView<K, V>> {
        tree_view(&self.root, range, ViewKind::Keys)
    }

    pub fn values(&self, range: &KeyRange<K>) -> Result<RangeView<K, V>> {
        tree_view(&self.root, range, ViewKind::Values)
    }

    pub fn items(&self, range: &KeyRange<K>) -> Result<RangeView<K, V>> {
        tree_view(&self.root, range, ViewKind::Items)
    }

    /// Forward iterator over all items
    pub fn iter(&self) -> Result<TreeIter<K, V>> {
        tree_iter(&self.root, ViewKind::Items)
    }

    pub fn check(&self) -> Result<()> {
        check::check_structure(&self.root)
    }

    pub fn check_values(&self) -> Result<()> {
        check::check_values(&self.root)
    }

    pub fn conflict_resolve(
        old: Option<&Datum>,
        committed: Option<&Datum>,
        new: Option<&Datum>,
    ) -> Result<Datum> {
        resolve_tree_conflict::<K, V>(false, old, committed, new)
    }
}

impl<K: KeyOrdering, V: WeightedValue> BTree<K, V> {
    /// `(value, key)` pairs with value >= `min`, largest value first.
    /// Values are divided by `min` when it is positive.
    pub fn by_value(&self, min: V) -> Result<Vec<(V, K)>> {
        by_value_items(self.iter()?, min)
    }
}

impl<K: KeyOrdering, V: ValueCodec> MergeSource<K, V> for BTree<K, V> {
    fn uses_values(&self) -> bool {
        true
    }

    fn merge_cursor(&self) -> Result<MergeCursor<'_, K, V>> {
        Ok(Box::new(self.iter()?.merge_items()))
    }
}

/// Persistent sorted set organized as a B+Tree
#[derive(Debug, Clone)]
pub struct TreeSet<K: KeyOrdering> {
    root: TreeHandle<K, ()>,
}

impl<K: KeyOrdering> Default for TreeSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyOrdering> TreeSet<K> {
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default())
    }

    pub fn with_config(config: TreeConfig) -> Self {
        Self {
            root: Handle::new(TreeData::new(true, config)),
        }
    }

    pub fn from_handle(root: TreeHandle<K, ()>) -> Self {
        Self { root }
    }

    pub fn from_keys(keys: impl IntoIterator<Item = K>) -> Result<Self> {
        let set = Self::new();
        set.update(keys)?;
        Ok(set)
    }

    pub fn from_state(state: &Datum) -> Result<Self> {
        Ok(Self {
            root: new_tree(true, TreeConfig::default(), Some(state), None)?,
        })
    }

    pub fn from_state_in(state: &Datum, jar: Rc<dyn DataManager>) -> Result<Self> {
        Ok(Self {
            root: new_tree(true, TreeConfig::default(), Some(state), Some(jar))?,
        })
    }

    pub fn load(jar: &MemoryJar, oid: Oid) -> Result<Self> {
        Ok(Self {
            root: load_tree(jar, oid, NodeKind::TreeSet, None)?,
        })
    }

    pub fn load_with_config(jar: &MemoryJar, oid: Oid, config: TreeConfig) -> Result<Self> {
        Ok(Self {
            root: load_tree(jar, oid, NodeKind::TreeSet, Some(config))?,
        })
    }

    pub fn handle(&self) -> &TreeHandle<K, ()> {
        &self.root
    }

    pub fn is_ghost(&self) -> bool {
        self.root.is_ghost()
    }

    pub fn ghostify_if_idle(&self, force: bool) -> bool {
        self.root.ghostify_if_idle(force)
    }

    pub fn to_state(&self) -> Result<Datum> {
        tree_state(&self.root)
    }

    pub fn set_state(&self, state: &Datum) -> Result<()> {
        tree_set_state(&self.root, state)
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.has_key(key)? > 0)
    }

    pub fn has_key(&self, key: &K) -> Result<usize> {
        tree::has_key(&self.root, key)
    }

    /// True when the key was not already present
    pub fn add(&self, key: K) -> Result<bool> {
        Ok(tree::set(&self.root, &key, Some(()), false)?.changes_size())
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        tree::set(&self.root, key, None, false)?;
        Ok(())
    }

    /// Remove `key` if present; absent or incomparable keys are ignored
    pub fn discard(&self, key: &K) -> Result<()> {
        match self.remove(key) {
            Err(err) if err.is_key_not_found() || err.is_comparison() => Ok(()),
            other => other,
        }
    }

    /// Remove and return the smallest key
    pub fn pop(&self) -> Result<K> {
        let key = match self.min_key(None) {
            Err(BTreeError::Empty) => {
                return Err(BTreeError::KeyNotFound("pop(): empty set".to_string()))
            }
            other => other?,
        };
        self.remove(&key)?;
        Ok(key)
    }

    /// Add every key; returns how many were new
    pub fn update(&self, keys: impl IntoIterator<Item = K>) -> Result<usize> {
        let mut added = 0;
        for key in keys {
            if self.add(key)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn isdisjoint<V2: ValueCodec>(&self, other: &dyn MergeSource<K, V2>) -> Result<bool> {
        is_disjoint(other, |key| self.contains(key))
    }

    pub fn clear(&self) -> Result<()> {
        tree::clear(&self.root)
    }

    pub fn len(&self) -> Result<usize> {
        tree::len(&self.root)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(tree::first_bucket(&self.root)?.is_none())
    }

    pub fn min_key(&self, bound: Option<&K>) -> Result<K> {
        tree::extreme_key(&self.root, bound, true)
    }

    pub fn max_key(&self, bound: Option<&K>) -> Result<K> {
        tree::extreme_key(&self.root, bound, false)
    }

    pub fn keys(&self, range: &KeyRange<K>) -> Result<RangeView<K, ()>> {
        tree_view(&self.root, range, ViewKind::Keys)
    }

    pub fn iter(&self) -> Result<TreeIter<K, ()>> {
        tree_iter(&self.root, ViewKind::Keys)
    }

    pub fn check(&self) -> Result<()> {
        check::check_structure(&self.root)
    }

    pub fn check_values(&self) -> Result<()> {
        check::check_values(&self.root)
    }

    pub fn conflict_resolve(
        old: Option<&Datum>,
        committed: Option<&Datum>,
        new: Option<&Datum>,
    ) -> Result<Datum> {
        resolve_tree_conflict::<K, ()>(true, old, committed, new)
    }
}

impl<K: KeyOrdering, V: ValueCodec> MergeSource<K, V> for TreeSet<K> {
    fn uses_values(&self) -> bool {
        false
    }

    fn merge_cursor(&self) -> Result<MergeCursor<'_, K, V>> {
        Ok(keys_only(self.iter()?))
    }
}

/// Standalone leaf mapping
#[derive(Debug, Clone)]
pub struct Bucket<K: KeyOrdering, V: ValueCodec> {
    node: BucketHandle<K, V>,
}

impl<K: KeyOrdering, V: ValueCodec> Default for Bucket<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyOrdering, V: ValueCodec> Bucket<K, V> {
    pub fn new() -> Self {
        Self {
            node: Handle::new(BucketData::new(false)),
        }
    }

    /// Bucket over already sorted, distinct keys
    pub(crate) fn from_sorted(keys: Vec<K>, values: Vec<V>) -> Self {
        let mut body = BucketData::new(false);
        body.keys = keys;
        body.values = values;
        Self {
            node: Handle::new(body),
        }
    }

    pub fn from_handle(node: BucketHandle<K, V>) -> Self {
        Self { node }
    }

    pub fn from_items(items: impl IntoIterator<Item = (K, V)>) -> Result<Self> {
        let bucket = Self::new();
        bucket.update(items)?;
        Ok(bucket)
    }

    pub fn from_state(state: &Datum) -> Result<Self> {
        Ok(Self {
            node: new_bucket(false, Some(state), None)?,
        })
    }

    pub fn from_state_in(state: &Datum, jar: Rc<dyn DataManager>) -> Result<Self> {
        Ok(Self {
            node: new_bucket(false, Some(state), Some(jar))?,
        })
    }

    pub fn handle(&self) -> &BucketHandle<K, V> {
        &self.node
    }

    pub fn is_ghost(&self) -> bool {
        self.node.is_ghost()
    }

    pub fn ghostify_if_idle(&self, force: bool) -> bool {
        self.node.ghostify_if_idle(force)
    }

    pub fn to_state(&self) -> Result<Datum> {
        bucket_read(&self.node, |body| body.to_state())
    }

    pub fn set_state(&self, state: &Datum) -> Result<()> {
        bucket_set_state(&self.node, state)
    }

    pub fn get(&self, key: &K) -> Result<V> {
        bucket_read(&self.node, |body| body.get(key))
    }

    pub fn get_or(&self, key: &K, default: V) -> Result<V> {
        swallow_not_found(self.get(key), default)
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        bucket_read(&self.node, |body| body.contains(key))
    }

    /// 1 when present, 0 otherwise
    pub fn has_key(&self, key: &K) -> Result<usize> {
        Ok(usize::from(self.contains(key)?))
    }

    pub fn set(&self, key: K, value: V) -> Result<()> {
        bucket_set(&self.node, key, Some(value), false)?;
        Ok(())
    }

    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        Ok(bucket_set(&self.node, key, Some(value), true)?.changes_size())
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        bucket_set(&self.node, key.clone(), None, false)?;
        Ok(())
    }

    pub fn pop(&self, key: &K) -> Result<V> {
        let value = self.get(key)?;
        self.remove(key)?;
        Ok(value)
    }

    pub fn pop_or(&self, key: &K, default: V) -> Result<V> {
        swallow_not_found(self.pop(key), default)
    }

    pub fn setdefault(&self, key: K, default: V) -> Result<V> {
        match self.get(&key) {
            Err(err) if err.is_key_not_found() => {
                self.set(key, default.clone())?;
                Ok(default)
            }
            other => other,
        }
    }

    pub fn popitem(&self) -> Result<(K, V)> {
        let first = bucket_read(&self.node, |body| {
            if body.is_empty() {
                return Ok(None);
            }
            Ok(Some((body.key_at(0)?, body.value_at(0)?)))
        })?;
        let (key, value) =
            first.ok_or_else(|| BTreeError::KeyNotFound("popitem(): empty bucket".to_string()))?;
        self.remove(&key)?;
        Ok((key, value))
    }

    pub fn update(&self, items: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        for (key, value) in items {
            self.set(key, value)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        bucket_clear(&self.node)
    }

    pub fn len(&self) -> Result<usize> {
        bucket_read(&self.node, |body| Ok(body.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn min_key(&self, bound: Option<&K>) -> Result<K> {
        bucket_read(&self.node, |body| body.extreme_key(bound, true))
    }

    pub fn max_key(&self, bound: Option<&K>) -> Result<K> {
        bucket_read(&self.node, |body| body.extreme_key(bound, false))
    }

    pub fn keys(&self, range: &KeyRange<K>) -> Result<RangeView<K, V>> {
        bucket_view(&self.node, range, ViewKind::Keys)
    }

    pub fn values(&self, range: &KeyRange<K>) -> Result<RangeView<K, V>> {
        bucket_view(&self.node, range, ViewKind::Values)
    }

    pub fn items(&self, range: &KeyRange<K>) -> Result<RangeView<K, V>> {
        bucket_view(&self.node, range, ViewKind::Items)
    }

    pub fn iter(&self) -> Result<TreeIter<K, V>> {
        bucket_iter(&self.node, ViewKind::Items)
    }

    pub fn conflict_resolve(
        old: Option<&Datum>,
        committed: Option<&Datum>,
        new: Option<&Datum>,
    ) -> Result<Datum> {
        resolve_bucket_conflict::<K, V>(false, old, committed, new)
    }
}

impl<K: KeyOrdering, V: WeightedValue> Bucket<K, V> {
    pub fn by_value(&self, min: V) -> Result<Vec<(V, K)>> {
        by_value_items(self.iter()?, min)
    }
}

impl<K: KeyOrdering, V: ValueCodec> MergeSource<K, V> for Bucket<K, V> {
    fn uses_values(&self) -> bool {
        true
    }

    fn merge_cursor(&self) -> Result<MergeCursor<'_, K, V>> {
        Ok(Box::new(self.iter()?.merge_items()))
    }
}

/// Standalone leaf set
#[derive(Debug, Clone)]
pub struct Set<K: KeyOrdering> {
    node: BucketHandle<K, ()>,
}

impl<K: KeyOrdering> Default for Set<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyOrdering> Set<K> {
    pub fn new() -> Self {
        Self {
            node: Handle::new(BucketData::new(true)),
        }
    }

    pub(crate) fn from_sorted(keys: Vec<K>) -> Self {
        let mut body = BucketData::new(true);
        body.keys = keys;
        Self {
            node: Handle::new(body),
        }
    }

    pub fn from_handle(node: BucketHandle<K, ()>) -> Self {
        Self { node }
    }

    pub fn from_keys(keys: impl IntoIterator<Item = K>) -> Result<Self> {
        let set = Self::new();
        set.update(keys)?;
        Ok(set)
    }

    pub fn from_state(state: &Datum) -> Result<Self> {
        Ok(Self {
            node: new_bucket(true, Some(state), None)?,
        })
    }

    pub fn from_state_in(state: &Datum, jar: Rc<dyn DataManager>) -> Result<Self> {
        Ok(Self {
            node: new_bucket(true, Some(state), Some(jar))?,
        })
    }

    pub fn handle(&self) -> &BucketHandle<K, ()> {
        &self.node
    }

    pub fn is_ghost(&self) -> bool {
        self.node.is_ghost()
    }

    pub fn ghostify_if_idle(&self, force: bool) -> bool {
        self.node.ghostify_if_idle(force)
    }

    pub fn to_state(&self) -> Result<Datum> {
        bucket_read(&self.node, |body| body.to_state())
    }

    pub fn set_state(&self, state: &Datum) -> Result<()> {
        bucket_set_state(&self.node, state)
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        bucket_read(&self.node, |body| body.contains(key))
    }

    pub fn has_key(&self, key: &K) -> Result<usize> {
        Ok(usize::from(self.contains(key)?))
    }

    pub fn add(&self, key: K) -> Result<bool> {
        Ok(bucket_set(&self.node, key, Some(()), false)?.changes_size())
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        bucket_set(&self.node, key.clone(), None, false)?;
        Ok(())
    }

    pub fn discard(&self, key: &K) -> Result<()> {
        match self.remove(key) {
            Err(err) if err.is_key_not_found() || err.is_comparison() => Ok(()),
            other => other,
        }
    }

    pub fn pop(&self) -> Result<K> {
        let key = match self.min_key(None) {
            Err(BTreeError::Empty) => {
                return Err(BTreeError::KeyNotFound("pop(): empty set".to_string()))
            }
            other => other?,
        };
        self.remove(&key)?;
        Ok(key)
    }

    pub fn update(&self, keys: impl IntoIterator<Item = K>) -> Result<usize> {
        let mut added = 0;
        for key in keys {
            if self.add(key)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn isdisjoint<V2: ValueCodec>(&self, other: &dyn MergeSource<K, V2>) -> Result<bool> {
        is_disjoint(other, |key| self.contains(key))
    }

    pub fn clear(&self) -> Result<()> {
        bucket_clear(&self.node)
    }

    pub fn len(&self) -> Result<usize> {
        bucket_read(&self.node, |body| Ok(body.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn min_key(&self, bound: Option<&K>) -> Result<K> {
        bucket_read(&self.node, |body| body.extreme_key(bound, true))
    }

    pub fn max_key(&self, bound: Option<&K>) -> Result<K> {
        bucket_read(&self.node, |body| body.extreme_key(bound, false))
    }

    pub fn keys(&self, range: &KeyRange<K>) -> Result<RangeView<K, ()>> {
        bucket_view(&self.node, range, ViewKind::Keys)
    }

    pub fn iter(&self) -> Result<TreeIter<K, ()>> {
        bucket_iter(&self.node, ViewKind::Keys)
    }

    pub fn conflict_resolve(
        old: Option<&Datum>,
        committed: Option<&Datum>,
        new: Option<&Datum>,
    ) -> Result<Datum> {
        resolve_bucket_conflict::<K, ()>(true, old, committed, new)
    }
}

impl<K: KeyOrdering, V: ValueCodec> MergeSource<K, V> for Set<K> {
    fn uses_values(&self) -> bool {
        false
    }

    fn merge_cursor(&self) -> Result<MergeCursor<'_, K, V>> {
        Ok(keys_only(self.iter()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Object;
    use pretty_assertions::assert_eq;

    fn small_tree() -> BTree<i32, i32> {
        BTree::with_config(TreeConfig::new(Some(3), Some(3)))
    }

    #[test]
    fn test_mapping_convenience_wrappers() -> anyhow::Result<()> {
        let tree = small_tree();
        tree.update((0..20).map(|k| (k, k * 10)))?;

        assert_eq!(tree.get_or(&5, -1)?, 50);
        assert_eq!(tree.get_or(&50, -1)?, -1);
        assert_eq!(tree.pop(&5)?, 50);
        assert_eq!(tree.pop_or(&5, -1)?, -1);
        assert!(tree.pop(&5).unwrap_err().is_key_not_found());
        assert_eq!(tree.setdefault(5, 7)?, 7);
        assert_eq!(tree.setdefault(5, 8)?, 7);
        assert!(!tree.insert(5, 9)?);
        assert_eq!(tree.get(&5)?, 7);

        assert_eq!(tree.popitem()?, (0, 0));
        assert_eq!(tree.len()?, 19);
        tree.check()?;
        tree.check_values()?;
        Ok(())
    }

    #[test]
    fn test_popitem_on_empty_containers() {
        assert!(BTree::<i32, i32>::new().popitem().unwrap_err().is_key_not_found());
        assert!(Bucket::<i32, i32>::new().popitem().unwrap_err().is_key_not_found());
        assert!(TreeSet::<i32>::new().pop().unwrap_err().is_key_not_found());
    }

    #[test]
    fn test_has_key_reports_depth() -> anyhow::Result<()> {
        let tree = small_tree();
        tree.set(1, 1)?;
        assert_eq!(tree.has_key(&1)?, 2);
        assert_eq!(tree.has_key(&2)?, 0);
        tree.update((2..40).map(|k| (k, k)))?;
        assert!(tree.has_key(&39)? > 2);

        let bucket = Bucket::from_items([(1, 1)])?;
        assert_eq!(bucket.has_key(&1)?, 1);
        assert_eq!(bucket.has_key(&2)?, 0);
        Ok(())
    }

    #[test]
    fn test_discard_is_idempotent_and_lenient() -> anyhow::Result<()> {
        let set = TreeSet::from_keys([Object::from(1), Object::from(2)])?;
        set.discard(&Object::from(1))?;
        set.discard(&Object::from(1))?;
        set.discard(&Object::from("text"))?;
        assert_eq!(set.len()?, 1);

        let leaf = Set::from_keys([3, 4])?;
        leaf.discard(&3)?;
        leaf.discard(&3)?;
        assert_eq!(leaf.keys(&KeyRange::all())?.to_keys()?, vec![4]);
        Ok(())
    }

    #[test]
    fn test_isdisjoint_ignores_incomparable_keys() -> anyhow::Result<()> {
        let set = TreeSet::from_keys([Object::from(1), Object::from(2)])?;
        let other = Set::from_keys([Object::from("a"), Object::from("b")])?;
        assert!(set.isdisjoint::<()>(&other)?);
        let overlapping = Set::from_keys([Object::from(2)])?;
        assert!(!set.isdisjoint::<()>(&overlapping)?);
        Ok(())
    }

    #[test]
    fn test_by_value_sorts_descending_and_normalizes() -> anyhow::Result<()> {
        let tree = BTree::<i32, i64>::from_items([(1, 10), (2, 40), (3, 20), (4, 40), (5, 5)])?;
        assert_eq!(tree.by_value(10)?, vec![(4, 4), (4, 2), (2, 3), (1, 1)]);
        assert_eq!(tree.by_value(0)?.len(), 5);
        assert_eq!(tree.by_value(0)?[0], (40, 4));
        assert_eq!(tree.by_value(-3)?.last(), Some(&(5, 5)));

        let bucket = Bucket::<i32, f64>::from_items([(1, 1.0), (2, 3.0)])?;
        assert_eq!(bucket.by_value(2.0)?, vec![(1.5, 2)]);
        Ok(())
    }

    #[test]
    fn test_bucket_ranges_and_extremes() -> anyhow::Result<()> {
        let bucket = Bucket::from_items((0..10).map(|k| (k, k * k)))?;
        let view = bucket.items(&KeyRange::between(3, 6).exclude_max())?;
        assert_eq!(view.to_items()?, vec![(3, 9), (4, 16), (5, 25)]);
        assert_eq!(bucket.min_key(Some(&4))?, 4);
        assert_eq!(bucket.max_key(None)?, 9);
        assert!(matches!(bucket.max_key(Some(&-1)), Err(BTreeError::NoKeyInRange)));
        bucket.clear()?;
        assert!(matches!(bucket.min_key(None), Err(BTreeError::Empty)));
        Ok(())
    }

    #[test]
    fn test_state_roundtrip_for_leaves() -> anyhow::Result<()> {
        let set = Set::from_keys([3, 1, 2])?;
        let copy = Set::<i32>::from_state(&set.to_state()?)?;
        assert_eq!(copy.keys(&KeyRange::all())?.to_keys()?, vec![1, 2, 3]);

        let bucket = Bucket::from_items([(1, 2)])?;
        let copy = Bucket::<i32, i32>::from_state(&bucket.to_state()?)?;
        assert_eq!(copy.get(&1)?, 2);
        Ok(())
    }

    #[test]
    fn test_load_with_config_applies_to_loaded_nodes() -> anyhow::Result<()> {
        let jar = MemoryJar::new();
        let tree = small_tree();
        tree.update((0..30).map(|k| (k, k)))?;
        let oid = jar.add(tree.handle())?;
        jar.commit()?;

        let reopened = jar.reopen();
        let config = TreeConfig::new(Some(3), Some(3));
        let loaded = BTree::<i32, i32>::load_with_config(&reopened, oid, config)?;
        loaded.update((30..60).map(|k| (k, k)))?;
        loaded.check()?;
        assert_eq!(loaded.len()?, 60);
        Ok(())
    }
}
