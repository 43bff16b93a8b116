// Tree - interior node of a B+Tree
// `data[0].key` is unused; for child i every key in its subtree lies in
// [data[i].key, data[i+1].key). All children of one node have the same kind
// and `first_bucket` caches the leftmost bucket below the node.

use std::cell::Cell;
use std::cmp::Ordering;
use std::rc::Rc;

use tracing::{debug, trace};

use super::bucket::{
    bucket_len, first_key, key_at_offset, next_bucket, previous_bucket, split_bucket,
    unlink_next, BucketData, BucketHandle,
};
use super::items::Span;
use crate::config::{Limits, TreeConfig};
use crate::contracts::{KeyOrdering, ValueCodec};
use crate::error::{BTreeError, Result};
use crate::observability::{record_metric, MetricType};
use crate::persistence::{DataManager, Handle, NodeBody, Pinned};
use crate::state::{Datum, NodeKind};

pub type TreeHandle<K, V> = Handle<TreeData<K, V>>;

/// Child slot of an interior node
pub enum Child<K, V> {
    Tree(TreeHandle<K, V>),
    Bucket(BucketHandle<K, V>),
}

impl<K, V> Clone for Child<K, V> {
    fn clone(&self) -> Self {
        match self {
            Child::Tree(tree) => Child::Tree(tree.clone()),
            Child::Bucket(bucket) => Child::Bucket(bucket.clone()),
        }
    }
}

impl<K: KeyOrdering, V: ValueCodec> Child<K, V> {
    pub fn is_tree(&self) -> bool {
        matches!(self, Child::Tree(_))
    }

    /// Number of children (trees) or keys (buckets)
    pub(crate) fn len(&self) -> Result<usize> {
        match self {
            Child::Tree(tree) => {
                let pin = tree.use_node()?;
                let len = pin.body()?.data.len();
                Ok(len)
            }
            Child::Bucket(bucket) => bucket_len(bucket),
        }
    }

    pub(crate) fn first_bucket(&self) -> Result<Option<BucketHandle<K, V>>> {
        match self {
            Child::Tree(tree) => {
                let pin = tree.use_node()?;
                let first = pin.body()?.first_bucket.clone();
                Ok(first)
            }
            Child::Bucket(bucket) => Ok(Some(bucket.clone())),
        }
    }

    /// Rightmost bucket reachable through child pointers
    pub(crate) fn last_bucket(&self) -> Result<BucketHandle<K, V>> {
        let mut child = self.clone();
        loop {
            match child {
                Child::Bucket(bucket) => return Ok(bucket),
                Child::Tree(tree) => {
                    let pin = tree.use_node()?;
                    let last = pin.body()?.data.last().map(|item| item.child.clone());
                    child = last.ok_or(BTreeError::IndexOutOfRange(-1))?;
                }
            }
        }
    }

    fn to_datum(&self) -> Datum {
        match self {
            Child::Tree(tree) => Datum::Node(tree.object_ref()),
            Child::Bucket(bucket) => Datum::Node(bucket.object_ref()),
        }
    }
}

pub struct TreeItem<K, V> {
    pub(crate) key: Option<K>,
    pub(crate) child: Child<K, V>,
}

pub struct TreeData<K, V> {
    pub(crate) data: Vec<TreeItem<K, V>>,
    pub(crate) first_bucket: Option<BucketHandle<K, V>>,
    pub(crate) noval: bool,
    pub(crate) config: TreeConfig,
    limits: Cell<Option<Limits>>,
}

/// How a tree-level set changed the subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatus {
    /// Key count unchanged (the key existed, or a value was replaced)
    Unchanged,
    Resized,
    /// A delete removed the subtree's first bucket; the bucket before it
    /// still has to be relinked by an ancestor
    FirstBucketGone,
}

impl SetStatus {
    pub fn changes_size(self) -> bool {
        self != SetStatus::Unchanged
    }
}

impl<K, V> TreeData<K, V> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop the first bucket reference, then children left to right
    pub(crate) fn clear_items(&mut self) {
        self.first_bucket = None;
        let data = std::mem::take(&mut self.data);
        for item in data {
            drop(item);
        }
    }
}

impl<K: KeyOrdering, V: ValueCodec> TreeData<K, V> {
    pub fn new(noval: bool, config: TreeConfig) -> Self {
        Self {
            data: Vec::new(),
            first_bucket: None,
            noval,
            config,
            limits: Cell::new(None),
        }
    }

    /// Replace the configuration; cached thresholds are recomputed
    pub(crate) fn set_config(&mut self, config: TreeConfig) {
        self.config = config;
        self.limits.set(None);
    }

    /// Fanout thresholds, resolved on first use
    pub(crate) fn limits(&self) -> Limits {
        match self.limits.get() {
            Some(limits) => limits,
            None => {
                let limits = self.config.limits::<K, V>();
                self.limits.set(Some(limits));
                limits
            }
        }
    }

    pub(crate) fn separator(&self, index: usize) -> Result<&K> {
        self.data
            .get(index)
            .and_then(|item| item.key.as_ref())
            .ok_or_else(|| {
                BTreeError::StructuralInvariant(format!("missing separator key in slot {index}"))
            })
    }

    /// Child index `i` with `data[i].key <= key < data[i+1].key`. Slot 0 is
    /// never compared. The node must not be empty.
    pub(crate) fn search(&self, key: &K) -> Result<usize> {
        let (mut lo, mut hi) = (0, self.data.len());
        let mut i = hi / 2;
        while i > lo {
            match self.separator(i)?.compare(key)? {
                Ordering::Less => lo = i,
                Ordering::Greater => hi = i,
                Ordering::Equal => break,
            }
            i = (lo + hi) / 2;
        }
        Ok(i)
    }

    fn child_kind(&self) -> NodeKind {
        self.kind().leaf_kind()
    }

    fn sibling(&self, data: Vec<TreeItem<K, V>>, first_bucket: Option<BucketHandle<K, V>>) -> Self {
        Self {
            data,
            first_bucket,
            noval: self.noval,
            config: self.config,
            limits: Cell::new(None),
        }
    }

    fn resolve_child(&self, entry: &Datum, jar: Option<&Rc<dyn DataManager>>) -> Result<Child<K, V>> {
        if let Datum::Tuple(_) = entry {
            let mut bucket = BucketData::new(self.noval);
            bucket.set_state(entry, jar)?;
            return Ok(Child::Bucket(Handle::new(bucket)));
        }
        match BucketHandle::<K, V>::reference_kind(entry) {
            Some(kind) if kind == self.kind() => {
                let tree = TreeHandle::<K, V>::resolve(entry, jar)?;
                tree.unloaded_body_mut()?.set_config(self.config);
                Ok(Child::Tree(tree))
            }
            Some(kind) if kind == self.child_kind() => {
                Ok(Child::Bucket(BucketHandle::<K, V>::resolve(entry, jar)?))
            }
            _ => Err(BTreeError::InvalidState(format!(
                "tree child {} is neither {:?} nor {:?}",
                entry.type_name(),
                self.kind(),
                self.child_kind()
            ))),
        }
    }
}

impl<K: KeyOrdering, V: ValueCodec> NodeBody for TreeData<K, V> {
    fn empty(kind: NodeKind) -> Self {
        TreeData::new(kind == NodeKind::TreeSet, TreeConfig::default())
    }

    fn kind(&self) -> NodeKind {
        if self.noval {
            NodeKind::TreeSet
        } else {
            NodeKind::Tree
        }
    }

    /// `None`, `((bucket_state,),)` for a lone bucket without an oid, or
    /// `((child_0, key_1, child_1, ...), first_bucket)`
    fn to_state(&self) -> Result<Datum> {
        if self.data.is_empty() {
            return Ok(Datum::None);
        }

        if let [TreeItem {
            child: Child::Bucket(bucket),
            ..
        }] = self.data.as_slice()
        {
            if bucket.oid().is_none() {
                let pin = bucket.use_node()?;
                let state = pin.body()?.to_state()?;
                return Ok(Datum::tuple(vec![Datum::tuple(vec![state])]));
            }
        }

        let mut items = Vec::new();
        items.try_reserve_exact(self.data.len() * 2 - 1)?;
        for (index, item) in self.data.iter().enumerate() {
            if index > 0 {
                items.push(self.separator(index)?.to_datum());
            }
            items.push(item.child.to_datum());
        }
        let first = self.first_bucket.as_ref().ok_or_else(|| {
            BTreeError::StructuralInvariant("non-empty tree has no first bucket".to_string())
        })?;
        Ok(Datum::tuple(vec![
            Datum::Tuple(items),
            Datum::Node(first.object_ref()),
        ]))
    }

    fn set_state(&mut self, state: &Datum, jar: Option<&Rc<dyn DataManager>>) -> Result<()> {
        self.clear_items();
        if state.is_none() {
            return Ok(());
        }

        let parts = state.as_tuple().ok_or_else(|| {
            BTreeError::InvalidState("tree state must be None or a tuple".to_string())
        })?;
        let (items, first) = match parts {
            [items] => (items, None),
            [items, first] => (items, Some(first)),
            _ => {
                return Err(BTreeError::InvalidState(
                    "tree state must have one or two elements".to_string(),
                ))
            }
        };
        let items = items.as_tuple().ok_or_else(|| {
            BTreeError::InvalidState("tuple required for first state element".to_string())
        })?;
        if items.is_empty() {
            return Err(BTreeError::InvalidState(
                "non-empty tree state has no children".to_string(),
            ));
        }

        let len = (items.len() + 1) / 2;
        let mut data = Vec::new();
        data.try_reserve_exact(len)?;
        let mut entries = items.iter();
        for index in 0..len {
            let key = if index > 0 {
                let datum = entries.next().ok_or_else(|| {
                    BTreeError::InvalidState("tree state ends after a key".to_string())
                })?;
                Some(K::from_datum(datum)?)
            } else {
                None
            };
            let entry = entries.next().ok_or_else(|| {
                BTreeError::InvalidState("tree state ends after a key".to_string())
            })?;
            let child = self.resolve_child(entry, jar)?;
            data.push(TreeItem { key, child });
        }

        let first_bucket = match first {
            Some(first) => {
                if BucketHandle::<K, V>::reference_kind(first) != Some(self.child_kind()) {
                    return Err(BTreeError::InvalidState(
                        "No firstbucket in non-empty BTree".to_string(),
                    ));
                }
                BucketHandle::<K, V>::resolve(first, jar)?
            }
            None => match &data[0].child {
                Child::Bucket(bucket) => bucket.clone(),
                Child::Tree(_) => {
                    return Err(BTreeError::InvalidState(
                        "No firstbucket in non-empty BTree".to_string(),
                    ))
                }
            },
        };

        self.data = data;
        self.first_bucket = Some(first_bucket);
        Ok(())
    }

    fn clear(&mut self) {
        self.clear_items();
        self.limits.set(None);
    }
}

/// Bucket, offset and depth of `key`, or `None` when it is absent
pub(crate) fn locate<K: KeyOrdering, V: ValueCodec>(
    tree: &TreeHandle<K, V>,
    key: &K,
) -> Result<Option<(BucketHandle<K, V>, usize, usize)>> {
    let mut node = tree.clone();
    let mut depth = 1;
    loop {
        let pin = node.use_node()?;
        let child = {
            let body = pin.body()?;
            if body.data.is_empty() {
                return Ok(None);
            }
            let index = body.search(key)?;
            body.data[index].child.clone()
        };
        drop(pin);
        depth += 1;

        match child {
            Child::Tree(subtree) => node = subtree,
            Child::Bucket(bucket) => {
                let (index, found) = {
                    let leaf = bucket.use_node()?;
                    let found = leaf.body()?.search(key)?;
                    found
                };
                return Ok(found.then_some((bucket, index, depth)));
            }
        }
    }
}

pub(crate) fn get<K: KeyOrdering, V: ValueCodec>(tree: &TreeHandle<K, V>, key: &K) -> Result<V> {
    match locate(tree, key)? {
        Some((bucket, index, _)) => {
            let leaf = bucket.use_node()?;
            let value = leaf.body()?.value_at(index);
            value
        }
        None => Err(BTreeError::not_found(key)),
    }
}

/// Depth at which `key` was found, 0 when absent
pub(crate) fn has_key<K: KeyOrdering, V: ValueCodec>(tree: &TreeHandle<K, V>, key: &K) -> Result<usize> {
    Ok(locate(tree, key)?.map_or(0, |(_, _, depth)| depth))
}

/// Insert, replace (`value` is `Some`) or delete (`None`) a key
pub(crate) fn set<K: KeyOrdering, V: ValueCodec>(
    tree: &TreeHandle<K, V>,
    key: &K,
    value: Option<V>,
    unique: bool,
) -> Result<SetStatus> {
    let pin = tree.use_node()?;
    set_pinned(&pin, key, value, unique)
}

fn set_pinned<K: KeyOrdering, V: ValueCodec>(
    pin: &Pinned<TreeData<K, V>>,
    key: &K,
    value: Option<V>,
    unique: bool,
) -> Result<SetStatus> {
    let was_empty = pin.body()?.data.is_empty();
    let result = set_in_node(pin, key, value, unique, was_empty);
    if result.is_err() && was_empty {
        // growing an empty tree adds an empty bucket; never leave it behind
        if let Ok(mut body) = pin.body_mut() {
            body.clear_items();
        }
    }
    result
}

fn set_in_node<K: KeyOrdering, V: ValueCodec>(
    pin: &Pinned<TreeData<K, V>>,
    key: &K,
    value: Option<V>,
    unique: bool,
    was_empty: bool,
) -> Result<SetStatus> {
    let inserting = value.is_some();
    let mut changed = false;

    if was_empty {
        if !inserting {
            return Err(BTreeError::not_found(key));
        }
        grow(pin, 0)?;
    }

    let (min, child) = {
        let body = pin.body()?;
        let min = body.search(key)?;
        (min, body.data[min].child.clone())
    };

    let mut status = match &child {
        Child::Tree(subtree) => {
            let node = subtree.use_node()?;
            set_pinned(&node, key, value, unique)?
        }
        Child::Bucket(bucket) => {
            let leaf = bucket.use_node()?;
            let outcome = leaf.body_mut()?.set(key.clone(), value, unique)?;
            if outcome.is_changed() {
                leaf.changed()?;
                // a lone bucket without an oid is stored inside our state
                if bucket.oid().is_none() && pin.body()?.data.len() == 1 {
                    changed = true;
                }
            }
            if outcome.changes_size() {
                SetStatus::Resized
            } else {
                SetStatus::Unchanged
            }
        }
    };

    if status == SetStatus::Unchanged {
        return finish(pin, changed, status);
    }
    let child_len = child.len()?;

    if inserting {
        let limits = pin.body()?.limits();
        let max = if child.is_tree() {
            limits.internal
        } else {
            limits.leaf
        };
        if child_len > max {
            grow(pin, min)?;
            changed = true;
        }
        return finish(pin, changed, status);
    }

    // Deletes never rebalance: repair what the child left behind and drop
    // the child once it is empty.
    if min > 0 && child_len > 0 {
        let stale = pin.body()?.separator(min)?.compare(key)? == Ordering::Equal;
        if stale {
            let bucket = child.first_bucket()?.ok_or_else(|| {
                BTreeError::StructuralInvariant("non-empty child has no first bucket".to_string())
            })?;
            let replacement = first_key(&bucket)?;
            pin.body_mut()?.data[min].key = Some(replacement);
            changed = true;
        }
    }

    if status == SetStatus::FirstBucketGone {
        if min > 0 {
            let previous = pin.body()?.data[min - 1].child.clone();
            unlink_after(&previous)?;
            status = SetStatus::Resized;
        } else {
            let first = child.first_bucket()?;
            pin.body_mut()?.first_bucket = first;
            changed = true;
        }
    }

    if child_len > 0 {
        return finish(pin, changed, status);
    }

    if let Child::Bucket(bucket) = &child {
        if min > 0 {
            let previous = pin.body()?.data[min - 1].child.clone();
            unlink_after(&previous)?;
        } else {
            let next = next_bucket(bucket)?;
            pin.body_mut()?.first_bucket = next;
            status = SetStatus::FirstBucketGone;
        }
    }

    {
        let mut body = pin.body_mut()?;
        body.data.remove(min);
        if min == 0 {
            if let Some(first) = body.data.first_mut() {
                first.key = None;
            }
        }
    }
    finish(pin, true, status)
}

fn finish<K: KeyOrdering, V: ValueCodec>(
    pin: &Pinned<TreeData<K, V>>,
    changed: bool,
    status: SetStatus,
) -> Result<SetStatus> {
    if changed {
        pin.changed()?;
    }
    Ok(status)
}

/// Unlink the bucket that follows the last bucket of `child`
fn unlink_after<K: KeyOrdering, V: ValueCodec>(child: &Child<K, V>) -> Result<()> {
    let last = child.last_bucket()?;
    let leaf = last.use_node()?;
    unlink_next(&leaf)
}

/// Split `data[index].child` (or add the first bucket of an empty node)
fn grow<K: KeyOrdering, V: ValueCodec>(pin: &Pinned<TreeData<K, V>>, index: usize) -> Result<()> {
    let (noval, empty) = {
        let body = pin.body()?;
        (body.noval, body.data.is_empty())
    };
    if empty {
        let bucket = Handle::new(BucketData::new(noval));
        let mut body = pin.body_mut()?;
        body.data.try_reserve(1)?;
        body.data.push(TreeItem {
            key: None,
            child: Child::Bucket(bucket.clone()),
        });
        body.first_bucket = Some(bucket);
        return Ok(());
    }

    let child = pin.body()?.data[index].child.clone();
    pin.body_mut()?.data.try_reserve(1)?;
    let (separator, sibling) = match &child {
        Child::Bucket(bucket) => {
            let leaf = bucket.use_node()?;
            let sibling = split_bucket(&leaf, None)?;
            (first_key(&sibling)?, Child::Bucket(sibling))
        }
        Child::Tree(subtree) => {
            let node = subtree.use_node()?;
            let sibling = split_tree(&node, None)?;
            (take_first_separator(&sibling)?, Child::Tree(sibling))
        }
    };

    let (len, limits) = {
        let mut body = pin.body_mut()?;
        body.data.insert(
            index + 1,
            TreeItem {
                key: Some(separator),
                child: sibling,
            },
        );
        (body.data.len(), body.limits())
    };
    trace!(index, children = len, "Split child node");
    record_metric(MetricType::Counter {
        name: "btree.splits",
        value: 1,
    });

    if len >= limits.internal * 2 {
        split_root(pin)?;
    }
    Ok(())
}

/// Move the children from `index` on (midpoint when out of range) into a
/// new sibling node
fn split_tree<K: KeyOrdering, V: ValueCodec>(
    pin: &Pinned<TreeData<K, V>>,
    index: Option<usize>,
) -> Result<TreeHandle<K, V>> {
    let sibling = {
        let mut body = pin.body_mut()?;
        let len = body.data.len();
        let index = match index {
            Some(index) if index < len => index,
            _ => len / 2,
        };
        if index == 0 || index >= len {
            return Err(BTreeError::StructuralInvariant(
                "split creates empty tree".to_string(),
            ));
        }
        let first_bucket = body.data[index].child.first_bucket()?;
        let mut moved = Vec::new();
        moved.try_reserve_exact(len - index)?;
        moved.extend(body.data.drain(index..));
        body.sibling(moved, first_bucket)
    };
    pin.changed()?;
    Ok(Handle::new(sibling))
}

fn take_first_separator<K: KeyOrdering, V: ValueCodec>(tree: &TreeHandle<K, V>) -> Result<K> {
    let pin = tree.use_node()?;
    let key = pin
        .body_mut()?
        .data
        .first_mut()
        .and_then(|item| item.key.take());
    key.ok_or_else(|| BTreeError::StructuralInvariant("split sibling has no separator".to_string()))
}

/// Move the root's content into a new child and split that child. The root
/// keeps its identity.
fn split_root<K: KeyOrdering, V: ValueCodec>(pin: &Pinned<TreeData<K, V>>) -> Result<()> {
    {
        let mut body = pin.body_mut()?;
        let mut data = Vec::new();
        data.try_reserve_exact(2)?;
        let content = std::mem::take(&mut body.data);
        let child = body.sibling(content, body.first_bucket.clone());
        data.push(TreeItem {
            key: None,
            child: Child::Tree(Handle::new(child)),
        });
        body.data = data;
    }
    debug!("Split root node");
    record_metric(MetricType::Counter {
        name: "btree.root_splits",
        value: 1,
    });
    grow(pin, 0)
}

pub(crate) fn first_bucket<K: KeyOrdering, V: ValueCodec>(
    tree: &TreeHandle<K, V>,
) -> Result<Option<BucketHandle<K, V>>> {
    let pin = tree.use_node()?;
    let first = pin.body()?.first_bucket.clone();
    Ok(first)
}

/// Rightmost bucket of a non-empty tree
pub(crate) fn last_bucket<K: KeyOrdering, V: ValueCodec>(
    tree: &TreeHandle<K, V>,
) -> Result<BucketHandle<K, V>> {
    Child::Tree(tree.clone()).last_bucket()
}

/// Number of keys, summed over the bucket chain
pub(crate) fn len<K: KeyOrdering, V: ValueCodec>(tree: &TreeHandle<K, V>) -> Result<usize> {
    let mut total = 0;
    let mut current = first_bucket(tree)?;
    while let Some(bucket) = current {
        let pin = bucket.use_node()?;
        let body = pin.body()?;
        total += body.len();
        current = body.next.clone();
    }
    Ok(total)
}

pub(crate) fn clear<K: KeyOrdering, V: ValueCodec>(tree: &TreeHandle<K, V>) -> Result<()> {
    let pin = tree.use_node()?;
    let was_empty = {
        let mut body = pin.body_mut()?;
        let was_empty = body.data.is_empty();
        body.clear_items();
        was_empty
    };
    if !was_empty {
        pin.changed()?;
    }
    Ok(())
}

/// Bucket and offset of the smallest key >= `key` (`low`) or the largest
/// key <= `key`. Stale separators left by deletes mean the landing bucket
/// may hold no such key; then the search continues in the next bucket (low
/// end) or the last bucket left of the deepest leftward turn (high end).
pub(crate) fn find_range_end<K: KeyOrdering, V: ValueCodec>(
    tree: &TreeHandle<K, V>,
    key: &K,
    low: bool,
    exclude_equal: bool,
) -> Result<Option<(BucketHandle<K, V>, usize)>> {
    let mut node = tree.clone();
    let mut deepest_smaller: Option<Child<K, V>> = None;
    let bucket = loop {
        let pin = node.use_node()?;
        let (child, smaller) = {
            let body = pin.body()?;
            if body.data.is_empty() {
                return Ok(None);
            }
            let index = body.search(key)?;
            let smaller = (index > 0).then(|| body.data[index - 1].child.clone());
            (body.data[index].child.clone(), smaller)
        };
        drop(pin);
        if smaller.is_some() {
            deepest_smaller = smaller;
        }
        match child {
            Child::Tree(subtree) => node = subtree,
            Child::Bucket(bucket) => break bucket,
        }
    };

    let offset = {
        let leaf = bucket.use_node()?;
        let offset = leaf.body()?.find_range_end(key, low, exclude_equal)?;
        offset
    };
    if let Some(offset) = offset {
        return Ok(Some((bucket, offset)));
    }

    if low {
        return Ok(next_bucket(&bucket)?.map(|next| (next, 0)));
    }
    match deepest_smaller {
        Some(child) => {
            let bucket = child.last_bucket()?;
            let len = bucket_len(&bucket)?;
            Ok(len.checked_sub(1).map(|offset| (bucket, offset)))
        }
        None => Ok(None),
    }
}

/// Inclusive bucket span selected by optional bounds, `None` when empty
pub(crate) fn range_search<K: KeyOrdering, V: ValueCodec>(
    tree: &TreeHandle<K, V>,
    min: Option<&K>,
    max: Option<&K>,
    exclude_min: bool,
    exclude_max: bool,
) -> Result<Option<Span<K, V>>> {
    let Some(first) = first_bucket(tree)? else {
        return Ok(None);
    };

    let (low, low_offset) = match min {
        Some(min) => match find_range_end(tree, min, true, exclude_min)? {
            Some(found) => found,
            None => return Ok(None),
        },
        None if exclude_min => {
            if bucket_len(&first)? > 1 {
                (first.clone(), 1)
            } else {
                match next_bucket(&first)? {
                    Some(next) => (next, 0),
                    None => return Ok(None),
                }
            }
        }
        None => (first.clone(), 0),
    };

    let (high, high_offset) = match max {
        Some(max) => match find_range_end(tree, max, false, exclude_max)? {
            Some(found) => found,
            None => return Ok(None),
        },
        None => {
            let last = last_bucket(tree)?;
            let top = bucket_len(&last)?.checked_sub(1).ok_or_else(|| {
                BTreeError::StructuralInvariant("tree contains an empty bucket".to_string())
            })?;
            if !exclude_max {
                (last, top)
            } else if top > 0 {
                (last, top - 1)
            } else if last.ptr_eq(&first) {
                return Ok(None);
            } else {
                let previous = previous_bucket(&first, &last)?;
                let top = bucket_len(&previous)?.saturating_sub(1);
                (previous, top)
            }
        }
    };

    if low.ptr_eq(&high) {
        if low_offset > high_offset {
            return Ok(None);
        }
    } else {
        // endpoints in different buckets may still be crossed
        let first_key = key_at_offset(&low, low_offset)?;
        let last_key = key_at_offset(&high, high_offset)?;
        if first_key.compare(&last_key)? == Ordering::Greater {
            return Ok(None);
        }
    }

    Ok(Some(Span {
        first: low,
        first_offset: low_offset,
        last: high,
        last_offset: high_offset,
    }))
}

/// Smallest (`min`) or largest key, optionally bounded by `bound`
pub(crate) fn extreme_key<K: KeyOrdering, V: ValueCodec>(
    tree: &TreeHandle<K, V>,
    bound: Option<&K>,
    min: bool,
) -> Result<K> {
    let Some(first) = first_bucket(tree)? else {
        return Err(BTreeError::Empty);
    };
    match bound {
        Some(bound) => {
            let (bucket, offset) =
                find_range_end(tree, bound, min, false)?.ok_or(BTreeError::NoKeyInRange)?;
            key_at_offset(&bucket, offset)
        }
        None if min => key_at_offset(&first, 0),
        None => {
            let last = last_bucket(tree)?;
            let top = bucket_len(&last)?.checked_sub(1).ok_or(BTreeError::Empty)?;
            key_at_offset(&last, top)
        }
    }
}
