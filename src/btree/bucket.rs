// Bucket - the leaf node of the tree
// A sorted array of keys (plus parallel values for mappings) and a link to
// the next bucket in key order. Set buckets keep `values` empty.

use std::cmp::Ordering;
use std::rc::Rc;

use tracing::trace;

use crate::contracts::{KeyOrdering, ValueCodec};
use crate::error::{BTreeError, Result};
use crate::persistence::{DataManager, Handle, NodeBody, Pinned};
use crate::state::{Datum, NodeKind};

/// Capacity of a bucket's arrays the first time they grow
pub const MIN_BUCKET_ALLOC: usize = 16;

pub type BucketHandle<K, V> = Handle<BucketData<K, V>>;

/// Result of a bucket-level set or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Unchanged,
    Inserted,
    Replaced,
    Deleted,
}

impl SetOutcome {
    pub fn is_changed(self) -> bool {
        self != SetOutcome::Unchanged
    }

    /// True when the number of keys changed
    pub fn changes_size(self) -> bool {
        matches!(self, SetOutcome::Inserted | SetOutcome::Deleted)
    }
}

pub struct BucketData<K, V> {
    pub(crate) keys: Vec<K>,
    pub(crate) values: Vec<V>,
    pub(crate) next: Option<BucketHandle<K, V>>,
    pub(crate) noval: bool,
}

impl<K, V> BucketData<K, V> {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_set(&self) -> bool {
        self.noval
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Values of a mapping bucket; empty for sets
    pub fn values(&self) -> &[V] {
        &self.values
    }

    pub fn next(&self) -> Option<&BucketHandle<K, V>> {
        self.next.as_ref()
    }
}

/// Release a bucket chain front to back without recursive drops
fn release_chain<K, V>(mut next: Option<BucketHandle<K, V>>) {
    while let Some(handle) = next.take() {
        match handle.try_into_body() {
            Ok(mut body) => next = body.next.take(),
            Err(_still_shared) => break,
        }
    }
}

impl<K, V> Drop for BucketData<K, V> {
    fn drop(&mut self) {
        release_chain(self.next.take());
    }
}

impl<K: KeyOrdering, V: ValueCodec> BucketData<K, V> {
    pub fn new(noval: bool) -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
            noval,
        }
    }

    /// Binary search: `(index, found)`, where `index` is the insertion point
    /// when the key is absent.
    pub fn search(&self, key: &K) -> Result<(usize, bool)> {
        let (mut lo, mut hi) = (0, self.keys.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.keys[mid].compare(key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.search(key)?.1)
    }

    pub fn get(&self, key: &K) -> Result<V> {
        match self.search(key)? {
            (index, true) => self.value_at(index),
            _ => Err(BTreeError::not_found(key)),
        }
    }

    pub(crate) fn value_at(&self, index: usize) -> Result<V> {
        self.values.get(index).cloned().ok_or_else(|| {
            if self.noval {
                BTreeError::InvalidState("sets have no values".to_string())
            } else {
                BTreeError::IndexOutOfRange(index as isize)
            }
        })
    }

    pub(crate) fn key_at(&self, index: usize) -> Result<K> {
        self.keys
            .get(index)
            .cloned()
            .ok_or(BTreeError::IndexOutOfRange(index as isize))
    }

    /// Make room for one more item: double the capacity, starting at 16.
    /// Nothing is moved if the allocation fails.
    fn grow(&mut self) -> Result<()> {
        let len = self.keys.len();
        if len < self.keys.capacity() && (self.noval || len < self.values.capacity()) {
            return Ok(());
        }
        let target = if len == 0 {
            MIN_BUCKET_ALLOC
        } else {
            len.checked_mul(2).ok_or(BTreeError::OutOfMemory)?
        };
        self.keys.try_reserve_exact(target - len)?;
        if !self.noval {
            self.values.try_reserve_exact(target - len)?;
        }
        Ok(())
    }

    /// Insert, replace or (with `value == None`) delete `key`.
    ///
    /// With `unique` an existing key is left untouched. Set buckets ignore
    /// the value entirely.
    pub fn set(&mut self, key: K, value: Option<V>, unique: bool) -> Result<SetOutcome> {
        if value.is_some() && !key.supports() {
            return Err(BTreeError::InvalidKey(format!(
                "{key:?} has default comparison"
            )));
        }

        let (index, found) = self.search(&key)?;
        match (found, value) {
            (true, Some(value)) => {
                if unique || self.noval {
                    return Ok(SetOutcome::Unchanged);
                }
                if !V::IS_OBJECT && self.values[index].same(&value) {
                    return Ok(SetOutcome::Unchanged);
                }
                self.values[index] = value;
                Ok(SetOutcome::Replaced)
            }
            (true, None) => {
                self.keys.remove(index);
                if !self.noval {
                    self.values.remove(index);
                }
                Ok(SetOutcome::Deleted)
            }
            (false, None) => Err(BTreeError::not_found(&key)),
            (false, Some(value)) => {
                self.grow()?;
                self.keys.insert(index, key);
                if !self.noval {
                    self.values.insert(index, value);
                }
                Ok(SetOutcome::Inserted)
            }
        }
    }

    /// Move the items from `index` on into a new body. An out-of-range
    /// index splits at the midpoint. The caller links the new bucket in.
    pub fn split_off(&mut self, index: Option<usize>) -> Result<BucketData<K, V>> {
        let len = self.keys.len();
        let index = match index {
            Some(index) if index < len => index,
            _ => len / 2,
        };
        let moved = len - index;

        let mut tail = BucketData::new(self.noval);
        tail.keys.try_reserve_exact(moved)?;
        if !self.noval {
            tail.values.try_reserve_exact(moved)?;
        }
        tail.keys.extend(self.keys.drain(index..));
        if !self.noval {
            tail.values.extend(self.values.drain(index..));
        }
        Ok(tail)
    }

    /// Offset of the smallest key >= `key` (`low`) or the largest key <= `key`
    /// (high end) within this bucket. `exclude_equal` steps off an exact hit.
    pub fn find_range_end(&self, key: &K, low: bool, exclude_equal: bool) -> Result<Option<usize>> {
        let (index, found) = self.search(key)?;
        let mut index = index as isize;
        if found {
            if exclude_equal {
                index += if low { 1 } else { -1 };
            }
        } else if !low {
            index -= 1;
        }
        if index >= 0 && (index as usize) < self.keys.len() {
            Ok(Some(index as usize))
        } else {
            Ok(None)
        }
    }

    /// Inclusive offsets selected by optional bounds, `None` when empty
    pub fn range_offsets(
        &self,
        min: Option<&K>,
        max: Option<&K>,
        exclude_min: bool,
        exclude_max: bool,
    ) -> Result<Option<(usize, usize)>> {
        let len = self.keys.len();
        if len == 0 {
            return Ok(None);
        }

        let low = match min {
            Some(min) => match self.find_range_end(min, true, exclude_min)? {
                Some(low) => low,
                None => return Ok(None),
            },
            None if exclude_min => {
                if len < 2 {
                    return Ok(None);
                }
                1
            }
            None => 0,
        };

        let high = match max {
            Some(max) => match self.find_range_end(max, false, exclude_max)? {
                Some(high) => high,
                None => return Ok(None),
            },
            None if exclude_max => {
                if len < 2 {
                    return Ok(None);
                }
                len - 2
            }
            None => len - 1,
        };

        Ok((low <= high).then_some((low, high)))
    }

    /// Smallest (`min`) or largest key, optionally bounded by `bound`
    pub fn extreme_key(&self, bound: Option<&K>, min: bool) -> Result<K> {
        if self.keys.is_empty() {
            return Err(BTreeError::Empty);
        }
        let offset = match bound {
            Some(bound) => self
                .find_range_end(bound, min, false)?
                .ok_or(BTreeError::NoKeyInRange)?,
            None if min => 0,
            None => self.keys.len() - 1,
        };
        self.key_at(offset)
    }

    /// Interleaved `(k0, v0, k1, v1, ...)` tuple, keys only for sets
    pub(crate) fn items_datum(&self) -> Datum {
        let width = if self.noval { 1 } else { 2 };
        let mut items = Vec::with_capacity(self.keys.len() * width);
        for (index, key) in self.keys.iter().enumerate() {
            items.push(key.to_datum());
            if !self.noval {
                items.push(self.values[index].to_datum());
            }
        }
        Datum::Tuple(items)
    }

    /// Replace keys and values from an interleaved items tuple
    pub(crate) fn load_items(&mut self, items: &[Datum]) -> Result<()> {
        let width = if self.noval { 1 } else { 2 };
        if items.len() % width != 0 {
            return Err(BTreeError::InvalidState(
                "odd number of items in bucket state".to_string(),
            ));
        }
        let len = items.len() / width;
        let mut keys = Vec::new();
        keys.try_reserve_exact(len)?;
        let mut values = Vec::new();
        if !self.noval {
            values.try_reserve_exact(len)?;
        }
        for chunk in items.chunks(width) {
            keys.push(K::from_datum(&chunk[0])?);
            if !self.noval {
                values.push(V::from_datum(&chunk[1])?);
            }
        }
        self.keys = keys;
        self.values = values;
        Ok(())
    }
}

impl<K: KeyOrdering, V: ValueCodec> NodeBody for BucketData<K, V> {
    fn empty(kind: NodeKind) -> Self {
        BucketData::new(kind == NodeKind::Set)
    }

    fn kind(&self) -> NodeKind {
        if self.noval {
            NodeKind::Set
        } else {
            NodeKind::Bucket
        }
    }

    /// `(items,)` or `(items, next)`
    fn to_state(&self) -> Result<Datum> {
        let mut state = vec![self.items_datum()];
        if let Some(next) = &self.next {
            state.push(Datum::Node(next.object_ref()));
        }
        Ok(Datum::Tuple(state))
    }

    fn set_state(&mut self, state: &Datum, jar: Option<&Rc<dyn DataManager>>) -> Result<()> {
        let parts = state
            .as_tuple()
            .ok_or_else(|| BTreeError::InvalidState("bucket state must be a tuple".to_string()))?;
        let items = parts
            .first()
            .and_then(Datum::as_tuple)
            .ok_or_else(|| {
                BTreeError::InvalidState("tuple required for first state element".to_string())
            })?;

        let next = match parts {
            [_] => None,
            [_, next] => {
                if BucketHandle::<K, V>::reference_kind(next) != Some(self.kind()) {
                    return Err(BTreeError::InvalidState(
                        "bucket successor has the wrong type".to_string(),
                    ));
                }
                Some(BucketHandle::resolve(next, jar)?)
            }
            _ => {
                return Err(BTreeError::InvalidState(
                    "bucket state must have one or two elements".to_string(),
                ))
            }
        };

        self.load_items(items)?;
        release_chain(std::mem::replace(&mut self.next, next));
        Ok(())
    }

    fn clear(&mut self) {
        self.keys = Vec::new();
        self.values = Vec::new();
        release_chain(self.next.take());
    }
}

/// Split the pinned bucket, link the new sibling after it and return it
pub(crate) fn split_bucket<K: KeyOrdering, V: ValueCodec>(
    pin: &Pinned<BucketData<K, V>>,
    index: Option<usize>,
) -> Result<BucketHandle<K, V>> {
    let sibling = {
        let mut body = pin.body_mut()?;
        let mut tail = body.split_off(index)?;
        tail.next = body.next.take();
        let sibling = Handle::new(tail);
        body.next = Some(sibling.clone());
        trace!(left = body.len(), "Split bucket");
        sibling
    };
    pin.changed()?;
    Ok(sibling)
}

/// Splice out the successor of the pinned bucket
pub(crate) fn unlink_next<K: KeyOrdering, V: ValueCodec>(
    pin: &Pinned<BucketData<K, V>>,
) -> Result<()> {
    let successor = match pin.body()?.next.clone() {
        Some(successor) => successor,
        None => return Ok(()),
    };
    let successor_pin = successor.use_node()?;
    let after = successor_pin.body()?.next.clone();
    pin.body_mut()?.next = after;
    pin.changed()
}

/// First key of a bucket, used to repair separators
pub(crate) fn first_key<K: KeyOrdering, V: ValueCodec>(bucket: &BucketHandle<K, V>) -> Result<K> {
    key_at_offset(bucket, 0)
}

pub(crate) fn key_at_offset<K: KeyOrdering, V: ValueCodec>(
    bucket: &BucketHandle<K, V>,
    offset: usize,
) -> Result<K> {
    let pin = bucket.use_node()?;
    let key = pin.body()?.key_at(offset);
    key
}

pub(crate) fn bucket_len<K: KeyOrdering, V: ValueCodec>(bucket: &BucketHandle<K, V>) -> Result<usize> {
    let pin = bucket.use_node()?;
    let len = pin.body()?.len();
    Ok(len)
}

pub(crate) fn next_bucket<K: KeyOrdering, V: ValueCodec>(
    bucket: &BucketHandle<K, V>,
) -> Result<Option<BucketHandle<K, V>>> {
    let pin = bucket.use_node()?;
    let next = pin.body()?.next.clone();
    Ok(next)
}

/// Bucket whose `next` is `target`, searching forward from `first`
pub(crate) fn previous_bucket<K: KeyOrdering, V: ValueCodec>(
    first: &BucketHandle<K, V>,
    target: &BucketHandle<K, V>,
) -> Result<BucketHandle<K, V>> {
    let mut current = first.clone();
    loop {
        match next_bucket(&current)? {
            Some(next) if next.ptr_eq(target) => return Ok(current),
            Some(next) => current = next,
            None => {
                return Err(BTreeError::StructuralInvariant(
                    "bucket is not reachable from the first bucket".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Object;

    fn mapping(keys: &[i32]) -> BucketData<i32, i32> {
        let mut bucket = BucketData::new(false);
        for &k in keys {
            bucket.set(k, Some(k * 10), false).unwrap();
        }
        bucket
    }

    #[test]
    fn test_set_outcomes() {
        let mut bucket = BucketData::<i32, i32>::new(false);
        assert_eq!(bucket.set(3, Some(30), false).unwrap(), SetOutcome::Inserted);
        assert_eq!(bucket.set(3, Some(30), false).unwrap(), SetOutcome::Unchanged);
        assert_eq!(bucket.set(3, Some(31), true).unwrap(), SetOutcome::Unchanged);
        assert_eq!(bucket.set(3, Some(31), false).unwrap(), SetOutcome::Replaced);
        assert_eq!(bucket.get(&3).unwrap(), 31);
        assert_eq!(bucket.set(3, None, false).unwrap(), SetOutcome::Deleted);
        assert!(bucket.set(3, None, false).unwrap_err().is_key_not_found());
    }

    #[test]
    fn test_capacity_doubles_from_sixteen() {
        let mut bucket = BucketData::<i32, i32>::new(false);
        bucket.set(1, Some(1), false).unwrap();
        assert!(bucket.keys.capacity() >= MIN_BUCKET_ALLOC);
        for k in 2..=17 {
            bucket.set(k, Some(k), false).unwrap();
        }
        assert!(bucket.keys.capacity() >= 2 * MIN_BUCKET_ALLOC);
        assert_eq!(bucket.len(), 17);
    }

    #[test]
    fn test_set_bucket_keeps_no_values() {
        let mut set = BucketData::<i32, ()>::new(true);
        assert_eq!(set.set(2, Some(()), false).unwrap(), SetOutcome::Inserted);
        assert_eq!(set.set(2, Some(()), false).unwrap(), SetOutcome::Unchanged);
        assert!(set.values().is_empty());
        assert_eq!(set.items_datum(), Datum::Tuple(vec![Datum::Int(2)]));
    }

    #[test]
    fn test_split_off_midpoint_and_index() {
        let mut bucket = mapping(&[1, 2, 3, 4, 5]);
        let tail = bucket.split_off(None).unwrap();
        assert_eq!(bucket.keys(), &[1, 2]);
        assert_eq!(tail.keys(), &[3, 4, 5]);
        assert_eq!(tail.values(), &[30, 40, 50]);

        let mut bucket = mapping(&[1, 2, 3, 4, 5]);
        let tail = bucket.split_off(Some(4)).unwrap();
        assert_eq!(tail.keys(), &[5]);
        let tail = bucket.split_off(Some(99)).unwrap();
        assert_eq!(bucket.keys(), &[1, 2]);
        assert_eq!(tail.keys(), &[3, 4]);
    }

    #[test]
    fn test_find_range_end() {
        let bucket = mapping(&[2, 4, 6]);
        assert_eq!(bucket.find_range_end(&4, true, false).unwrap(), Some(1));
        assert_eq!(bucket.find_range_end(&4, true, true).unwrap(), Some(2));
        assert_eq!(bucket.find_range_end(&4, false, true).unwrap(), Some(0));
        assert_eq!(bucket.find_range_end(&5, true, false).unwrap(), Some(2));
        assert_eq!(bucket.find_range_end(&5, false, false).unwrap(), Some(1));
        assert_eq!(bucket.find_range_end(&7, true, false).unwrap(), None);
        assert_eq!(bucket.find_range_end(&1, false, false).unwrap(), None);
        assert_eq!(bucket.find_range_end(&6, true, true).unwrap(), None);
    }

    #[test]
    fn test_range_offsets() {
        let bucket = mapping(&[1, 2, 3, 4]);
        assert_eq!(bucket.range_offsets(None, None, false, false).unwrap(), Some((0, 3)));
        assert_eq!(bucket.range_offsets(None, None, true, true).unwrap(), Some((1, 2)));
        assert_eq!(bucket.range_offsets(Some(&2), Some(&3), true, false).unwrap(), Some((2, 2)));
        assert_eq!(bucket.range_offsets(Some(&3), Some(&2), false, false).unwrap(), None);
        let single = mapping(&[1]);
        assert_eq!(single.range_offsets(None, None, true, false).unwrap(), None);
    }

    #[test]
    fn test_extreme_keys() {
        let bucket = mapping(&[2, 4, 6]);
        assert_eq!(bucket.extreme_key(None, true).unwrap(), 2);
        assert_eq!(bucket.extreme_key(Some(&5), false).unwrap(), 4);
        assert!(matches!(bucket.extreme_key(Some(&7), true), Err(BTreeError::NoKeyInRange)));
        let empty = BucketData::<i32, i32>::new(false);
        assert!(matches!(empty.extreme_key(None, true), Err(BTreeError::Empty)));
    }

    #[test]
    fn test_comparison_failure_propagates() {
        let mut bucket = BucketData::<Object, i32>::new(false);
        bucket.set(Object::Int(1), Some(1), false).unwrap();
        let err = bucket.search(&Object::from("x")).unwrap_err();
        assert!(err.is_comparison());
        let err = bucket.set(Object::Opaque(9), Some(1), false).unwrap_err();
        assert!(matches!(err, BTreeError::InvalidKey(_)));
    }

    #[test]
    fn test_linked_split_and_unlink() {
        let handle = Handle::new(mapping(&[1, 2, 3, 4]));
        let pin = handle.use_node().unwrap();
        let sibling = split_bucket(&pin, None).unwrap();
        assert!(pin.body().unwrap().next().unwrap().ptr_eq(&sibling));
        assert_eq!(first_key(&sibling).unwrap(), 3);
        unlink_next(&pin).unwrap();
        assert!(pin.body().unwrap().next().is_none());
    }

    #[test]
    fn test_state_roundtrip_with_successor() {
        let first = Handle::new(mapping(&[1, 2]));
        let second = Handle::new(mapping(&[5]));
        first.use_node().unwrap().body_mut().unwrap().next = Some(second.clone());

        let state = first.use_node().unwrap().body().unwrap().to_state().unwrap();
        let parts = state.as_tuple().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0],
            Datum::Tuple(vec![Datum::Int(1), Datum::Int(10), Datum::Int(2), Datum::Int(20)])
        );

        let mut copy = BucketData::<i32, i32>::new(false);
        copy.set_state(&state, None).unwrap();
        assert_eq!(copy.keys(), &[1, 2]);
        assert!(copy.next().unwrap().ptr_eq(&second));
    }

    #[test]
    fn test_long_chain_drops_without_recursion() {
        let head = Handle::new(mapping(&[0]));
        let mut tail = head.clone();
        for k in 1..200_000 {
            let next = Handle::new(mapping(&[k]));
            tail.use_node().unwrap().body_mut().unwrap().next = Some(next.clone());
            tail = next;
        }
        drop(tail);
        drop(head);
    }
}
