// Range views and iteration
// A `RangeView` is an inclusive run of bucket entries from (first,
// first_offset) to (last, last_offset), reached by following `next` links.
// Positional access goes through a search finger, which makes ascending
// access cheap; moving left has to rescan the chain from the first bucket.

use std::cell::RefCell;

use super::bucket::{bucket_len, previous_bucket, BucketData, BucketHandle};
use crate::contracts::{KeyOrdering, MergeItem, ValueCodec};
use crate::error::{BTreeError, Result};
use crate::persistence::Pinned;

/// Inclusive endpoints of a non-empty range
pub(crate) struct Span<K, V> {
    pub(crate) first: BucketHandle<K, V>,
    pub(crate) first_offset: usize,
    pub(crate) last: BucketHandle<K, V>,
    pub(crate) last_offset: usize,
}

impl<K, V> Clone for Span<K, V> {
    fn clone(&self) -> Self {
        Self {
            first: self.first.clone(),
            first_offset: self.first_offset,
            last: self.last.clone(),
            last_offset: self.last_offset,
        }
    }
}

/// What a view yields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Keys,
    Values,
    Items,
}

/// One element of a view
#[derive(Debug, Clone, PartialEq)]
pub enum Entry<K, V> {
    Key(K),
    Value(V),
    Item(K, V),
}

impl<K, V> Entry<K, V> {
    pub fn key(&self) -> Option<&K> {
        match self {
            Entry::Key(key) | Entry::Item(key, _) => Some(key),
            Entry::Value(_) => None,
        }
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            Entry::Value(value) | Entry::Item(_, value) => Some(value),
            Entry::Key(_) => None,
        }
    }

    pub fn into_key(self) -> Option<K> {
        match self {
            Entry::Key(key) | Entry::Item(key, _) => Some(key),
            Entry::Value(_) => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Entry::Value(value) | Entry::Item(_, value) => Some(value),
            Entry::Key(_) => None,
        }
    }

    pub fn into_item(self) -> Option<(K, V)> {
        match self {
            Entry::Item(key, value) => Some((key, value)),
            _ => None,
        }
    }
}

fn entry_at<K: KeyOrdering, V: ValueCodec>(
    body: &BucketData<K, V>,
    offset: usize,
    kind: ViewKind,
) -> Result<Entry<K, V>> {
    match kind {
        ViewKind::Keys => Ok(Entry::Key(body.key_at(offset)?)),
        ViewKind::Values => Ok(Entry::Value(body.value_at(offset)?)),
        ViewKind::Items => Ok(Entry::Item(body.key_at(offset)?, body.value_at(offset)?)),
    }
}

struct Finger<K, V> {
    bucket: BucketHandle<K, V>,
    offset: usize,
    index: isize,
}

/// Immutable range over a tree or bucket; holds pins on its end buckets
pub struct RangeView<K: KeyOrdering, V: ValueCodec> {
    span: Option<Span<K, V>>,
    kind: ViewKind,
    finger: RefCell<Option<Finger<K, V>>>,
    _pins: Vec<Pinned<BucketData<K, V>>>,
}

impl<K: KeyOrdering, V: ValueCodec> RangeView<K, V> {
    pub(crate) fn new(span: Option<Span<K, V>>, kind: ViewKind) -> Result<Self> {
        let (finger, pins) = match &span {
            Some(span) => (
                Some(Finger {
                    bucket: span.first.clone(),
                    offset: span.first_offset,
                    index: 0,
                }),
                vec![span.first.use_node()?, span.last.use_node()?],
            ),
            None => (None, Vec::new()),
        };
        Ok(Self {
            span,
            kind,
            finger: RefCell::new(finger),
            _pins: pins,
        })
    }

    pub fn empty(kind: ViewKind) -> Self {
        Self {
            span: None,
            kind,
            finger: RefCell::new(None),
            _pins: Vec::new(),
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_none()
    }

    /// Number of entries, counted by walking the spanned buckets
    pub fn len(&self) -> Result<usize> {
        let Some(span) = &self.span else {
            return Ok(0);
        };
        let mut total = span.last_offset as isize + 1 - span.first_offset as isize;
        if span.first.ptr_eq(&span.last) {
            return Ok(total.max(0) as usize);
        }

        let mut bucket = span.first.clone();
        loop {
            let (len, next) = {
                let pin = bucket.use_node()?;
                let body = pin.body()?;
                (body.len(), body.next.clone())
            };
            let Some(next) = next else {
                break;
            };
            total += len as isize;
            if next.ptr_eq(&span.last) {
                break;
            }
            bucket = next;
        }
        Ok(total.max(0) as usize)
    }

    /// Move the finger to position `index` (0-based, not normalized)
    fn seek(&self, index: isize) -> Result<(BucketHandle<K, V>, usize)> {
        let span = self.span.as_ref().ok_or(BTreeError::IndexOutOfRange(index))?;
        let mut finger = self
            .finger
            .try_borrow_mut()
            .map_err(|_| BTreeError::StructuralInvariant("range view is busy".to_string()))?;
        let (mut bucket, mut offset, mut position) = match finger.as_ref() {
            Some(finger) => (finger.bucket.clone(), finger.offset as isize, finger.index),
            None => return Err(BTreeError::IndexOutOfRange(index)),
        };

        let mut delta = index - position;
        while delta > 0 {
            let (len, next) = {
                let pin = bucket.use_node()?;
                let body = pin.body()?;
                (body.len() as isize, body.next.clone())
            };
            // the most we can move right inside this bucket
            let max = len - offset - 1;
            if delta <= max {
                offset += delta;
                position += delta;
                if bucket.ptr_eq(&span.last) && offset > span.last_offset as isize {
                    return Err(BTreeError::IndexOutOfRange(index));
                }
                break;
            }
            let next = match next {
                Some(next) if !bucket.ptr_eq(&span.last) => next,
                _ => return Err(BTreeError::IndexOutOfRange(index)),
            };
            bucket = next;
            position += max + 1;
            delta -= max + 1;
            offset = 0;
        }
        while delta < 0 {
            if -delta <= offset {
                offset += delta;
                position += delta;
                if bucket.ptr_eq(&span.first) && offset < span.first_offset as isize {
                    return Err(BTreeError::IndexOutOfRange(index));
                }
                break;
            }
            if bucket.ptr_eq(&span.first) {
                return Err(BTreeError::IndexOutOfRange(index));
            }
            bucket = previous_bucket(&span.first, &bucket)
                .map_err(|_| BTreeError::IndexOutOfRange(index))?;
            position -= offset + 1;
            delta += offset + 1;
            offset = bucket_len(&bucket)? as isize - 1;
        }

        // the bucket may have been mutated since the finger was placed
        let len = bucket_len(&bucket)? as isize;
        if offset < 0 || offset >= len {
            return Err(BTreeError::bucket_changed());
        }
        *finger = Some(Finger {
            bucket: bucket.clone(),
            offset: offset as usize,
            index: position,
        });
        Ok((bucket, offset as usize))
    }

    /// Entry at `index`; negative indexes count from the end
    pub fn get(&self, index: isize) -> Result<Entry<K, V>> {
        let index = if index < 0 {
            index + self.len()? as isize
        } else {
            index
        };
        let (bucket, offset) = self.seek(index)?;
        let pin = bucket.use_node()?;
        let body = pin.body()?;
        entry_at(&*body, offset, self.kind)
    }

    /// Half-open sub-range `[low, high)` with sequence slicing rules:
    /// negative bounds count from the end, out-of-range bounds are clipped
    pub fn slice(&self, low: isize, high: isize) -> Result<RangeView<K, V>> {
        let len = self.len()? as isize;
        let clip = |i: isize| {
            if i < 0 {
                (i + len).max(0)
            } else {
                i.min(len)
            }
        };
        let low = clip(low);
        let high = clip(high).max(low);
        if low == high {
            return Ok(RangeView::empty(self.kind));
        }

        let (first, first_offset) = self.seek(low)?;
        let (last, last_offset) = self.seek(high - 1)?;
        RangeView::new(
            Some(Span {
                first,
                first_offset,
                last,
                last_offset,
            }),
            self.kind,
        )
    }

    pub fn iter(&self) -> Result<TreeIter<K, V>> {
        TreeIter::new(self.span.as_ref(), self.kind)
    }

    fn iter_as(&self, kind: ViewKind) -> Result<TreeIter<K, V>> {
        TreeIter::new(self.span.as_ref(), kind)
    }

    pub fn to_keys(&self) -> Result<Vec<K>> {
        let mut keys = Vec::new();
        for entry in self.iter_as(ViewKind::Keys)? {
            keys.extend(entry?.into_key());
        }
        Ok(keys)
    }

    pub fn to_values(&self) -> Result<Vec<V>> {
        let mut values = Vec::new();
        for entry in self.iter_as(ViewKind::Values)? {
            values.extend(entry?.into_value());
        }
        Ok(values)
    }

    pub fn to_items(&self) -> Result<Vec<(K, V)>> {
        let mut items = Vec::new();
        for entry in self.iter_as(ViewKind::Items)? {
            items.extend(entry?.into_item());
        }
        Ok(items)
    }
}

/// Forward iterator over a range. Exhaustion is sticky, and so is the
/// error raised when the current bucket changes size mid-iteration.
pub struct TreeIter<K: KeyOrdering, V: ValueCodec> {
    bucket: Option<Pinned<BucketData<K, V>>>,
    offset: usize,
    expected_len: usize,
    last: Option<(BucketHandle<K, V>, usize)>,
    kind: ViewKind,
    poisoned: bool,
}

impl<K: KeyOrdering, V: ValueCodec> TreeIter<K, V> {
    pub(crate) fn new(span: Option<&Span<K, V>>, kind: ViewKind) -> Result<Self> {
        let (bucket, offset, expected_len, last) = match span {
            Some(span) => {
                let pin = span.first.use_node()?;
                let len = pin.body()?.len();
                (
                    Some(pin),
                    span.first_offset,
                    len,
                    Some((span.last.clone(), span.last_offset)),
                )
            }
            None => (None, 0, 0, None),
        };
        Ok(Self {
            bucket,
            offset,
            expected_len,
            last,
            kind,
            poisoned: false,
        })
    }

    fn advance(&mut self) -> Result<Option<Entry<K, V>>> {
        let Some(pin) = self.bucket.take() else {
            return Ok(None);
        };
        let (entry, len, next) = {
            let body = pin.body()?;
            if body.len() != self.expected_len || self.offset >= body.len() {
                return Err(BTreeError::bucket_changed());
            }
            (
                entry_at(&body, self.offset, self.kind)?,
                body.len(),
                body.next.clone(),
            )
        };

        let at_end = match &self.last {
            Some((last, last_offset)) => pin.handle().ptr_eq(last) && self.offset >= *last_offset,
            None => true,
        };
        if at_end {
            return Ok(Some(entry));
        }

        self.offset += 1;
        if self.offset < len {
            self.bucket = Some(pin);
        } else if let Some(next) = next {
            drop(pin);
            let next = next.use_node()?;
            self.expected_len = next.body()?.len();
            self.offset = 0;
            self.bucket = Some(next);
        }
        Ok(Some(entry))
    }

    /// Adapt to the merge protocol used by the set operations
    pub(crate) fn merge_items(self) -> impl Iterator<Item = Result<MergeItem<K, V>>> {
        self.map(|entry| match entry? {
            Entry::Item(key, value) => Ok((key, Some(value))),
            Entry::Key(key) => Ok((key, None)),
            Entry::Value(_) => Err(BTreeError::InvalidState(
                "merge cursors need keys".to_string(),
            )),
        })
    }
}

impl<K: KeyOrdering, V: ValueCodec> Iterator for TreeIter<K, V> {
    type Item = Result<Entry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned {
            return Some(Err(BTreeError::bucket_changed()));
        }
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                self.bucket = None;
                if err.is_concurrent_modification() {
                    self.poisoned = true;
                }
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Handle;
    use pretty_assertions::assert_eq;

    /// Chain of buckets `[0, 1, 2] [3, 4, 5] ...` with values `key * 10`
    fn chain(buckets: usize) -> Vec<BucketHandle<i32, i32>> {
        let mut handles: Vec<BucketHandle<i32, i32>> = Vec::new();
        for b in 0..buckets {
            let mut body = BucketData::new(false);
            for k in 0..3 {
                let key = (b * 3 + k) as i32;
                body.set(key, Some(key * 10), false).unwrap();
            }
            handles.push(Handle::new(body));
        }
        for pair in handles.windows(2) {
            pair[0].use_node().unwrap().body_mut().unwrap().next = Some(pair[1].clone());
        }
        handles
    }

    fn view(
        handles: &[BucketHandle<i32, i32>],
        first: (usize, usize),
        last: (usize, usize),
        kind: ViewKind,
    ) -> RangeView<i32, i32> {
        RangeView::new(
            Some(Span {
                first: handles[first.0].clone(),
                first_offset: first.1,
                last: handles[last.0].clone(),
                last_offset: last.1,
            }),
            kind,
        )
        .unwrap()
    }

    #[test]
    fn test_len_spans_buckets() {
        let handles = chain(4);
        assert_eq!(view(&handles, (0, 1), (3, 1), ViewKind::Keys).len().unwrap(), 10);
        assert_eq!(view(&handles, (2, 0), (2, 2), ViewKind::Keys).len().unwrap(), 3);
        assert_eq!(RangeView::<i32, i32>::empty(ViewKind::Keys).len().unwrap(), 0);
    }

    #[test]
    fn test_positional_access_both_directions() {
        let handles = chain(4);
        let range = view(&handles, (0, 1), (3, 1), ViewKind::Keys);
        assert_eq!(range.get(0).unwrap(), Entry::Key(1));
        assert_eq!(range.get(7).unwrap(), Entry::Key(8));
        assert_eq!(range.get(2).unwrap(), Entry::Key(3));
        assert_eq!(range.get(-1).unwrap(), Entry::Key(10));
        assert_eq!(range.get(-10).unwrap(), Entry::Key(1));
        assert!(matches!(range.get(10), Err(BTreeError::IndexOutOfRange(10))));
        assert!(matches!(range.get(-11), Err(BTreeError::IndexOutOfRange(_))));
    }

    #[test]
    fn test_items_and_values() {
        let handles = chain(2);
        let items = view(&handles, (0, 2), (1, 0), ViewKind::Items);
        assert_eq!(items.get(1).unwrap(), Entry::Item(3, 30));
        assert_eq!(items.to_items().unwrap(), vec![(2, 20), (3, 30)]);
        assert_eq!(items.to_values().unwrap(), vec![20, 30]);
    }

    #[test]
    fn test_slices_follow_sequence_rules() {
        let handles = chain(3);
        let range = view(&handles, (0, 0), (2, 2), ViewKind::Keys);
        assert_eq!(range.slice(2, 5).unwrap().to_keys().unwrap(), vec![2, 3, 4]);
        assert_eq!(range.slice(-3, 100).unwrap().to_keys().unwrap(), vec![6, 7, 8]);
        assert!(range.slice(5, 2).unwrap().is_empty());
        assert!(range.slice(9, 12).unwrap().is_empty());
        let inner = range.slice(1, -1).unwrap();
        assert_eq!(inner.len().unwrap(), 7);
        assert_eq!(inner.slice(0, 2).unwrap().to_keys().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_iteration_stops_at_last_offset() {
        let handles = chain(3);
        let range = view(&handles, (0, 2), (2, 0), ViewKind::Keys);
        let keys: Vec<i32> = range
            .iter()
            .unwrap()
            .map(|entry| entry.unwrap().into_key().unwrap())
            .collect();
        assert_eq!(keys, vec![2, 3, 4, 5, 6]);

        let mut iter = range.iter().unwrap();
        for _ in 0..5 {
            assert!(iter.next().is_some());
        }
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_shrinking_bucket_poisons_iterator() {
        let handles = chain(2);
        let range = view(&handles, (0, 0), (1, 2), ViewKind::Keys);
        let mut iter = range.iter().unwrap();
        assert_eq!(iter.next().unwrap().unwrap(), Entry::Key(0));

        handles[0].use_node().unwrap().body_mut().unwrap().set(2, None, false).unwrap();
        let err = iter.next().unwrap().unwrap_err();
        assert!(err.is_concurrent_modification());
        assert!(iter.next().unwrap().unwrap_err().is_concurrent_modification());
    }

    #[test]
    fn test_seek_detects_shrunk_bucket() {
        let handles = chain(1);
        let range = view(&handles, (0, 0), (0, 2), ViewKind::Keys);
        assert_eq!(range.get(2).unwrap(), Entry::Key(2));
        handles[0].use_node().unwrap().body_mut().unwrap().set(0, None, false).unwrap();
        assert!(range.get(2).unwrap_err().is_concurrent_modification());
    }
}
