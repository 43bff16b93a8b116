// Set operations
// Every operation walks two ascending cursors in lock step and decides,
// per key, whether to emit it from the left, the right or both sides.
// Results are always fresh leaf containers; inputs are never modified.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tracing::debug;

use super::containers::{Bucket, Set};
use crate::contracts::{KeyOrdering, MergeCursor, MergeItem, MergeSource, ValueCodec, WeightedValue};
use crate::error::{BTreeError, Result};
use crate::observability::{log_operation, record_metric, MetricType, Operation, OperationContext};

/// Result of a set operation: a mapping when values survive, a set otherwise
#[derive(Debug, Clone)]
pub enum Merged<K: KeyOrdering, V: ValueCodec> {
    Mapping(Bucket<K, V>),
    Set(Set<K>),
}

impl<K: KeyOrdering, V: ValueCodec> Merged<K, V> {
    pub fn is_mapping(&self) -> bool {
        matches!(self, Merged::Mapping(_))
    }

    pub fn as_mapping(&self) -> Option<&Bucket<K, V>> {
        match self {
            Merged::Mapping(bucket) => Some(bucket),
            Merged::Set(_) => None,
        }
    }

    pub fn as_set(&self) -> Option<&Set<K>> {
        match self {
            Merged::Set(set) => Some(set),
            Merged::Mapping(_) => None,
        }
    }

    pub fn len(&self) -> Result<usize> {
        match self {
            Merged::Mapping(bucket) => bucket.len(),
            Merged::Set(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn keys(&self) -> Result<Vec<K>> {
        let mut keys = Vec::new();
        for item in self.merge_cursor()? {
            keys.push(item?.0);
        }
        Ok(keys)
    }
}

impl<K: KeyOrdering, V: ValueCodec> MergeSource<K, V> for Merged<K, V> {
    fn uses_values(&self) -> bool {
        self.is_mapping()
    }

    fn merge_cursor(&self) -> Result<MergeCursor<'_, K, V>> {
        match self {
            Merged::Mapping(bucket) => bucket.merge_cursor(),
            Merged::Set(set) => set.merge_cursor(),
        }
    }
}

/// Accumulates the output of a merge
struct Output<K, V> {
    keys: Vec<K>,
    values: Option<Vec<V>>,
}

impl<K: KeyOrdering, V: ValueCodec> Output<K, V> {
    fn new(with_values: bool) -> Self {
        Self {
            keys: Vec::new(),
            values: with_values.then(Vec::new),
        }
    }

    fn push(&mut self, key: K, value: Option<V>) -> Result<()> {
        self.keys.try_reserve(1)?;
        self.keys.push(key);
        if let Some(values) = &mut self.values {
            let value = value.ok_or_else(|| {
                BTreeError::InvalidValue("mapping result needs a value for every key".to_string())
            })?;
            values.try_reserve(1)?;
            values.push(value);
        }
        Ok(())
    }

    fn finish(self) -> Merged<K, V> {
        match self.values {
            Some(values) => Merged::Mapping(Bucket::from_sorted(self.keys, values)),
            None => Merged::Set(Set::from_sorted(self.keys)),
        }
    }
}

/// One merge step: a key found on one side only, or on both
enum Step<K, V> {
    Left(MergeItem<K, V>),
    Right(MergeItem<K, V>),
    Both(MergeItem<K, V>, MergeItem<K, V>),
}

/// Which steps an operation wants; the walk stops early once no further
/// step can be wanted
#[derive(Clone, Copy)]
struct Keep {
    left: bool,
    both: bool,
    right: bool,
}

struct Cursor<'a, K, V> {
    iter: MergeCursor<'a, K, V>,
    current: Option<MergeItem<K, V>>,
}

impl<'a, K: KeyOrdering, V: ValueCodec> Cursor<'a, K, V> {
    fn new(source: &'a dyn MergeSource<K, V>) -> Result<Self> {
        let mut cursor = Self {
            iter: source.merge_cursor()?,
            current: None,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    fn advance(&mut self) -> Result<()> {
        self.current = self.iter.next().transpose()?;
        Ok(())
    }
}

fn merge_walk<K, V, F>(
    left: &dyn MergeSource<K, V>,
    right: &dyn MergeSource<K, V>,
    keep: Keep,
    mut emit: F,
) -> Result<()>
where
    K: KeyOrdering,
    V: ValueCodec,
    F: FnMut(Step<K, V>) -> Result<()>,
{
    let mut l = Cursor::new(left)?;
    let mut r = Cursor::new(right)?;
    loop {
        match (l.current.take(), r.current.take()) {
            (Some(a), Some(b)) => match a.0.compare(&b.0)? {
                Ordering::Less => {
                    if keep.left {
                        emit(Step::Left(a))?;
                    }
                    l.advance()?;
                    r.current = Some(b);
                }
                Ordering::Equal => {
                    if keep.both {
                        emit(Step::Both(a, b))?;
                    }
                    l.advance()?;
                    r.advance()?;
                }
                Ordering::Greater => {
                    if keep.right {
                        emit(Step::Right(b))?;
                    }
                    l.current = Some(a);
                    r.advance()?;
                }
            },
            (Some(a), None) => {
                if !keep.left {
                    break;
                }
                emit(Step::Left(a))?;
                l.advance()?;
            }
            (None, Some(b)) => {
                if !keep.right {
                    break;
                }
                emit(Step::Right(b))?;
                r.advance()?;
            }
            (None, None) => break,
        }
    }
    Ok(())
}

/// Logs the outcome of a merge walk and counts the successful ones
fn finish_merge<K, V>(
    ctx: &OperationContext,
    walked: Result<()>,
    output: &Output<K, V>,
) -> Result<()> {
    log_merge(ctx, &walked, output.keys.len());
    walked
}

fn log_merge<T>(ctx: &OperationContext, result: &Result<T>, result_count: usize) {
    let op = Operation::SetOperation {
        name: ctx.operation.clone(),
        result_count,
    };
    log_operation(ctx, &op, result);
    if result.is_ok() {
        record_metric(MetricType::Counter {
            name: "setops.merges",
            value: 1,
        });
    }
}

/// Keys of either operand. Values survive only when both operands carry
/// them; on ties the left value wins.
pub fn union<K: KeyOrdering, V: ValueCodec>(
    left: &dyn MergeSource<K, V>,
    right: &dyn MergeSource<K, V>,
) -> Result<Merged<K, V>> {
    let ctx = OperationContext::new("union");
    let mut output = Output::new(left.uses_values() && right.uses_values());
    let keep = Keep {
        left: true,
        both: true,
        right: true,
    };
    let walked = merge_walk(left, right, keep, |step| match step {
        Step::Left((key, value)) | Step::Right((key, value)) | Step::Both((key, value), _) => {
            output.push(key, value)
        }
    });
    finish_merge(&ctx, walked, &output)?;
    Ok(output.finish())
}

/// Keys present in both operands, left values when both carry values
pub fn intersection<K: KeyOrdering, V: ValueCodec>(
    left: &dyn MergeSource<K, V>,
    right: &dyn MergeSource<K, V>,
) -> Result<Merged<K, V>> {
    let ctx = OperationContext::new("intersection");
    let mut output = Output::new(left.uses_values() && right.uses_values());
    let keep = Keep {
        left: false,
        both: true,
        right: false,
    };
    let walked = merge_walk(left, right, keep, |step| match step {
        Step::Both((key, value), _) => output.push(key, value),
        Step::Left(_) | Step::Right(_) => Ok(()),
    });
    finish_merge(&ctx, walked, &output)?;
    Ok(output.finish())
}

/// Keys of `left` that are absent from `right`, with `left`'s values
pub fn difference<K: KeyOrdering, V: ValueCodec>(
    left: &dyn MergeSource<K, V>,
    right: &dyn MergeSource<K, V>,
) -> Result<Merged<K, V>> {
    let ctx = OperationContext::new("difference");
    let mut output = Output::new(left.uses_values());
    let keep = Keep {
        left: true,
        both: false,
        right: false,
    };
    let walked = merge_walk(left, right, keep, |step| match step {
        Step::Left((key, value)) => output.push(key, value),
        Step::Both(..) | Step::Right(_) => Ok(()),
    });
    finish_merge(&ctx, walked, &output)?;
    Ok(output.finish())
}

/// Orders the operands so a mapping comes first, swapping weights with them
fn mapping_first<'a, K: KeyOrdering, V: ValueCodec>(
    left: &'a dyn MergeSource<K, V>,
    right: &'a dyn MergeSource<K, V>,
    w1: V,
    w2: V,
) -> (&'a dyn MergeSource<K, V>, &'a dyn MergeSource<K, V>, V, V) {
    if !left.uses_values() && right.uses_values() {
        (right, left, w2, w1)
    } else {
        (left, right, w1, w2)
    }
}

/// Weighted union: values on one side are scaled by that side's weight,
/// tied keys get `v1 * w1 + v2 * w2`. Set members count as `MERGE_DEFAULT`.
/// The returned weight is always one.
pub fn weighted_union<K: KeyOrdering, V: WeightedValue>(
    left: &dyn MergeSource<K, V>,
    right: &dyn MergeSource<K, V>,
    w1: V,
    w2: V,
) -> Result<(V, Merged<K, V>)> {
    let ctx = OperationContext::new("weighted_union");
    let (left, right, w1, w2) = mapping_first(left, right, w1, w2);
    let merging = left.uses_values() || right.uses_values();
    let mut output = Output::new(merging);
    let value_of = |value: Option<V>| value.unwrap_or(V::MERGE_DEFAULT);
    // plain sets carry no values, so there is nothing to weigh
    let weigh = |value: Option<V>, w: V| -> Result<Option<V>> {
        if merging {
            V::merge_weight(value_of(value), w).map(Some)
        } else {
            Ok(None)
        }
    };
    let keep = Keep {
        left: true,
        both: true,
        right: true,
    };
    let walked = merge_walk(left, right, keep, |step| match step {
        Step::Left((key, value)) => output.push(key, weigh(value, w1)?),
        Step::Right((key, value)) => output.push(key, weigh(value, w2)?),
        Step::Both((key, v1), (_, v2)) => {
            let value = if merging {
                Some(V::merge(value_of(v1), w1, value_of(v2), w2)?)
            } else {
                None
            };
            output.push(key, value)
        }
    });
    finish_merge(&ctx, walked, &output)?;
    Ok((V::MERGE_DEFAULT, output.finish()))
}

/// Weighted intersection: tied keys get `v1 * w1 + v2 * w2`. Intersecting
/// two plain sets yields a set and the weight `w1 + w2`; otherwise the
/// returned weight is one.
pub fn weighted_intersection<K: KeyOrdering, V: WeightedValue>(
    left: &dyn MergeSource<K, V>,
    right: &dyn MergeSource<K, V>,
    w1: V,
    w2: V,
) -> Result<(V, Merged<K, V>)> {
    let ctx = OperationContext::new("weighted_intersection");
    let (left, right, w1, w2) = mapping_first(left, right, w1, w2);
    let merging = left.uses_values() || right.uses_values();
    let mut output = Output::new(merging);
    let value_of = |value: Option<V>| value.unwrap_or(V::MERGE_DEFAULT);
    let keep = Keep {
        left: false,
        both: true,
        right: false,
    };
    let walked = merge_walk(left, right, keep, |step| match step {
        Step::Both((key, v1), (_, v2)) => {
            let value = if merging {
                Some(V::merge(value_of(v1), w1, value_of(v2), w2)?)
            } else {
                None
            };
            output.push(key, value)
        }
        Step::Left(_) | Step::Right(_) => Ok(()),
    });
    finish_merge(&ctx, walked, &output)?;
    let weight = if merging {
        V::MERGE_DEFAULT
    } else {
        V::add_weights(w1, w2)?
    };
    Ok((weight, output.finish()))
}

/// Union of many sources in a single pass over a heap of cursor heads.
/// Keys need a total order, which in practice means integer keys.
pub fn multiunion<K, V>(sources: &[&dyn MergeSource<K, V>]) -> Result<Set<K>>
where
    K: KeyOrdering + Ord,
    V: ValueCodec,
{
    let ctx = OperationContext::new("multiunion");
    let result = multiunion_keys(sources);
    log_merge(&ctx, &result, result.as_ref().map_or(0, Vec::len));
    debug!(sources = sources.len(), "Multiunion finished");
    result.map(Set::from_sorted)
}

fn multiunion_keys<K, V>(sources: &[&dyn MergeSource<K, V>]) -> Result<Vec<K>>
where
    K: KeyOrdering + Ord,
    V: ValueCodec,
{
    let mut cursors = Vec::with_capacity(sources.len());
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        let cursor = Cursor::new(*source)?;
        if let Some((key, _)) = &cursor.current {
            heap.push(Reverse((key.clone(), index)));
        }
        cursors.push(cursor);
    }

    let mut keys: Vec<K> = Vec::new();
    while let Some(Reverse((key, index))) = heap.pop() {
        if keys.last() != Some(&key) {
            keys.try_reserve(1)?;
            keys.push(key);
        }
        let cursor = &mut cursors[index];
        cursor.advance()?;
        if let Some((next, _)) = &cursor.current {
            heap.push(Reverse((next.clone(), index)));
        }
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::containers::{BTree, TreeSet};
    use pretty_assertions::assert_eq;

    fn items(merged: &Merged<i64, i64>) -> Vec<(i64, i64)> {
        merged
            .as_mapping()
            .expect("mapping result")
            .iter()
            .unwrap()
            .map(|entry| entry.unwrap().into_item().unwrap())
            .collect()
    }

    #[test]
    fn test_plain_set_algebra() {
        let a = Set::from_keys([1i64, 2, 3, 4]).unwrap();
        let b = TreeSet::from_keys([3i64, 4, 5, 6]).unwrap();

        let both = intersection::<_, ()>(&a, &b).unwrap();
        assert!(!both.is_mapping());
        assert_eq!(both.keys().unwrap(), vec![3, 4]);
        assert_eq!(union::<_, ()>(&a, &b).unwrap().keys().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(difference::<_, ()>(&a, &b).unwrap().keys().unwrap(), vec![1, 2]);
        assert_eq!(difference::<_, ()>(&b, &a).unwrap().keys().unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_mapping_results_keep_left_values() {
        let left = BTree::from_items([(1i64, 10i64), (2, 20), (3, 30)]).unwrap();
        let right = Bucket::from_items([(2i64, 200i64), (4, 400)]).unwrap();
        let set = Set::from_keys([3i64]).unwrap();

        assert_eq!(items(&union(&left, &right).unwrap()), vec![(1, 10), (2, 20), (3, 30), (4, 400)]);
        assert_eq!(items(&intersection(&left, &right).unwrap()), vec![(2, 20)]);
        assert_eq!(items(&difference(&left, &set).unwrap()), vec![(1, 10), (2, 20)]);
        assert!(!union(&left, &set).unwrap().is_mapping());
        assert!(!difference(&set, &left).unwrap().is_mapping());
    }

    #[test]
    fn test_weighted_union_scales_and_sums() {
        let left = Bucket::from_items([(1i64, 1i64), (2, 2)]).unwrap();
        let right = Bucket::from_items([(2i64, 10i64), (3, 30)]).unwrap();
        let (weight, merged) = weighted_union(&left, &right, 2, 3).unwrap();
        assert_eq!(weight, 1);
        assert_eq!(items(&merged), vec![(1, 2), (2, 34), (3, 90)]);

        // set members count as 1 and the mapping side moves first
        let set = Set::from_keys([1i64, 5]).unwrap();
        let (_, merged) = weighted_union(&set, &left, 4, 5).unwrap();
        assert_eq!(items(&merged), vec![(1, 9), (2, 10), (5, 4)]);
    }

    #[test]
    fn test_weighted_intersection_weights() {
        let a = Set::from_keys([1i64, 2, 3]).unwrap();
        let b = Set::from_keys([2i64, 3, 4]).unwrap();
        let (weight, merged) = weighted_intersection(&a, &b, 2, 5).unwrap();
        assert_eq!(weight, 7);
        assert_eq!(merged.keys().unwrap(), vec![2, 3]);

        let mapping = Bucket::from_items([(3i64, 10i64), (4, 1)]).unwrap();
        let (weight, merged) = weighted_intersection(&a, &mapping, 2, 5).unwrap();
        assert_eq!(weight, 1);
        assert_eq!(items(&merged), vec![(3, 52)]);
    }

    #[test]
    fn test_multiunion_merges_many_sources() {
        let a = Set::from_keys([1i64, 5, 9]).unwrap();
        let b = TreeSet::from_keys([2i64, 5, 7]).unwrap();
        let c = Set::<i64>::new();
        let d = BTree::from_items([(9i64, 0i64), (11, 0)]).unwrap();
        let sources: [&dyn MergeSource<i64, i64>; 4] = [&a, &b, &c, &d];
        let merged = multiunion(&sources).unwrap();
        assert_eq!(
            merged.keys(&Default::default()).unwrap().to_keys().unwrap(),
            vec![1, 2, 5, 7, 9, 11]
        );
        assert!(multiunion::<i64, ()>(&[]).unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_comparison_errors_propagate() {
        use crate::types::Object;
        let a = Set::from_keys([Object::from(1)]).unwrap();
        let b = Set::from_keys([Object::from("x")]).unwrap();
        assert!(union::<_, ()>(&a, &b).unwrap_err().is_comparison());
    }
}
