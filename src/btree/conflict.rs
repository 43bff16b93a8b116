// Three-way merge of concurrently changed bucket states
// Given the state both transactions started from (`old`), the state that
// was committed first and the state being committed now, produce a merged
// bucket state or report why the changes cannot be combined. Trees can only
// be merged while they consist of a single embedded bucket.

use std::cmp::Ordering;

use tracing::debug;

use super::bucket::BucketData;
use crate::contracts::{KeyOrdering, ValueCodec};
use crate::error::{BTreeError, ConflictPositions, ConflictReason, Result};
use crate::observability::{record_metric, MetricType};
use crate::state::Datum;

/// Items and successor reference of one bucket state
struct BucketState<K, V> {
    body: BucketData<K, V>,
    next: Option<Datum>,
}

impl<K: KeyOrdering, V: ValueCodec> BucketState<K, V> {
    fn parse(state: Option<&Datum>, noval: bool) -> Result<Self> {
        let mut body = BucketData::new(noval);
        let Some(state) = state.filter(|state| !state.is_none()) else {
            return Ok(Self { body, next: None });
        };
        let parts = state
            .as_tuple()
            .ok_or_else(|| BTreeError::InvalidState("bucket state must be a tuple".to_string()))?;
        let (items, next) = match parts {
            [items] => (items, None),
            [items, next] => (items, Some(next.clone())),
            _ => {
                return Err(BTreeError::InvalidState(
                    "bucket state must have one or two elements".to_string(),
                ))
            }
        };
        let items = items.as_tuple().ok_or_else(|| {
            BTreeError::InvalidState("tuple required for first state element".to_string())
        })?;
        body.load_items(items)?;
        Ok(Self { body, next })
    }
}

/// Merge cursor; `position` is 1-based while active and -1 once exhausted
struct Cursor<'a, K, V> {
    body: &'a BucketData<K, V>,
    index: usize,
}

impl<'a, K: KeyOrdering, V: ValueCodec> Cursor<'a, K, V> {
    fn new(body: &'a BucketData<K, V>) -> Self {
        Self { body, index: 0 }
    }

    fn active(&self) -> bool {
        self.index < self.body.len()
    }

    fn position(&self) -> isize {
        if self.active() {
            self.index as isize + 1
        } else {
            -1
        }
    }

    fn key(&self) -> &K {
        &self.body.keys[self.index]
    }

    fn value(&self) -> Option<&V> {
        self.body.values.get(self.index)
    }

    fn same_value(&self, other: &Cursor<'_, K, V>) -> bool {
        match (self.value(), other.value()) {
            (Some(a), Some(b)) => a.same(b),
            (None, None) => true,
            _ => false,
        }
    }

    fn advance(&mut self) {
        self.index += 1;
    }
}

struct Merge<'a, K, V> {
    old: Cursor<'a, K, V>,
    committed: Cursor<'a, K, V>,
    new: Cursor<'a, K, V>,
    result: BucketData<K, V>,
}

#[derive(Clone, Copy)]
enum Side {
    Old,
    Committed,
    New,
}

impl<'a, K: KeyOrdering, V: ValueCodec> Merge<'a, K, V> {
    fn error(&self, reason: ConflictReason) -> BTreeError {
        debug!(reason = reason.code(), "Conflict resolution failed");
        record_metric(MetricType::Counter {
            name: "btree.conflicts",
            value: 1,
        });
        BTreeError::conflict(
            reason,
            ConflictPositions {
                old: self.old.position(),
                committed: self.committed.position(),
                new: self.new.position(),
            },
        )
    }

    fn cursor(&mut self, side: Side) -> &mut Cursor<'a, K, V> {
        match side {
            Side::Old => &mut self.old,
            Side::Committed => &mut self.committed,
            Side::New => &mut self.new,
        }
    }

    /// Copy the current item of `side` to the result and advance it
    fn output(&mut self, side: Side) {
        let cursor = self.cursor(side);
        let key = cursor.key().clone();
        let value = cursor.value().cloned();
        cursor.advance();
        self.push(key, value);
    }

    fn push(&mut self, key: K, value: Option<V>) {
        self.result.keys.push(key);
        if let Some(value) = value {
            self.result.values.push(value);
        }
    }

    fn run(&mut self) -> Result<()> {
        while self.old.active() && self.committed.active() && self.new.active() {
            let old_committed = self.old.key().compare(self.committed.key())?;
            let old_new = self.old.key().compare(self.new.key())?;
            match (old_committed, old_new) {
                (Ordering::Equal, Ordering::Equal) => {
                    let value = if self.committed.same_value(&self.old) {
                        self.new.value().cloned()
                    } else if self.new.same_value(&self.old) {
                        self.committed.value().cloned()
                    } else {
                        return Err(self.error(ConflictReason::ValueChangedInBoth));
                    };
                    let key = self.old.key().clone();
                    self.push(key, value);
                    self.old.advance();
                    self.committed.advance();
                    self.new.advance();
                }
                (Ordering::Equal, Ordering::Greater) => self.output(Side::New),
                (Ordering::Equal, Ordering::Less) => {
                    if !self.old.same_value(&self.committed) {
                        return Err(self.error(ConflictReason::DeleteVsChangeNew));
                    }
                    if self.new.position() == 1 {
                        return Err(self.error(ConflictReason::FirstItemDeleted));
                    }
                    self.old.advance();
                    self.committed.advance();
                }
                (Ordering::Greater, Ordering::Equal) => self.output(Side::Committed),
                (Ordering::Less, Ordering::Equal) => {
                    if !self.old.same_value(&self.new) {
                        return Err(self.error(ConflictReason::DeleteVsChangeCommitted));
                    }
                    if self.committed.position() == 1 {
                        return Err(self.error(ConflictReason::FirstItemDeleted));
                    }
                    self.old.advance();
                    self.new.advance();
                }
                _ => {
                    let committed_new = self.committed.key().compare(self.new.key())?;
                    if committed_new == Ordering::Equal {
                        return Err(self.error(ConflictReason::DuelingInsert));
                    }
                    if old_committed == Ordering::Greater {
                        if committed_new == Ordering::Greater {
                            self.output(Side::New);
                        } else {
                            self.output(Side::Committed);
                        }
                    } else if old_new == Ordering::Greater {
                        self.output(Side::New);
                    } else {
                        return Err(self.error(ConflictReason::BothDeleted));
                    }
                }
            }
        }

        while self.committed.active() && self.new.active() {
            match self.committed.key().compare(self.new.key())? {
                Ordering::Equal => return Err(self.error(ConflictReason::DuelingInsertTail)),
                Ordering::Greater => self.output(Side::New),
                Ordering::Less => self.output(Side::Committed),
            }
        }

        while self.old.active() && self.committed.active() {
            match self.old.key().compare(self.committed.key())? {
                Ordering::Greater => self.output(Side::Committed),
                Ordering::Equal if self.old.same_value(&self.committed) => {
                    self.old.advance();
                    self.committed.advance();
                }
                _ => return Err(self.error(ConflictReason::DeleteAndChangeCommittedTail)),
            }
        }

        while self.old.active() && self.new.active() {
            match self.old.key().compare(self.new.key())? {
                Ordering::Greater => self.output(Side::New),
                Ordering::Equal if self.old.same_value(&self.new) => {
                    self.old.advance();
                    self.new.advance();
                }
                _ => return Err(self.error(ConflictReason::DeleteAndChangeNewTail)),
            }
        }

        if self.old.active() {
            return Err(self.error(ConflictReason::DuelingDeletes));
        }
        while self.committed.active() {
            self.output(Side::Committed);
        }
        while self.new.active() {
            self.output(Side::New);
        }
        if self.result.is_empty() {
            return Err(self.error(ConflictReason::EmptyResult));
        }
        Ok(())
    }
}

/// Merge three bucket states (`None` is an empty bucket)
pub fn resolve_bucket_conflict<K: KeyOrdering, V: ValueCodec>(
    noval: bool,
    old: Option<&Datum>,
    committed: Option<&Datum>,
    new: Option<&Datum>,
) -> Result<Datum> {
    let old = BucketState::<K, V>::parse(old, noval)?;
    let committed = BucketState::<K, V>::parse(committed, noval)?;
    let new = BucketState::<K, V>::parse(new, noval)?;

    if committed.next != old.next || new.next != old.next {
        return Err(BTreeError::conflict(
            ConflictReason::NextChanged,
            ConflictPositions::UNKNOWN,
        ));
    }
    if committed.body.is_empty() || new.body.is_empty() {
        return Err(BTreeError::conflict(
            ConflictReason::EmptyInput,
            ConflictPositions::UNKNOWN,
        ));
    }

    let mut merge = Merge {
        old: Cursor::new(&old.body),
        committed: Cursor::new(&committed.body),
        new: Cursor::new(&new.body),
        result: BucketData::new(noval),
    };
    merge.run()?;

    let mut state = vec![merge.result.items_datum()];
    state.extend(old.next);
    Ok(Datum::Tuple(state))
}

/// Bucket state embedded in a single-bucket tree state
fn simple_bucket_state(state: Option<&Datum>) -> Result<Option<&Datum>> {
    let Some(state) = state.filter(|state| !state.is_none()) else {
        return Ok(None);
    };
    let parts = state.as_tuple().ok_or_else(|| {
        BTreeError::InvalidState("expected tuple or None for tree state".to_string())
    })?;
    match parts {
        [_, _] => Err(BTreeError::conflict(
            ConflictReason::NonDegenerateTree,
            ConflictPositions::UNKNOWN,
        )),
        [wrapper] => match wrapper.as_tuple() {
            Some([bucket @ Datum::Tuple(_)]) => Ok(Some(bucket)),
            Some([_]) => Err(BTreeError::InvalidState(
                "expected tuple for bucket state".to_string(),
            )),
            _ => Err(BTreeError::InvalidState(
                "expected 1-tuple containing bucket state".to_string(),
            )),
        },
        _ => Err(BTreeError::InvalidState(
            "expected 1- or 2-tuple for tree state".to_string(),
        )),
    }
}

/// Merge three tree states; only empty and single-bucket trees qualify
pub fn resolve_tree_conflict<K: KeyOrdering, V: ValueCodec>(
    noval: bool,
    old: Option<&Datum>,
    committed: Option<&Datum>,
    new: Option<&Datum>,
) -> Result<Datum> {
    let old = simple_bucket_state(old)?;
    let committed = simple_bucket_state(committed)?;
    let new = simple_bucket_state(new)?;
    let bucket = resolve_bucket_conflict::<K, V>(noval, old, committed, new)?;
    Ok(Datum::tuple(vec![Datum::tuple(vec![bucket])]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NodeKind, Oid, PersistentRef};

    fn mapping(items: &[(i64, i64)]) -> Datum {
        let mut flat = Vec::new();
        for &(k, v) in items {
            flat.push(Datum::Int(k));
            flat.push(Datum::Int(v));
        }
        Datum::tuple(vec![Datum::Tuple(flat)])
    }

    fn set(keys: &[i64]) -> Datum {
        Datum::tuple(vec![Datum::Tuple(keys.iter().map(|&k| Datum::Int(k)).collect())])
    }

    fn merge_map(old: &Datum, committed: &Datum, new: &Datum) -> Result<Datum> {
        resolve_bucket_conflict::<i64, i64>(false, Some(old), Some(committed), Some(new))
    }

    fn merge_set(old: &Datum, committed: &Datum, new: &Datum) -> Result<Datum> {
        resolve_bucket_conflict::<i64, ()>(true, Some(old), Some(committed), Some(new))
    }

    fn reason(result: Result<Datum>) -> u8 {
        match result {
            Err(BTreeError::Conflict { reason, .. }) => reason.code(),
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_independent_changes_merge() {
        let old = mapping(&[(1, 1), (2, 2), (3, 3)]);
        let committed = mapping(&[(1, 1), (2, 20), (3, 3)]);
        let new = mapping(&[(1, 1), (2, 2), (3, 3), (4, 4)]);
        let merged = merge_map(&old, &committed, &new).unwrap();
        assert_eq!(merged, mapping(&[(1, 1), (2, 20), (3, 3), (4, 4)]));

        let old = set(&[1, 5, 9]);
        let committed = set(&[1, 3, 5, 9]);
        let new = set(&[1, 5, 7, 9]);
        assert_eq!(merge_set(&old, &committed, &new).unwrap(), set(&[1, 3, 5, 7, 9]));
    }

    #[test]
    fn test_deletes_merge_unless_first_item() {
        let old = set(&[1, 2, 3, 4]);
        let committed = set(&[1, 3, 4]);
        let new = set(&[1, 2, 3]);
        assert_eq!(merge_set(&old, &committed, &new).unwrap(), set(&[1, 3]));

        let new = set(&[2, 3, 4]);
        assert_eq!(reason(merge_set(&old, &old, &new)), 13);
    }

    #[test]
    fn test_conflict_reasons() {
        let old = mapping(&[(1, 1), (2, 2)]);
        assert_eq!(
            reason(merge_map(&old, &mapping(&[(1, 1), (2, 5)]), &mapping(&[(1, 1), (2, 6)]))),
            1
        );
        assert_eq!(
            reason(merge_map(&old, &mapping(&[(1, 1), (2, 5)]), &mapping(&[(1, 1)]))),
            7
        );
        assert_eq!(
            reason(merge_map(&old, &mapping(&[(1, 1), (2, 2), (3, 3)]), &mapping(&[(1, 1), (2, 2), (3, 4)]))),
            6
        );
        assert_eq!(reason(merge_map(&old, &mapping(&[]), &old)), 12);

        let old = set(&[1, 2, 3]);
        assert_eq!(reason(merge_set(&old, &set(&[1, 3]), &set(&[1, 4]))), 5);
        assert_eq!(reason(merge_set(&old, &set(&[1, 3]), &set(&[1, 3]))), 4);
        assert_eq!(reason(merge_set(&old, &set(&[1, 2]), &set(&[1, 2]))), 9);
        assert_eq!(reason(merge_set(&set(&[1, 5]), &set(&[1, 3, 5]), &set(&[1, 3, 5]))), 4);
    }

    #[test]
    fn test_changed_successor_is_reason_zero() {
        let next = Datum::Ref(PersistentRef {
            oid: Oid(7),
            kind: NodeKind::Bucket,
        });
        let old = mapping(&[(1, 1)]);
        let mut committed_items = mapping(&[(1, 1)]);
        if let Datum::Tuple(parts) = &mut committed_items {
            parts.push(next);
        }
        let err = merge_map(&old, &committed_items, &old).unwrap_err();
        assert!(matches!(
            err,
            BTreeError::Conflict {
                reason: ConflictReason::NextChanged,
                positions: ConflictPositions::UNKNOWN
            }
        ));
    }

    #[test]
    fn test_tree_states() {
        let wrap = |bucket: Datum| Datum::tuple(vec![Datum::tuple(vec![bucket])]);
        let old = wrap(set(&[1, 2]));
        let committed = wrap(set(&[1, 2, 3]));
        let new = wrap(set(&[0, 1, 2]));
        let merged =
            resolve_tree_conflict::<i64, ()>(true, Some(&old), Some(&committed), Some(&new)).unwrap();
        assert_eq!(merged, wrap(set(&[0, 1, 2, 3])));

        let large = Datum::tuple(vec![Datum::Tuple(vec![]), Datum::None]);
        assert_eq!(
            reason(resolve_tree_conflict::<i64, ()>(true, Some(&old), Some(&large), Some(&new))),
            11
        );
        assert!(matches!(
            resolve_tree_conflict::<i64, ()>(true, Some(&old), Some(&Datum::Int(3)), Some(&new)),
            Err(BTreeError::InvalidState(_))
        ));
    }
}
