// Capability contracts for the B+Tree engine
// Keys and values plug into the engine through these traits; the engine never
// inspects a concrete key or value type directly.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Result;
use crate::state::Datum;

/// Total order over keys plus conversion to and from the external form.
///
/// `compare` may fail (for example when two dynamically typed keys have no
/// common ordering); the engine always propagates that failure instead of
/// treating it as "not found".
pub trait KeyOrdering: Clone + fmt::Debug + 'static {
    /// Default maximum number of children in an internal node
    const TREE_SIZE: usize = 500;
    /// Default maximum number of items in a bucket
    const BUCKET_SIZE: usize = 120;

    fn compare(&self, other: &Self) -> Result<Ordering>;

    /// False for keys whose only ordering is identity, which would make
    /// their position depend on memory layout. Checked on insertion.
    fn supports(&self) -> bool {
        true
    }

    fn to_datum(&self) -> Datum;

    fn from_datum(datum: &Datum) -> Result<Self>;

    /// Bucket size used when this key type is paired with `V`
    fn bucket_size_for<V: ValueCodec>() -> usize {
        if V::IS_OBJECT {
            (Self::BUCKET_SIZE / 2).max(1)
        } else {
            Self::BUCKET_SIZE
        }
    }
}

/// Conversion of values to and from the external form
pub trait ValueCodec: Clone + fmt::Debug + 'static {
    /// Object values are larger, so buckets holding them are kept smaller
    const IS_OBJECT: bool = false;

    fn to_datum(&self) -> Datum;

    fn from_datum(datum: &Datum) -> Result<Self>;

    /// Value identity as seen by conflict resolution
    fn same(&self, other: &Self) -> bool;
}

/// Numeric values that support the weighted set operations and `by_value`
pub trait WeightedValue: ValueCodec + PartialOrd + Copy {
    /// Value assumed for members of a plain set in a weighted merge
    const MERGE_DEFAULT: Self;

    /// `v1 * w1 + v2 * w2`. Integer types report overflow as
    /// `InvalidValue` instead of wrapping.
    fn merge(v1: Self, w1: Self, v2: Self, w2: Self) -> Result<Self>;

    /// `v * w`
    fn merge_weight(v: Self, w: Self) -> Result<Self>;

    /// Sum of two weights; the result of intersecting two plain sets
    fn add_weights(w1: Self, w2: Self) -> Result<Self>;

    /// `v / min` when `min` is strictly positive, `v` otherwise
    fn normalize(v: Self, min: Self) -> Self;

    fn zero() -> Self;
}

/// One step of the iteration protocol: a key and, for mappings, its value
pub type MergeItem<K, V> = (K, Option<V>);

/// Monotonic cursor handed to the set operations
pub type MergeCursor<'a, K, V> = Box<dyn Iterator<Item = Result<MergeItem<K, V>>> + 'a>;

/// Anything that can be walked in ascending key order by the set operations
pub trait MergeSource<K: KeyOrdering, V: ValueCodec> {
    /// True when the cursor yields values alongside keys
    fn uses_values(&self) -> bool;

    fn merge_cursor(&self) -> Result<MergeCursor<'_, K, V>>;
}
