// B+Tree engine
// Leaf buckets linked left to right, interior tree nodes over them, range
// views and iterators over the bucket chain, set algebra, and the public
// containers built from these pieces.

pub mod bucket;
pub mod check;
pub mod conflict;
pub mod containers;
pub mod items;
pub mod length;
pub mod setops;
pub mod tree;

pub use bucket::{BucketData, BucketHandle, SetOutcome};
pub use conflict::{resolve_bucket_conflict, resolve_tree_conflict};
pub use containers::{BTree, Bucket, KeyRange, Set, TreeSet};
pub use items::{Entry, RangeView, TreeIter, ViewKind};
pub use length::{Length, LengthData};
pub use setops::{
    difference, intersection, multiunion, union, weighted_intersection, weighted_union, Merged,
};
pub use tree::{SetStatus, TreeData, TreeHandle};
