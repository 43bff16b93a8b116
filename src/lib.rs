// pbtrees - persistent B+Tree containers
// Root library module

pub mod btree;
pub mod builders;
pub mod config;
pub mod contracts;
pub mod error;
pub mod observability;
pub mod persistence;
pub mod state;
pub mod types;
pub mod wrappers;

// Re-export observability
pub use observability::{
    get_metrics, init_logging, init_logging_with_level, log_operation, record_metric, MetricType,
    Operation, OperationContext, PerfTimer,
};

pub use contracts::{
    KeyOrdering, MergeCursor, MergeItem, MergeSource, ValueCodec, WeightedValue,
};

pub use error::{BTreeError, ConflictPositions, ConflictReason, Result};

pub use state::{Datum, NodeKind, Oid, PersistentRef};

pub use types::{FixedBytes, Object};

pub use persistence::{DataManager, Handle, MemoryJar, NodeBody, PersistentStatus, Pinned};

pub use config::{Limits, TreeConfig};

// Re-export containers and algorithms
pub use btree::{
    difference, intersection, multiunion, resolve_bucket_conflict, resolve_tree_conflict, union,
    weighted_intersection, weighted_union, BTree, Bucket, Entry, KeyRange, Length, LengthData, Merged,
    RangeView, Set, TreeIter, TreeSet, ViewKind,
};

// Re-export builders
pub use builders::{RangeBuilder, TreeBuilder, TreeConfigBuilder};

// Re-export wrappers
pub use wrappers::{CountedTree, TracedTree};
