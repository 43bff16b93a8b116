// Set operation tests
// Merges across multi-bucket trees and mixed container kinds.

use anyhow::Result;
use pbtrees::{
    difference, get_metrics, intersection, multiunion, union, weighted_intersection,
    weighted_union, BTree, Bucket, KeyRange, MergeSource, Set, TreeConfig, TreeSet,
};
use pretty_assertions::assert_eq;

fn small() -> TreeConfig {
    TreeConfig::new(Some(4), Some(3))
}

fn evens(limit: i64) -> Result<TreeSet<i64>> {
    let set = TreeSet::with_config(small());
    set.update((0..limit).step_by(2))?;
    Ok(set)
}

fn multiples_of_three(limit: i64) -> Result<BTree<i64, i64>> {
    let tree = BTree::with_config(small());
    tree.update((0..limit).step_by(3).map(|k| (k, k * 100)))?;
    Ok(tree)
}

#[test]
fn test_merges_walk_every_bucket() -> Result<()> {
    let a = evens(60)?;
    let b = multiples_of_three(60)?;

    let both = intersection::<i64, i64>(&a, &b)?;
    assert!(!both.is_mapping());
    assert_eq!(both.keys()?, (0..60).step_by(6).collect::<Vec<_>>());

    let either = union::<i64, i64>(&a, &b)?;
    let expected: Vec<i64> = (0..60).filter(|k| k % 2 == 0 || k % 3 == 0).collect();
    assert_eq!(either.keys()?, expected);

    let only_threes = difference::<i64, i64>(&b, &a)?;
    assert!(only_threes.is_mapping());
    let items = only_threes
        .as_mapping()
        .expect("left operand has values")
        .items(&KeyRange::all())?
        .to_items()?;
    assert_eq!(items[0], (3, 300));
    assert!(items.iter().all(|(k, v)| k % 2 == 1 && *v == k * 100));
    Ok(())
}

#[test]
fn test_empty_operands() -> Result<()> {
    let empty = TreeSet::<i64>::new();
    let a = evens(10)?;
    assert_eq!(union::<i64, ()>(&empty, &a)?.keys()?, vec![0, 2, 4, 6, 8]);
    assert!(intersection::<i64, ()>(&a, &empty)?.is_empty()?);
    assert_eq!(difference::<i64, ()>(&a, &empty)?.len()?, 5);
    assert!(difference::<i64, ()>(&empty, &a)?.is_empty()?);
    Ok(())
}

#[test]
fn test_weighted_merges_over_trees() -> Result<()> {
    let scores = BTree::<i64, i64>::from_items([(1, 10), (2, 20), (3, 30)])?;
    let bonus = Bucket::<i64, i64>::from_items([(2, 1), (3, 2), (4, 3)])?;

    let (weight, merged) = weighted_union(&scores, &bonus, 1, 10)?;
    assert_eq!(weight, 1);
    let merged = merged.as_mapping().expect("mapping").items(&KeyRange::all())?.to_items()?;
    assert_eq!(merged, vec![(1, 10), (2, 30), (3, 50), (4, 30)]);

    let (weight, merged) = weighted_intersection(&scores, &bonus, 2, 0)?;
    assert_eq!(weight, 1);
    assert_eq!(merged.keys()?, vec![2, 3]);

    let a = Set::<i64>::from_keys([1, 2])?;
    let b = TreeSet::<i64>::from_keys([2, 3])?;
    let (weight, merged) = weighted_intersection::<i64, i64>(&a, &b, 3, 4)?;
    assert_eq!(weight, 7);
    assert!(!merged.is_mapping());
    Ok(())
}

#[test]
fn test_weighted_merge_overflow_is_an_error() -> Result<()> {
    let big = BTree::<i32, i32>::from_items([(1, i32::MAX), (2, 5)])?;
    let small = Bucket::<i32, i32>::from_items([(2, 1)])?;
    let err = weighted_union(&big, &small, 2, 1).unwrap_err();
    assert!(matches!(err, pbtrees::BTreeError::InvalidValue(_)));
    assert!(weighted_intersection(&big, &small, i32::MAX, 2).is_err());

    // plain sets carry no values, only the returned weight can overflow
    let a = Set::<i32>::from_keys([1, 2])?;
    let b = Set::<i32>::from_keys([2, 3])?;
    let (weight, merged) = weighted_union::<i32, i32>(&a, &b, i32::MAX, i32::MAX)?;
    assert_eq!(weight, 1);
    assert_eq!(merged.keys()?, vec![1, 2, 3]);
    assert!(weighted_intersection::<i32, i32>(&a, &b, i32::MAX, 1).is_err());
    Ok(())
}

#[test]
fn test_multiunion_of_mixed_sources() -> Result<()> {
    let a = evens(20)?;
    let b = multiples_of_three(20)?;
    let c = Set::<i64>::from_keys([100, 7])?;
    let sources: [&dyn MergeSource<i64, i64>; 3] = [&a, &b, &c];
    let merged = multiunion(&sources)?;

    let mut expected: Vec<i64> = (0..20).filter(|k| k % 2 == 0 || k % 3 == 0).collect();
    expected.extend([7, 100]);
    expected.sort_unstable();
    assert_eq!(merged.keys(&KeyRange::all())?.to_keys()?, expected);
    Ok(())
}

#[test]
fn test_results_feed_further_merges() -> Result<()> {
    let a = evens(30)?;
    let b = multiples_of_three(30)?;
    let both = intersection::<i64, i64>(&a, &b)?;
    let rest = difference::<i64, i64>(&a, &both)?;
    let rebuilt = union::<i64, i64>(&rest, &both)?;
    assert_eq!(rebuilt.keys()?, a.keys(&KeyRange::all())?.to_keys()?);
    assert!(!a.isdisjoint::<i64>(&rest)?);
    let odds = Set::<i64>::from_keys([1, 3, 5])?;
    assert!(a.isdisjoint::<i64>(&odds)?);
    Ok(())
}

#[test]
fn test_set_operations_are_counted() -> Result<()> {
    let count = || get_metrics()["btree"]["set_operations"].as_u64().unwrap_or(0);
    let before = count();
    let a = evens(10)?;
    let b = multiples_of_three(10)?;
    union::<i64, i64>(&a, &b)?;
    let sources: [&dyn MergeSource<i64, i64>; 2] = [&a, &b];
    multiunion(&sources)?;
    // other tests in this binary merge concurrently
    assert!(count() >= before + 2);
    Ok(())
}
