// Consistency checking
// `check_structure` verifies the pointer skeleton: non-empty nodes and
// buckets, uniform child kinds, `first_bucket` caches and the bucket chain.
// `check_values` walks the tree with the key range implied by the separators
// and reports every key that falls outside it.

use std::cmp::Ordering;

use super::bucket::BucketHandle;
use super::tree::{Child, TreeHandle};
use crate::contracts::{KeyOrdering, ValueCodec};
use crate::error::{BTreeError, Result};

fn ensure_that(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(BTreeError::StructuralInvariant(message.to_string()))
    }
}

fn same_bucket<K: KeyOrdering, V: ValueCodec>(a: Option<&BucketHandle<K, V>>, b: Option<&BucketHandle<K, V>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.ptr_eq(b),
        (None, None) => true,
        _ => false,
    }
}

/// Structural check of a whole tree; the last bucket must end the chain
pub(crate) fn check_structure<K: KeyOrdering, V: ValueCodec>(tree: &TreeHandle<K, V>) -> Result<()> {
    check_node(tree, None)
}

fn check_node<K: KeyOrdering, V: ValueCodec>(
    tree: &TreeHandle<K, V>,
    next_bucket: Option<&BucketHandle<K, V>>,
) -> Result<()> {
    let pin = tree.use_node()?;
    let (children, first_bucket) = {
        let body = pin.body()?;
        let children: Vec<Child<K, V>> = body.data.iter().map(|item| item.child.clone()).collect();
        (children, body.first_bucket.clone())
    };

    if children.is_empty() {
        return ensure_that(first_bucket.is_none(), "Empty BTree has non-NULL firstbucket");
    }
    ensure_that(first_bucket.is_some(), "Non-empty BTree has NULL firstbucket")?;

    let all_trees = children.iter().all(Child::is_tree);
    let all_buckets = !children.iter().any(Child::is_tree);
    ensure_that(all_trees || all_buckets, "BTree children have different types")?;

    if all_trees {
        let leftmost = children[0].first_bucket()?;
        ensure_that(
            same_bucket(first_bucket.as_ref(), leftmost.as_ref()),
            "BTree has firstbucket different than its first child's firstbucket",
        )?;
        for (index, child) in children.iter().enumerate() {
            let after = match children.get(index + 1) {
                Some(sibling) => sibling.first_bucket()?,
                None => next_bucket.cloned(),
            };
            if let Child::Tree(subtree) = child {
                check_node(subtree, after.as_ref())?;
            }
        }
        return Ok(());
    }

    let leftmost = match &children[0] {
        Child::Bucket(bucket) => Some(bucket),
        Child::Tree(_) => None,
    };
    ensure_that(
        same_bucket(first_bucket.as_ref(), leftmost),
        "Bottom-level BTree node has inconsistent firstbucket belief",
    )?;
    for (index, child) in children.iter().enumerate() {
        let Child::Bucket(bucket) = child else {
            return Err(BTreeError::StructuralInvariant(
                "BTree children have different types".to_string(),
            ));
        };
        let after = match children.get(index + 1) {
            Some(Child::Bucket(sibling)) => Some(sibling),
            Some(Child::Tree(_)) => None,
            None => next_bucket,
        };
        let leaf = bucket.use_node()?;
        let body = leaf.body()?;
        ensure_that(!body.is_empty(), "Bucket length < 1")?;
        ensure_that(
            same_bucket(body.next.as_ref(), after),
            "Bucket next pointer is damaged",
        )?;
    }
    Ok(())
}

/// Range check of every key against the separators above it
pub(crate) fn check_values<K: KeyOrdering, V: ValueCodec>(tree: &TreeHandle<K, V>) -> Result<()> {
    let mut errors = Vec::new();
    let mut path = Vec::new();
    visit(&Child::Tree(tree.clone()), None, None, &mut path, &mut errors)?;
    if errors.is_empty() {
        return Ok(());
    }
    errors.insert(0, "Errors found in tree:".to_string());
    Err(BTreeError::StructuralInvariant(errors.join("\n")))
}

fn visit<K: KeyOrdering, V: ValueCodec>(
    node: &Child<K, V>,
    lo: Option<&K>,
    hi: Option<&K>,
    path: &mut Vec<usize>,
    errors: &mut Vec<String>,
) -> Result<()> {
    match node {
        Child::Bucket(bucket) => {
            let leaf = bucket.use_node()?;
            let keys = leaf.body()?.keys().to_vec();
            check_sorted(&keys, lo, hi, path, errors)
        }
        Child::Tree(tree) => {
            let pin = tree.use_node()?;
            let (separators, children) = {
                let body = pin.body()?;
                let separators: Vec<K> = body.data.iter().skip(1).filter_map(|item| item.key.clone()).collect();
                let children: Vec<Child<K, V>> = body.data.iter().map(|item| item.child.clone()).collect();
                (separators, children)
            };
            drop(pin);
            if separators.len() + 1 != children.len().max(1) {
                errors.push(format!(
                    "node has {} children but {} separators, path from root {}",
                    children.len(),
                    separators.len(),
                    format_path(path)
                ));
                return Ok(());
            }
            check_sorted(&separators, lo, hi, path, errors)?;

            for (index, child) in children.iter().enumerate() {
                let child_lo = if index == 0 { lo } else { separators.get(index - 1) };
                let child_hi = separators.get(index).or(hi);
                path.push(index);
                visit(child, child_lo, child_hi, path, errors)?;
                path.pop();
            }
            Ok(())
        }
    }
}

fn check_sorted<K: KeyOrdering>(
    keys: &[K],
    lo: Option<&K>,
    hi: Option<&K>,
    path: &[usize],
    errors: &mut Vec<String>,
) -> Result<()> {
    for (index, key) in keys.iter().enumerate() {
        if let Some(lo) = lo {
            if lo.compare(key)? == Ordering::Greater {
                errors.push(format!(
                    "key {key:?} < lower bound {lo:?} at index {index}, path from root {}",
                    format_path(path)
                ));
            }
        }
        if let Some(hi) = hi {
            if key.compare(hi)? != Ordering::Less {
                errors.push(format!(
                    "key {key:?} >= upper bound {hi:?} at index {index}, path from root {}",
                    format_path(path)
                ));
            }
        }
        if let Some(following) = keys.get(index + 1) {
            if key.compare(following)? != Ordering::Less {
                errors.push(format!(
                    "key {key:?} at index {index} >= key {following:?} at index {}, path from root {}",
                    index + 1,
                    format_path(path)
                ));
            }
        }
    }
    Ok(())
}

fn format_path(path: &[usize]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::bucket::BucketData;
    use crate::btree::tree::{self, TreeData, TreeItem};
    use crate::config::TreeConfig;
    use crate::persistence::Handle;

    fn small_tree(keys: impl IntoIterator<Item = i32>) -> TreeHandle<i32, i32> {
        let tree = Handle::new(TreeData::new(false, TreeConfig::new(Some(3), Some(3))));
        for key in keys {
            tree::set(&tree, &key, Some(key), false).unwrap();
        }
        tree
    }

    fn bucket(keys: &[i32]) -> BucketHandle<i32, i32> {
        let mut body = BucketData::new(false);
        for &key in keys {
            body.set(key, Some(key), false).unwrap();
        }
        Handle::new(body)
    }

    #[test]
    fn test_valid_trees_pass() {
        let tree = small_tree(0..50);
        check_structure(&tree).unwrap();
        check_values(&tree).unwrap();

        for key in (0..50).step_by(3) {
            tree::set(&tree, &key, None, false).unwrap();
        }
        check_structure(&tree).unwrap();
        check_values(&tree).unwrap();

        let empty = small_tree(std::iter::empty());
        check_structure(&empty).unwrap();
        check_values(&empty).unwrap();
    }

    #[test]
    fn test_damaged_chain_is_reported() {
        let left = bucket(&[1, 2]);
        let right = bucket(&[5, 6]);
        let mut body = TreeData::new(false, TreeConfig::default());
        body.data.push(TreeItem {
            key: None,
            child: Child::Bucket(left.clone()),
        });
        body.data.push(TreeItem {
            key: Some(5),
            child: Child::Bucket(right),
        });
        body.first_bucket = Some(left);
        let tree = Handle::new(body);

        let err = check_structure(&tree).unwrap_err();
        assert!(err.to_string().contains("Bucket next pointer is damaged"));
    }

    #[test]
    fn test_out_of_range_keys_are_reported() {
        let left = bucket(&[1, 7]);
        let right = bucket(&[5, 6]);
        left.use_node().unwrap().body_mut().unwrap().next = Some(right.clone());
        let mut body = TreeData::new(false, TreeConfig::default());
        body.data.push(TreeItem {
            key: None,
            child: Child::Bucket(left.clone()),
        });
        body.data.push(TreeItem {
            key: Some(5),
            child: Child::Bucket(right),
        });
        body.first_bucket = Some(left);
        let tree = Handle::new(body);

        check_structure(&tree).unwrap();
        let message = check_values(&tree).unwrap_err().to_string();
        assert!(message.contains("key 7 >= upper bound 5 at index 1"));
        assert!(message.contains("path from root 0"));
    }
}
