// External state representation for persistent nodes
// Buckets and trees serialize to nested tuples of `Datum`; child nodes appear
// either as live in-memory references or as persistent references by oid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

use crate::persistence::PersistentObject;

/// Object identifier assigned by a data manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oid(pub u64);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Class metadata carried with every persistent reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Bucket,
    Set,
    Tree,
    TreeSet,
    Length,
}

impl NodeKind {
    pub fn is_tree(self) -> bool {
        matches!(self, NodeKind::Tree | NodeKind::TreeSet)
    }

    pub fn is_bucket(self) -> bool {
        matches!(self, NodeKind::Bucket | NodeKind::Set)
    }

    /// Leaf kind stored under a tree kind
    pub fn leaf_kind(self) -> NodeKind {
        match self {
            NodeKind::Tree => NodeKind::Bucket,
            NodeKind::TreeSet => NodeKind::Set,
            other => other,
        }
    }
}

/// Persistent reference: oid plus the kind needed to build a ghost for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistentRef {
    pub oid: Oid,
    pub kind: NodeKind,
}

/// In-memory reference to a live node, used when a state is produced
/// without a data manager (plain copy/restore).
#[derive(Clone)]
pub struct ObjectRef(pub(crate) Rc<dyn PersistentObject>);

impl ObjectRef {
    pub fn kind(&self) -> NodeKind {
        self.0.kind()
    }

    pub fn object(&self) -> &Rc<dyn PersistentObject> {
        &self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.oid() {
            Some(oid) => write!(f, "<{:?} {}>", self.0.kind(), oid),
            None => write!(f, "<{:?} unsaved>", self.0.kind()),
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A value in the external representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    None,
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<Datum>),
    Ref(PersistentRef),
    /// Identity of an object that only compares by identity
    Opaque(u64),
    #[serde(skip)]
    Node(ObjectRef),
}

impl Datum {
    pub fn tuple(items: Vec<Datum>) -> Datum {
        Datum::Tuple(items)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Datum::None)
    }

    pub fn as_tuple(&self) -> Option<&[Datum]> {
        match self {
            Datum::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Name of the variant, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::None => "None",
            Datum::Int(_) => "int",
            Datum::UInt(_) => "uint",
            Datum::Float(_) => "float",
            Datum::Bytes(_) => "bytes",
            Datum::Str(_) => "str",
            Datum::Tuple(_) => "tuple",
            Datum::Ref(_) => "persistent reference",
            Datum::Opaque(_) => "opaque object",
            Datum::Node(_) => "node",
        }
    }

    /// Replace every live node reference with the value returned by `f`,
    /// walking nested tuples without recursion.
    pub(crate) fn replace_nodes<F>(&mut self, mut f: F) -> crate::error::Result<()>
    where
        F: FnMut(&ObjectRef) -> crate::error::Result<Datum>,
    {
        let mut stack: Vec<&mut Datum> = vec![self];
        while let Some(datum) = stack.pop() {
            if let Datum::Node(node) = &*datum {
                let replacement = f(node)?;
                *datum = replacement;
                continue;
            }
            if let Datum::Tuple(items) = datum {
                stack.extend(items.iter_mut());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datum_serde_roundtrip_without_nodes() {
        let datum = Datum::tuple(vec![
            Datum::tuple(vec![Datum::Int(1), Datum::Str("a".into())]),
            Datum::Ref(PersistentRef {
                oid: Oid(7),
                kind: NodeKind::Bucket,
            }),
        ]);
        let bytes = bincode::serialize(&datum).expect("serialize");
        let back: Datum = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(back, datum);
    }

    #[test]
    fn test_leaf_kinds() {
        assert_eq!(NodeKind::Tree.leaf_kind(), NodeKind::Bucket);
        assert_eq!(NodeKind::TreeSet.leaf_kind(), NodeKind::Set);
        assert!(NodeKind::TreeSet.is_tree());
        assert!(NodeKind::Set.is_bucket());
    }
}
