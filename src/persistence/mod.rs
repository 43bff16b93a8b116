// Persistence adapter for tree and bucket nodes
// A node lives behind a reference-counted `Handle`; before its body is read
// it must be materialized (loaded from its data manager if it is a ghost) and
// pinned. Pins are counted, so nested use during one operation is fine, and a
// pinned node is never evicted.

pub mod jar;

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::{BTreeError, Result};
use crate::observability::{record_metric, MetricType};
use crate::state::{Datum, NodeKind, ObjectRef, Oid};

pub use jar::MemoryJar;

/// Residency and change-tracking status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentStatus {
    /// Never stored; has no oid
    Unsaved,
    UpToDate,
    Changed,
    /// Evicted; the body must be reloaded before use
    Ghost,
}

/// Node payload managed by a `Handle`
pub trait NodeBody: 'static {
    /// Empty body of the given kind, used for ghosts
    fn empty(kind: NodeKind) -> Self
    where
        Self: Sized;

    fn kind(&self) -> NodeKind;

    fn to_state(&self) -> Result<Datum>;

    fn set_state(&mut self, state: &Datum, jar: Option<&Rc<dyn DataManager>>) -> Result<()>;

    /// Drop owned substructure, leaving an empty body of the same kind
    fn clear(&mut self);
}

/// Object-safe view of a persistent node, used by data managers
pub trait PersistentObject: Any {
    fn kind(&self) -> NodeKind;

    fn oid(&self) -> Option<Oid>;

    fn status(&self) -> PersistentStatus;

    /// Materialize and produce the current state
    fn state(&self) -> Result<Datum>;

    fn attach(&self, oid: Oid, jar: Rc<dyn DataManager>);

    fn mark_saved(&self);

    fn ghostify(&self, force: bool) -> bool;

    fn as_any(self: Rc<Self>) -> Rc<dyn Any>;
}

/// External persistence collaborator
pub trait DataManager {
    /// Fetch the stored state of an object
    fn load_state(&self, oid: Oid) -> Result<Datum>;

    /// Called when a stored object changes
    fn register(&self, object: Rc<dyn PersistentObject>);

    /// Identity map lookup
    fn lookup(&self, oid: Oid) -> Option<Rc<dyn PersistentObject>>;

    fn remember(&self, object: &Rc<dyn PersistentObject>);
}

struct Header {
    kind: NodeKind,
    oid: Option<Oid>,
    jar: Option<Rc<dyn DataManager>>,
    status: PersistentStatus,
    pins: usize,
    accesses: u64,
}

pub struct PersistentNode<T> {
    header: RefCell<Header>,
    body: RefCell<T>,
}

fn busy(kind: NodeKind) -> BTreeError {
    BTreeError::StructuralInvariant(format!("{kind:?} node is already borrowed"))
}

impl<T: NodeBody> PersistentNode<T> {
    fn materialize(&self) -> Result<()> {
        let (oid, jar) = {
            let header = self.header.borrow();
            if header.status != PersistentStatus::Ghost {
                return Ok(());
            }
            match (header.oid, header.jar.clone()) {
                (Some(oid), Some(jar)) => (oid, jar),
                _ => {
                    return Err(BTreeError::InvalidState(
                        "ghost node has no data manager".to_string(),
                    ))
                }
            }
        };

        let state = jar.load_state(oid)?;
        {
            let kind = self.header.borrow().kind;
            let mut body = self.body.try_borrow_mut().map_err(|_| busy(kind))?;
            body.set_state(&state, Some(&jar))?;
        }
        self.header.borrow_mut().status = PersistentStatus::UpToDate;

        debug!(oid = %oid, "Materialized ghost node");
        record_metric(MetricType::Counter {
            name: "persistence.loads",
            value: 1,
        });
        Ok(())
    }
}

impl<T: NodeBody> PersistentObject for PersistentNode<T> {
    fn kind(&self) -> NodeKind {
        self.header.borrow().kind
    }

    fn oid(&self) -> Option<Oid> {
        self.header.borrow().oid
    }

    fn status(&self) -> PersistentStatus {
        self.header.borrow().status
    }

    fn state(&self) -> Result<Datum> {
        self.materialize()?;
        let body = self.body.try_borrow().map_err(|_| busy(self.kind()))?;
        body.to_state()
    }

    fn attach(&self, oid: Oid, jar: Rc<dyn DataManager>) {
        let mut header = self.header.borrow_mut();
        header.oid = Some(oid);
        header.jar = Some(jar);
    }

    fn mark_saved(&self) {
        let mut header = self.header.borrow_mut();
        if header.status != PersistentStatus::Ghost {
            header.status = PersistentStatus::UpToDate;
        }
    }

    fn ghostify(&self, force: bool) -> bool {
        {
            let header = self.header.borrow();
            if header.pins > 0 || header.oid.is_none() || header.jar.is_none() {
                return false;
            }
            match header.status {
                PersistentStatus::UpToDate => {}
                PersistentStatus::Changed if force => {}
                _ => return false,
            }
        }
        let Ok(mut body) = self.body.try_borrow_mut() else {
            return false;
        };
        body.clear();
        drop(body);

        let mut header = self.header.borrow_mut();
        header.status = PersistentStatus::Ghost;
        trace!(oid = ?header.oid, kind = ?header.kind, "Node evicted to ghost");
        true
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Shared handle to a persistent node
pub struct Handle<T> {
    node: Rc<PersistentNode<T>>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
        }
    }
}

impl<T> Handle<T> {
    /// Take the node apart if this is the last strong reference
    pub(crate) fn try_into_body(self) -> std::result::Result<T, Self> {
        match Rc::try_unwrap(self.node) {
            Ok(node) => Ok(node.body.into_inner()),
            Err(node) => Err(Handle { node }),
        }
    }
}

impl<T: NodeBody> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.node.header.borrow();
        f.debug_struct("Handle")
            .field("kind", &header.kind)
            .field("oid", &header.oid)
            .field("status", &header.status)
            .finish()
    }
}

impl<T: NodeBody> Handle<T> {
    /// Wrap a fresh, never-stored body
    pub fn new(body: T) -> Self {
        let header = Header {
            kind: body.kind(),
            oid: None,
            jar: None,
            status: PersistentStatus::Unsaved,
            pins: 0,
            accesses: 0,
        };
        Self {
            node: Rc::new(PersistentNode {
                header: RefCell::new(header),
                body: RefCell::new(body),
            }),
        }
    }

    fn ghost(kind: NodeKind, oid: Oid, jar: Rc<dyn DataManager>) -> Self {
        let header = Header {
            kind,
            oid: Some(oid),
            jar: Some(jar),
            status: PersistentStatus::Ghost,
            pins: 0,
            accesses: 0,
        };
        Self {
            node: Rc::new(PersistentNode {
                header: RefCell::new(header),
                body: RefCell::new(T::empty(kind)),
            }),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.node.header.borrow().kind
    }

    pub fn oid(&self) -> Option<Oid> {
        self.node.header.borrow().oid
    }

    pub fn status(&self) -> PersistentStatus {
        self.node.header.borrow().status
    }

    pub fn is_ghost(&self) -> bool {
        self.status() == PersistentStatus::Ghost
    }

    pub fn pins(&self) -> usize {
        self.node.header.borrow().pins
    }

    /// Number of completed use spans
    pub fn accesses(&self) -> u64 {
        self.node.header.borrow().accesses
    }

    pub fn ptr_eq(&self, other: &Handle<T>) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    pub(crate) fn jar(&self) -> Option<Rc<dyn DataManager>> {
        self.node.header.borrow().jar.clone()
    }

    /// Load the body if this node is a ghost; idempotent
    pub fn materialize(&self) -> Result<()> {
        self.node.materialize()
    }

    /// Materialize and pin; the pin is released when the guard drops
    pub fn use_node(&self) -> Result<Pinned<T>> {
        self.node.materialize()?;
        self.node.header.borrow_mut().pins += 1;
        Ok(Pinned {
            handle: self.clone(),
        })
    }

    /// Body access without loading; a ghost exposes its empty placeholder
    pub(crate) fn unloaded_body_mut(&self) -> Result<RefMut<'_, T>> {
        self.node
            .body
            .try_borrow_mut()
            .map_err(|_| busy(self.kind()))
    }

    /// Record an in-place mutation of the body
    pub fn mark_dirty(&self) -> Result<()> {
        let jar = {
            let mut header = self.node.header.borrow_mut();
            match header.status {
                PersistentStatus::UpToDate => {
                    header.status = PersistentStatus::Changed;
                    header.jar.clone()
                }
                PersistentStatus::Ghost => {
                    return Err(BTreeError::InvalidState(
                        "cannot modify a ghost node".to_string(),
                    ))
                }
                PersistentStatus::Unsaved | PersistentStatus::Changed => None,
            }
        };
        if let Some(jar) = jar {
            jar.register(self.as_object());
        }
        Ok(())
    }

    /// Evict the node if it is idle. `force` also discards unsaved changes;
    /// a pinned node is never evicted.
    pub fn ghostify_if_idle(&self, force: bool) -> bool {
        self.node.ghostify(force)
    }

    pub(crate) fn as_object(&self) -> Rc<dyn PersistentObject> {
        self.node.clone()
    }

    pub(crate) fn object_ref(&self) -> ObjectRef {
        ObjectRef(self.as_object())
    }

    /// Kind of the node a state reference points at
    pub(crate) fn reference_kind(datum: &Datum) -> Option<NodeKind> {
        match datum {
            Datum::Node(node) => Some(node.kind()),
            Datum::Ref(reference) => Some(reference.kind),
            _ => None,
        }
    }

    /// Turn a state reference back into a handle, reusing live objects
    pub(crate) fn resolve(datum: &Datum, jar: Option<&Rc<dyn DataManager>>) -> Result<Self> {
        match datum {
            Datum::Node(node) => Self::downcast(node.object().clone()),
            Datum::Ref(reference) => {
                let jar = jar.ok_or_else(|| {
                    BTreeError::InvalidState(format!(
                        "reference to {} without a data manager",
                        reference.oid
                    ))
                })?;
                if let Some(object) = jar.lookup(reference.oid) {
                    return Self::downcast(object);
                }
                let handle = Self::ghost(reference.kind, reference.oid, Rc::clone(jar));
                jar.remember(&handle.as_object());
                Ok(handle)
            }
            other => Err(BTreeError::InvalidState(format!(
                "expected a node reference, got {}",
                other.type_name()
            ))),
        }
    }

    fn downcast(object: Rc<dyn PersistentObject>) -> Result<Self> {
        let kind = object.kind();
        object
            .as_any()
            .downcast::<PersistentNode<T>>()
            .map(|node| Handle { node })
            .map_err(|_| BTreeError::InvalidState(format!("{kind:?} node has an unexpected type")))
    }
}

/// Materialized, pinned node. Dropping the guard releases the pin.
pub struct Pinned<T: NodeBody> {
    handle: Handle<T>,
}

impl<T: NodeBody> Pinned<T> {
    pub fn handle(&self) -> &Handle<T> {
        &self.handle
    }

    pub fn body(&self) -> Result<Ref<'_, T>> {
        self.handle
            .node
            .body
            .try_borrow()
            .map_err(|_| busy(self.handle.kind()))
    }

    pub fn body_mut(&self) -> Result<RefMut<'_, T>> {
        self.handle
            .node
            .body
            .try_borrow_mut()
            .map_err(|_| busy(self.handle.kind()))
    }

    pub fn changed(&self) -> Result<()> {
        self.handle.mark_dirty()
    }
}

impl<T: NodeBody> Drop for Pinned<T> {
    fn drop(&mut self) {
        let mut header = self.handle.node.header.borrow_mut();
        header.pins = header.pins.saturating_sub(1);
        header.accesses += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::bucket::BucketData;

    #[test]
    fn test_pins_nest_and_release() {
        let handle = Handle::new(BucketData::<i32, i32>::empty(NodeKind::Bucket));
        {
            let outer = handle.use_node().unwrap();
            let inner = handle.use_node().unwrap();
            assert_eq!(handle.pins(), 2);
            drop(inner);
            assert_eq!(handle.pins(), 1);
            assert!(outer.body().is_ok());
        }
        assert_eq!(handle.pins(), 0);
        assert_eq!(handle.accesses(), 2);
    }

    #[test]
    fn test_unsaved_nodes_are_never_evicted() {
        let handle = Handle::new(BucketData::<i32, i32>::empty(NodeKind::Bucket));
        assert!(!handle.ghostify_if_idle(true));
        assert_eq!(handle.status(), PersistentStatus::Unsaved);
        assert!(handle.mark_dirty().is_ok());
        assert_eq!(handle.status(), PersistentStatus::Unsaved);
    }

    #[test]
    fn test_conflicting_borrow_is_an_error_not_a_panic() {
        let handle = Handle::new(BucketData::<i32, i32>::empty(NodeKind::Bucket));
        let pin = handle.use_node().unwrap();
        let _writer = pin.body_mut().unwrap();
        assert!(matches!(pin.body(), Err(BTreeError::StructuralInvariant(_))));
    }
}
