// In-memory data manager
// Stores node states as checksummed bincode records, keeps a weak identity
// map of live nodes, and can evict idle nodes back to ghosts. `reopen` gives a
// fresh identity map over the same records, like opening a second connection.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{DataManager, Handle, NodeBody, PersistentObject, PersistentStatus};
use crate::error::{BTreeError, Result};
use crate::observability::{
    log_operation, record_metric, MetricType, Operation, OperationContext, PerfTimer,
};
use crate::state::{Datum, NodeKind, Oid, PersistentRef};

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    kind: NodeKind,
    state: Datum,
}

const CHECKSUM_LEN: usize = 4;

#[derive(Default)]
struct Storage {
    records: HashMap<Oid, Vec<u8>>,
    next_oid: u64,
}

pub struct MemoryJar {
    this: Weak<MemoryJar>,
    storage: Rc<RefCell<Storage>>,
    cache: RefCell<HashMap<Oid, Weak<dyn PersistentObject>>>,
    registered: RefCell<Vec<Rc<dyn PersistentObject>>>,
    loads: Cell<u64>,
}

impl MemoryJar {
    pub fn new() -> Rc<Self> {
        Self::with_storage(Rc::new(RefCell::new(Storage {
            records: HashMap::new(),
            next_oid: 1,
        })))
    }

    fn with_storage(storage: Rc<RefCell<Storage>>) -> Rc<Self> {
        Rc::new_cyclic(|this| MemoryJar {
            this: this.clone(),
            storage,
            cache: RefCell::new(HashMap::new()),
            registered: RefCell::new(Vec::new()),
            loads: Cell::new(0),
        })
    }

    /// New identity map over the same stored records
    pub fn reopen(&self) -> Rc<Self> {
        Self::with_storage(Rc::clone(&self.storage))
    }

    fn manager(&self) -> Result<Rc<dyn DataManager>> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| BTreeError::InvalidState("data manager was dropped".to_string()))?;
        Ok(this)
    }

    fn allocate(&self) -> Oid {
        let mut storage = self.storage.borrow_mut();
        let oid = Oid(storage.next_oid);
        storage.next_oid += 1;
        oid
    }

    /// Give a root object an oid and schedule it for the next commit
    pub fn add<T: NodeBody>(&self, handle: &Handle<T>) -> Result<Oid> {
        if let Some(oid) = handle.oid() {
            return Ok(oid);
        }
        let object = handle.as_object();
        let oid = self.allocate();
        object.attach(oid, self.manager()?);
        self.remember(&object);
        self.register(object);
        Ok(oid)
    }

    /// Typed lookup of a stored object by oid
    pub fn get<T: NodeBody>(&self, oid: Oid, kind: NodeKind) -> Result<Handle<T>> {
        let manager = self.manager()?;
        Handle::resolve(&Datum::Ref(PersistentRef { oid, kind }), Some(&manager))
    }

    /// Write every changed object, assigning oids to newly referenced nodes
    pub fn commit(&self) -> Result<usize> {
        let ctx = OperationContext::new("jar.commit");
        let result = self.write_changed();
        let objects = result.as_ref().map_or(0, |written| *written);
        log_operation(&ctx, &Operation::Commit { objects }, &result);
        result
    }

    fn write_changed(&self) -> Result<usize> {
        let manager = self.manager()?;
        let mut pending: Vec<Rc<dyn PersistentObject>> =
            self.registered.borrow_mut().drain(..).collect();
        let mut written = 0;

        while let Some(object) = pending.pop() {
            let Some(oid) = object.oid() else {
                warn!(kind = ?object.kind(), "Skipping registered object without an oid");
                continue;
            };
            if !matches!(
                object.status(),
                PersistentStatus::Changed | PersistentStatus::Unsaved
            ) {
                continue;
            }

            let mut state = object.state()?;
            state.replace_nodes(|node| {
                let child = node.object();
                let child_oid = match child.oid() {
                    Some(child_oid) => child_oid,
                    None => {
                        let child_oid = self.allocate();
                        child.attach(child_oid, Rc::clone(&manager));
                        self.remember(child);
                        pending.push(Rc::clone(child));
                        child_oid
                    }
                };
                Ok(Datum::Ref(PersistentRef {
                    oid: child_oid,
                    kind: child.kind(),
                }))
            })?;

            let record = StoredRecord {
                kind: object.kind(),
                state,
            };
            let payload = bincode::serialize(&record).map_err(|e| {
                BTreeError::InvalidState(format!("cannot serialize {oid}: {e}"))
            })?;
            let mut bytes = Vec::with_capacity(payload.len() + CHECKSUM_LEN);
            bytes.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
            bytes.extend_from_slice(&payload);
            self.storage.borrow_mut().records.insert(oid, bytes);

            object.mark_saved();
            written += 1;
        }

        info!(objects = written, "Committed changed objects");
        record_metric(MetricType::Counter {
            name: "persistence.commits",
            value: written as u64,
        });
        Ok(written)
    }

    /// Evict every idle, unchanged cached object; returns how many were evicted
    pub fn minimize(&self) -> usize {
        let _timer = PerfTimer::new("jar.minimize");
        let live: Vec<Rc<dyn PersistentObject>> = {
            let mut cache = self.cache.borrow_mut();
            cache.retain(|_, weak| weak.strong_count() > 0);
            cache.values().filter_map(Weak::upgrade).collect()
        };
        let evicted = live.iter().filter(|object| object.ghostify(false)).count();
        debug!(evicted, cached = live.len(), "Minimized object cache");
        record_metric(MetricType::Gauge {
            name: "persistence.resident_nodes",
            value: (live.len() - evicted) as u64,
        });
        evicted
    }

    pub fn load_count(&self) -> u64 {
        self.loads.get()
    }

    pub fn stored_count(&self) -> usize {
        self.storage.borrow().records.len()
    }

    /// Raw stored record, checksum included
    pub fn export_record(&self, oid: Oid) -> Option<Vec<u8>> {
        self.storage.borrow().records.get(&oid).cloned()
    }

    /// Replace a raw stored record, for restoring exported data
    pub fn import_record(&self, oid: Oid, bytes: Vec<u8>) {
        let mut storage = self.storage.borrow_mut();
        storage.next_oid = storage.next_oid.max(oid.0 + 1);
        storage.records.insert(oid, bytes);
    }

    fn read_record(&self, oid: Oid) -> Result<Datum> {
        let bytes = self
            .storage
            .borrow()
            .records
            .get(&oid)
            .cloned()
            .ok_or_else(|| BTreeError::Load {
                oid,
                reason: "no such object".to_string(),
            })?;
        if bytes.len() < CHECKSUM_LEN {
            return Err(BTreeError::Load {
                oid,
                reason: "truncated record".to_string(),
            });
        }
        let (checksum, payload) = bytes.split_at(CHECKSUM_LEN);
        let expected = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        if crc32c::crc32c(payload) != expected {
            return Err(BTreeError::Load {
                oid,
                reason: "checksum mismatch".to_string(),
            });
        }
        let record: StoredRecord = bincode::deserialize(payload).map_err(|e| BTreeError::Load {
            oid,
            reason: e.to_string(),
        })?;
        self.loads.set(self.loads.get() + 1);
        Ok(record.state)
    }
}

impl DataManager for MemoryJar {
    fn load_state(&self, oid: Oid) -> Result<Datum> {
        let ctx = OperationContext::new("jar.load");
        let result = self.read_record(oid);
        log_operation(&ctx, &Operation::Load { oid: oid.0 }, &result);
        result
    }

    fn register(&self, object: Rc<dyn PersistentObject>) {
        self.registered.borrow_mut().push(object);
    }

    fn lookup(&self, oid: Oid) -> Option<Rc<dyn PersistentObject>> {
        self.cache.borrow().get(&oid).and_then(Weak::upgrade)
    }

    fn remember(&self, object: &Rc<dyn PersistentObject>) {
        if let Some(oid) = object.oid() {
            self.cache.borrow_mut().insert(oid, Rc::downgrade(object));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_object_is_a_load_error() {
        let jar = MemoryJar::new();
        let err = jar.load_state(Oid(42)).unwrap_err();
        assert!(matches!(err, BTreeError::Load { oid: Oid(42), .. }));
    }

    #[test]
    fn test_checksum_is_verified() {
        let jar = MemoryJar::new();
        let payload = bincode::serialize(&StoredRecord {
            kind: NodeKind::Length,
            state: Datum::Int(3),
        })
        .unwrap();
        let mut bytes = crc32c::crc32c(&payload).to_le_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        jar.import_record(Oid(5), bytes.clone());
        assert_eq!(jar.load_state(Oid(5)).unwrap(), Datum::Int(3));

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        jar.import_record(Oid(5), bytes);
        let err = jar.load_state(Oid(5)).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }
}
