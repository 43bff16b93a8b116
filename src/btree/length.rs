// Length - persistent counter kept next to a tree
// Counting a large tree walks every bucket, so applications keep the count
// themselves. Concurrent changes merge by adding both deltas.

use std::rc::Rc;

use crate::error::{BTreeError, Result};
use crate::persistence::{DataManager, Handle, NodeBody};
use crate::state::{Datum, NodeKind};

#[derive(Debug, Default)]
pub struct LengthData {
    value: i64,
}

impl NodeBody for LengthData {
    fn empty(_kind: NodeKind) -> Self {
        Self::default()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Length
    }

    fn to_state(&self) -> Result<Datum> {
        Ok(Datum::Int(self.value))
    }

    fn set_state(&mut self, state: &Datum, _jar: Option<&Rc<dyn DataManager>>) -> Result<()> {
        self.value = state_value(state)?;
        Ok(())
    }

    fn clear(&mut self) {
        self.value = 0;
    }
}

fn state_value(state: &Datum) -> Result<i64> {
    match state {
        Datum::Int(value) => Ok(*value),
        Datum::UInt(value) => i64::try_from(*value)
            .map_err(|_| BTreeError::InvalidState(format!("length {value} out of range"))),
        other => Err(BTreeError::InvalidState(format!(
            "length state must be an integer, got {}",
            other.type_name()
        ))),
    }
}

/// Application-maintained element count
#[derive(Debug, Clone)]
pub struct Length {
    handle: Handle<LengthData>,
}

impl Default for Length {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Length {
    pub fn new(value: i64) -> Self {
        Self {
            handle: Handle::new(LengthData { value }),
        }
    }

    pub fn from_handle(handle: Handle<LengthData>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle<LengthData> {
        &self.handle
    }

    pub fn value(&self) -> Result<i64> {
        let pin = self.handle.use_node()?;
        let value = pin.body()?.value;
        Ok(value)
    }

    pub fn set(&self, value: i64) -> Result<()> {
        let pin = self.handle.use_node()?;
        pin.body_mut()?.value = value;
        pin.changed()
    }

    pub fn change(&self, delta: i64) -> Result<()> {
        let pin = self.handle.use_node()?;
        {
            let mut body = pin.body_mut()?;
            body.value = body.value.wrapping_add(delta);
        }
        pin.changed()
    }

    /// `committed + new - old`
    pub fn resolve_conflict(old: &Datum, committed: &Datum, new: &Datum) -> Result<Datum> {
        let old = state_value(old)?;
        let committed = state_value(committed)?;
        let new = state_value(new)?;
        Ok(Datum::Int(committed.wrapping_add(new).wrapping_sub(old)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryJar, PersistentStatus};

    #[test]
    fn test_change_and_set() {
        let length = Length::default();
        length.change(5).unwrap();
        length.change(-2).unwrap();
        assert_eq!(length.value().unwrap(), 3);
        length.set(10).unwrap();
        assert_eq!(length.value().unwrap(), 10);
    }

    #[test]
    fn test_conflict_adds_both_deltas() {
        let merged =
            Length::resolve_conflict(&Datum::Int(10), &Datum::Int(13), &Datum::Int(9)).unwrap();
        assert_eq!(merged, Datum::Int(12));
        assert!(Length::resolve_conflict(&Datum::None, &Datum::Int(1), &Datum::Int(1)).is_err());
    }

    #[test]
    fn test_persists_through_jar() -> anyhow::Result<()> {
        let jar = MemoryJar::new();
        let length = Length::new(4);
        let oid = jar.add(length.handle())?;
        jar.commit()?;
        length.change(1)?;
        assert_eq!(length.handle().status(), PersistentStatus::Changed);
        jar.commit()?;

        let reopened = jar.reopen();
        let loaded = Length::from_handle(reopened.get::<LengthData>(oid, NodeKind::Length)?);
        assert!(loaded.handle().is_ghost());
        assert_eq!(loaded.value()?, 5);
        Ok(())
    }
}
