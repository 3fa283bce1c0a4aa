//! Per-member write-once-per-step stores.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::ondemand::value::Value;
use crate::protocol::Step;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store access cancelled")]
    Cancelled,
    #[error("stored value corrupt: {}", .0)]
    Decode(#[from] serde_json::Error),
}

/// The persistent register of one consensus group member.
///
/// Implementations are expected to ride out transient failures internally,
/// retrying with backoff for as long as the caller has not cancelled;
/// an error returned from here is fatal for the calling client.
#[async_trait]
pub trait Store: Send + Sync {
    /// Writes `value` at `value.step` unless that step already holds one,
    /// then returns whatever the store holds for the step: the caller's
    /// own write, an earlier winner, or a value from a later step if the
    /// member has already moved past the requested one.
    async fn write_read(&self, value: Value) -> Result<Value, StoreError>;
}

/// In-memory store retaining every step. First write wins; repeated
/// writes at a step return the fixed winner forever.
#[derive(Debug, Default)]
pub struct MemStore {
    slots: Mutex<BTreeMap<Step, Value>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn write_read(&self, value: Value) -> Result<Value, StoreError> {
        let mut slots = self.slots.lock();
        let winner = slots.entry(value.step).or_insert(value);
        Ok(winner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondemand::value::{Head, Proposal};

    fn value(step: Step, data: &str) -> Value {
        let prop = Proposal {
            node: 0,
            priority: 1,
            data: data.to_string(),
        };
        Value::proposal(step, Head::default(), prop)
    }

    #[tokio::test]
    async fn first_write_fixes_the_step() {
        let store = MemStore::new();

        let winner = store.write_read(value(3, "first")).await.unwrap();
        assert_eq!(winner.prop.data, "first");

        // Later writers at the same step read the fixed winner back.
        let winner = store.write_read(value(3, "second")).await.unwrap();
        assert_eq!(winner.prop.data, "first");

        // Other steps are independent.
        let winner = store.write_read(value(4, "second")).await.unwrap();
        assert_eq!(winner.prop.data, "second");
    }
}
