//! A member store layered over a versioned compare-and-set register.
//!
//! The register holds one JSON-encoded value per member, the latest. A
//! write-read loops over read-then-conditional-write until either its own
//! value lands, or the register turns out to already hold a value for the
//! requested step or a later one. Register errors are treated as
//! transient and retried with backoff until cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cas::CasRegister;
use crate::ondemand::store::{Store, StoreError};
use crate::ondemand::value::Value;
use crate::utilities::backoff::{retry, BackoffPolicy};

pub struct CasStore {
    register: Arc<dyn CasRegister>,
    policy: BackoffPolicy,
    token: CancellationToken,
}

impl CasStore {
    pub fn new(
        register: Arc<dyn CasRegister>,
        policy: BackoffPolicy,
        token: CancellationToken,
    ) -> CasStore {
        CasStore {
            register,
            policy,
            token,
        }
    }

    async fn attempt(&self, old: String, new: String) -> Result<(u64, String), StoreError> {
        let register = self.register.clone();
        retry(&self.policy, &self.token, move || {
            let register = register.clone();
            let old = old.clone();
            let new = new.clone();
            async move { register.compare_and_set(&old, &new).await }
        })
        .await
        .map_err(|_| StoreError::Cancelled)
    }
}

#[async_trait]
impl Store for CasStore {
    async fn write_read(&self, value: Value) -> Result<Value, StoreError> {
        let encoded = serde_json::to_string(&value)?;
        let mut known = String::new();
        loop {
            let (_, actual) = self.attempt(known, encoded.clone()).await?;
            if actual == encoded {
                // Our conditional write landed.
                return Ok(value);
            }
            if actual.is_empty() {
                known = actual;
                continue;
            }
            let current: Value = serde_json::from_str(&actual)?;
            if current.step >= value.step {
                // The step is already taken, or the member moved past it.
                return Ok(current);
            }
            // The register lags behind the requested step; replace it.
            known = actual;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::cas::{CasError, Register};
    use crate::ondemand::value::{Head, Proposal};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2))
    }

    fn value(step: u64, data: &str) -> Value {
        let prop = Proposal {
            node: 0,
            priority: 1,
            data: data.to_string(),
        };
        Value::proposal(step, Head::default(), prop)
    }

    fn cas_store(register: Arc<dyn CasRegister>) -> CasStore {
        CasStore::new(register, fast_policy(), CancellationToken::new())
    }

    #[tokio::test]
    async fn write_read_is_first_come_first_served() {
        let register: Arc<dyn CasRegister> = Arc::new(Register::new());
        let store = cas_store(register.clone());

        let winner = store.write_read(value(0, "first")).await.unwrap();
        assert_eq!(winner.prop.data, "first");

        let other = cas_store(register);
        let winner = other.write_read(value(0, "second")).await.unwrap();
        assert_eq!(winner.prop.data, "first");
    }

    #[tokio::test]
    async fn newer_steps_replace_older_ones() {
        let register: Arc<dyn CasRegister> = Arc::new(Register::new());
        let store = cas_store(register);

        store.write_read(value(0, "old")).await.unwrap();
        let winner = store.write_read(value(4, "new")).await.unwrap();
        assert_eq!(winner.prop.data, "new");
    }

    #[tokio::test]
    async fn requests_behind_the_member_get_its_later_value() {
        let register: Arc<dyn CasRegister> = Arc::new(Register::new());
        let store = cas_store(register);

        store.write_read(value(8, "ahead")).await.unwrap();
        let answer = store.write_read(value(2, "late")).await.unwrap();
        assert_eq!(answer.step, 8);
        assert_eq!(answer.prop.data, "ahead");
    }

    struct BrokenRegister;

    #[async_trait]
    impl CasRegister for BrokenRegister {
        async fn compare_and_set(&self, _: &str, _: &str) -> Result<(u64, String), CasError> {
            Err(CasError::Unavailable("disk on fire".to_string()))
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_retrying() {
        let token = CancellationToken::new();
        let store = CasStore::new(Arc::new(BrokenRegister), fast_policy(), token.clone());
        token.cancel();

        let result = store.write_read(value(0, "doomed")).await;
        assert_matches!(result, Err(StoreError::Cancelled));
    }
}
