//! Versioned compare-and-set registers.
//!
//! The on-demand consensus core can be layered over any storage that
//! offers a single conditional-write primitive: write `new` if and only if
//! the current value equals `old`, and report the value and version that
//! are current afterwards. Versions never decrease and strictly increase
//! whenever the stored value changes; they may also increase while the
//! value stays the same.
//!
//! This module holds the trait, an in-memory register, and a history
//! checker that external register drivers can wrap around themselves to
//! torture-test their versioning.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CasError {
    #[error("register access cancelled")]
    Cancelled,
    #[error("register unavailable: {}", .0)]
    Unavailable(String),
}

#[async_trait]
pub trait CasRegister: Send + Sync {
    /// Writes `new` iff the current value equals `old`, then returns the
    /// version and value that are current after the attempt. Losing a race
    /// is not an error; the caller sees the winning value and retries from
    /// there.
    async fn compare_and_set(&self, old: &str, new: &str) -> Result<(u64, String), CasError>;
}

/// In-memory register. Starts empty at version zero.
#[derive(Debug, Default)]
pub struct Register {
    state: Mutex<(u64, String)>,
}

impl Register {
    pub fn new() -> Register {
        Register::default()
    }
}

#[async_trait]
impl CasRegister for Register {
    async fn compare_and_set(&self, old: &str, new: &str) -> Result<(u64, String), CasError> {
        let mut state = self.state.lock();
        if state.1 == old && old != new {
            state.0 += 1;
            state.1 = new.to_string();
        }
        Ok((state.0, state.1.clone()))
    }
}

/// Records every `(version, value)` pair any caller observed and flags
/// registers that serve two values for one version.
#[derive(Debug, Default)]
pub struct History {
    observed: Mutex<HashMap<u64, String>>,
}

impl History {
    pub fn new() -> History {
        History::default()
    }

    pub fn observe(&self, version: u64, value: &str) -> Result<(), CasError> {
        let mut observed = self.observed.lock();
        match observed.get(&version) {
            Some(known) if known != value => Err(CasError::Unavailable(format!(
                "version {version} served two values: {known:?} and {value:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                observed.insert(version, value.to_string());
                Ok(())
            }
        }
    }
}

/// Wraps a register so every response is checked against a shared history
/// and against the wrapping caller's own version watermark.
pub struct Checked {
    register: Arc<dyn CasRegister>,
    history: Arc<History>,
    last_version: Mutex<u64>,
}

impl Checked {
    pub fn new(register: Arc<dyn CasRegister>, history: Arc<History>) -> Checked {
        Checked {
            register,
            history,
            last_version: Mutex::new(0),
        }
    }
}

#[async_trait]
impl CasRegister for Checked {
    async fn compare_and_set(&self, old: &str, new: &str) -> Result<(u64, String), CasError> {
        let (version, actual) = self.register.compare_and_set(old, new).await?;
        {
            let mut last = self.last_version.lock();
            if version < *last {
                return Err(CasError::Unavailable(format!(
                    "version went backwards: {version} after {}",
                    *last
                )));
            }
            *last = version;
        }
        self.history.observe(version, &actual)?;
        Ok((version, actual))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn register_applies_only_matching_writes() {
        let register = Register::new();

        let (version, value) = register.compare_and_set("", "a").await.unwrap();
        assert_eq!((version, value.as_str()), (1, "a"));

        // Stale expectation: no write, current state returned.
        let (version, value) = register.compare_and_set("", "b").await.unwrap();
        assert_eq!((version, value.as_str()), (1, "a"));

        let (version, value) = register.compare_and_set("a", "b").await.unwrap();
        assert_eq!((version, value.as_str()), (2, "b"));
    }

    #[tokio::test]
    async fn identical_write_does_not_bump_the_version() {
        let register = Register::new();
        register.compare_and_set("", "a").await.unwrap();
        let (version, value) = register.compare_and_set("a", "a").await.unwrap();
        assert_eq!((version, value.as_str()), (1, "a"));
    }

    #[tokio::test]
    async fn history_rejects_conflicting_observations() {
        let history = History::new();
        history.observe(1, "a").unwrap();
        history.observe(1, "a").unwrap();
        assert_matches!(history.observe(1, "b"), Err(CasError::Unavailable(_)));
    }

    // Many contenders hammering one register: every observed version maps
    // to exactly one value, no observer ever sees versions go backwards,
    // and the register ends up having applied one write per version bump.
    #[tokio::test(flavor = "multi_thread")]
    async fn contended_register_stays_consistent() {
        const CONTENDERS: usize = 100;
        const ATTEMPTS: usize = 2_500;

        let register: Arc<dyn CasRegister> = Arc::new(Register::new());
        let history = Arc::new(History::new());

        fn count_of(value: &str) -> u64 {
            value.split('/').next().unwrap().parse().unwrap_or(0)
        }

        let mut tasks = Vec::with_capacity(CONTENDERS);
        for contender in 0..CONTENDERS {
            let checked = Checked::new(register.clone(), history.clone());
            tasks.push(tokio::spawn(async move {
                let mut known = String::new();
                let mut wins = 0u64;
                for _ in 0..ATTEMPTS {
                    // Tag attempts with the contender so no two distinct
                    // writes ever carry the same value.
                    let next = format!("{}/{contender}", count_of(&known) + 1);
                    let (_, actual) = checked.compare_and_set(&known, &next).await.unwrap();
                    if actual == next {
                        wins += 1;
                    }
                    known = actual;
                }
                wins
            }));
        }

        let mut total_wins = 0;
        for task in tasks {
            total_wins += task.await.unwrap();
        }

        let (final_version, final_value) = register.compare_and_set("", "").await.unwrap();
        assert_eq!(final_version, total_wins);
        assert_eq!(count_of(&final_value), total_wins);
    }
}
