//! The client driving consensus across the member stores.
//!
//! One worker task per member keeps register accesses serial per store;
//! the proposer hands every worker the value to write for the current
//! time-step and moves on as soon as a receive threshold of members has
//! answered for exactly that step. Four steps make a round: one threshold
//! broadcast to spread proposals, one more to find out which proposal the
//! group saw spread widely enough to commit.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use lru::LruCache;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigurationError, OnDemandConfig};
use crate::ondemand::store::{Store, StoreError};
use crate::ondemand::value::{best_proposal, uniquely_best, Head, Proposal, Value, ValueSet};
use crate::protocol::{NodeId, Step};
use crate::utilities::entropy::Entropy;

/// Steps per consensus round: two threshold broadcasts of two steps each.
const ROUND_STEPS: Step = 4;

/// Bound on how many steps' worth of member answers stay cached.
const CACHED_STEPS: usize = 32;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("consensus cancelled")]
    Cancelled,
    #[error("member store failed: {0}")]
    Store(#[from] StoreError),
    #[error("all store workers terminated")]
    WorkersGone,
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Why an in-progress round was cut short.
enum RoundAbort {
    /// A member answered from a later step: the group moved on without us.
    Behind(Value),
    Cancelled,
    Store(StoreError),
    WorkersGone,
}

struct WorkerReply {
    node: NodeId,
    requested: Step,
    result: Result<Value, StoreError>,
}

pub struct Client {
    size: usize,
    receive_threshold: usize,
    spread_threshold: usize,
    entropy: Box<dyn Entropy>,
    step: Step,
    head: Head,
    /// Member answers keyed by step. Workers may answer late for steps the
    /// proposer has already left behind; those entries age out.
    cache: LruCache<Step, ValueSet>,
    jobs: Vec<mpsc::UnboundedSender<Value>>,
    replies: mpsc::UnboundedReceiver<WorkerReply>,
    workers: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("size", &self.size)
            .field("receive_threshold", &self.receive_threshold)
            .field("spread_threshold", &self.spread_threshold)
            .field("step", &self.step)
            .field("head", &self.head)
            .finish()
    }
}

impl Client {
    pub fn new(
        config: &OnDemandConfig,
        stores: Vec<Arc<dyn Store>>,
        entropy: Box<dyn Entropy>,
        token: CancellationToken,
    ) -> Result<Client, ClientError> {
        config.validate()?;
        if stores.len() != config.size {
            return Err(ConfigurationError::Other(format!(
                "{} stores for a group of {}",
                stores.len(),
                config.size
            ))
            .into());
        }

        let (reply_tx, replies) = mpsc::unbounded_channel();
        let mut jobs = Vec::with_capacity(config.size);
        let mut workers = Vec::with_capacity(config.size);
        for (node, store) in stores.into_iter().enumerate() {
            let (job_tx, job_rx) = mpsc::unbounded_channel();
            workers.push(tokio::spawn(store_worker(
                node,
                store,
                job_rx,
                reply_tx.clone(),
                token.child_token(),
            )));
            jobs.push(job_tx);
        }

        Ok(Client {
            size: config.size,
            receive_threshold: config.receive_threshold(),
            spread_threshold: config.spread_threshold(),
            entropy,
            step: 0,
            head: Head::default(),
            cache: LruCache::new(NonZeroUsize::new(CACHED_STEPS).expect("nonzero")),
            jobs,
            replies,
            workers,
            token,
        })
    }

    /// The history head this client currently builds on.
    pub fn head(&self) -> &Head {
        &self.head
    }

    /// The time-step the next round will start at.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Drives rounds proposing `data` until some round commits, returning
    /// the newly committed head — which may carry another client's data.
    pub async fn commit(&mut self, data: impl Into<String>) -> Result<Head, ClientError> {
        let data = data.into();
        loop {
            let base = self.step;
            match self.round(base, &data).await {
                Ok(Some(head)) => return Ok(head),
                Ok(None) => {}
                Err(RoundAbort::Behind(value)) => self.resync(value),
                Err(RoundAbort::Cancelled) => return Err(ClientError::Cancelled),
                Err(RoundAbort::Store(err)) => return Err(ClientError::Store(err)),
                Err(RoundAbort::WorkersGone) => return Err(ClientError::WorkersGone),
            }
        }
    }

    /// One four-step round starting at `base`.
    async fn round(&mut self, base: Step, data: &str) -> Result<Option<Head>, RoundAbort> {
        let head = self.head.clone();

        // Propose on behalf of every member, each with a fresh priority
        // that stays fixed for the whole round.
        let proposals: Vec<Value> = (0..self.size)
            .map(|node| {
                let prop = Proposal {
                    node,
                    priority: self.next_priority(),
                    data: data.to_string(),
                };
                Value::proposal(base, head.clone(), prop)
            })
            .collect();
        let (receive0, broadcast0) = self.tlcb(base, proposals).await?;

        // Spread the best proposal the group saw spread in the first half.
        let best = best_proposal(&broadcast0);
        let spreads: Vec<Value> = (0..self.size)
            .map(|_| Value {
                step: base + 2,
                head: head.clone(),
                prop: best.clone(),
                receive: receive0.clone(),
                broadcast: broadcast0.clone(),
            })
            .collect();
        let (receive2, broadcast2) = self.tlcb(base + 2, spreads).await?;

        self.step = base + ROUND_STEPS;

        let winner = best_proposal(&receive2);
        if winner.is_none() {
            trace!("Round {base}: nothing spread widely enough to win");
            return Ok(None);
        }

        // Whether committed or not, the round's winner becomes the head we
        // build on next; a committed round just makes it definite.
        self.head = Head {
            step: base,
            data: winner.data.clone(),
        };

        let confirmed = broadcast2
            .get(&winner.node)
            .map_or(false, |value| value.prop == winner);
        let unspoiled = uniquely_best(&receive0, &winner);
        if confirmed && unspoiled {
            debug!(
                "Round {base} committed member {}'s proposal: {:?}",
                winner.node, winner.data
            );
            Ok(Some(self.head.clone()))
        } else {
            trace!("Round {base}: winner unconfirmed or spoiled, going again");
            Ok(None)
        }
    }

    fn next_priority(&mut self) -> u64 {
        loop {
            let priority = self.entropy.next();
            if priority > 0 {
                return priority;
            }
        }
    }

    /// Adopts the head observed in a later-step value and rejoins at the
    /// first round starting after that step.
    fn resync(&mut self, value: Value) {
        let base = (value.step / ROUND_STEPS + 1) * ROUND_STEPS;
        warn!(
            "Fell behind the group at step {}; rejoining at step {base}",
            self.step
        );
        self.head = value.head;
        self.step = base;
    }

    /// Threshold broadcast: two back-to-back threshold receives. Returns
    /// the union of everything the second receive saw of the first, and
    /// the subset enough members echoed to count as broadcast.
    async fn tlcb(
        &mut self,
        step: Step,
        values: Vec<Value>,
    ) -> Result<(ValueSet, ValueSet), RoundAbort> {
        let first = self.tlcr(step, values).await?;

        let head = self.head.clone();
        let relays = (0..self.size)
            .map(|_| Value::relay(step + 1, head.clone(), first.clone()))
            .collect();
        let second = self.tlcr(step + 1, relays).await?;

        let mut receive = ValueSet::new();
        let mut appearances: BTreeMap<NodeId, usize> = BTreeMap::new();
        for relay in second.values() {
            for (node, value) in &relay.receive {
                receive.insert(*node, value.clone());
                *appearances.entry(*node).or_default() += 1;
            }
        }
        let broadcast = receive
            .iter()
            .filter(|(node, _)| appearances[node] >= self.spread_threshold)
            .map(|(node, value)| (*node, value.clone()))
            .collect();
        Ok((receive, broadcast))
    }

    /// Threshold receive: hand every worker its value for `step`, then
    /// wait until a receive threshold of members has answered for exactly
    /// that step.
    async fn tlcr(&mut self, step: Step, values: Vec<Value>) -> Result<ValueSet, RoundAbort> {
        for (node, value) in values.into_iter().enumerate() {
            // A closed job channel means the worker failed; its error
            // arrives through the reply channel.
            let _ = self.jobs[node].send(value);
        }

        loop {
            if let Some(answers) = self.cache.get(&step) {
                if answers.len() >= self.receive_threshold {
                    return Ok(answers.clone());
                }
            }

            let reply = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(RoundAbort::Cancelled),
                reply = self.replies.recv() => reply.ok_or(RoundAbort::WorkersGone)?,
            };
            let value = match reply.result {
                Ok(value) => value,
                Err(StoreError::Cancelled) => return Err(RoundAbort::Cancelled),
                Err(err) => {
                    error!("Store worker {} failed: {err}", reply.node);
                    return Err(RoundAbort::Store(err));
                }
            };
            if value.step > reply.requested {
                return Err(RoundAbort::Behind(value));
            }
            let answers = self.cache.get_or_insert_mut(value.step, ValueSet::new);
            answers.entry(reply.node).or_insert(value);
        }
    }

    /// Cancels the workers and waits for them to wind down.
    pub async fn shutdown(mut self) {
        info!("Stopping consensus client");
        self.token.cancel();
        self.jobs.clear();
        for outcome in futures::future::join_all(self.workers.drain(..)).await {
            if let Err(err) = outcome {
                warn!("Store worker ended abnormally: {err}");
            }
        }
    }
}

/// Serially relays the proposer's per-step values to one member store.
/// Blocking happens only inside `write_read`, never while the proposer
/// needs attention.
async fn store_worker(
    node: NodeId,
    store: Arc<dyn Store>,
    mut jobs: mpsc::UnboundedReceiver<Value>,
    replies: mpsc::UnboundedSender<WorkerReply>,
    token: CancellationToken,
) {
    while let Some(value) = jobs.recv().await {
        let requested = value.step;
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(StoreError::Cancelled),
            result = store.write_read(value) => result,
        };
        let failed = result.is_err();
        if replies
            .send(WorkerReply {
                node,
                requested,
                result,
            })
            .is_err()
        {
            break;
        }
        if failed {
            break;
        }
    }
    trace!("Store worker {node} stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    use super::*;
    use crate::cas::{CasRegister, Register};
    use crate::ondemand::castore::CasStore;
    use crate::ondemand::store::MemStore;
    use crate::utilities::backoff::BackoffPolicy;
    use crate::utilities::entropy::SeededEntropy;

    fn mem_stores(count: usize) -> Vec<Arc<dyn Store>> {
        (0..count)
            .map(|_| Arc::new(MemStore::new()) as Arc<dyn Store>)
            .collect()
    }

    fn client(config: &OnDemandConfig, stores: Vec<Arc<dyn Store>>, seed: u64) -> Client {
        Client::new(
            config,
            stores,
            Box::new(SeededEntropy::new(seed)),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn lone_client_commits_its_own_proposals() {
        let config = OnDemandConfig::new(3, 1);
        let mut alone = client(&config, mem_stores(3), 5);

        let mut last_step = None;
        for turn in 0..10 {
            let head = alone.commit(format!("operation {turn}")).await.unwrap();
            assert_eq!(head.data, format!("operation {turn}"));
            assert!(last_step.map_or(true, |previous| previous < head.step));
            last_step = Some(head.step);
        }
        alone.shutdown().await;
    }

    #[tokio::test]
    async fn store_count_must_match_the_group() {
        let config = OnDemandConfig::new(3, 1);
        let result = Client::new(
            &config,
            mem_stores(2),
            Box::new(SeededEntropy::new(1)),
            CancellationToken::new(),
        );
        assert_matches!(result, Err(ClientError::Configuration(_)));
    }

    #[tokio::test]
    async fn cancellation_surfaces_cleanly() {
        let config = OnDemandConfig::new(3, 1);
        let token = CancellationToken::new();
        let mut doomed = Client::new(
            &config,
            mem_stores(3),
            Box::new(SeededEntropy::new(2)),
            token.clone(),
        )
        .unwrap();

        token.cancel();
        assert_matches!(doomed.commit("too late").await, Err(ClientError::Cancelled));
        doomed.shutdown().await;
    }

    // Several clients race over the same member stores; whenever two of
    // them report a commit for the same round, the committed data must be
    // identical.
    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_clients_agree_on_every_committed_round() {
        const CLIENTS: usize = 3;
        const OPERATIONS: usize = 25;

        let stores: Vec<Arc<MemStore>> = (0..9).map(|_| Arc::new(MemStore::new())).collect();
        let committed: Arc<Mutex<BTreeMap<Step, String>>> = Arc::default();

        let mut tasks = Vec::new();
        for client_id in 0..CLIENTS {
            let stores: Vec<Arc<dyn Store>> = stores
                .iter()
                .map(|store| store.clone() as Arc<dyn Store>)
                .collect();
            let committed = committed.clone();
            tasks.push(tokio::spawn(async move {
                let config = OnDemandConfig::new(9, 2);
                let mut racer = client(&config, stores, 100 + client_id as u64);
                for operation in 0..OPERATIONS {
                    let head = racer
                        .commit(format!("client {client_id} op {operation}"))
                        .await
                        .unwrap();
                    let mut committed = committed.lock();
                    committed
                        .entry(head.step)
                        .and_modify(|known| {
                            assert_eq!(
                                known, &head.data,
                                "clients disagree about round {}",
                                head.step
                            )
                        })
                        .or_insert(head.data);
                }
                racer.shutdown().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(!committed.lock().is_empty());
    }

    // A client starting from scratch against registers another client has
    // already driven forward discovers it is behind, adopts the observed
    // head, and rejoins at a fresh round.
    #[tokio::test]
    async fn late_client_resyncs_over_cas_registers() {
        let config = OnDemandConfig::new(3, 1);
        let registers: Vec<Arc<Register>> = (0..3).map(|_| Arc::new(Register::new())).collect();
        let stores = |token: &CancellationToken| -> Vec<Arc<dyn Store>> {
            registers
                .iter()
                .map(|register| {
                    Arc::new(CasStore::new(
                        register.clone() as Arc<dyn CasRegister>,
                        BackoffPolicy::default(),
                        token.clone(),
                    )) as Arc<dyn Store>
                })
                .collect()
        };

        let first_token = CancellationToken::new();
        let mut first = Client::new(
            &config,
            stores(&first_token),
            Box::new(SeededEntropy::new(21)),
            first_token,
        )
        .unwrap();
        for turn in 0..3 {
            let head = first.commit(format!("early {turn}")).await.unwrap();
            assert_eq!(head.data, format!("early {turn}"));
        }
        let frontier = first.step();
        first.shutdown().await;

        let late_token = CancellationToken::new();
        let mut late = Client::new(
            &config,
            stores(&late_token),
            Box::new(SeededEntropy::new(22)),
            late_token,
        )
        .unwrap();
        let head = late.commit("late arrival").await.unwrap();
        assert_eq!(head.data, "late arrival");
        assert!(
            head.step >= frontier,
            "late client committed at step {} before the frontier {frontier}",
            head.step
        );
        late.shutdown().await;
    }
}
