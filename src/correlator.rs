// src/correlator.rs
use crate::cell::{DecodeError, TonAddress};
use crate::db::Store;
use crate::models::{EventKind, Log, PendingOperation};
use crate::notifier::{alert, Channel, Notifier};
use crate::parser::{self, Outcome};
use crate::retry::{retry, RetryPolicy};
use crate::rpc::{ChainClient, Message, Transaction};
use crate::scheduler::ProjectionQueue;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How withdraw and liquidate events become `processed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMode {
    /// The master's success report is taken as final.
    Inline,
    /// Wait for the user contract's own outcome transaction.
    Confirmed,
}

impl FromStr for CorrelationMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(CorrelationMode::Inline),
            "confirmed" => Ok(CorrelationMode::Confirmed),
            other => Err(eyre!("unknown correlation mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub mode: CorrelationMode,
    pub orphan_after: Duration,
    pub evict_after: Duration,
    /// Transactions fetched per pending contract on each poll
    pub poll_limit: usize,
    pub fetch_policy: RetryPolicy,
    pub store_policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Stored as processed; projection scheduled.
    Final { event_id: i64 },
    /// Stored unprocessed until the user contract answers.
    AwaitingOutcome { event_id: i64, operation_id: i64 },
    /// This transaction's event is already stored.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed { event_id: i64 },
    Failed { event_id: i64, error_code: u32 },
    Aborted { event_id: i64, exit_code: Option<i32> },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub orphaned: usize,
    pub evicted: usize,
}

type Key = (u64, String);

struct Tracked {
    op: PendingOperation,
    orphan_reported: bool,
}

/// Owns the working set of operations waiting for a user contract outcome.
pub struct Correlator {
    config: CorrelatorConfig,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    notifier: Arc<dyn Notifier>,
    projections: Arc<ProjectionQueue>,
    pending: Mutex<HashMap<Key, Tracked>>,
}

impl Correlator {
    pub fn new(
        config: CorrelatorConfig,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        notifier: Arc<dyn Notifier>,
        projections: Arc<ProjectionQueue>,
    ) -> Self {
        Self {
            config,
            store,
            chain,
            notifier,
            projections,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.config.mode
    }

    pub fn pending_count(&self) -> usize {
        self.working_set().len()
    }

    fn working_set(&self) -> std::sync::MutexGuard<'_, HashMap<Key, Tracked>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, op: &PendingOperation) {
        self.working_set().remove(&(op.lt, op.raw_body.clone()));
    }

    /// Rebuilds the working set from the store. Unprocessed events with no
    /// pending operation behind them are reported.
    pub async fn load(&self) -> Result<usize> {
        let ops = self.store.list_pending_operations().await?;
        let covered: HashSet<i64> = ops.iter().map(|op| op.event_id).collect();
        let count = ops.len();
        {
            let mut pending = self.working_set();
            for op in ops {
                pending.insert(
                    (op.lt, op.raw_body.clone()),
                    Tracked {
                        op,
                        orphan_reported: false,
                    },
                );
            }
        }
        info!("Loaded {} pending operations", count);

        for event in self.store.list_unprocessed_events().await? {
            let Some(id) = event.id else { continue };
            if !covered.contains(&id) {
                alert(
                    self.notifier.as_ref(),
                    Channel::Anomaly,
                    format!(
                        "Event {} ({} in tx {}) is unprocessed and no operation is pending for it",
                        id, event.kind, event.hash
                    ),
                )
                .await;
            }
        }
        Ok(count)
    }

    /// Records a successfully reported request. `report` is the master's
    /// message to the user contract. Safe to repeat after a partial failure.
    pub async fn accept(&self, mut event: Log, report: &Message) -> Result<Accepted> {
        let awaits_outcome = self.config.mode == CorrelationMode::Confirmed && event.kind != EventKind::Supply;
        event.processed = !awaits_outcome;

        let policy = self.config.store_policy;
        let Some(event_id) = retry(&policy, "append event", || self.store.append_event(&event)).await? else {
            return self.complete_duplicate(&event, report, awaits_outcome).await;
        };

        if !awaits_outcome {
            self.projections.schedule(&event.sender_address, event.utime).await?;
            info!("Recorded {} event {} for {}", event.kind, event_id, event.sender_address);
            return Ok(Accepted::Final { event_id });
        }

        let op = self.register(&event, event_id, report).await?;
        info!(
            "Recorded {} event {}, awaiting outcome from {} (lt {})",
            event.kind, event_id, op.contract_address, op.lt
        );
        let operation_id = op.id.ok_or_else(|| eyre!("pending operation stored without id"))?;
        Ok(Accepted::AwaitingOutcome { event_id, operation_id })
    }

    /// The event is already stored; redo whatever an interrupted earlier
    /// attempt may not have finished.
    async fn complete_duplicate(&self, event: &Log, report: &Message, awaits_outcome: bool) -> Result<Accepted> {
        let policy = self.config.store_policy;
        let stored = retry(&policy, "find event", || self.store.find_event_by_hash(&event.hash))
            .await?
            .ok_or_else(|| eyre!("event of tx {} reported stored but not found", event.hash))?;
        let event_id = stored.id.ok_or_else(|| eyre!("stored event of tx {} without id", event.hash))?;

        if stored.processed {
            self.projections.schedule(&stored.sender_address, stored.utime).await?;
        } else if awaits_outcome {
            self.register(&stored, event_id, report).await?;
        }
        debug!("Event {} of tx {} already stored", event_id, event.hash);
        Ok(Accepted::Duplicate)
    }

    /// Stores the pending operation (idempotent on its key) and tracks it.
    async fn register(&self, event: &Log, event_id: i64, report: &Message) -> Result<PendingOperation> {
        let raw_body = report
            .body_key()
            .ok_or_else(|| eyre!("report of tx {} has no body", event.hash))?;
        let mut op = PendingOperation {
            id: None,
            lt: report.created_lt,
            contract_address: report.destination().unwrap_or(event.sender_address),
            opcode: parser::family(event.kind).request,
            raw_body,
            event_id,
            event_utime: event.utime,
            created_at: Utc::now(),
        };
        let policy = self.config.store_policy;
        let operation_id = retry(&policy, "add pending operation", || self.store.add_pending_operation(&op)).await?;
        op.id = Some(operation_id);
        self.working_set()
            .entry((op.lt, op.raw_body.clone()))
            .or_insert_with(|| Tracked {
                op: op.clone(),
                orphan_reported: false,
            });
        Ok(op)
    }

    /// Resolves the pending operation whose report is `tx`'s inbound message, if any.
    pub async fn observe(&self, tx: &Transaction) -> Result<Option<Resolution>> {
        let Some(in_msg) = &tx.in_msg else {
            return Ok(None);
        };
        let Some(body) = in_msg.body_key() else {
            return Ok(None);
        };
        let key = (in_msg.created_lt, body);
        let op = self.working_set().get(&key).map(|t| t.op.clone());
        match op {
            Some(op) => self.resolve(op, tx).await,
            None => Ok(None),
        }
    }

    async fn resolve(&self, op: PendingOperation, tx: &Transaction) -> Result<Option<Resolution>> {
        let family = parser::family_of_request(op.opcode)
            .ok_or_else(|| eyre!("pending operation for event {} has unknown opcode {:#x}", op.event_id, op.opcode))?;

        // the stored row is authoritative; it may have been resolved elsewhere
        let Some(current) = self.store.find_pending_operation(op.lt, &op.raw_body).await? else {
            self.forget(&op);
            return Ok(None);
        };
        let id = current.id.ok_or_else(|| eyre!("stored pending operation without id"))?;

        let resolution = match outcome_of(family, tx) {
            Ok(Verdict::Aborted(exit_code)) => Resolution::Aborted {
                event_id: op.event_id,
                exit_code,
            },
            Ok(Verdict::Reported(Outcome::Success)) => Resolution::Confirmed { event_id: op.event_id },
            Ok(Verdict::Reported(Outcome::Fail { error_code })) => Resolution::Failed {
                event_id: op.event_id,
                error_code,
            },
            Err(e) => {
                warn!(
                    "Outcome tx {} for event {} is undecodable, leaving it pending: {}",
                    tx.hash, op.event_id, e
                );
                return Ok(None);
            }
        };

        let policy = self.config.store_policy;
        match &resolution {
            Resolution::Confirmed { event_id } => {
                retry(&policy, "mark event processed", || self.store.mark_event_processed(*event_id)).await?;
                self.projections.schedule(&op.contract_address, op.event_utime).await?;
                info!("Event {} confirmed by tx {}", event_id, tx.hash);
            }
            Resolution::Failed { event_id, error_code } => {
                retry(&policy, "delete event", || self.store.delete_event(*event_id)).await?;
                info!(
                    "Event {} failed at {}: {} ({:#x})",
                    event_id,
                    op.contract_address,
                    parser::error_description(*error_code),
                    error_code
                );
            }
            Resolution::Aborted { event_id, exit_code } => {
                retry(&policy, "delete event", || self.store.delete_event(*event_id)).await?;
                info!("Event {} dropped, outcome tx {} aborted (exit code {:?})", event_id, tx.hash, exit_code);
            }
        }

        retry(&policy, "remove pending operation", || self.store.remove_pending_operation(id)).await?;
        self.forget(&op);
        Ok(Some(resolution))
    }

    /// Reads the history of every contract with a pending operation back to
    /// its oldest report and resolves what it answers. A failing contract does not stop the rest.
    pub async fn poll_pending(&self) -> Result<usize> {
        let contracts: BTreeSet<TonAddress> = self.working_set().values().map(|t| t.op.contract_address).collect();
        let mut resolved = 0;

        for contract in contracts {
            resolved += self.poll_contract(&contract).await;
        }

        if resolved > 0 {
            info!("Resolved {} pending operations, {} left", resolved, self.pending_count());
        }
        Ok(resolved)
    }

    /// Pages back through one contract's history until the oldest operation
    /// tracked for it is covered. Fetch failures end the walk early.
    async fn poll_contract(&self, contract: &TonAddress) -> usize {
        let mut resolved = 0;
        let mut before_lt = None;

        loop {
            let floor = self
                .working_set()
                .values()
                .filter(|t| t.op.contract_address == *contract)
                .map(|t| t.op.lt)
                .min();
            let Some(floor) = floor else {
                break;
            };

            let fetched = retry(&self.config.fetch_policy, "fetch user contract transactions", || {
                self.chain.get_account_transactions(contract, before_lt, self.config.poll_limit)
            })
            .await;
            let txs = match fetched {
                Ok(txs) => txs,
                Err(e) => {
                    warn!("Polling {} failed: {:#}", contract, e);
                    break;
                }
            };
            for tx in &txs {
                match self.observe(tx).await {
                    Ok(Some(_)) => resolved += 1,
                    Ok(None) => {}
                    Err(e) => warn!("Resolving against tx {} failed: {:#}", tx.hash, e),
                }
            }

            let Some(oldest) = txs.iter().map(|tx| tx.lt).min() else {
                break;
            };
            if txs.len() < self.config.poll_limit || oldest <= floor {
                break;
            }
            before_lt = Some(oldest);
        }
        resolved
    }

    /// Reports operations waiting longer than the orphan threshold (once each)
    /// and evicts those past the eviction threshold.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let age = |op: &PendingOperation| now.signed_duration_since(op.created_at).to_std().unwrap_or_default();
        let (orphaned, evicted): (Vec<PendingOperation>, Vec<PendingOperation>) = {
            let mut pending = self.working_set();
            let mut orphaned = Vec::new();
            let mut evicted = Vec::new();
            for tracked in pending.values_mut() {
                let waited = age(&tracked.op);
                if waited >= self.config.evict_after {
                    evicted.push(tracked.op.clone());
                } else if waited >= self.config.orphan_after && !tracked.orphan_reported {
                    tracked.orphan_reported = true;
                    orphaned.push(tracked.op.clone());
                }
            }
            (orphaned, evicted)
        };

        for op in &orphaned {
            alert(
                self.notifier.as_ref(),
                Channel::Anomaly,
                format!(
                    "No outcome from {} for event {} (lt {}) after {}s",
                    op.contract_address,
                    op.event_id,
                    op.lt,
                    age(op).as_secs()
                ),
            )
            .await;
        }

        let policy = self.config.store_policy;
        for op in &evicted {
            if let Some(id) = op.id {
                retry(&policy, "remove pending operation", || self.store.remove_pending_operation(id)).await?;
            }
            self.forget(op);
            alert(
                self.notifier.as_ref(),
                Channel::Service,
                format!(
                    "Gave up waiting on {} for event {} (lt {}); the event stays unprocessed",
                    op.contract_address, op.event_id, op.lt
                ),
            )
            .await;
        }

        Ok(SweepSummary {
            orphaned: orphaned.len(),
            evicted: evicted.len(),
        })
    }

    /// One correlation tick.
    pub async fn run_cycle(&self) -> Result<()> {
        if self.pending_count() == 0 {
            return Ok(());
        }
        self.poll_pending().await?;
        self.sweep(Utc::now()).await?;
        Ok(())
    }
}

enum Verdict {
    Aborted(Option<i32>),
    Reported(Outcome),
}

fn outcome_of(family: &parser::Family, tx: &Transaction) -> Result<Verdict, DecodeError> {
    if !tx.executed() {
        return Ok(Verdict::Aborted(tx.exit_code()));
    }
    let reply = tx
        .sorted_out_msgs()
        .into_iter()
        .find(|m| m.is_internal())
        .ok_or(DecodeError::MissingMessage("outcome message"))?;
    let body = reply.body()?.ok_or(DecodeError::MissingMessage("outcome body"))?;
    parser::decode_outcome(family, &body).map(Verdict::Reported)
}
