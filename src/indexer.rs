// src/indexer.rs
use crate::assets::AssetTable;
use crate::cell::{Cell, DecodeError, TonAddress};
use crate::correlator::{Accepted, Correlator, Resolution};
use crate::db::Store;
use crate::models::{EventKind, TxMarker};
use crate::notifier::{alert, Channel, Notifier};
use crate::parser::{self, Mismatch, Outcome};
use crate::rpc::{ChainClient, Message, Transaction};
use eyre::{Result, WrapErr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum Skip {
    Malformed(DecodeError),
    /// Successful report but no external log to take amounts from
    MissingLog,
}

/// What processing one transaction amounted to.
#[derive(Debug)]
pub enum Ingested {
    /// Not addressed to the protocol as a request
    Ignored,
    Aborted,
    Rejected { kind: EventKind, error_code: u32 },
    Skipped(Skip),
    Recorded(Accepted),
    Resolved(Resolution),
}

/// Decodes one transaction of the walked account and hands the result to the correlator.
pub struct TransactionProcessor {
    correlator: Arc<Correlator>,
    notifier: Arc<dyn Notifier>,
    assets: Arc<AssetTable>,
}

fn body_of(msg: &Message) -> Result<Cell, DecodeError> {
    msg.body()?.ok_or(DecodeError::MissingMessage("body"))
}

impl TransactionProcessor {
    pub fn new(correlator: Arc<Correlator>, notifier: Arc<dyn Notifier>, assets: Arc<AssetTable>) -> Self {
        Self {
            correlator,
            notifier,
            assets,
        }
    }

    fn malformed(&self, tx: &Transaction, e: DecodeError) -> Ingested {
        warn!("Skipping malformed tx {}: {}", tx.hash, e);
        Ingested::Skipped(Skip::Malformed(e))
    }

    pub async fn process(&self, tx: &Transaction) -> Result<Ingested> {
        if let Some(resolution) = self.correlator.observe(tx).await? {
            return Ok(Ingested::Resolved(resolution));
        }

        let Some(in_msg) = &tx.in_msg else {
            return Ok(Ingested::Ignored);
        };
        let Some(opcode) = in_msg.opcode().filter(|op| parser::is_request_opcode(*op)) else {
            return Ok(Ingested::Ignored);
        };

        let hash = match tx.tx_hash() {
            Ok(hash) => hash,
            Err(e) => return Ok(self.malformed(tx, e)),
        };
        let request = match body_of(in_msg).and_then(|body| parser::decode_request(opcode, &body)) {
            Ok(request) => request,
            Err(e) => return Ok(self.malformed(tx, e)),
        };
        if !tx.executed() {
            debug!("Request tx {} did not execute (exit code {:?})", tx.hash, tx.exit_code());
            return Ok(Ingested::Aborted);
        }

        let kind = request.kind();
        let out_msgs = tx.sorted_out_msgs();
        let Some(report_msg) = out_msgs.iter().copied().find(|m| m.is_internal()) else {
            return Ok(self.malformed(tx, DecodeError::MissingMessage("report")));
        };
        let report = match body_of(report_msg).and_then(|body| parser::decode_report(parser::family(kind), &body)) {
            Ok(report) => report,
            Err(e) => return Ok(self.malformed(tx, e)),
        };
        if let Outcome::Fail { error_code } = report.outcome {
            info!(
                "{} in tx {} failed: {} ({:#x})",
                kind,
                tx.hash,
                parser::error_description(error_code),
                error_code
            );
            return Ok(Ingested::Rejected { kind, error_code });
        }

        let Some(log_msg) = out_msgs.iter().copied().find(|m| m.is_external_out()) else {
            alert(
                self.notifier.as_ref(),
                Channel::Anomaly,
                format!("Log message not found for transaction {}", tx.hash),
            )
            .await;
            return Ok(Ingested::Skipped(Skip::MissingLog));
        };
        let log = match body_of(log_msg).and_then(|body| parser::decode_log(kind, &body)) {
            Ok(log) => log,
            Err(e) => return Ok(self.malformed(tx, e)),
        };

        for mismatch in parser::verify_amounts(&request, &log) {
            alert(
                self.notifier.as_ref(),
                Channel::Anomaly,
                format!("{} in tx {}: {}", kind, tx.hash, self.describe(&mismatch)),
            )
            .await;
        }

        let accepted = self.correlator.accept(log.into_event(hash, false), report_msg).await?;
        Ok(Ingested::Recorded(accepted))
    }

    fn describe(&self, mismatch: &Mismatch) -> String {
        match mismatch {
            Mismatch::Amount {
                leg,
                asset_id,
                requested,
                reported,
            } => format!(
                "{} amount mismatch: requested {}, executed {}",
                leg,
                self.assets.friendly_amount(asset_id, *requested),
                self.assets.friendly_amount(asset_id, *reported)
            ),
            Mismatch::CollateralBelowMinimum {
                asset_id,
                minimum,
                reward,
            } => format!(
                "collateral reward {} below requested minimum {}",
                self.assets.friendly_amount(asset_id, *reward),
                self.assets.friendly_amount(asset_id, *minimum)
            ),
            Mismatch::Asset {
                leg,
                requested,
                reported,
            } => format!(
                "{} asset mismatch: requested {}, executed {}",
                leg,
                self.assets.ticker(requested),
                self.assets.ticker(reported)
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalkerConfig {
    pub account: TonAddress,
    pub page_size: usize,
    /// Transactions older than this unix time are never walked
    pub epoch_floor: u64,
    pub failure_threshold: u32,
    pub retry_delay: Duration,
    pub failure_cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    CaughtUp { ingested: usize },
    EpochFloorReached { ingested: usize },
}

enum WalkState {
    Fetching,
    DrainingPage(Vec<Transaction>),
    CaughtUp(WalkOutcome),
}

/// Walks the account's history newest to oldest until it meets an
/// already-seen transaction or the epoch floor.
pub struct Walker {
    config: WalkerConfig,
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    processor: TransactionProcessor,
    failures: AtomicU32,
}

impl Walker {
    pub fn new(
        config: WalkerConfig,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        processor: TransactionProcessor,
    ) -> Self {
        Self {
            config,
            chain,
            store,
            notifier,
            processor,
            failures: AtomicU32::new(0),
        }
    }

    /// One walk; an interrupted walk resumes from the stored cursor.
    pub async fn run_cycle(&self) -> Result<WalkOutcome> {
        let account = &self.config.account;
        let mut cursor = self.store.load_walk_cursor(account).await?;
        if let Some(lt) = cursor {
            info!("Resuming walk of {} below lt {}", account, lt);
        }
        let mut ingested = 0;
        let mut state = WalkState::Fetching;

        loop {
            state = match state {
                WalkState::Fetching => {
                    match self
                        .chain
                        .get_account_transactions(account, cursor, self.config.page_size)
                        .await
                    {
                        Ok(mut page) => {
                            self.failures.store(0, Ordering::Relaxed);
                            if page.is_empty() {
                                WalkState::CaughtUp(WalkOutcome::CaughtUp { ingested })
                            } else {
                                page.sort_by(|a, b| b.lt.cmp(&a.lt));
                                debug!("Fetched {} transactions below {:?}", page.len(), cursor);
                                WalkState::DrainingPage(page)
                            }
                        }
                        Err(e) => {
                            self.on_fetch_failure(e).await;
                            WalkState::Fetching
                        }
                    }
                }
                WalkState::DrainingPage(page) => match self.drain(page, &mut cursor, &mut ingested).await? {
                    Some(outcome) => WalkState::CaughtUp(outcome),
                    None => WalkState::Fetching,
                },
                WalkState::CaughtUp(outcome) => {
                    self.store.save_walk_cursor(account, None).await?;
                    if ingested > 0 {
                        info!("Walk finished: {:?}", outcome);
                    }
                    return Ok(outcome);
                }
            };
        }
    }

    /// Processes one newest-first page; `Some` ends the walk.
    async fn drain(
        &self,
        page: Vec<Transaction>,
        cursor: &mut Option<u64>,
        ingested: &mut usize,
    ) -> Result<Option<WalkOutcome>> {
        let account = &self.config.account;
        for tx in page {
            let marker: TxMarker = match tx.marker() {
                Ok(marker) => marker,
                Err(e) => {
                    warn!("Skipping tx with unreadable hash {}: {}", tx.hash, e);
                    *cursor = Some(tx.lt);
                    continue;
                }
            };
            if marker.utime < self.config.epoch_floor {
                return Ok(Some(WalkOutcome::EpochFloorReached { ingested: *ingested }));
            }
            if self.store.has_transaction(&marker.hash).await? {
                debug!("Reached already seen tx {}", tx.hash);
                return Ok(Some(WalkOutcome::CaughtUp { ingested: *ingested }));
            }

            let result = self
                .processor
                .process(&tx)
                .await
                .wrap_err_with(|| format!("processing tx {}", tx.hash))?;
            debug!("tx {} (lt {}): {:?}", tx.hash, tx.lt, result);

            self.store.mark_transaction_seen(&marker).await?;
            *cursor = Some(marker.lt);
            self.store.save_walk_cursor(account, *cursor).await?;
            *ingested += 1;
        }
        Ok(None)
    }

    async fn on_fetch_failure(&self, e: eyre::Report) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Fetching transactions of {} failed ({}/{}): {:#}",
            self.config.account, failures, self.config.failure_threshold, e
        );
        if failures >= self.config.failure_threshold {
            alert(
                self.notifier.as_ref(),
                Channel::Service,
                format!(
                    "Unknown problem with TonAPI: {} consecutive failures fetching {} ({:#})",
                    failures, self.config.account, e
                ),
            )
            .await;
            self.failures.store(0, Ordering::Relaxed);
            sleep(self.config.failure_cooldown).await;
        } else {
            sleep(self.config.retry_delay).await;
        }
    }
}
