// src/projector.rs
use crate::assets::AssetTable;
use crate::cell::TonAddress;
use crate::db::Store;
use crate::models::{ProjectionJob, UserSnapshot};
use crate::notifier::{alert, Channel, Notifier};
use crate::parser;
use crate::retry::{retry, RetryPolicy};
use crate::rpc::{ChainClient, GetMethodResult};
use crate::scheduler::{KeyedLocks, ProjectionQueue};
use eyre::{eyre, Result};
use futures_util::{stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info};

pub const USER_STATE_METHOD: &str = "getAllUserScData";

#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub rpc_policy: RetryPolicy,
    pub store_policy: RetryPolicy,
    /// Contracts read in parallel per drain
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Written(UserSnapshot),
    Abandoned,
}

/// Reads user contract state once its projection job is due and folds it
/// into the stored snapshot.
pub struct Projector {
    config: ProjectorConfig,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    notifier: Arc<dyn Notifier>,
    queue: Arc<ProjectionQueue>,
    assets: Arc<AssetTable>,
    locks: KeyedLocks<TonAddress>,
}

impl Projector {
    pub fn new(
        config: ProjectorConfig,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        notifier: Arc<dyn Notifier>,
        queue: Arc<ProjectionQueue>,
        assets: Arc<AssetTable>,
    ) -> Self {
        Self {
            config,
            store,
            chain,
            notifier,
            queue,
            assets,
            locks: KeyedLocks::new(),
        }
    }

    /// Projects every due job; returns how many were taken.
    pub async fn drain(&self) -> Result<usize> {
        let jobs = self.queue.due().await?;
        let taken = jobs.len();
        stream::iter(jobs)
            .for_each_concurrent(self.config.concurrency.max(1), |job| async move {
                if let Err(e) = self.project(&job).await {
                    error!("Projection of {} failed, will retry: {:#}", job.contract_address, e);
                }
            })
            .await;
        if taken > 0 {
            debug!("Drained {} projection jobs", taken);
        }
        Ok(taken)
    }

    async fn read_state(&self, contract: &TonAddress) -> Result<GetMethodResult> {
        retry(&self.config.rpc_policy, USER_STATE_METHOD, || async move {
            let result = self.chain.call_get_method(contract, USER_STATE_METHOD).await?;
            if result.exit_code != 0 {
                return Err(eyre!("{} on {} exited with {}", USER_STATE_METHOD, contract, result.exit_code));
            }
            Ok(result)
        })
        .await
    }

    pub async fn project(&self, job: &ProjectionJob) -> Result<Projection> {
        let contract = &job.contract_address;
        let _guard = self.locks.lock(contract).await;

        let state = match self.read_state(contract).await {
            Ok(result) => parser::decode_user_state(&result.stack, self.assets.order()),
            Err(e) => {
                alert(
                    self.notifier.as_ref(),
                    Channel::Service,
                    format!("Failed to read user contract {}: {:#}", contract, e),
                )
                .await;
                self.queue.complete(job).await?;
                return Ok(Projection::Abandoned);
            }
        };
        let state = match state {
            Ok(state) => state,
            Err(e) => {
                alert(
                    self.notifier.as_ref(),
                    Channel::Anomaly,
                    format!("Undecodable state of user contract {}: {}", contract, e),
                )
                .await;
                self.queue.complete(job).await?;
                return Ok(Projection::Abandoned);
            }
        };

        let incoming = UserSnapshot {
            wallet_address: state.user_address,
            contract_address: *contract,
            code_version: state.code_version,
            created_at: job.first_event,
            updated_at: job.last_event,
            principals: state.principals,
            state: state.state,
        };

        let policy = self.config.store_policy;
        let existing = retry(&policy, "get user snapshot", || self.store.get_user_snapshot(contract)).await?;
        let snapshot = match existing {
            Some(existing) => {
                let merged = existing.merged_with(&incoming);
                retry(&policy, "merge user snapshot", || self.store.merge_user_snapshot(&merged)).await?;
                merged
            }
            None => {
                retry(&policy, "insert user snapshot", || self.store.insert_user_snapshot(&incoming)).await?;
                incoming
            }
        };
        self.queue.complete(job).await?;

        info!(
            "Projected {} ({} principals, state {})",
            contract,
            snapshot.principals.len(),
            snapshot.state
        );
        Ok(Projection::Written(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::rpc::StackEntry;
    use crate::testing::*;
    use std::time::Duration;

    struct Fixture {
        chain: Arc<FakeChain>,
        store: Arc<SqliteStore>,
        notifier: Arc<RecordingNotifier>,
        queue: Arc<ProjectionQueue>,
        projector: Projector,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(FakeChain::default());
        let store = memory_store();
        let notifier = Arc::new(RecordingNotifier::default());
        let queue = Arc::new(ProjectionQueue::new(store.clone(), Duration::ZERO));
        let projector = Projector::new(
            ProjectorConfig {
                rpc_policy: instant_policy(3),
                store_policy: instant_policy(1),
                concurrency: 4,
            },
            store.clone(),
            chain.clone(),
            notifier.clone(),
            queue.clone(),
            Arc::new(AssetTable::mainnet()),
        );
        Fixture {
            chain,
            store,
            notifier,
            queue,
            projector,
        }
    }

    fn assets() -> Vec<alloy::primitives::U256> {
        AssetTable::mainnet().order().to_vec()
    }

    #[tokio::test]
    async fn first_projection_inserts_snapshot() {
        let f = fixture();
        let ids = assets();
        f.chain.push_method_result(
            &addr(2),
            Ok(user_state_result(&addr(100), &addr(1), &[(ids[1], -20), (ids[0], 300)])),
        );
        f.queue.schedule(&addr(2), 1_000).await.unwrap();

        assert_eq!(f.projector.drain().await.unwrap(), 1);
        let snapshot = f.store.get_user_snapshot(&addr(2)).await.unwrap().unwrap();
        assert_eq!(snapshot.wallet_address, addr(1));
        assert_eq!(snapshot.code_version, 1);
        assert_eq!((snapshot.created_at, snapshot.updated_at), (1_000, 1_000));
        let order: Vec<_> = snapshot.principals.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![ids[0], ids[1]]);
        assert_eq!(snapshot.principals.get(&ids[1]), Some(-20));
        assert!(f.queue.due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn later_projection_merges_without_moving_time_back() {
        let f = fixture();
        let ids = assets();
        for principal in [100, 250] {
            f.chain.push_method_result(
                &addr(2),
                Ok(user_state_result(&addr(100), &addr(1), &[(ids[0], principal)])),
            );
        }

        let job = |first, last| ProjectionJob {
            contract_address: addr(2),
            due_at: 0,
            first_event: first,
            last_event: last,
        };
        f.projector.project(&job(500, 900)).await.unwrap();
        let Projection::Written(merged) = f.projector.project(&job(400, 600)).await.unwrap() else {
            panic!("expected a snapshot");
        };
        assert_eq!((merged.created_at, merged.updated_at), (400, 900));
        assert_eq!(merged.principals.get(&ids[0]), Some(250));
        assert_eq!(f.store.get_user_snapshot(&addr(2)).await.unwrap(), Some(merged));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_retried() {
        let f = fixture();
        let failed = GetMethodResult {
            success: false,
            exit_code: 11,
            stack: Vec::new(),
        };
        f.chain.push_method_result(&addr(2), Ok(failed));
        f.chain.push_method_result(&addr(2), Ok(user_state_result(&addr(100), &addr(1), &[])));
        f.queue.schedule(&addr(2), 10).await.unwrap();

        f.projector.drain().await.unwrap();
        assert_eq!(f.chain.method_calls(), 2);
        let snapshot = f.store.get_user_snapshot(&addr(2)).await.unwrap().unwrap();
        assert!(snapshot.principals.is_empty());
    }

    #[tokio::test]
    async fn exhausted_reads_notify_and_drop_the_job() {
        let f = fixture();
        for _ in 0..3 {
            f.chain.push_method_result(&addr(2), Err("rate limited".into()));
        }
        f.queue.schedule(&addr(2), 10).await.unwrap();

        f.projector.drain().await.unwrap();
        assert_eq!(f.chain.method_calls(), 3);
        assert_eq!(f.notifier.messages(Channel::Service).len(), 1);
        assert!(f.store.get_user_snapshot(&addr(2)).await.unwrap().is_none());
        assert!(f.queue.due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_state_is_an_anomaly() {
        let f = fixture();
        let garbled = GetMethodResult {
            success: true,
            exit_code: 0,
            stack: vec![StackEntry::Num { num: "0x1".into() }],
        };
        f.chain.push_method_result(&addr(2), Ok(garbled));
        f.queue.schedule(&addr(2), 10).await.unwrap();

        f.projector.drain().await.unwrap();
        assert_eq!(f.chain.method_calls(), 1);
        assert_eq!(f.notifier.messages(Channel::Anomaly).len(), 1);
        assert!(f.queue.due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drains_contracts_concurrently() {
        let f = fixture();
        for n in 2..=5 {
            f.chain.push_method_result(&addr(n), Ok(user_state_result(&addr(100), &addr(n + 10), &[])));
            f.queue.schedule(&addr(n), 10).await.unwrap();
        }
        assert_eq!(f.projector.drain().await.unwrap(), 4);
        for n in 2..=5 {
            let snapshot = f.store.get_user_snapshot(&addr(n)).await.unwrap().unwrap();
            assert_eq!(snapshot.wallet_address, addr(n + 10));
        }
    }
}
