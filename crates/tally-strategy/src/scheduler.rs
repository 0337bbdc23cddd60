//! Strategy execution and the periodic tick driver.
//!
//! Each periodic task is an independent cooperative worker driven by a
//! timer; tasks never call each other. Correctness under concurrent
//! workers comes from the ledger's row locks and the execution-record
//! batch key, not from application-level mutexes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tally_common::config::SchedulerConfig;
use tally_common::{TallyResult, UserId, UserProfile};
use tally_gateway::Gateway;
use tally_ledger::QuotaLedger;

use crate::batch::batch_key;
use crate::condition::{evaluate, parse_condition, QuotaProbe};
use crate::store::StrategyStore;
use crate::types::{ExecutionRecord, ExecutionStatus, QuotaStrategy, StrategyKind};

/// Quota probe reading through the gateway adapter.
pub struct GatewayProbe<G>(Arc<G>);

impl<G> GatewayProbe<G> {
    /// Wrap a gateway for condition evaluation.
    pub fn new(gateway: Arc<G>) -> Self {
        Self(gateway)
    }
}

impl<G: Gateway + Send + Sync> QuotaProbe for GatewayProbe<G> {
    async fn quota_value(&self, user: UserId) -> TallyResult<i64> {
        self.0.query_quota_value(user).await
    }
}

/// Paged access to the user population.
#[trait_variant::make(UserDirectory: Send)]
pub trait LocalUserDirectory {
    /// One page of users, ordered stably.
    async fn list_users(&self, offset: u32, limit: u32) -> TallyResult<Vec<UserProfile>>;
}

/// Tally of one `exec_strategy` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecReport {
    /// Users whose condition matched.
    pub matched: u64,
    /// Executions completed in this run.
    pub completed: u64,
    /// Users skipped (condition false, cap reached, or batch done).
    pub skipped: u64,
    /// Executions that failed (credit error or condition eval error).
    pub failed: u64,
}

/// Executes strategies over the user population.
pub struct StrategyScheduler<S, L, G> {
    store: Arc<S>,
    ledger: Arc<L>,
    probe: GatewayProbe<G>,
    config: SchedulerConfig,
}

impl<S, L, G> StrategyScheduler<S, L, G>
where
    S: StrategyStore + Sync,
    L: QuotaLedger + Sync,
    G: Gateway + Send + Sync,
{
    /// Create a scheduler over the given store, ledger, and gateway.
    pub fn new(store: Arc<S>, ledger: Arc<L>, gateway: Arc<G>, config: SchedulerConfig) -> Self {
        Self {
            store,
            ledger,
            probe: GatewayProbe::new(gateway),
            config,
        }
    }

    /// Execute one strategy over a user population.
    ///
    /// Per user, sequentially: evaluate the condition, enforce the
    /// per-user cap, enforce batch idempotence, then insert a PENDING
    /// row and credit through the ledger. A failure for one user never
    /// stops the others.
    #[instrument(name = "scheduler.exec_strategy", skip(self, strategy, users), fields(strategy = %strategy.name))]
    pub async fn exec_strategy(
        &self,
        strategy: &QuotaStrategy,
        users: &[UserProfile],
    ) -> TallyResult<ExecReport> {
        let mut report = ExecReport::default();
        if !strategy.status {
            return Ok(report);
        }

        let Some(batch) = batch_key(strategy, Utc::now())? else {
            debug!("schedule has not fired yet");
            return Ok(report);
        };

        // A condition that does not parse is a permanent failure: the
        // strategy stays enabled, executions are not attempted.
        let condition = match parse_condition(&strategy.condition) {
            Ok(expr) => expr,
            Err(err) => {
                warn!(error = %err, "condition does not parse; skipping strategy");
                return Ok(report);
            }
        };

        let deadline = Instant::now() + Duration::from_secs(self.config.tick_deadline_secs);
        for user in users {
            if Instant::now() > deadline {
                warn!(batch = %batch, "deadline reached, aborting population iteration");
                break;
            }

            let matched = match evaluate(&condition, user, &self.probe).await {
                Ok(matched) => matched,
                Err(err) => {
                    warn!(user = %user.id, error = %err, "condition evaluation failed");
                    let record = ExecutionRecord::new(
                        strategy.id,
                        user.id,
                        batch.clone(),
                        ExecutionStatus::Failed,
                    );
                    self.store.insert_execution(&record).await?;
                    report.failed += 1;
                    continue;
                }
            };
            if !matched {
                report.skipped += 1;
                continue;
            }
            report.matched += 1;

            if strategy.max_exec_per_user > 0 {
                let completed = self.store.completed_count(strategy.id, user.id).await?;
                if completed >= strategy.max_exec_per_user as i64 {
                    report.skipped += 1;
                    continue;
                }
            }

            if self
                .store
                .completed_in_batch(strategy.id, user.id, &batch)
                .await?
            {
                report.skipped += 1;
                continue;
            }

            let record = ExecutionRecord::new(
                strategy.id,
                user.id,
                batch.clone(),
                ExecutionStatus::Pending,
            );
            self.store.insert_execution(&record).await?;

            match self
                .ledger
                .add_quota_for_strategy(user.id, strategy.amount, &strategy.name)
                .await
            {
                Ok(expiry) => {
                    self.store
                        .mark_execution(record.id, ExecutionStatus::Completed, Some(expiry))
                        .await?;
                    report.completed += 1;
                }
                Err(err) => {
                    warn!(user = %user.id, error = %err, "recharge failed");
                    self.store
                        .mark_execution(record.id, ExecutionStatus::Failed, None)
                        .await?;
                    report.failed += 1;
                }
            }
        }

        debug!(?report, batch = %batch, "strategy executed");
        Ok(report)
    }

    /// Whether a periodic strategy is due: its most recent firing has no
    /// completed execution row in the current batch.
    pub async fn should_execute_periodic(&self, strategy: &QuotaStrategy) -> TallyResult<bool> {
        let Some(batch) = batch_key(strategy, Utc::now())? else {
            return Ok(false);
        };
        let done = self.store.any_completed_in_batch(strategy.id, &batch).await?;
        Ok(!done)
    }

    /// One scheduler tick: enumerate enabled strategies, select the due
    /// ones, and run each over the full (paged) user population.
    #[instrument(name = "scheduler.tick", skip_all)]
    pub async fn tick<D: UserDirectory + Sync>(&self, directory: &D) -> TallyResult<()> {
        let strategies = self.store.list(true).await?;
        let mut population: Option<Vec<UserProfile>> = None;

        for strategy in &strategies {
            let due = match strategy.kind {
                StrategyKind::OneShot => true,
                StrategyKind::Periodic => match self.should_execute_periodic(strategy).await {
                    Ok(due) => due,
                    Err(err) => {
                        warn!(strategy = %strategy.name, error = %err, "periodic check failed");
                        continue;
                    }
                },
            };
            if !due {
                continue;
            }

            // The population is fetched once per tick and shared across
            // the selected strategies.
            if population.is_none() {
                population = Some(self.fetch_population(directory).await?);
            }
            let users = population.as_deref().unwrap_or_default();

            if let Err(err) = self.exec_strategy(strategy, users).await {
                warn!(strategy = %strategy.name, error = %err, "strategy execution failed");
            }
        }
        Ok(())
    }

    async fn fetch_population<D: UserDirectory + Sync>(
        &self,
        directory: &D,
    ) -> TallyResult<Vec<UserProfile>> {
        let page_size = self.config.user_page_size.max(1);
        let mut users = Vec::new();
        let mut offset = 0;
        loop {
            let page = directory.list_users(offset, page_size).await?;
            let page_len = page.len();
            users.extend(page);
            if page_len < page_size as usize {
                break;
            }
            offset += page_len as u32;
        }
        Ok(users)
    }

    /// Run the tick loop until cancelled. Cancellation aborts the next
    /// iteration, never an in-flight tick.
    pub async fn run<D: UserDirectory + Sync>(&self, directory: D, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("strategy scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.tick(&directory).await {
                        warn!(error = %err, "strategy tick failed");
                    }
                }
            }
        }
    }
}
