//! Transaction execution engine
//!
//! Drives one [`TransactionIntent`] to a confirmed [`Receipt`]:
//!
//! ```text
//! CheckingPreconditions -> Building -> Estimating -> NonceReserving
//!     -> Publishing -> Confirming -> Done
//! ```
//!
//! The [`ExecutionContext`] is checkpointed after every externally visible
//! step, and every execution is claimed under its build id first, so a
//! restarted instance resumes instead of broadcasting twice.

use super::nonce::NonceManager;
use super::retry::{with_timeout, RetryPolicy};
use super::types::{ExecutionContext, HtlcLockArgs, OperationType, Receipt, TransactionIntent};
use super::PreparedTransaction;
use crate::chain::ChainAdapter;
use crate::config::EngineConfig;
use crate::error::{ChainRejection, SolverError, SolverResult};
use crate::state::{Claim, ExecutionStatus, StateStore};

use dashmap::DashSet;
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const RELEASE_NONCE_SUFFIX: &str = ":release-nonce";
const APPROVE_SUFFIX: &str = ":approve";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Estimating,
    Publishing,
    Confirming,
}

enum Transition {
    To(Phase),
    Done(Receipt),
}

pub struct TransactionEngine {
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
    store: Arc<dyn StateStore>,
    nonces: NonceManager,
    config: EngineConfig,
    retry: RetryPolicy,
    instance_id: String,
    /// Build ids executing in this process
    in_flight: DashSet<String>,
}

/// Removes a build id from the in-flight set when the execution ends
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    build_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.build_id);
    }
}

impl TransactionEngine {
    pub fn new(
        adapters: HashMap<String, Arc<dyn ChainAdapter>>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            adapters,
            nonces: NonceManager::new(store.clone()),
            store,
            retry: RetryPolicy::from_config(&config),
            config,
            instance_id: instance_id.into(),
            in_flight: DashSet::new(),
        }
    }

    pub fn networks(&self) -> impl Iterator<Item = &String> {
        self.adapters.keys()
    }

    fn adapter(&self, network: &str) -> SolverResult<&dyn ChainAdapter> {
        self.adapters
            .get(network)
            .map(|a| a.as_ref())
            .ok_or_else(|| SolverError::NetworkNotFound {
                network: network.to_string(),
            })
    }

    /// Execute an intent. Nested intents (approve before lock, nonce
    /// release) recurse through here with their own contexts.
    pub fn execute<'a>(
        &'a self,
        intent: &'a TransactionIntent,
        context: ExecutionContext,
    ) -> BoxFuture<'a, SolverResult<Receipt>> {
        Box::pin(async move {
            let build_id = intent.build_id();
            let started = Instant::now();

            // The store treats a running record of our own as left over from
            // a previous process, so concurrent calls here are caught first.
            if !self.in_flight.insert(build_id.clone()) {
                return Err(SolverError::AlreadyInFlight {
                    build_id,
                    owner: self.instance_id.clone(),
                });
            }
            let _guard = InFlightGuard {
                set: &self.in_flight,
                build_id: build_id.clone(),
            };

            let mut ctx = match self
                .store
                .claim_execution(&build_id, &self.instance_id, intent, &context)
                .await?
            {
                Claim::Fresh => context,
                Claim::Resumed(saved) => {
                    info!(
                        "Resuming {} on {} ({} published, attempt {})",
                        intent.operation,
                        intent.network_name,
                        saved.published_ids().len(),
                        saved.attempts
                    );
                    saved
                }
                Claim::Completed(receipt) => {
                    debug!("{} {} already completed", intent.operation, build_id);
                    return Ok(receipt);
                }
                Claim::HeldBy(owner) => {
                    return Err(SolverError::AlreadyInFlight { build_id, owner });
                }
            };

            match self.drive(intent, &build_id, &mut ctx).await {
                Ok(receipt) => {
                    self.finish(&build_id, ExecutionStatus::Completed, &ctx, Some(&receipt), None)
                        .await;
                    crate::metrics::record_execution_completed(
                        &intent.network_name,
                        intent.operation.as_str(),
                        started.elapsed().as_secs_f64(),
                    );
                    info!(
                        "{} on {} confirmed in {} (block {})",
                        intent.operation, intent.network_name, receipt.transaction_id, receipt.block_number
                    );
                    Ok(receipt)
                }
                Err(e) => {
                    if let Some(nonce) = ctx.nonce.filter(|_| !ctx.has_published()) {
                        self.release_nonce(intent, nonce).await;
                    }

                    let message = e.to_string();
                    self.finish(&build_id, ExecutionStatus::Failed, &ctx, None, Some(&message))
                        .await;
                    crate::metrics::record_execution_failed(
                        &intent.network_name,
                        intent.operation.as_str(),
                    );
                    if e.should_alert() {
                        error!("ALERT: {} on {} failed: {}", intent.operation, intent.network_name, message);
                    } else {
                        warn!("{} on {} failed: {}", intent.operation, intent.network_name, message);
                    }

                    Err(SolverError::Execution {
                        network: intent.network_name.clone(),
                        operation: intent.operation.to_string(),
                        swap_id: intent.swap_id.clone(),
                        last_fee: ctx.fee.clone(),
                        published_ids: ctx.published_ids_vec(),
                        source: Box::new(e),
                    })
                }
            }
        })
    }

    /// Restart executions this instance owned when it last stopped. Nested
    /// approvals and nonce releases are left to the parent that spawned them.
    pub async fn resume_running(self: &Arc<Self>) -> SolverResult<usize> {
        let records: Vec<_> = self
            .store
            .running_executions(&self.instance_id)
            .await?
            .into_iter()
            .filter(|r| {
                let token = &r.intent.uniqueness_token;
                !token.ends_with(APPROVE_SUFFIX) && !token.ends_with(RELEASE_NONCE_SUFFIX)
            })
            .collect();
        let count = records.len();

        for record in records {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.execute(&record.intent, record.context.clone()).await {
                    warn!("Resumed execution {} failed: {}", record.build_id, e);
                }
            });
        }

        if count > 0 {
            info!("Resumed {} interrupted executions", count);
        }
        Ok(count)
    }

    async fn drive(
        &self,
        intent: &TransactionIntent,
        build_id: &str,
        ctx: &mut ExecutionContext,
    ) -> SolverResult<Receipt> {
        let adapter = self.adapter(&intent.network_name)?;

        if intent.operation == OperationType::HtlcLock {
            self.ensure_allowance(adapter, intent).await?;
        }

        let operation = intent.operation;
        let args = &intent.prepare_args;
        let prepared = self
            .step("build_transaction", move || adapter.build_transaction(operation, args))
            .await?;

        let mut phase = if ctx.fee.is_none() {
            Phase::Estimating
        } else if ctx.has_published() {
            Phase::Confirming
        } else {
            Phase::Publishing
        };
        let mut failures = 0u32;
        let step_started = Instant::now();

        loop {
            let result = match phase {
                Phase::Estimating => self.estimate(adapter, intent, &prepared, build_id, ctx).await,
                Phase::Publishing => self.publish(adapter, intent, &prepared, build_id, ctx).await,
                Phase::Confirming => self.confirm(adapter, build_id, ctx).await.map(Transition::Done),
            };

            match result {
                Ok(Transition::To(next)) => phase = next,
                Ok(Transition::Done(receipt)) => return Ok(receipt.with_call_data_amount(&prepared)),
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if step_started.elapsed() >= self.config.step_ceiling() {
                        return Err(SolverError::Timeout {
                            operation: format!("{} {:?}", intent.operation, phase),
                        });
                    }
                    match self.retry.delay_for(failures) {
                        Some(delay) => {
                            warn!(
                                "{} on {} failed while {:?} (attempt {}/{}), retrying in {:?}: {}",
                                intent.operation,
                                intent.network_name,
                                phase,
                                failures,
                                self.retry.max_attempts(),
                                delay,
                                e
                            );
                            tokio::time::sleep(delay).await;
                            phase = Phase::Estimating;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Approve the HTLC contract first if the current allowance is short
    async fn ensure_allowance(
        &self,
        adapter: &dyn ChainAdapter,
        intent: &TransactionIntent,
    ) -> SolverResult<()> {
        let args: HtlcLockArgs = intent.args()?;
        let owner = intent.from_address.as_str();
        let asset = args.asset.as_str();

        let allowance = self
            .step("get_spender_allowance", move || adapter.get_spender_allowance(owner, asset))
            .await?;
        if args.amount <= allowance {
            return Ok(());
        }

        info!(
            "Allowance {} < {} for {} on {}; approving",
            allowance, args.amount, args.asset, intent.network_name
        );
        let approve = TransactionIntent {
            network_name: intent.network_name.clone(),
            operation: OperationType::Approve,
            prepare_args: json!({
                "asset": args.asset,
                "amount": args.amount.to_string(),
            }),
            from_address: intent.from_address.clone(),
            swap_id: intent.swap_id.clone(),
            uniqueness_token: format!("{}{}", intent.uniqueness_token, APPROVE_SUFFIX),
        };
        self.execute(&approve, ExecutionContext::new()).await?;
        Ok(())
    }

    async fn estimate(
        &self,
        adapter: &dyn ChainAdapter,
        intent: &TransactionIntent,
        prepared: &PreparedTransaction,
        build_id: &str,
        ctx: &mut ExecutionContext,
    ) -> SolverResult<Transition> {
        if ctx.fee.is_some() {
            return Ok(Transition::To(Phase::Publishing));
        }

        let err = match self
            .call("estimate_fee", adapter.estimate_fee(&intent.from_address, prepared))
            .await
        {
            Ok(fee) => {
                debug!("{} fee on {}: {:?}", intent.operation, intent.network_name, fee);
                ctx.fee = Some(fee);
                self.checkpoint(build_id, ctx).await?;
                return Ok(Transition::To(Phase::Publishing));
            }
            Err(e) => e,
        };

        match err.rejection() {
            Some(ChainRejection::HashlockAlreadySet) | Some(ChainRejection::AlreadyClaimed) => {
                if ctx.has_published() {
                    info!(
                        "{} on {} already done on chain; confirming earlier broadcast",
                        intent.operation, intent.network_name
                    );
                    Ok(Transition::To(Phase::Confirming))
                } else {
                    Err(err)
                }
            }
            Some(ChainRejection::HtlcAlreadyExists) if ctx.has_published() => {
                let ids = ctx.published_ids_vec();
                match self.call("get_receipt", adapter.get_receipt(&ids)).await {
                    Ok(receipt) => {
                        info!(
                            "HTLC for {} already exists; reconciled with {}",
                            build_id, receipt.transaction_id
                        );
                        Ok(Transition::Done(receipt))
                    }
                    Err(e) => {
                        debug!("No receipt yet for {:?}: {}", ids, e);
                        Err(err)
                    }
                }
            }
            _ => Err(err),
        }
    }

    async fn publish(
        &self,
        adapter: &dyn ChainAdapter,
        intent: &TransactionIntent,
        prepared: &PreparedTransaction,
        build_id: &str,
        ctx: &mut ExecutionContext,
    ) -> SolverResult<Transition> {
        let fee = match ctx.fee.clone() {
            Some(fee) => fee,
            None => return Ok(Transition::To(Phase::Estimating)),
        };

        let nonce = match ctx.nonce {
            Some(nonce) => nonce,
            None => {
                let nonce = self
                    .nonces
                    .reserve(adapter, &intent.from_address, &intent.uniqueness_token)
                    .await?;
                ctx.nonce = Some(nonce);
                self.checkpoint(build_id, ctx).await?;
                nonce
            }
        };

        let published = self
            .call(
                "sign_and_publish",
                adapter.sign_and_publish(&intent.from_address, nonce, prepared, &fee),
            )
            .await;

        match published {
            Ok(transaction_id) => {
                info!(
                    "Published {} on {} as {} (nonce {}, attempt {})",
                    intent.operation, intent.network_name, transaction_id, nonce, ctx.attempts
                );
                ctx.record_published(transaction_id);
                self.checkpoint(build_id, ctx).await?;
                crate::metrics::record_tx_published(&intent.network_name, intent.operation.as_str());
                Ok(Transition::To(Phase::Confirming))
            }
            Err(e) => match e.rejection() {
                Some(ChainRejection::Underpriced) => {
                    if ctx.attempts >= self.config.max_fee_attempts {
                        return Err(SolverError::UnderpricedExhausted {
                            network: intent.network_name.clone(),
                            attempts: ctx.attempts,
                        });
                    }

                    let bumped = fee.bump(self.config.fee_bump_percent);
                    warn!(
                        "{} on {} underpriced at {}; bumping to {} (attempt {})",
                        intent.operation,
                        intent.network_name,
                        fee.effective_price(),
                        bumped.effective_price(),
                        ctx.attempts + 1
                    );
                    ctx.fee = Some(bumped);
                    ctx.attempts += 1;
                    self.checkpoint(build_id, ctx).await?;
                    crate::metrics::record_fee_bump(&intent.network_name);
                    Ok(Transition::To(Phase::Publishing))
                }
                // our own earlier broadcast consumed the nonce
                Some(ChainRejection::NonceTooLow) if ctx.has_published() => {
                    Ok(Transition::To(Phase::Confirming))
                }
                _ => Err(e),
            },
        }
    }

    /// Poll all published ids at a flat interval until one confirms
    async fn confirm(
        &self,
        adapter: &dyn ChainAdapter,
        build_id: &str,
        ctx: &mut ExecutionContext,
    ) -> SolverResult<Receipt> {
        let ids = ctx.published_ids_vec();
        let interval = self.config.confirm_poll_interval();
        let compaction = u64::from(self.config.confirm_compaction_polls.max(1));
        let mut polls: u64 = 0;

        loop {
            match self.call("get_receipt", adapter.get_receipt(&ids)).await {
                Ok(receipt) => return Ok(receipt),
                Err(e @ SolverError::TransactionFailed { .. }) => return Err(e),
                Err(e) if e.is_retryable() => {
                    polls += 1;
                    if polls % compaction == 0 {
                        info!("{} still unconfirmed after {} polls ({:?})", build_id, polls, ids);
                        self.checkpoint(build_id, ctx).await?;
                    }
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Burn a reserved but never broadcast nonce with a zero-value transfer
    /// to self, so later transactions from the address are not stuck behind
    /// the gap
    async fn release_nonce(&self, intent: &TransactionIntent, nonce: u64) {
        if intent.uniqueness_token.ends_with(RELEASE_NONCE_SUFFIX) {
            error!(
                "Nonce {} on {} could not be released; later transactions from {} will stall",
                nonce, intent.network_name, intent.from_address
            );
            return;
        }
        let adapter = match self.adapter(&intent.network_name) {
            Ok(adapter) => adapter,
            Err(_) => return,
        };

        let release = TransactionIntent {
            network_name: intent.network_name.clone(),
            operation: OperationType::Transfer,
            prepare_args: json!({
                "to": intent.from_address,
                "asset": adapter.native_asset(),
                "amount": "0",
            }),
            from_address: intent.from_address.clone(),
            swap_id: intent.swap_id.clone(),
            uniqueness_token: format!("{}{}", intent.uniqueness_token, RELEASE_NONCE_SUFFIX),
        };

        info!(
            "Releasing unused nonce {} on {} after {} failed",
            nonce, intent.network_name, intent.operation
        );
        if let Err(e) = self.execute(&release, ExecutionContext::with_nonce(nonce)).await {
            error!("Failed to release nonce {} on {}: {}", nonce, intent.network_name, e);
        }
    }

    /// One remote call bounded by the per-call timeout
    async fn call<T, Fut>(&self, operation: &str, fut: Fut) -> SolverResult<T>
    where
        Fut: Future<Output = SolverResult<T>>,
    {
        with_timeout(operation, self.config.call_timeout(), fut).await
    }

    /// A remote call with bounded retries and the overall step ceiling
    async fn step<T, F, Fut>(&self, operation: &str, mut op: F) -> SolverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SolverResult<T>>,
    {
        let limit = self.config.call_timeout();
        with_timeout(
            operation,
            self.config.step_ceiling(),
            self.retry
                .run(operation, move || with_timeout(operation, limit, op())),
        )
        .await
    }

    async fn checkpoint(&self, build_id: &str, ctx: &ExecutionContext) -> SolverResult<()> {
        self.store.save_execution(build_id, ctx).await
    }

    async fn finish(
        &self,
        build_id: &str,
        status: ExecutionStatus,
        ctx: &ExecutionContext,
        receipt: Option<&Receipt>,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .finish_execution(build_id, status, ctx, receipt, error)
            .await
        {
            warn!("Failed to record {} as {}: {}", build_id, status.as_str(), e);
        }
    }
}
