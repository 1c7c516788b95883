//! Plan executor for deploy and destroy runs.
//!
//! Batches execute sequentially. Stacks within a batch run as concurrent
//! tasks, optionally bounded by a semaphore. The first failure in a batch
//! cancels siblings that have not started yet; in-flight siblings are
//! awaited. After a failed or cancelled deploy, the stacks this run created
//! in the failure's dependency closure are torn down in reverse order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{DeprovisionRequest, ProvisionRequest, ProvisioningBackend, RetryPolicy};
use crate::config::{Removal, StackConfig, StackHasher};
use crate::error::{BackendError, Result, StackyardError};
use crate::graph::DependencyGraph;
use crate::stack::{StackRegistry, render_stack};
use crate::state::{DeploymentRecord, StateStore};

use super::plan::DeploymentPlan;
use super::report::{Operation, RunOutcome, RunReport, StackReport, StackStatus};
use super::rollback::rollback_scope;
use super::signal::RunSignal;

/// Executor for deployment plans.
pub struct DeploymentExecutor {
    backend: Arc<dyn ProvisioningBackend>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    max_concurrency: Option<usize>,
    production: bool,
    signal: RunSignal,
}

/// Shared, immutable context handed to every stack task.
struct RunContext {
    backend: Arc<dyn ProvisioningBackend>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    hasher: StackHasher,
    production: bool,
    run_id: String,
}

/// Work for one stack in one batch.
enum Job {
    Deploy {
        stack: StackConfig,
        imports: std::result::Result<BTreeMap<String, String>, String>,
        prior: Option<DeploymentRecord>,
    },
    Teardown {
        stack_id: String,
        record: Option<DeploymentRecord>,
        removal: Removal,
        rollback: bool,
    },
}

/// What a stack task reports back.
struct TaskOutcome {
    stack_id: String,
    status: StackStatus,
    attempts: u32,
    error: Option<String>,
    record: Option<DeploymentRecord>,
}

impl std::fmt::Debug for DeploymentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentExecutor")
            .field("backend", &self.backend.backend_type())
            .field("store", &self.store.backend_type())
            .field("retry", &self.retry)
            .field("max_concurrency", &self.max_concurrency)
            .field("production", &self.production)
            .finish_non_exhaustive()
    }
}

impl DeploymentExecutor {
    /// Creates a new executor with default retry and unbounded concurrency.
    #[must_use]
    pub fn new(backend: Arc<dyn ProvisioningBackend>, store: Arc<dyn StateStore>) -> Self {
        Self {
            backend,
            store,
            retry: RetryPolicy::default(),
            max_concurrency: None,
            production: false,
            signal: RunSignal::new(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bounds concurrent stacks within a batch. `None` is unbounded.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit.filter(|n| *n > 0);
        self
    }

    /// Sets whether the target environment is production.
    #[must_use]
    pub const fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    /// Uses an externally owned cancellation signal.
    #[must_use]
    pub fn with_signal(mut self, signal: RunSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Returns the cancellation signal.
    #[must_use]
    pub const fn signal(&self) -> &RunSignal {
        &self.signal
    }

    fn context(&self) -> Arc<RunContext> {
        Arc::new(RunContext {
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            retry: self.retry,
            hasher: StackHasher::new(),
            production: self.production,
            run_id: Uuid::new_v4().to_string(),
        })
    }

    /// Executes a deploy plan.
    ///
    /// `graph` is the full dependency graph; it is consulted to decide which
    /// deployments outside the plan still depend on stacks this run created.
    ///
    /// # Errors
    ///
    /// Returns an error only for state store failures, which abort the run
    /// without rollback. Backend failures are reported in the [`RunReport`].
    pub async fn deploy(
        &self,
        registry: &StackRegistry,
        graph: &DependencyGraph,
        plan: &DeploymentPlan,
    ) -> Result<RunReport> {
        let ctx = self.context();
        let started_at = Utc::now();
        info!(
            run_id = %ctx.run_id,
            stacks = plan.stack_count(),
            batches = plan.batches.len(),
            "Starting deploy"
        );

        let mut prior: BTreeMap<String, Option<DeploymentRecord>> = BTreeMap::new();
        for id in plan.stacks() {
            prior.insert(id.to_string(), self.store.get(id).await?);
        }

        let mut reports: BTreeMap<String, StackReport> = BTreeMap::new();
        let mut exports: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut failed: Vec<String> = Vec::new();
        let mut cancelled: Option<String> = None;

        for batch in &plan.batches {
            if !failed.is_empty() {
                break;
            }
            if let Some(reason) = self.signal.reason() {
                cancelled = Some(reason);
                break;
            }

            debug!(run_id = %ctx.run_id, batch = batch.index, stacks = ?batch.stacks, "Starting batch");

            let mut jobs = Vec::with_capacity(batch.stacks.len());
            for id in &batch.stacks {
                let stack = registry
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StackyardError::internal(format!("Planned stack '{id}' is not declared")))?;
                let imports = resolve_imports(graph, id, &exports);
                jobs.push(Job::Deploy {
                    stack,
                    imports,
                    prior: prior.get(id).cloned().flatten(),
                });
            }

            for outcome in self.run_batch(&ctx, jobs, true).await? {
                if outcome.status == StackStatus::Failed {
                    failed.push(outcome.stack_id.clone());
                }
                if matches!(outcome.status, StackStatus::Deployed | StackStatus::Unchanged)
                    && let Some(record) = &outcome.record
                {
                    exports.insert(outcome.stack_id.clone(), record.exports.clone());
                }
                reports.insert(outcome.stack_id.clone(), outcome.into_report(batch.index));
            }
        }

        fill_not_started(plan, &mut reports);

        let mut rollback_failed = Vec::new();
        if !failed.is_empty() || cancelled.is_some() {
            rollback_failed = self
                .rollback(&ctx, graph, plan, &prior, &failed, &mut reports)
                .await?;
        }

        let outcome = if !rollback_failed.is_empty() {
            RunOutcome::PartialRollbackFailure {
                stacks: rollback_failed,
            }
        } else if !failed.is_empty() {
            RunOutcome::RolledBack { failed }
        } else if let Some(reason) = cancelled {
            RunOutcome::Cancelled { reason }
        } else {
            RunOutcome::Succeeded
        };

        let report = finish(&ctx, Operation::Deploy, started_at, outcome, plan, reports);
        info!(run_id = %report.run_id, "{report}");
        Ok(report)
    }

    /// Tears down the stacks this run created that nothing live depends on.
    ///
    /// Returns the stacks whose teardown failed.
    async fn rollback(
        &self,
        ctx: &Arc<RunContext>,
        graph: &DependencyGraph,
        plan: &DeploymentPlan,
        prior: &BTreeMap<String, Option<DeploymentRecord>>,
        failed: &[String],
        reports: &mut BTreeMap<String, StackReport>,
    ) -> Result<Vec<String>> {
        let status = |id: &str| reports.get(id).map(|r| r.status);
        let prior_of = |id: &str| prior.get(id).and_then(Option::as_ref);

        let created: BTreeSet<String> = plan
            .stacks()
            .filter(|&id| status(id) == Some(StackStatus::Deployed))
            .filter(|&id| !prior_of(id).is_some_and(DeploymentRecord::was_deployed))
            .map(str::to_string)
            .collect();

        let candidates: BTreeSet<String> = if failed.is_empty() {
            created
        } else {
            let closure = graph.ancestors(failed.iter().map(String::as_str));
            created.intersection(&closure).cloned().collect()
        };

        if candidates.is_empty() {
            info!(run_id = %ctx.run_id, "Nothing to roll back");
            return Ok(Vec::new());
        }

        let mut live = BTreeSet::new();
        for id in plan.stacks() {
            let alive = match status(id) {
                Some(StackStatus::Deployed | StackStatus::Unchanged) => true,
                // A failed stack still holding handles has resources that may
                // reference its producers.
                Some(StackStatus::Failed) => {
                    prior_of(id).is_some_and(DeploymentRecord::was_deployed)
                        || self
                            .store
                            .get(id)
                            .await?
                            .is_some_and(|r| !r.handles.is_empty())
                }
                _ => prior_of(id).is_some_and(DeploymentRecord::is_deployed),
            };
            if alive {
                live.insert(id.to_string());
            }
        }
        for candidate in &candidates {
            for successor in graph.successors(candidate) {
                if !prior.contains_key(successor)
                    && self
                        .store
                        .get(successor)
                        .await?
                        .is_some_and(|r| r.is_deployed())
                {
                    live.insert(successor.to_string());
                }
            }
        }

        let scope = rollback_scope(graph, candidates, &live);
        if scope.is_empty() {
            info!(run_id = %ctx.run_id, "All candidates have live dependents; nothing rolled back");
            return Ok(Vec::new());
        }

        warn!(run_id = %ctx.run_id, stacks = ?scope, "Rolling back stacks created by this run");

        let teardown = DeploymentPlan::from_graph(&graph.subgraph(&scope)).teardown();
        let mut records: BTreeMap<String, DeploymentRecord> = BTreeMap::new();
        for id in &scope {
            if let Some(record) = self.store.get(id).await? {
                records.insert(id.clone(), record);
            }
        }

        let mut blocked: BTreeSet<String> = BTreeSet::new();
        let mut rollback_failed = Vec::new();

        for batch in &teardown.batches {
            let mut jobs = Vec::new();
            for id in &batch.stacks {
                if blocked.contains(id) {
                    warn!(stack = %id, "Skipping rollback: a dependent failed to roll back");
                    continue;
                }
                let record = records.remove(id);
                let removal = record.as_ref().map_or(Removal::Delete, |r| r.removal);
                jobs.push(Job::Teardown {
                    stack_id: id.clone(),
                    record,
                    removal,
                    rollback: true,
                });
            }

            for outcome in self.run_batch(ctx, jobs, false).await? {
                if outcome.status == StackStatus::RollbackFailed {
                    error!(stack = %outcome.stack_id, "Rollback failed");
                    blocked.extend(graph.ancestors([outcome.stack_id.as_str()]));
                    rollback_failed.push(outcome.stack_id.clone());
                }
                if let Some(report) = reports.get_mut(&outcome.stack_id) {
                    report.status = outcome.status;
                    report.attempts += outcome.attempts;
                    if outcome.error.is_some() {
                        report.error = outcome.error;
                    }
                }
            }
        }

        Ok(rollback_failed)
    }

    /// Executes a teardown plan.
    ///
    /// The removal directive comes from the current declaration when the
    /// stack is still declared, otherwise from its record.
    ///
    /// # Errors
    ///
    /// Returns an error only for state store failures.
    pub async fn destroy(
        &self,
        registry: &StackRegistry,
        plan: &DeploymentPlan,
    ) -> Result<RunReport> {
        let ctx = self.context();
        let started_at = Utc::now();
        info!(
            run_id = %ctx.run_id,
            stacks = plan.stack_count(),
            batches = plan.batches.len(),
            "Starting destroy"
        );

        let mut reports: BTreeMap<String, StackReport> = BTreeMap::new();
        let mut failed: Vec<String> = Vec::new();
        let mut cancelled: Option<String> = None;

        for batch in &plan.batches {
            if !failed.is_empty() {
                break;
            }
            if let Some(reason) = self.signal.reason() {
                cancelled = Some(reason);
                break;
            }

            let mut jobs = Vec::with_capacity(batch.stacks.len());
            for id in &batch.stacks {
                let record = self.store.get(id).await?;
                let removal = registry.get(id).map_or_else(
                    || record.as_ref().map_or(Removal::Delete, |r| r.removal),
                    |s| s.removal_policy.resolve(self.production),
                );
                jobs.push(Job::Teardown {
                    stack_id: id.clone(),
                    record,
                    removal,
                    rollback: false,
                });
            }

            for outcome in self.run_batch(&ctx, jobs, true).await? {
                if outcome.status == StackStatus::Failed {
                    failed.push(outcome.stack_id.clone());
                }
                reports.insert(outcome.stack_id.clone(), outcome.into_report(batch.index));
            }
        }

        fill_not_started(plan, &mut reports);

        let outcome = if !failed.is_empty() {
            RunOutcome::DestroyFailed { stacks: failed }
        } else if let Some(reason) = cancelled {
            RunOutcome::Cancelled { reason }
        } else {
            RunOutcome::Succeeded
        };

        let report = finish(&ctx, Operation::Destroy, started_at, outcome, plan, reports);
        info!(run_id = %report.run_id, "{report}");
        Ok(report)
    }

    /// Runs one batch of jobs concurrently and waits for all of them.
    async fn run_batch(
        &self,
        ctx: &Arc<RunContext>,
        jobs: Vec<Job>,
        fail_fast: bool,
    ) -> Result<Vec<TaskOutcome>> {
        let (fail_tx, _fail_rx) = watch::channel(false);
        let fail_flag = Arc::new(fail_tx);
        let sem = self.max_concurrency.map(|n| Arc::new(Semaphore::new(n)));

        let mut tasks = Vec::with_capacity(jobs.len());

        for job in jobs {
            let ctx = Arc::clone(ctx);
            let fail_flag = Arc::clone(&fail_flag);
            let fail_rx = fail_flag.subscribe();
            let sem = sem.clone();
            let stack_id = job.stack_id().to_string();

            let task = tokio::spawn(async move {
                let _permit = match sem {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };

                // A sibling failed while this task waited for a permit.
                if fail_fast && *fail_rx.borrow() {
                    debug!(stack = %job.stack_id(), "Cancelled before start");
                    return Ok(TaskOutcome::skipped(job.stack_id(), StackStatus::Cancelled));
                }

                let outcome = job.run(&ctx).await;
                let ok = outcome.as_ref().is_ok_and(|o| !o.status.is_failure());
                if fail_fast && !ok {
                    fail_flag.send_replace(true);
                }
                outcome
            });

            tasks.push((stack_id, task));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut fatal = None;

        for (stack_id, task) in tasks {
            match task.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    error!(stack = %stack_id, "State store failure: {e}");
                    fatal.get_or_insert(e);
                }
                Err(join_error) => {
                    fatal.get_or_insert(StackyardError::internal(format!(
                        "Task for stack '{stack_id}' did not complete: {join_error}"
                    )));
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }
}

/// Binds a stack's imports to export values already recorded in this run.
fn resolve_imports(
    graph: &DependencyGraph,
    stack_id: &str,
    exports: &BTreeMap<String, BTreeMap<String, String>>,
) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut imports = BTreeMap::new();
    for reference in graph.references_for(stack_id) {
        let value = exports
            .get(&reference.producer)
            .and_then(|values| values.get(&reference.export))
            .ok_or_else(|| {
                format!(
                    "Export '{}' of stack '{}' is not resolved",
                    reference.export, reference.producer
                )
            })?;
        imports.insert(reference.export.clone(), value.clone());
    }
    Ok(imports)
}

fn fill_not_started(plan: &DeploymentPlan, reports: &mut BTreeMap<String, StackReport>) {
    for batch in &plan.batches {
        for id in &batch.stacks {
            reports.entry(id.clone()).or_insert_with(|| StackReport {
                stack_id: id.clone(),
                batch: batch.index,
                status: StackStatus::NotStarted,
                attempts: 0,
                error: None,
            });
        }
    }
}

fn finish(
    ctx: &RunContext,
    operation: Operation,
    started_at: chrono::DateTime<Utc>,
    outcome: RunOutcome,
    plan: &DeploymentPlan,
    mut reports: BTreeMap<String, StackReport>,
) -> RunReport {
    let stacks = plan
        .stacks()
        .filter_map(|id| reports.remove(id))
        .collect();

    RunReport {
        run_id: ctx.run_id.clone(),
        operation,
        started_at,
        finished_at: Utc::now(),
        outcome,
        stacks,
    }
}

impl Job {
    fn stack_id(&self) -> &str {
        match self {
            Self::Deploy { stack, .. } => &stack.id,
            Self::Teardown { stack_id, .. } => stack_id,
        }
    }

    async fn run(self, ctx: &RunContext) -> Result<TaskOutcome> {
        match self {
            Self::Deploy {
                stack,
                imports,
                prior,
            } => deploy_stack(ctx, stack, imports, prior).await,
            Self::Teardown {
                stack_id,
                record,
                removal,
                rollback,
            } => teardown_stack(ctx, stack_id, record, removal, rollback).await,
        }
    }
}

async fn deploy_stack(
    ctx: &RunContext,
    stack: StackConfig,
    imports: std::result::Result<BTreeMap<String, String>, String>,
    prior: Option<DeploymentRecord>,
) -> Result<TaskOutcome> {
    let imports = match imports {
        Ok(imports) => imports,
        Err(message) => {
            error!(stack = %stack.id, "{message}");
            return Ok(TaskOutcome::failed(stack.id, 0, message, prior));
        }
    };

    let removal = stack.removal_policy.resolve(ctx.production);
    let resolved = match render_stack(&stack, &imports, removal) {
        Ok(resolved) => resolved,
        Err(e) => return Ok(TaskOutcome::failed(stack.id, 0, e.to_string(), prior)),
    };
    let fingerprint = ctx.hasher.fingerprint(&resolved);

    if let Some(record) = &prior
        && record.is_deployed()
        && StackHasher::hashes_match(&record.fingerprint, &fingerprint)
    {
        debug!(stack = %stack.id, "Fingerprint unchanged, skipping");
        return Ok(TaskOutcome {
            stack_id: stack.id,
            status: StackStatus::Unchanged,
            attempts: 0,
            error: None,
            record: prior,
        });
    }

    let mut record =
        prior.unwrap_or_else(|| DeploymentRecord::new(&stack.id, &fingerprint, removal));
    record.mark_pending(&fingerprint, removal, &ctx.run_id);
    ctx.store.put(&stack.id, &record).await?;

    info!(
        stack = %stack.id,
        fingerprint = %StackHasher::short_hash(&fingerprint),
        "Provisioning stack"
    );

    let request = ProvisionRequest::from_resolved(&resolved, &fingerprint);
    let (result, attempts) = ctx
        .retry
        .run(&stack.id, || ctx.backend.provision(&request))
        .await;

    let error = match result {
        Ok(output) => {
            let missing = resolved
                .exports
                .keys()
                .find(|name| !output.exports.contains_key(*name))
                .cloned();
            match missing {
                None => {
                    record.mark_deployed(output.exports, output.handles, &ctx.run_id);
                    ctx.store.put(&stack.id, &record).await?;
                    info!(stack = %stack.id, attempts, "Stack deployed");
                    return Ok(TaskOutcome {
                        stack_id: stack.id,
                        status: StackStatus::Deployed,
                        attempts,
                        error: None,
                        record: Some(record),
                    });
                }
                Some(export) => {
                    // Keep handles so the partial deployment can be torn down.
                    record.handles = output.handles;
                    BackendError::MissingExport {
                        stack_id: stack.id.clone(),
                        export,
                    }
                }
            }
        }
        Err(e) => e,
    };

    error!(stack = %stack.id, attempts, "Stack failed: {error}");
    record.mark_failed(error.to_string(), &ctx.run_id);
    ctx.store.put(&stack.id, &record).await?;

    Ok(TaskOutcome::failed(stack.id, attempts, error.to_string(), Some(record)))
}

async fn teardown_stack(
    ctx: &RunContext,
    stack_id: String,
    record: Option<DeploymentRecord>,
    removal: Removal,
    rollback: bool,
) -> Result<TaskOutcome> {
    let Some(mut record) = record.filter(|r| !r.is_absent()) else {
        debug!(stack = %stack_id, "Nothing recorded, skipping teardown");
        return Ok(TaskOutcome::skipped(&stack_id, StackStatus::AlreadyAbsent));
    };

    info!(stack = %stack_id, %removal, rollback, "Deprovisioning stack");

    let request = DeprovisionRequest {
        stack_id: stack_id.clone(),
        handles: record.handles.clone(),
        removal,
    };
    let (result, attempts) = ctx
        .retry
        .run(&stack_id, || ctx.backend.deprovision(&request))
        .await;

    match result {
        Ok(()) => {
            let status = if rollback {
                record.mark_rolled_back(&ctx.run_id);
                StackStatus::RolledBack
            } else {
                record.mark_destroyed(&ctx.run_id);
                StackStatus::Destroyed
            };
            ctx.store.put(&stack_id, &record).await?;
            info!(stack = %stack_id, attempts, "Stack {status}");

            Ok(TaskOutcome {
                stack_id,
                status,
                attempts,
                error: None,
                record: Some(record),
            })
        }
        Err(e) => {
            error!(stack = %stack_id, attempts, "Teardown failed: {e}");
            record.mark_failed(e.to_string(), &ctx.run_id);
            ctx.store.put(&stack_id, &record).await?;

            Ok(TaskOutcome {
                stack_id,
                status: if rollback {
                    StackStatus::RollbackFailed
                } else {
                    StackStatus::Failed
                },
                attempts,
                error: Some(e.to_string()),
                record: Some(record),
            })
        }
    }
}

impl TaskOutcome {
    fn failed(
        stack_id: String,
        attempts: u32,
        error: String,
        record: Option<DeploymentRecord>,
    ) -> Self {
        Self {
            stack_id,
            status: StackStatus::Failed,
            attempts,
            error: Some(error),
            record,
        }
    }

    fn skipped(stack_id: &str, status: StackStatus) -> Self {
        Self {
            stack_id: stack_id.to_string(),
            status,
            attempts: 0,
            error: None,
            record: None,
        }
    }

    fn into_report(self, batch: usize) -> StackReport {
        StackReport {
            stack_id: self.stack_id,
            batch,
            status: self.status,
            attempts: self.attempts,
            error: self.error,
        }
    }
}
