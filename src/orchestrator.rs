//! Orchestrator wiring declarations to plans and runs.
//!
//! Registry, reference resolution and graph construction are pure and run
//! on every call. Deploy and destroy hold the state lock for the whole run.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend::{ProvisioningBackend, RetryPolicy};
use crate::config::StackyardConfig;
use crate::error::{ConfigError, Result, StackyardError, StateError};
use crate::graph::{DependencyGraph, GraphBuilder, ReferenceResolver};
use crate::planner::{
    DeploymentExecutor, DeploymentPlan, DiffEngine, DiffResult, RunReport, RunSignal,
};
use crate::stack::StackRegistry;
use crate::state::{DeploymentRecord, LOCK_EXPIRY_SECS, StateStore, generate_holder_id};

/// Pure output of declaration processing.
#[derive(Debug, Clone)]
pub struct Prepared {
    /// Declared stacks.
    pub registry: StackRegistry,
    /// Full dependency graph.
    pub graph: DependencyGraph,
}

/// Entry point for diff, deploy and destroy.
pub struct Orchestrator {
    config: StackyardConfig,
    backend: Arc<dyn ProvisioningBackend>,
    store: Arc<dyn StateStore>,
    signal: RunSignal,
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
    heartbeat: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project", &self.config.project.name)
            .field("backend", &self.backend.backend_type())
            .field("store", &self.store.backend_type())
            .field("max_concurrency", &self.max_concurrency)
            .field("timeout", &self.timeout)
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

impl Prepared {
    /// Checks that every target is declared.
    fn check_targets(&self, targets: &[String]) -> Result<()> {
        match targets.iter().find(|t| !self.registry.contains(t)) {
            Some(unknown) => Err(ConfigError::UnknownStack {
                stack_id: unknown.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Builds the deploy plan for `targets` and their transitive predecessors.
    /// An empty target list plans every stack.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStack` if a target is not declared.
    pub fn plan_deploy(&self, targets: &[String]) -> Result<DeploymentPlan> {
        self.check_targets(targets)?;
        if targets.is_empty() {
            return Ok(DeploymentPlan::from_graph(&self.graph));
        }

        let mut keep: BTreeSet<String> = targets.iter().cloned().collect();
        keep.extend(self.graph.ancestors(targets.iter().map(String::as_str)));
        Ok(DeploymentPlan::from_graph(&self.graph.subgraph(&keep)))
    }

    /// Builds the teardown plan for `targets` and their transitive dependents.
    /// An empty target list plans every stack.
    ///
    /// Stacks still recorded in `records` but no longer declared are torn
    /// down first: nothing declared can depend on them. They may also be
    /// named as targets.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStack` if a target is neither declared nor recorded.
    pub fn plan_destroy(
        &self,
        targets: &[String],
        records: &[DeploymentRecord],
    ) -> Result<DeploymentPlan> {
        let orphans: BTreeSet<&str> = records
            .iter()
            .filter(|r| !self.registry.contains(&r.stack_id) && !r.is_absent())
            .map(|r| r.stack_id.as_str())
            .collect();

        let (declared, undeclared): (Vec<String>, Vec<String>) = targets
            .iter()
            .cloned()
            .partition(|t| self.registry.contains(t));
        if let Some(unknown) = undeclared.iter().find(|t| !orphans.contains(t.as_str())) {
            return Err(ConfigError::UnknownStack {
                stack_id: unknown.clone(),
            }
            .into());
        }

        if targets.is_empty() {
            let orphans = orphans.into_iter().map(String::from).collect();
            return Ok(DeploymentPlan::from_graph(&self.graph)
                .teardown()
                .with_leading_batch(orphans));
        }

        let mut keep: BTreeSet<String> = declared.iter().cloned().collect();
        keep.extend(self.graph.descendants(declared.iter().map(String::as_str)));
        Ok(DeploymentPlan::from_graph(&self.graph.subgraph(&keep))
            .teardown()
            .with_leading_batch(undeclared))
    }
}

impl Orchestrator {
    /// Creates an orchestrator. Run limits default to the configuration.
    #[must_use]
    pub fn new(
        config: StackyardConfig,
        backend: Arc<dyn ProvisioningBackend>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let max_concurrency = config.run.max_concurrency;
        let timeout = config.run.timeout_secs.map(Duration::from_secs);
        Self {
            config,
            backend,
            store,
            signal: RunSignal::new(),
            max_concurrency,
            timeout,
            heartbeat: Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs() / 3),
        }
    }

    /// Overrides the per-batch concurrency limit.
    #[must_use]
    pub const fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Overrides the run timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides how often the run lock is renewed while a run is active.
    #[must_use]
    pub const fn with_lock_heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = period;
        self
    }

    /// Returns the run cancellation signal.
    #[must_use]
    pub const fn signal(&self) -> &RunSignal {
        &self.signal
    }

    /// Returns the loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &StackyardConfig {
        &self.config
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Builds the registry and dependency graph.
    ///
    /// # Errors
    ///
    /// Returns a plan-time error for duplicate stacks, unresolved or
    /// ambiguous imports, unknown dependencies, and cycles.
    pub fn prepare(&self) -> Result<Prepared> {
        let registry = StackRegistry::new(self.config.stacks.iter().cloned())?;
        let references = ReferenceResolver::new().resolve(&registry)?;
        let graph = GraphBuilder::new().build(&registry, references)?;
        Ok(Prepared { registry, graph })
    }

    /// Computes what a deploy of `targets` would change. Never calls the backend.
    ///
    /// # Errors
    ///
    /// Returns plan-time errors only; a state read failure degrades to an
    /// unannotated plan.
    pub async fn diff(&self, targets: &[String]) -> Result<DiffResult> {
        let prepared = self.prepare()?;
        let plan = prepared.plan_deploy(targets)?;

        match self.store.list().await {
            Ok(records) => Ok(DiffEngine::new()
                .with_production(self.config.project.is_production())
                .compute_diff(&prepared.registry, &prepared.graph, &plan, &records)),
            Err(e) => {
                warn!("Could not read state, showing plan only: {e}");
                Ok(DiffResult::unannotated(&plan))
            }
        }
    }

    /// Deploys `targets` and their predecessors; all stacks if empty.
    ///
    /// # Errors
    ///
    /// Returns plan-time errors, lock failures, and state store failures.
    pub async fn deploy(&self, targets: &[String]) -> Result<RunReport> {
        let prepared = self.prepare()?;
        let plan = prepared.plan_deploy(targets)?;
        info!(project = %self.config.qualified_name(), "{plan}");

        let executor = self.executor();
        self.locked(executor.deploy(&prepared.registry, &prepared.graph, &plan))
            .await
    }

    /// Builds the teardown plan for `targets`, including recorded stacks
    /// that are no longer declared.
    ///
    /// # Errors
    ///
    /// Returns plan-time errors and state read failures.
    pub async fn destroy_plan(&self, targets: &[String]) -> Result<DeploymentPlan> {
        let prepared = self.prepare()?;
        let records = self.store.list().await?;
        prepared.plan_destroy(targets, &records)
    }

    /// Destroys `targets` and their dependents; all stacks if empty.
    /// Undeclared stacks that still have a live record are torn down too.
    ///
    /// # Errors
    ///
    /// Returns plan-time errors, lock failures, and state store failures.
    pub async fn destroy(&self, targets: &[String]) -> Result<RunReport> {
        let prepared = self.prepare()?;
        let executor = self.executor();

        self.locked(async {
            let records = self.store.list().await?;
            let plan = prepared.plan_destroy(targets, &records)?;
            info!(project = %self.config.qualified_name(), "{plan}");
            executor.destroy(&prepared.registry, &plan).await
        })
        .await
    }

    fn executor(&self) -> DeploymentExecutor {
        DeploymentExecutor::new(Arc::clone(&self.backend), Arc::clone(&self.store))
            .with_retry(RetryPolicy::from(&self.config.run.retry))
            .with_max_concurrency(self.max_concurrency)
            .with_production(self.config.project.is_production())
            .with_signal(self.signal.clone())
    }

    /// Runs `run` under the state lock with the run timeout armed.
    /// The lock is renewed in the background until `run` finishes.
    async fn locked<T>(&self, run: impl Future<Output = Result<T>>) -> Result<T> {
        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        let heartbeat = self.spawn_heartbeat(lock.lock_id.clone());
        let timer = self.timeout.map(|t| self.signal.arm_timeout(t));

        let result = run.await;

        if let Some(timer) = timer {
            timer.abort();
        }
        // Wait for the heartbeat to stop so no refresh lands after release.
        heartbeat.abort();
        let _ = heartbeat.await;
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!(lock_id = %lock.lock_id, "Failed to release state lock: {e}");
        }
        result
    }

    /// Renews the run lock every heartbeat period. Losing the lock to
    /// another holder cancels the run; other refresh errors are retried on
    /// the next tick.
    fn spawn_heartbeat(&self, lock_id: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let signal = self.signal.clone();
        let period = self.heartbeat.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match store.refresh_lock(&lock_id).await {
                    Ok(_) => {}
                    Err(e @ StackyardError::State(StateError::LockLost { .. })) => {
                        error!("{e}");
                        signal.cancel("state lock lost");
                        break;
                    }
                    Err(e) => warn!(lock_id = %lock_id, "Failed to refresh state lock: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use crate::backend::{DeprovisionRequest, LocalBackend, ProvisionOutput, ProvisionRequest};
    use crate::config::{ConfigParser, StackConfig};
    use crate::error::BackendResult;
    use crate::planner::{ChangeKind, RunOutcome, StackStatus};
    use crate::state::{MemoryStateStore, RecordStatus};

    /// Local backend that takes `delay` per call.
    struct SlowBackend {
        inner: LocalBackend,
        delay: Duration,
    }

    #[async_trait]
    impl ProvisioningBackend for SlowBackend {
        async fn provision(&self, request: &ProvisionRequest) -> BackendResult<ProvisionOutput> {
            tokio::time::sleep(self.delay).await;
            self.inner.provision(request).await
        }

        async fn deprovision(&self, request: &DeprovisionRequest) -> BackendResult<()> {
            self.inner.deprovision(request).await
        }

        fn backend_type(&self) -> &'static str {
            "slow"
        }
    }

    const CONFIG: &str = r#"
project:
  name: size-tracker
  environment: dev
stacks:
  - id: Storage
    resources:
      - name: bucket
        kind: object-store
    exports:
      bucketArn: "${bucket.arn}"
  - id: Compute
    imports:
      - name: bucketArn
        from: Storage
    resources:
      - name: tracker
        kind: function
        properties:
          bucket: "${imports.bucketArn}"
  - id: Dashboard
    depends_on: [Compute]
  - id: Audit
"#;

    fn orchestrator(store: &Arc<MemoryStateStore>) -> Orchestrator {
        let config = ConfigParser::new().parse_yaml(CONFIG, None).expect("config");
        let store: Arc<dyn StateStore> = store.clone();
        Orchestrator::new(config, Arc::new(LocalBackend::new()), store)
    }

    fn slow_orchestrator(store: &Arc<MemoryStateStore>, delay_ms: u64) -> Orchestrator {
        let config = ConfigParser::new().parse_yaml(CONFIG, None).expect("config");
        let store: Arc<dyn StateStore> = store.clone();
        let backend = SlowBackend {
            inner: LocalBackend::new(),
            delay: Duration::from_millis(delay_ms),
        };
        Orchestrator::new(config, Arc::new(backend), store)
    }

    /// Same stacks as `CONFIG` with `Audit` no longer declared.
    fn without_audit(store: &Arc<MemoryStateStore>) -> Orchestrator {
        let mut config = ConfigParser::new().parse_yaml(CONFIG, None).expect("config");
        config.stacks.retain(|s| s.id != "Audit");
        let store: Arc<dyn StateStore> = store.clone();
        Orchestrator::new(config, Arc::new(LocalBackend::new()), store)
    }

    fn ids(plan: &DeploymentPlan) -> Vec<Vec<&str>> {
        plan.batches
            .iter()
            .map(|b| b.stacks.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_full_plan() {
        let store = Arc::new(MemoryStateStore::new());
        let prepared = orchestrator(&store).prepare().expect("prepare");
        let plan = prepared.plan_deploy(&[]).expect("plan");

        assert_eq!(
            ids(&plan),
            vec![vec!["Audit", "Storage"], vec!["Compute"], vec!["Dashboard"]]
        );
    }

    #[test]
    fn test_targeted_plans() {
        let store = Arc::new(MemoryStateStore::new());
        let prepared = orchestrator(&store).prepare().expect("prepare");

        let deploy = prepared.plan_deploy(&[String::from("Compute")]).expect("plan");
        assert_eq!(ids(&deploy), vec![vec!["Storage"], vec!["Compute"]]);

        let destroy = prepared
            .plan_destroy(&[String::from("Compute")], &[])
            .expect("plan");
        assert_eq!(ids(&destroy), vec![vec!["Dashboard"], vec!["Compute"]]);
    }

    #[test]
    fn test_unknown_target() {
        let store = Arc::new(MemoryStateStore::new());
        let prepared = orchestrator(&store).prepare().expect("prepare");
        let err = prepared
            .plan_deploy(&[String::from("Nope")])
            .expect_err("unknown");

        assert!(err.is_plan_time());
        assert!(matches!(
            err,
            StackyardError::Config(ConfigError::UnknownStack { .. })
        ));
    }

    #[test]
    fn test_cycle_is_plan_time_error() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut config = ConfigParser::new().parse_yaml(CONFIG, None).expect("config");
        config.stacks = vec![
            StackConfig::new("A").with_depends_on("B"),
            StackConfig::new("B").with_depends_on("A"),
        ];
        let orchestrator = Orchestrator::new(config, Arc::new(LocalBackend::new()), store);

        let err = orchestrator.prepare().expect_err("cycle");
        assert!(matches!(
            err,
            StackyardError::Config(ConfigError::CyclicDependency { .. })
        ));
    }

    #[tokio::test]
    async fn test_deploy_diff_destroy() {
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = orchestrator(&store);

        let diff = orchestrator.diff(&[]).await.expect("diff");
        assert_eq!(diff.count(ChangeKind::Create), 4);

        let report = orchestrator.deploy(&[]).await.expect("deploy");
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.count(StackStatus::Deployed), 4);
        assert!(!store.is_locked().await.expect("locked"));

        let compute = store.get("Compute").await.expect("get").expect("record");
        assert_eq!(compute.status, RecordStatus::Deployed);

        let diff = orchestrator.diff(&[]).await.expect("diff");
        assert!(!diff.has_changes());

        let report = orchestrator.destroy(&[]).await.expect("destroy");
        assert!(report.is_success());
        assert_eq!(report.count(StackStatus::Destroyed), 4);
    }

    #[tokio::test]
    async fn test_deploy_refused_while_locked() {
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = orchestrator(&store);
        store.acquire_lock("someone-else").await.expect("lock");

        let err = orchestrator.deploy(&[]).await.expect_err("locked");

        assert!(!err.is_plan_time());
        assert!(store.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_undeclared_records_are_destroyed_first() {
        let store = Arc::new(MemoryStateStore::new());
        orchestrator(&store).deploy(&[]).await.expect("deploy");

        let orchestrator = without_audit(&store);
        let plan = orchestrator.destroy_plan(&[]).await.expect("plan");
        assert_eq!(
            ids(&plan),
            vec![vec!["Audit"], vec!["Dashboard"], vec!["Compute"], vec!["Storage"]]
        );

        let report = orchestrator.destroy(&[]).await.expect("destroy");
        assert!(report.is_success());
        assert_eq!(report.count(StackStatus::Destroyed), 4);

        let audit = store.get("Audit").await.expect("get").expect("record");
        assert_eq!(audit.status, RecordStatus::Destroyed);

        // Once destroyed it is no longer a valid target.
        let err = orchestrator
            .destroy_plan(&[String::from("Audit")])
            .await
            .expect_err("absent");
        assert!(matches!(
            err,
            StackyardError::Config(ConfigError::UnknownStack { .. })
        ));
    }

    #[tokio::test]
    async fn test_undeclared_record_as_target() {
        let store = Arc::new(MemoryStateStore::new());
        orchestrator(&store).deploy(&[]).await.expect("deploy");

        let orchestrator = without_audit(&store);
        let report = orchestrator
            .destroy(&[String::from("Audit")])
            .await
            .expect("destroy");

        assert!(report.is_success());
        assert_eq!(report.status_of("Audit"), Some(StackStatus::Destroyed));
        assert_eq!(report.stacks.len(), 1);

        let storage = store.get("Storage").await.expect("get").expect("record");
        assert_eq!(storage.status, RecordStatus::Deployed);

        let err = orchestrator
            .destroy(&[String::from("Nope")])
            .await
            .expect_err("unknown");
        assert!(err.is_plan_time());
        assert!(!store.is_locked().await.expect("locked"));
    }

    #[tokio::test]
    async fn test_lock_renewed_during_long_run() {
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator =
            slow_orchestrator(&store, 60).with_lock_heartbeat(Duration::from_millis(10));

        let seen: Arc<Mutex<BTreeSet<DateTime<Utc>>>> = Arc::default();
        let watcher = {
            let store = Arc::clone(&store);
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                loop {
                    if let Some(lock) = store.get_lock_info().await.expect("lock info") {
                        seen.lock().expect("seen").insert(lock.expires_at);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let report = orchestrator.deploy(&[]).await.expect("deploy");
        watcher.abort();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert!(seen.lock().expect("seen").len() >= 2);
        assert!(!store.is_locked().await.expect("locked"));
    }

    #[tokio::test]
    async fn test_lost_lock_cancels_run() {
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator =
            slow_orchestrator(&store, 60).with_lock_heartbeat(Duration::from_millis(10));

        let intruder = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                let held = store.get_lock_info().await.expect("info").expect("held");
                store.release_lock(&held.lock_id).await.expect("release");
                store.acquire_lock("intruder").await.expect("takeover")
            })
        };

        let report = orchestrator.deploy(&[]).await.expect("deploy");
        let takeover = intruder.await.expect("join");

        assert!(matches!(report.outcome, RunOutcome::Cancelled { .. }));
        assert_eq!(report.status_of("Dashboard"), Some(StackStatus::NotStarted));
        let lock = store.get_lock_info().await.expect("info").expect("held");
        assert_eq!(lock.lock_id, takeover.lock_id);
    }

    #[tokio::test]
    async fn test_run_timeout_cancels_and_rolls_back() {
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator =
            slow_orchestrator(&store, 80).with_timeout(Some(Duration::from_millis(20)));

        let report = orchestrator.deploy(&[]).await.expect("deploy");

        match &report.outcome {
            RunOutcome::Cancelled { reason } => assert!(reason.contains("timeout")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(report.status_of("Audit"), Some(StackStatus::RolledBack));
        assert_eq!(report.status_of("Storage"), Some(StackStatus::RolledBack));
        assert_eq!(report.status_of("Compute"), Some(StackStatus::NotStarted));
        assert_eq!(report.status_of("Dashboard"), Some(StackStatus::NotStarted));

        let storage = store.get("Storage").await.expect("get").expect("record");
        assert_eq!(storage.status, RecordStatus::RolledBack);
        assert!(!store.is_locked().await.expect("locked"));
    }
}
