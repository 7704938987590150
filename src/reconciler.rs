//! Apply cycle.
//!
//! The reconciler ties the pipeline together: it turns configuration into
//! descriptors, plans them against the applied state and executes the plan
//! under the state lock. Plan, status and `state rm` are read-mostly flows
//! around the same pieces.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigValidator, KestrelConfig};
use crate::error::{ExecutionError, KestrelError, Result, StateError};
use crate::planner::{Action, ExecutionReport, ExecutionResult, Executor, Outcome, Plan, PlanEngine};
use crate::provider::{Provider, IP_ADDRESS_ATTR};
use crate::resource::{ClusterBlueprint, DescriptorValidator, ResourceDescriptor, ResourceKind};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::state::{
    generate_holder_id, with_transaction, AppliedState, ApplyHistoryEntry, ApplyOperation,
    LockInfo, StateStore, StateTransaction,
};

/// Drives plan, apply and destroy cycles for one cluster.
pub struct Reconciler<'a> {
    /// Cluster configuration.
    config: &'a KestrelConfig,
    /// Where applied state lives.
    store: &'a dyn StateStore,
    /// Cloud API.
    provider: Arc<dyn Provider>,
    /// Stops the executor from dispatching new operations.
    cancel: CancellationToken,
    /// Lock holder recorded for every cycle.
    holder: String,
}

/// A failed operation in the summary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedOperation {
    /// Resource name.
    pub name: String,
    /// Failure detail.
    pub error: String,
}

/// Counts of what a cycle did.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ApplySummary {
    /// Resources created.
    pub created: usize,
    /// Resources updated.
    pub updated: usize,
    /// Resources deleted.
    pub deleted: usize,
    /// Resources already up to date.
    pub unchanged: usize,
    /// Operations that failed.
    pub failed: Vec<FailedOperation>,
    /// Operations that were never attempted.
    pub skipped: Vec<String>,
}

/// Values exported once a cycle finishes.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ClusterOutputs {
    /// Address of each public IP, keyed by resource name. `None` when the
    /// provider has not allocated one or could not be asked.
    pub public_ips: BTreeMap<String, Option<String>>,
}

/// Everything a finished apply or destroy cycle reports.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Kind of cycle.
    pub operation: ApplyOperation,
    /// Fingerprint of the desired set.
    pub plan_fingerprint: String,
    /// Aggregate counts.
    pub summary: ApplySummary,
    /// Per-operation results in plan order.
    pub results: Vec<ExecutionResult>,
    /// Exported values.
    pub outputs: ClusterOutputs,
    /// Why the run stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<String>,
}

impl ApplyReport {
    fn new(operation: ApplyOperation, plan: &Plan, execution: ExecutionReport) -> Self {
        let summary = ApplySummary::from_execution(&execution);
        Self {
            operation,
            plan_fingerprint: plan.fingerprint.clone(),
            summary,
            results: execution.results,
            outputs: ClusterOutputs::default(),
            interrupted: execution.interrupted,
        }
    }

    /// True when every operation succeeded and the run was not interrupted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.summary.failed.is_empty() && self.summary.skipped.is_empty() && self.interrupted.is_none()
    }

    fn history_entry(&self) -> ApplyHistoryEntry {
        ApplyHistoryEntry {
            timestamp: chrono::Utc::now(),
            operation: self.operation,
            plan_fingerprint: self.plan_fingerprint.clone(),
            created: self.summary.created,
            updated: self.summary.updated,
            deleted: self.summary.deleted,
            failed: self.summary.failed.len(),
            skipped: self.summary.skipped.len(),
        }
    }
}

impl ApplySummary {
    fn from_execution(report: &ExecutionReport) -> Self {
        let mut summary = Self {
            created: report.succeeded(Action::Create),
            updated: report.succeeded(Action::Update),
            deleted: report.succeeded(Action::Delete),
            unchanged: report.succeeded(Action::NoOp),
            ..Self::default()
        };

        for result in &report.results {
            match result.outcome {
                Outcome::Failed => summary.failed.push(FailedOperation {
                    name: result.name.clone(),
                    error: result.error.clone().unwrap_or_default(),
                }),
                Outcome::Skipped => summary.skipped.push(result.name.clone()),
                Outcome::Success => {}
            }
        }

        summary
    }
}

/// What the provider says about an applied resource.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum LiveStatus {
    /// The resource exists.
    Present,
    /// The provider no longer knows the resource.
    Missing,
    /// The provider could not be asked.
    Unknown(String),
}

/// One applied resource in a status report.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider identifier.
    pub provider_id: String,
    /// When it was last applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// Planned action against the current configuration.
    pub pending: Action,
    /// Provider view, when refreshed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStatus>,
}

/// Snapshot of the applied state against the configuration.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// State serial.
    pub serial: u64,
    /// When the state was last saved, if ever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
    /// Applied resources.
    pub resources: Vec<ResourceStatus>,
    /// Desired resources that have never been applied.
    pub missing: Vec<String>,
    /// Current lock, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockInfo>,
    /// Most recent cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<ApplyHistoryEntry>,
}

impl StatusReport {
    /// True when nothing is pending and nothing was found missing upstream.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.missing.is_empty()
            && self.resources.iter().all(|r| {
                r.pending == Action::NoOp && !matches!(r.live, Some(LiveStatus::Missing))
            })
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(config: &'a KestrelConfig, store: &'a dyn StateStore, provider: Arc<dyn Provider>) -> Self {
        Self {
            config,
            store,
            provider,
            cancel: CancellationToken::new(),
            holder: generate_holder_id(),
        }
    }

    /// Uses `token` to interrupt apply and destroy cycles.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Validates the configuration and returns the descriptors it expands to.
    ///
    /// # Errors
    ///
    /// Returns a configuration or model error; nothing is sent to the
    /// provider in that case.
    pub fn desired(&self) -> Result<Vec<ResourceDescriptor>> {
        ConfigValidator::new().validate(self.config)?;

        let descriptors = ClusterBlueprint::new(&self.config.cluster).descriptors();
        DescriptorValidator::new().validate(&descriptors)?;

        debug!("Configuration expands to {} descriptors", descriptors.len());
        Ok(descriptors)
    }

    /// Plans against the current state without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, loading or planning fails.
    pub async fn plan(&self) -> Result<Plan> {
        let desired = self.desired()?;
        let state = self.store.load().await?.unwrap_or_default();
        PlanEngine::new().plan(&desired, &state)
    }

    /// Converges the cluster towards the configuration.
    ///
    /// Operation failures do not make this return `Err`; they are in the
    /// report. Check [`ApplyReport::is_success`].
    ///
    /// # Errors
    ///
    /// Returns an error if validation, locking, loading or planning fails.
    pub async fn apply(&self) -> Result<ApplyReport> {
        let desired = self.desired()?;
        self.run_cycle(&desired, ApplyOperation::Apply).await
    }

    /// Deletes every resource in the state, dependents first. The state
    /// document itself is removed once nothing is left.
    ///
    /// # Errors
    ///
    /// Returns an error if locking, loading or planning fails.
    pub async fn destroy(&self) -> Result<ApplyReport> {
        self.run_cycle(&[], ApplyOperation::Destroy).await
    }

    async fn run_cycle(&self, desired: &[ResourceDescriptor], operation: ApplyOperation) -> Result<ApplyReport> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::Aborted {
                reason: String::from("cancelled before the state lock was taken"),
            }
            .into());
        }

        let mut tx = StateTransaction::begin(self.store, &self.holder).await?;

        let outcome = self.run_locked(desired, operation, &mut tx).await;

        let released = tx.commit().await;
        let report = outcome?;
        released?;

        info!(
            "{:?} finished: {} created, {} updated, {} deleted, {} failed, {} skipped",
            operation,
            report.summary.created,
            report.summary.updated,
            report.summary.deleted,
            report.summary.failed.len(),
            report.summary.skipped.len()
        );

        Ok(report)
    }

    async fn run_locked(
        &self,
        desired: &[ResourceDescriptor],
        operation: ApplyOperation,
        tx: &mut StateTransaction<'_>,
    ) -> Result<ApplyReport> {
        let plan = PlanEngine::new().plan(desired, tx.state())?;

        let executor =
            Executor::new(Arc::clone(&self.provider), &self.config.executor).with_cancellation(self.cancel.clone());
        let execution = executor.execute(&plan, tx).await;

        let mut report = ApplyReport::new(operation, &plan, execution);

        let entry = report.history_entry();
        if let Err(e) = tx.record(|state| state.add_history(entry)).await {
            warn!("Failed to record apply history: {e}");
        }

        match operation {
            ApplyOperation::Apply => {
                report.outputs = self.collect_outputs(tx.state().resources.values()).await;
            }
            ApplyOperation::Destroy if report.is_success() && tx.state().is_empty() => {
                self.store.delete().await?;
                info!("Every resource destroyed; state removed");
            }
            ApplyOperation::Destroy => {}
        }

        Ok(report)
    }

    /// Reads the allocated address of every applied public IP.
    async fn collect_outputs<'s>(&self, applied: impl Iterator<Item = &'s AppliedState>) -> ClusterOutputs {
        let retry = RetryConfig::from_executor(&self.config.executor);
        let mut outputs = ClusterOutputs::default();

        for resource in applied.filter(|r| r.kind == ResourceKind::PublicIp) {
            let (result, _) = retry_with_backoff(&retry, &resource.name, || {
                self.provider.read(ResourceKind::PublicIp, &resource.provider_id)
            })
            .await;

            let address = match result {
                Ok(attributes) => attributes
                    .get(IP_ADDRESS_ATTR)
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                Err(e) => {
                    warn!("Cannot read address of {}: {e}", resource.name);
                    None
                }
            };
            outputs.public_ips.insert(resource.name.clone(), address);
        }

        outputs
    }

    /// Reports the applied state, what is pending against the configuration
    /// and, with `refresh`, whether each resource still exists upstream.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, loading or planning fails.
    pub async fn status(&self, refresh: bool) -> Result<StatusReport> {
        let desired = self.desired()?;
        let state = self.store.load().await?.unwrap_or_default();
        let plan = PlanEngine::new().plan(&desired, &state)?;
        let lock = self.store.get_lock_info().await?;

        let mut resources = Vec::with_capacity(state.len());
        for applied in state.resources.values() {
            let pending = plan.get(&applied.name).map_or(Action::Delete, |op| op.action);
            let live = if refresh {
                Some(self.refresh(applied).await)
            } else {
                None
            };

            resources.push(ResourceStatus {
                name: applied.name.clone(),
                kind: applied.kind,
                provider_id: applied.provider_id.clone(),
                applied_at: applied.applied_at,
                pending,
                live,
            });
        }

        let missing = plan
            .operations
            .iter()
            .filter(|op| op.action == Action::Create)
            .map(|op| op.name.clone())
            .collect();

        Ok(StatusReport {
            serial: state.serial,
            last_updated: (state.serial > 0).then_some(state.last_updated),
            resources,
            missing,
            lock,
            last_cycle: state.history.last().cloned(),
        })
    }

    async fn refresh(&self, applied: &AppliedState) -> LiveStatus {
        match self.provider.read(applied.kind, &applied.provider_id).await {
            Ok(_) => LiveStatus::Present,
            Err(crate::error::ProviderError::NotFound { .. }) => {
                warn!("{} is recorded in state but missing upstream", applied.name);
                LiveStatus::Missing
            }
            Err(e) => LiveStatus::Unknown(e.to_string()),
        }
    }

    /// Drops `name` from the state without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource is not in the state or the state
    /// cannot be locked or saved.
    pub async fn forget(&self, name: &str) -> Result<AppliedState> {
        let removed = with_transaction(self.store, &self.holder, |state| {
            state.remove(name).ok_or_else(|| -> KestrelError {
                StateError::ResourceNotFound {
                    name: name.to_string(),
                }
                .into()
            })
        })
        .await?;

        info!("Removed {} ({}) from state", removed.name, removed.kind);
        Ok(removed)
    }
}

impl std::fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
            self.created,
            self.updated,
            self.deleted,
            self.unchanged,
            self.failed.len(),
            self.skipped.len()
        )
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self.operation {
            ApplyOperation::Apply => "Apply",
            ApplyOperation::Destroy => "Destroy",
        };
        let status = if self.is_success() { "complete" } else { "incomplete" };
        writeln!(f, "{verb} {status}: {}", self.summary)?;

        for failed in &self.summary.failed {
            writeln!(f, "  failed  {}: {}", failed.name, failed.error)?;
        }
        for skipped in &self.summary.skipped {
            writeln!(f, "  skipped {skipped}")?;
        }
        if let Some(reason) = &self.interrupted {
            writeln!(f, "  interrupted: {reason}")?;
        }

        if !self.outputs.public_ips.is_empty() {
            writeln!(f, "Outputs:")?;
            for (name, address) in &self.outputs.public_ips {
                writeln!(f, "  {name} = {}", address.as_deref().unwrap_or("(pending)"))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, ExecutorConfig, ImageConfig, NetworkConfig, ProviderConfig, StateConfig};
    use crate::error::ProviderError;
    use crate::provider::MemoryProvider;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    fn config(node_count: u32) -> KestrelConfig {
        KestrelConfig {
            cluster: ClusterConfig {
                resource_group: "kestrel-rg".to_string(),
                location: "East US".to_string(),
                vm_size: "Standard_B2s".to_string(),
                admin_username: "azureuser".to_string(),
                ssh_public_key: "ssh-rsa AAAAB3NzaC1yc2E test@kestrel".to_string(),
                node_count,
                network: NetworkConfig::default(),
                image: ImageConfig::default(),
            },
            state: StateConfig::default(),
            provider: ProviderConfig::default(),
            executor: ExecutorConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                ..ExecutorConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn test_apply_creates_cluster_and_exports_ips() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(MemoryProvider::new());
        let config = config(2);

        let reconciler = Reconciler::new(&config, &store, provider.clone());
        let report = reconciler.apply().await.unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(report.summary.created, 9);
        assert_eq!(report.outputs.public_ips.len(), 2);
        assert!(report.outputs.public_ips.values().all(Option::is_some));

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.len(), 9);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].created, 9);
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_apply_is_noop() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(MemoryProvider::new());
        let config = config(1);

        let reconciler = Reconciler::new(&config, &store, provider);
        reconciler.apply().await.unwrap();

        let plan = reconciler.plan().await.unwrap();
        assert!(!plan.has_changes());

        let report = reconciler.apply().await.unwrap();
        assert_eq!(report.summary.unchanged, 6);
        assert_eq!(report.summary.created, 0);
    }

    #[tokio::test]
    async fn test_scale_down_deletes_node() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(MemoryProvider::new());

        let three = config(3);
        Reconciler::new(&three, &store, provider.clone()).apply().await.unwrap();

        let two = config(2);
        let report = Reconciler::new(&two, &store, provider.clone()).apply().await.unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(report.summary.deleted, 3);
        assert!(!provider.resource_names().await.contains(&"k3s-node-2".to_string()));
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_raised() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(
            MemoryProvider::new().fail_always("k3s-vnet", ProviderError::rejected(400, "address space overlaps")),
        );
        let config = config(1);

        let report = Reconciler::new(&config, &store, provider).apply().await.unwrap();

        assert!(!report.is_success());
        assert_eq!(report.summary.failed.len(), 1);
        assert_eq!(report.summary.failed[0].name, "k3s-vnet");
        assert!(report.summary.skipped.contains(&"k3s-subnet".to_string()));
        assert!(report.summary.skipped.contains(&"k3s-node-0".to_string()));

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.history[0].failed, 1);
    }

    #[tokio::test]
    async fn test_destroy_empties_state() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(MemoryProvider::new());
        let config = config(1);

        let reconciler = Reconciler::new(&config, &store, provider.clone());
        reconciler.apply().await.unwrap();
        let report = reconciler.destroy().await.unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(report.summary.deleted, 6);
        assert!(report.outputs.public_ips.is_empty());
        assert!(!store.exists().await.unwrap());
        assert!(provider.resource_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_never_reaches_provider() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(MemoryProvider::new());
        let mut config = config(1);
        config.cluster.node_count = 0;

        let result = Reconciler::new(&config, &store, provider.clone()).apply().await;

        assert!(result.is_err());
        assert!(provider.calls().await.is_empty());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_takes_no_lock() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(MemoryProvider::new());
        let config = config(1);
        let token = CancellationToken::new();
        token.cancel();

        let result = Reconciler::new(&config, &store, provider.clone())
            .with_cancellation(token)
            .apply()
            .await;

        assert!(matches!(
            result,
            Err(KestrelError::Execution(ExecutionError::Aborted { .. }))
        ));
        assert!(provider.calls().await.is_empty());
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_reports_pending_and_missing() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(MemoryProvider::new());

        let one = config(1);
        Reconciler::new(&one, &store, provider.clone()).apply().await.unwrap();

        let two = config(2);
        let status = Reconciler::new(&two, &store, provider).status(true).await.unwrap();

        assert!(!status.is_converged());
        assert_eq!(status.missing.len(), 3);
        assert!(status.missing.contains(&"k3s-node-1".to_string()));
        assert!(status.resources.iter().all(|r| r.live == Some(LiveStatus::Present)));
    }

    #[tokio::test]
    async fn test_forget_removes_only_from_state() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(MemoryProvider::new());
        let config = config(1);

        let reconciler = Reconciler::new(&config, &store, provider.clone());
        reconciler.apply().await.unwrap();

        let removed = reconciler.forget("k3s-node-0").await.unwrap();
        assert_eq!(removed.kind, ResourceKind::Vm);
        assert!(store.load().await.unwrap().unwrap().get("k3s-node-0").is_none());
        assert!(provider.resource_names().await.contains(&"k3s-node-0".to_string()));

        let err = reconciler.forget("k3s-node-0").await.unwrap_err();
        assert!(matches!(
            err,
            KestrelError::State(StateError::ResourceNotFound { ref name }) if name == "k3s-node-0"
        ));
    }
}
