//! Plan types and construction.
//!
//! A plan lists one operation per resource touched by the cycle. Deletes
//! come first, dependents before the resources they referenced; then every
//! desired resource in dependency order as a Create, Update or NoOp. A
//! delete also waits for any desired resource still resting on the doomed
//! one, so a reference is moved before its old target goes away.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

use crate::error::{PlanError, Result};
use crate::resource::{Fingerprint, ResourceDescriptor, ResourceKind};
use crate::state::{AppliedState, AppliedStateSet};

use super::diff::{DiffDetail, DiffEngine};
use super::graph::DependencyGraph;

/// What an operation will do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Provision a resource that has no applied record.
    Create,
    /// Change a resource whose desired attributes differ from the record.
    Update,
    /// Remove a resource that is no longer desired.
    Delete,
    /// Nothing to do.
    #[serde(rename = "noop")]
    NoOp,
}

/// A single planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOperation {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Action to perform.
    pub action: Action,
    /// Depth in its phase's dependency graph.
    pub rank: usize,
    /// Operations that must finish first, by resource name. A delete may
    /// name desired resources that have to move off it first.
    pub dependencies: Vec<String>,
    /// Desired descriptor; absent for deletes.
    #[serde(skip)]
    pub descriptor: Option<ResourceDescriptor>,
    /// Applied record; absent for creates.
    #[serde(skip)]
    pub prior: Option<AppliedState>,
    /// Field changes behind an update.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<DiffDetail>,
}

/// Number of operations per action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounts {
    /// Creates.
    pub create: usize,
    /// Updates.
    pub update: usize,
    /// Deletes.
    pub delete: usize,
    /// Unchanged resources.
    pub noop: usize,
}

/// A complete plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the desired descriptor set.
    pub fingerprint: String,
    /// Operations in dispatch order.
    pub operations: Vec<PlanOperation>,
}

/// Computes plans from desired descriptors and applied state.
#[derive(Debug, Default)]
pub struct PlanEngine {
    diff: DiffEngine,
    hasher: Fingerprint,
}

impl PlanEngine {
    /// Creates a new plan engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            diff: DiffEngine::new(),
            hasher: Fingerprint::new(),
        }
    }

    /// Plans the operations that move `applied` to `desired`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Conflict`] if a desired resource references one
    /// that is about to be deleted or changes kind, and graph errors for
    /// unknown references or cycles.
    pub fn plan(&self, desired: &[ResourceDescriptor], applied: &AppliedStateSet) -> Result<Plan> {
        Self::check_conflicts(desired, applied)?;

        let graph = DependencyGraph::build(desired)?;
        let desired_names: HashSet<&str> = desired.iter().map(|d| d.name.as_str()).collect();

        let mut operations = Self::plan_deletes(&desired_names, applied)?;
        let mut converge = Vec::with_capacity(desired.len());

        let by_name: BTreeMap<&str, &ResourceDescriptor> =
            desired.iter().map(|d| (d.name.as_str(), d)).collect();
        let ranks = graph.ranks();

        for name in graph.topological_order() {
            let Some(descriptor) = by_name.get(name.as_str()) else {
                continue;
            };
            let prior = applied.get(&name);

            let (action, changes) = match prior {
                None => (Action::Create, Vec::new()),
                Some(record) => {
                    let changes = self.diff.diff(descriptor, record);
                    if changes.is_empty() {
                        (Action::NoOp, changes)
                    } else {
                        (Action::Update, changes)
                    }
                }
            };

            debug!("Planned {action} for {name}");

            converge.push(PlanOperation {
                rank: ranks.get(&name).copied().unwrap_or(0),
                dependencies: graph.dependencies_of(&name),
                kind: descriptor.kind,
                action,
                descriptor: Some((**descriptor).clone()),
                prior: prior.cloned(),
                changes,
                name,
            });
        }

        Self::hold_deletes(&mut operations, &converge);
        operations.extend(converge);

        Ok(Plan {
            created_at: Utc::now(),
            fingerprint: self.hasher.hash_descriptors(desired),
            operations,
        })
    }

    fn check_conflicts(desired: &[ResourceDescriptor], applied: &AppliedStateSet) -> Result<()> {
        let desired_names: HashSet<&str> = desired.iter().map(|d| d.name.as_str()).collect();

        for descriptor in desired {
            if let Some(record) = applied.get(&descriptor.name)
                && record.kind != descriptor.kind
            {
                return Err(PlanError::Conflict {
                    resource: descriptor.name.clone(),
                    message: format!(
                        "kind changes from {} to {}; destroy the resource first",
                        record.kind, descriptor.kind
                    ),
                }
                .into());
            }

            for reference in &descriptor.references {
                if !desired_names.contains(reference.name.as_str()) && applied.get(&reference.name).is_some() {
                    return Err(PlanError::Conflict {
                        resource: descriptor.name.clone(),
                        message: format!(
                            "references '{}', which is no longer desired and would be deleted",
                            reference.name
                        ),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Plans deletes for applied resources that are no longer desired. A
    /// delete waits for the deletes of every doomed resource that may rest
    /// on it.
    fn plan_deletes(desired_names: &HashSet<&str>, applied: &AppliedStateSet) -> Result<Vec<PlanOperation>> {
        let doomed: BTreeSet<&str> = applied
            .resources
            .keys()
            .map(String::as_str)
            .filter(|name| !desired_names.contains(name))
            .collect();

        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        // Invert references: deleting X depends on deleting each Y that rests on X.
        let inverted: Vec<ResourceDescriptor> = doomed
            .iter()
            .filter_map(|name| applied.get(name))
            .map(|record| {
                let referrers = doomed
                    .iter()
                    .filter_map(|other| applied.get(other))
                    .filter(|other| other.may_depend_on(record));
                referrers.fold(
                    ResourceDescriptor::new(record.kind, record.name.clone()),
                    |d, referrer| d.with_ref(referrer.kind, referrer.name.clone()),
                )
            })
            .collect();

        let graph = DependencyGraph::build(&inverted)?;
        let ranks = graph.ranks();

        let operations = graph
            .topological_order()
            .into_iter()
            .filter_map(|name| {
                let record = applied.get(&name)?;
                debug!("Planned delete for {name}");
                Some(PlanOperation {
                    kind: record.kind,
                    action: Action::Delete,
                    rank: ranks.get(&name).copied().unwrap_or(0),
                    dependencies: graph.dependencies_of(&name),
                    descriptor: None,
                    prior: Some(record.clone()),
                    changes: Vec::new(),
                    name,
                })
            })
            .collect();

        Ok(operations)
    }

    /// Makes each delete wait for the desired operations whose applied
    /// record may still rest on the doomed resource.
    fn hold_deletes(deletes: &mut [PlanOperation], converge: &[PlanOperation]) {
        for delete in deletes.iter_mut() {
            let Some(doomed) = &delete.prior else {
                continue;
            };

            let holders: Vec<String> = converge
                .iter()
                .filter(|op| op.prior.as_ref().is_some_and(|prior| prior.may_depend_on(doomed)))
                .map(|op| op.name.clone())
                .collect();

            if !holders.is_empty() {
                debug!("Delete of {} waits for {}", delete.name, holders.join(", "));
                delete.dependencies.extend(holders);
            }
        }
    }
}

impl Plan {
    /// Operation counts per action.
    #[must_use]
    pub fn counts(&self) -> PlanCounts {
        self.operations.iter().fold(PlanCounts::default(), |mut counts, op| {
            match op.action {
                Action::Create => counts.create += 1,
                Action::Update => counts.update += 1,
                Action::Delete => counts.delete += 1,
                Action::NoOp => counts.noop += 1,
            }
            counts
        })
    }

    /// Returns true if any operation changes something.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(|op| op.action != Action::NoOp)
    }

    /// Returns true if the plan has no operations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Finds the operation for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PlanOperation> {
        self.operations.iter().find(|op| op.name == name)
    }
}

impl PlanOperation {
    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            Action::Create => format!("Create {} '{}'", self.kind, self.name),
            Action::Update => format!("Update {} '{}'", self.kind, self.name),
            Action::Delete => format!("Delete {} '{}'", self.kind, self.name),
            Action::NoOp => format!("No change for {} '{}'", self.kind, self.name),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} operations):", self.operations.len())?;
        for (i, op) in self.operations.iter().enumerate() {
            writeln!(f, "  {i}. {}", op.description())?;
            for change in &op.changes {
                writeln!(f, "       {change}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KestrelError;
    use crate::resource::ResourceKind;

    fn rg() -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::ResourceGroup, "rg1").with_attr("location", "East US")
    }

    fn vnet() -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::VNet, "vnet1")
            .with_attr("location", "East US")
            .with_ref(ResourceKind::ResourceGroup, "rg1")
    }

    fn subnet() -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::Subnet, "sub1")
            .with_attr("address_prefix", "10.0.1.0/24")
            .with_ref(ResourceKind::VNet, "vnet1")
    }

    fn applied(descriptors: &[ResourceDescriptor]) -> AppliedStateSet {
        let mut state = AppliedStateSet::new();
        for d in descriptors {
            state.upsert(AppliedState::from_descriptor(d, &format!("id-{}", d.name)));
        }
        state
    }

    fn actions(plan: &Plan) -> Vec<(String, Action)> {
        plan.operations.iter().map(|op| (op.name.clone(), op.action)).collect()
    }

    #[test]
    fn test_empty_state_creates_in_dependency_order() {
        let plan = PlanEngine::new()
            .plan(&[subnet(), vnet(), rg()], &AppliedStateSet::new())
            .unwrap();

        assert_eq!(
            actions(&plan),
            vec![
                (String::from("rg1"), Action::Create),
                (String::from("vnet1"), Action::Create),
                (String::from("sub1"), Action::Create),
            ]
        );
        assert_eq!(plan.get("sub1").unwrap().dependencies, vec!["vnet1"]);
        assert_eq!(plan.get("sub1").unwrap().rank, 2);
    }

    #[test]
    fn test_identical_state_is_all_noop() {
        let desired = [rg(), vnet(), subnet()];
        let plan = PlanEngine::new().plan(&desired, &applied(&desired)).unwrap();

        assert!(plan.operations.iter().all(|op| op.action == Action::NoOp));
        assert!(!plan.has_changes());
        assert_eq!(plan.counts().noop, 3);
    }

    #[test]
    fn test_changed_attribute_is_update() {
        let state = applied(&[rg(), vnet()]);
        let changed = vnet().with_attr("address_space", serde_json::json!(["10.1.0.0/16"]));
        let plan = PlanEngine::new().plan(&[rg(), changed], &state).unwrap();

        let op = plan.get("vnet1").unwrap();
        assert_eq!(op.action, Action::Update);
        assert_eq!(op.changes[0].field, "attributes.address_space");
        assert_eq!(plan.get("rg1").unwrap().action, Action::NoOp);
    }

    #[test]
    fn test_removed_resources_are_deleted_dependents_first() {
        let state = applied(&[rg(), vnet(), subnet()]);
        let plan = PlanEngine::new().plan(&[rg()], &state).unwrap();

        assert_eq!(
            actions(&plan),
            vec![
                (String::from("sub1"), Action::Delete),
                (String::from("vnet1"), Action::Delete),
                (String::from("rg1"), Action::NoOp),
            ]
        );
        assert_eq!(plan.get("vnet1").unwrap().dependencies, vec!["sub1"]);
        assert_eq!(plan.counts().delete, 2);
    }

    #[test]
    fn test_exactly_one_delete_per_removed_resource() {
        let state = applied(&[rg(), vnet()]);
        let plan = PlanEngine::new().plan(&[rg()], &state).unwrap();
        let deletes: Vec<_> = plan
            .operations
            .iter()
            .filter(|op| op.action == Action::Delete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].name, "vnet1");
    }

    #[test]
    fn test_reference_to_deleted_resource_conflicts() {
        let state = applied(&[rg(), vnet(), subnet()]);
        let err = PlanEngine::new().plan(&[rg(), subnet()], &state).unwrap_err();

        assert!(matches!(
            err,
            KestrelError::Plan(PlanError::Conflict { ref resource, .. }) if resource == "sub1"
        ));
    }

    #[test]
    fn test_kind_change_conflicts() {
        let state = applied(&[rg()]);
        let renamed = ResourceDescriptor::new(ResourceKind::VNet, "rg1").with_attr("location", "East US");
        let err = PlanEngine::new().plan(&[renamed], &state).unwrap_err();
        assert!(matches!(err, KestrelError::Plan(PlanError::Conflict { .. })));
    }

    #[test]
    fn test_empty_desired_deletes_everything() {
        let state = applied(&[rg(), vnet(), subnet()]);
        let plan = PlanEngine::new().plan(&[], &state).unwrap();

        assert_eq!(
            actions(&plan),
            vec![
                (String::from("sub1"), Action::Delete),
                (String::from("vnet1"), Action::Delete),
                (String::from("rg1"), Action::Delete),
            ]
        );
    }

    fn nic(subnet: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::Nic, "nic0")
            .with_attr("location", "East US")
            .with_ref(ResourceKind::Subnet, subnet)
    }

    fn named_subnet(name: &str, prefix: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::Subnet, name)
            .with_attr("address_prefix", prefix)
            .with_ref(ResourceKind::VNet, "vnet1")
    }

    #[test]
    fn test_old_target_is_deleted_after_reference_moves() {
        let old = named_subnet("old-subnet", "10.0.1.0/24");
        let new = named_subnet("new-subnet", "10.0.2.0/24");
        let state = applied(&[rg(), vnet(), old, nic("old-subnet")]);

        let plan = PlanEngine::new()
            .plan(&[rg(), vnet(), new, nic("new-subnet")], &state)
            .unwrap();

        let moved = plan.get("nic0").unwrap();
        assert_eq!(moved.action, Action::Update);
        assert_eq!(moved.dependencies, vec!["new-subnet"]);
        assert_eq!(moved.changes[0].field, "references");

        let delete = plan.get("old-subnet").unwrap();
        assert_eq!(delete.action, Action::Delete);
        assert_eq!(delete.dependencies, vec!["nic0"]);
        assert_eq!(plan.get("new-subnet").unwrap().action, Action::Create);
    }

    #[test]
    fn test_migrated_state_is_torn_down_by_kind_depth() {
        let mut state = applied(&[rg(), vnet(), subnet()]);
        for record in state.resources.values_mut() {
            record.references.clear();
        }

        let plan = PlanEngine::new().plan(&[], &state).unwrap();

        assert_eq!(
            actions(&plan),
            vec![
                (String::from("sub1"), Action::Delete),
                (String::from("vnet1"), Action::Delete),
                (String::from("rg1"), Action::Delete),
            ]
        );
        assert!(plan.get("sub1").unwrap().dependencies.is_empty());
        assert_eq!(plan.get("vnet1").unwrap().dependencies, vec!["sub1"]);
        let rg_deps = &plan.get("rg1").unwrap().dependencies;
        assert!(rg_deps.contains(&String::from("sub1")) && rg_deps.contains(&String::from("vnet1")));
        assert_eq!(plan.get("rg1").unwrap().rank, 2);
    }

    #[test]
    fn test_fingerprint_ignores_declaration_order() {
        let engine = PlanEngine::new();
        let a = engine.plan(&[rg(), vnet()], &AppliedStateSet::new()).unwrap();
        let b = engine.plan(&[vnet(), rg()], &AppliedStateSet::new()).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }
}
