//! Reconciliation planning.
//!
//! The plan partitions workload names by set comparison between the desired
//! manifest and the observed cluster state. A name present on both sides is
//! always an update, never a create or delete.

use std::collections::BTreeSet;

use crate::types::{DesiredWorkload, ObservedWorkload, WorkloadAction};

/// The create/update/delete partition for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// Desired but not observed.
    pub create: BTreeSet<String>,
    /// Both desired and observed.
    pub update: BTreeSet<String>,
    /// Observed but no longer desired.
    pub delete: BTreeSet<String>,
}

impl ReconciliationPlan {
    /// Compute the plan for a desired set against an observed set.
    #[must_use]
    pub fn compute(desired: &[DesiredWorkload], observed: &[ObservedWorkload]) -> Self {
        let desired: BTreeSet<&str> = desired.iter().map(|d| d.name.as_str()).collect();
        let observed: BTreeSet<&str> = observed.iter().map(|o| o.name.as_str()).collect();
        Self::from_names(&desired, &observed)
    }

    fn from_names(desired: &BTreeSet<&str>, observed: &BTreeSet<&str>) -> Self {
        let owned = |names: Vec<&&str>| -> BTreeSet<String> {
            names.into_iter().map(|n| (*n).to_string()).collect()
        };

        Self {
            create: owned(desired.difference(observed).collect()),
            update: owned(desired.intersection(observed).collect()),
            delete: owned(observed.difference(desired).collect()),
        }
    }

    /// The action planned for a name, if any.
    #[must_use]
    pub fn action_for(&self, name: &str) -> Option<WorkloadAction> {
        if self.create.contains(name) {
            Some(WorkloadAction::Create)
        } else if self.update.contains(name) {
            Some(WorkloadAction::Update)
        } else if self.delete.contains(name) {
            Some(WorkloadAction::Delete)
        } else {
            None
        }
    }

    /// Total number of planned actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.create.len() + self.update.len() + self.delete.len()
    }

    /// Whether the plan has no actions at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;

    fn desired(names: &[&str]) -> Vec<DesiredWorkload> {
        names
            .iter()
            .map(|n| DesiredWorkload {
                name: (*n).to_string(),
                spec: Deployment::default(),
            })
            .collect()
    }

    fn observed(names: &[&str]) -> Vec<ObservedWorkload> {
        names
            .iter()
            .map(|n| ObservedWorkload {
                name: (*n).to_string(),
                spec: Deployment::default(),
            })
            .collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn mixed_scenario() {
        let plan = ReconciliationPlan::compute(&desired(&["a", "b"]), &observed(&["b", "c"]));

        assert_eq!(plan.create, set(&["a"]));
        assert_eq!(plan.update, set(&["b"]));
        assert_eq!(plan.delete, set(&["c"]));
        assert_eq!(plan.action_for("a"), Some(WorkloadAction::Create));
        assert_eq!(plan.action_for("b"), Some(WorkloadAction::Update));
        assert_eq!(plan.action_for("c"), Some(WorkloadAction::Delete));
        assert_eq!(plan.action_for("d"), None);
    }

    #[test]
    fn identical_sets_only_update() {
        let plan = ReconciliationPlan::compute(&desired(&["a", "b"]), &observed(&["a", "b"]));
        assert!(plan.create.is_empty());
        assert!(plan.delete.is_empty());
        assert_eq!(plan.update, set(&["a", "b"]));
    }

    #[test]
    fn empty_desired_deletes_everything() {
        let plan = ReconciliationPlan::compute(&[], &observed(&["x", "y"]));
        assert_eq!(plan.delete, set(&["x", "y"]));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn empty_both_is_empty() {
        assert!(ReconciliationPlan::compute(&[], &[]).is_empty());
    }

    #[test]
    fn partition_is_exhaustive_and_disjoint() {
        let universe = ["a", "b", "c", "d"];

        // Every assignment of each name to {absent, desired, observed, both}.
        for mask in 0u32..(1 << (2 * universe.len())) {
            let mut d = BTreeSet::new();
            let mut o = BTreeSet::new();
            for (i, name) in universe.iter().enumerate() {
                let bits = (mask >> (2 * i)) & 0b11;
                if bits & 0b01 != 0 {
                    d.insert(*name);
                }
                if bits & 0b10 != 0 {
                    o.insert(*name);
                }
            }

            let plan = ReconciliationPlan::from_names(&d, &o);

            for name in d.union(&o) {
                let hits = [&plan.create, &plan.update, &plan.delete]
                    .iter()
                    .filter(|p| p.contains(*name))
                    .count();
                assert_eq!(hits, 1, "{name} must land in exactly one partition");
            }

            assert!(plan.create.iter().all(|n| d.contains(n.as_str()) && !o.contains(n.as_str())));
            assert!(plan.delete.iter().all(|n| o.contains(n.as_str()) && !d.contains(n.as_str())));
            let both: BTreeSet<String> = d.intersection(&o).map(|n| (*n).to_string()).collect();
            assert_eq!(plan.update, both);
            assert_eq!(plan.len(), d.union(&o).count());
        }
    }
}
