//! Migration Plan - What a single run will do
//!
//! Plans are pure values computed from the registry and a fresh ledger read.
//! They are never persisted.

use serde::Serialize;
use std::collections::BTreeSet;

use super::definitions::{LedgerEntry, MigrationDirection, MigrationVersion};
use super::registry::MigrationRegistry;
use crate::error::{MigrationError, MigrationResult};

/// What happens to one unit in a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationAction {
    Apply,
    Revert,
    Skip,
}

/// One entry of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub version: MigrationVersion,
    pub description: Option<String>,
    pub action: MigrationAction,
}

/// Ordered list of actions for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub direction: MigrationDirection,
    pub steps: Vec<PlannedStep>,
}

impl MigrationPlan {
    /// Apply every unapplied version up to and including `target`.
    ///
    /// Versions already applied appear as `Skip`. Without a target the plan
    /// runs to the latest known version.
    pub fn forward(
        registry: &MigrationRegistry,
        applied: &BTreeSet<String>,
        target: Option<&MigrationVersion>,
    ) -> MigrationResult<Self> {
        if let Some(target) = target {
            if !registry.contains(target.as_str()) {
                return Err(MigrationError::UnknownVersion(target.to_string()));
            }
        }

        let steps = registry
            .units()
            .iter()
            .take_while(|unit| target.map_or(true, |t| unit.version <= *t))
            .map(|unit| PlannedStep {
                version: unit.version.clone(),
                description: unit.description.clone(),
                action: if applied.contains(unit.version.as_str()) {
                    MigrationAction::Skip
                } else {
                    MigrationAction::Apply
                },
            })
            .collect();

        Ok(Self {
            direction: MigrationDirection::Up,
            steps,
        })
    }

    /// Revert the `steps` most recently applied versions, most recent first.
    ///
    /// Recency is `applied_at` descending, ties broken by version descending.
    /// Every selected version must still exist in the registry, otherwise
    /// planning fails before anything runs.
    pub fn rollback(
        registry: &MigrationRegistry,
        entries: &[LedgerEntry],
        steps: usize,
    ) -> MigrationResult<Self> {
        if steps == 0 {
            return Err(MigrationError::InvalidArgument(
                "steps must be at least 1".to_string(),
            ));
        }

        let mut recent: Vec<&LedgerEntry> = entries.iter().collect();
        sort_most_recent_first(&mut recent);
        recent.truncate(steps);

        Self::reverting(registry, recent)
    }

    /// Revert every unit applied in the highest batch
    pub fn rollback_batch(registry: &MigrationRegistry, entries: &[LedgerEntry]) -> MigrationResult<Self> {
        let Some(latest_batch) = entries.iter().map(|entry| entry.batch).max() else {
            return Ok(Self::empty(MigrationDirection::Down));
        };

        let mut batch: Vec<&LedgerEntry> = entries
            .iter()
            .filter(|entry| entry.batch == latest_batch)
            .collect();
        sort_most_recent_first(&mut batch);

        Self::reverting(registry, batch)
    }

    /// Revert everything in the ledger
    pub fn rollback_all(registry: &MigrationRegistry, entries: &[LedgerEntry]) -> MigrationResult<Self> {
        if entries.is_empty() {
            return Ok(Self::empty(MigrationDirection::Down));
        }
        Self::rollback(registry, entries, entries.len())
    }

    fn reverting(registry: &MigrationRegistry, entries: Vec<&LedgerEntry>) -> MigrationResult<Self> {
        let steps = entries
            .into_iter()
            .map(|entry| {
                let unit = registry.get(&entry.version).ok_or_else(|| {
                    MigrationError::OrphanedLedgerEntry {
                        version: entry.version.clone(),
                    }
                })?;
                Ok(PlannedStep {
                    version: unit.version.clone(),
                    description: unit.description.clone(),
                    action: MigrationAction::Revert,
                })
            })
            .collect::<MigrationResult<Vec<_>>>()?;

        Ok(Self {
            direction: MigrationDirection::Down,
            steps,
        })
    }

    fn empty(direction: MigrationDirection) -> Self {
        Self {
            direction,
            steps: Vec::new(),
        }
    }

    /// Steps that will run (apply or revert), in execution order
    pub fn actionable(&self) -> impl Iterator<Item = &PlannedStep> {
        self.steps
            .iter()
            .filter(|step| step.action != MigrationAction::Skip)
    }

    /// Versions that are skipped because they are already applied
    pub fn skipped(&self) -> Vec<MigrationVersion> {
        self.steps
            .iter()
            .filter(|step| step.action == MigrationAction::Skip)
            .map(|step| step.version.clone())
            .collect()
    }

    /// True when nothing will run
    pub fn is_empty(&self) -> bool {
        self.actionable().next().is_none()
    }
}

fn sort_most_recent_first(entries: &mut [&LedgerEntry]) {
    entries.sort_by(|a, b| {
        b.applied_at
            .cmp(&a.applied_at)
            .then_with(|| b.version.cmp(&a.version))
    });
}
