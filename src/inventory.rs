//! The installed-package and sandbox inventory.
//!
//! Readers take an `Arc<Snapshot>` and never see a half-applied change.
//! Writers are serialized: the queue's terminal handler applies confirmed
//! outcomes, `reconcile` swaps in a freshly listed snapshot. Nothing is ever
//! changed speculatively.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Local;
use tracing::debug;

use crate::model::{Intent, Operation, OperationStatus, PackageRecord, PackageRef, SandboxRef};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub generation: u64,
    pub packages: BTreeMap<PackageRef, PackageRecord>,
    pub sandboxes: BTreeMap<String, SandboxRef>,
}

/// Extra data a finished operation hands to the inventory.
#[derive(Debug, Clone, Default)]
pub struct OutcomeDetails {
    pub search_hits: Vec<PackageRecord>,
}

/// Metadata used to describe packages once they are installed. Never
/// consulted for installed state. Each half holds one listing only.
#[derive(Debug, Default)]
struct Catalog {
    /// The last full remote listing.
    listed: HashMap<PackageRef, PackageRecord>,
    /// Hits of the most recent successful search.
    searched: HashMap<PackageRef, PackageRecord>,
}

#[derive(Debug, Default)]
pub struct Inventory {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
    catalog: Mutex<Catalog>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn list_installed(&self) -> Vec<PackageRecord> {
        self.snapshot().packages.values().cloned().collect()
    }

    pub fn list_sandboxes(&self) -> Vec<SandboxRef> {
        self.snapshot().sandboxes.values().cloned().collect()
    }

    /// Installed packages with a newer version on their remote.
    pub fn list_updates(&self) -> Vec<PackageRecord> {
        self.snapshot()
            .packages
            .values()
            .filter(|r| r.has_update())
            .cloned()
            .collect()
    }

    pub fn get(&self, reference: &PackageRef) -> Option<PackageRecord> {
        self.snapshot().packages.get(reference).cloned()
    }

    pub fn is_installed(&self, reference: &PackageRef) -> bool {
        self.snapshot().packages.contains_key(reference)
    }

    /// Metadata for `reference` from the latest search, else from the latest
    /// catalog listing.
    pub fn catalog_entry(&self, reference: &PackageRef) -> Option<PackageRecord> {
        let catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        catalog
            .searched
            .get(reference)
            .or_else(|| catalog.listed.get(reference))
            .cloned()
    }

    /// Swap in a full remote listing.
    pub(crate) fn replace_catalog(&self, records: &[PackageRecord]) {
        let listed = records
            .iter()
            .map(|r| (r.reference.clone(), r.clone()))
            .collect();
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner).listed = listed;
    }

    /// Apply a finished operation. Only `Succeeded` operations change
    /// anything. Returns the new generation if the snapshot changed.
    pub(crate) fn apply_outcome(&self, op: &Operation, details: &OutcomeDetails) -> Option<u64> {
        if op.status != OperationStatus::Succeeded {
            return None;
        }

        if let Intent::Search { .. } = op.intent {
            let searched = details
                .search_hits
                .iter()
                .map(|hit| (hit.reference.clone(), hit.clone()))
                .collect();
            self.catalog.lock().unwrap_or_else(PoisonError::into_inner).searched = searched;
            return None;
        }

        let described = match &op.intent {
            Intent::Install { package, .. } => self.catalog_entry(package),
            _ => None,
        };

        let generation = self.write(|snapshot| match &op.intent {
            Intent::Install { package, scope } => {
                let mut record = described
                    .clone()
                    .unwrap_or_else(|| PackageRecord::new(package.clone()));
                record.reference = package.clone();
                record.scope = *scope;
                record.installed_version = record.available_version.clone();
                snapshot.packages.insert(package.clone(), record);
                true
            }
            Intent::Update {
                package: Some(package),
                ..
            } => match snapshot.packages.get_mut(package) {
                Some(record) => mark_updated(record),
                None => false,
            },
            Intent::Update {
                package: None,
                scope,
            } => {
                let mut changed = false;
                for record in snapshot.packages.values_mut().filter(|r| r.scope == *scope) {
                    changed |= mark_updated(record);
                }
                changed
            }
            Intent::Remove { package, .. } => snapshot.packages.remove(package).is_some(),
            Intent::CreateSandbox { name, image } => {
                snapshot.sandboxes.insert(
                    name.clone(),
                    SandboxRef {
                        name: name.clone(),
                        image: image.clone(),
                        created: Local::now().to_rfc3339(),
                        status: "Created".to_string(),
                    },
                );
                true
            }
            Intent::DeleteSandbox { name } => snapshot.sandboxes.remove(name).is_some(),
            Intent::Search { .. } | Intent::EnterSandbox { .. } => false,
        });

        if let Some(generation) = generation {
            debug!(operation = %op.id, generation, "inventory updated");
        }
        generation
    }

    /// Replace the whole snapshot, unless something else was written since
    /// `expected_generation`. Returns the new generation on success.
    pub(crate) fn replace_if_unchanged(
        &self,
        expected_generation: u64,
        packages: Vec<PackageRecord>,
        sandboxes: Vec<SandboxRef>,
    ) -> Option<u64> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        if current.generation != expected_generation {
            return None;
        }
        let next = Snapshot {
            generation: current.generation + 1,
            packages: packages
                .into_iter()
                .map(|r| (r.reference.clone(), r))
                .collect(),
            sandboxes: sandboxes.into_iter().map(|s| (s.name.clone(), s)).collect(),
        };
        let generation = next.generation;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Some(generation)
    }

    fn write(&self, apply: impl FnOnce(&mut Snapshot) -> bool) -> Option<u64> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        if !apply(&mut next) {
            return None;
        }
        next.generation += 1;
        let generation = next.generation;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Some(generation)
    }
}

/// Stands in for the version when the remote reports an update without one.
const UNVERSIONED_UPDATE: &str = "update available";

fn mark_updated(record: &mut PackageRecord) -> bool {
    match record.available_version.clone() {
        Some(available) if available == UNVERSIONED_UPDATE => {
            record.available_version = record.installed_version.clone();
            true
        }
        Some(available) if record.installed_version.as_ref() != Some(&available) => {
            record.installed_version = Some(available);
            true
        }
        _ => false,
    }
}

/// Merge update availability into freshly listed installed records.
pub(crate) fn merge_updates(
    packages: &mut [PackageRecord],
    updates: &[(PackageRef, Option<String>)],
) {
    let updates: HashMap<&PackageRef, &Option<String>> =
        updates.iter().map(|(r, v)| (r, v)).collect();
    for record in packages.iter_mut() {
        if let Some(version) = updates.get(&record.reference) {
            record.available_version = match version {
                Some(v) => Some(v.clone()),
                // The remote did not report a version; still flag the update.
                None => Some(UNVERSIONED_UPDATE.to_string()),
            };
        }
    }
}
