//! Child kinds the controller manages and watches
//!
//! Built once in `main` and handed to the runner, which turns every entry into
//! an owned-kind watch, and to the engine context. Nothing here is global.

use std::collections::BTreeMap;

use kube::runtime::watcher::Config as WatcherConfig;

use crate::compiler::{MANAGED_BY, MANAGED_BY_LABEL};
use crate::gateway::ChildKind;

/// How one child kind is watched
#[derive(Clone, Debug)]
pub struct ChildKindEntry {
    /// The child kind
    pub kind: ChildKind,
    /// Watch configuration for the owned-kind stream
    pub watcher: WatcherConfig,
}

/// Explicit mapping from child kind to its watch configuration
#[derive(Clone, Debug, Default)]
pub struct ChildKindRegistry {
    entries: BTreeMap<ChildKind, ChildKindEntry>,
}

impl ChildKindRegistry {
    /// Registry with no kinds
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry watching every child kind the compiler produces, restricted
    /// to objects labelled as managed by this operator
    pub fn standard(watch_timeout_secs: u32) -> Self {
        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY);
        ChildKind::ALL.into_iter().fold(Self::new(), |registry, kind| {
            registry.register(
                kind,
                WatcherConfig::default()
                    .labels(&selector)
                    .timeout(watch_timeout_secs),
            )
        })
    }

    /// Add or replace the entry for `kind`
    pub fn register(mut self, kind: ChildKind, watcher: WatcherConfig) -> Self {
        self.entries.insert(kind, ChildKindEntry { kind, watcher });
        self
    }

    /// Entry for `kind`, if registered
    pub fn get(&self, kind: ChildKind) -> Option<&ChildKindEntry> {
        self.entries.get(&kind)
    }

    /// True when changes to `kind` wake the owning cluster's reconcile
    pub fn is_watched(&self, kind: ChildKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Registered entries in creation order
    pub fn entries(&self) -> impl Iterator<Item = &ChildKindEntry> {
        self.entries.values()
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
