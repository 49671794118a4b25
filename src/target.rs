use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A (class, method) pair selected for test/mutant generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub class_name: String,
    pub method_name: String,
}

impl Target {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Target {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class_name, self.method_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Available,
    Active,
    Blacklisted,
    Processed,
}

#[derive(Default)]
struct CoordinatorInner {
    active: HashSet<Target>,
    processed: HashSet<Target>,
    blacklist: HashMap<Target, String>,
}

/// Tracks in-flight targets across concurrent workers. All state sits
/// behind one lock so `acquire` is linearizable: for any set of concurrent
/// claims on the same target, at most one succeeds.
#[derive(Default)]
pub struct TargetCoordinator {
    inner: Mutex<CoordinatorInner>,
}

impl TargetCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a target. Fails if the target is active in another worker,
    /// blacklisted, or (when `allow_processed` is false) already processed.
    pub fn acquire(&self, target: &Target, allow_processed: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.blacklist.contains_key(target) || inner.active.contains(target) {
            return false;
        }
        if !allow_processed && inner.processed.contains(target) {
            return false;
        }
        inner.active.insert(target.clone());
        true
    }

    /// Release a claimed target. Successful completions mark it processed;
    /// failures leave it available. In-batch retry policy belongs to the
    /// scheduler, not this registry.
    pub fn release(&self, target: &Target, success: bool) {
        let mut inner = self.inner.lock();
        if !inner.active.remove(target) {
            debug!(%target, "release of a target that was not active");
        }
        if success {
            inner.processed.insert(target.clone());
        }
    }

    /// Permanently exclude a target. Also clears any active claim so a
    /// worker-held target blacklisted mid-run stops being current.
    pub fn blacklist(&self, target: &Target, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.active.remove(target);
        inner.blacklist.insert(target.clone(), reason.into());
    }

    pub fn is_blacklisted(&self, target: &Target) -> bool {
        self.inner.lock().blacklist.contains_key(target)
    }

    pub fn state(&self, target: &Target) -> TargetState {
        let inner = self.inner.lock();
        if inner.blacklist.contains_key(target) {
            TargetState::Blacklisted
        } else if inner.active.contains(target) {
            TargetState::Active
        } else if inner.processed.contains(target) {
            TargetState::Processed
        } else {
            TargetState::Available
        }
    }

    pub fn active_snapshot(&self) -> Vec<Target> {
        let mut v: Vec<Target> = self.inner.lock().active.iter().cloned().collect();
        v.sort();
        v
    }

    pub fn blacklist_snapshot(&self) -> Vec<(Target, String)> {
        let mut v: Vec<(Target, String)> = self
            .inner
            .lock()
            .blacklist
            .iter()
            .map(|(t, r)| (t.clone(), r.clone()))
            .collect();
        v.sort();
        v
    }

    pub fn processed_snapshot(&self) -> Vec<Target> {
        let mut v: Vec<Target> = self.inner.lock().processed.iter().cloned().collect();
        v.sort();
        v
    }

    /// Seed registry state from a persisted snapshot when resuming a run.
    /// Previously-active targets go back to available: their workers died
    /// with the interrupted process.
    pub fn restore(&self, processed: Vec<Target>, blacklist: Vec<(Target, String)>) {
        let mut inner = self.inner.lock();
        inner.processed.extend(processed);
        inner.blacklist.extend(blacklist);
    }
}
