use std::collections::BTreeSet;

use tracing::{debug, warn};

/// Candidate artifacts carry a name (file path, method name) used for
/// duplicate detection and blame reporting.
pub trait Named {
    fn name(&self) -> &str;
}

impl Named for String {
    fn name(&self) -> &str {
        self
    }
}

/// Below this candidate count an unattributable combined failure falls
/// back to exhaustive per-artifact validation.
pub const EXHAUSTIVE_LIMIT: usize = 4;

/// Binary-search isolation of the artifacts causing a collective
/// validation failure. The validator receives a subset and returns true
/// when that subset compiles/passes in isolation; validators are expected
/// to run each check in its own sandbox so halves can be checked in
/// parallel.
///
/// Returns the blamed artifacts, empty when the full set already
/// validates.
pub fn isolate<A, V>(candidates: &[A], validator: &V) -> Vec<A>
where
    A: Named + Clone + Send + Sync,
    V: Fn(&[A]) -> bool + Sync,
{
    if candidates.is_empty() || validator(candidates) {
        return Vec::new();
    }
    isolate_failing(candidates, validator)
}

/// Invariant: the full `candidates` slice is already known to fail.
fn isolate_failing<A, V>(candidates: &[A], validator: &V) -> Vec<A>
where
    A: Named + Clone + Send + Sync,
    V: Fn(&[A]) -> bool + Sync,
{
    if candidates.len() == 1 {
        return candidates.to_vec();
    }
    let (left, right) = candidates.split_at(candidates.len() / 2);
    let (left_ok, right_ok) = rayon::join(|| validator(left), || validator(right));

    match (left_ok, right_ok) {
        (false, true) => isolate_failing(left, validator),
        (true, false) => isolate_failing(right, validator),
        (false, false) => {
            let mut blamed = isolate_failing(left, validator);
            blamed.extend(isolate_failing(right, validator));
            blamed
        }
        // Both halves pass independently but the union fails: an
        // inter-artifact conflict, not a single bad artifact.
        (true, true) => resolve_conflict(left, right, candidates, validator),
    }
}

fn resolve_conflict<A, V>(left: &[A], right: &[A], all: &[A], validator: &V) -> Vec<A>
where
    A: Named + Clone + Send + Sync,
    V: Fn(&[A]) -> bool + Sync,
{
    // Literal name collisions between the halves are blamed first.
    let left_names: BTreeSet<&str> = left.iter().map(|a| a.name()).collect();
    let colliding: Vec<A> = all
        .iter()
        .filter(|a| left_names.contains(a.name()) && right.iter().any(|r| r.name() == a.name()))
        .cloned()
        .collect();
    if !colliding.is_empty() {
        debug!(
            names = ?colliding.iter().map(|a| a.name()).collect::<Vec<_>>(),
            "conflict attributed to duplicate names"
        );
        return colliding;
    }

    if all.len() <= EXHAUSTIVE_LIMIT {
        // Validate singletons: anything failing alone is blamed. If every
        // artifact passes alone the conflict is combinatorial and the
        // whole set is blamed conservatively.
        let failing: Vec<A> = all
            .iter()
            .filter(|a| !validator(std::slice::from_ref(*a)))
            .cloned()
            .collect();
        if failing.is_empty() {
            warn!(
                count = all.len(),
                "combinatorial conflict not attributable to a subset; blaming entire set"
            );
            all.to_vec()
        } else {
            failing
        }
    } else {
        // Recurse into each half as an independent fresh problem; if
        // neither half surfaces a culprit the conflict spans the split and
        // the whole set is blamed conservatively.
        let mut blamed = isolate(left, validator);
        blamed.extend(isolate(right, validator));
        if blamed.is_empty() {
            warn!(
                count = all.len(),
                "cross-half conflict not attributable to a subset; blaming entire set"
            );
            all.to_vec()
        } else {
            blamed
        }
    }
}
