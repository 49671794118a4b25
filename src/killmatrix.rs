use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::mutants::{KillMatrix, Mutant};
use crate::runner::{Runner, TestOutcome};
use crate::sandbox::SandboxManager;
use crate::testcase::TestCase;

/// Result of one evaluation pass over a mutant set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixOutcome {
    pub matrix: KillMatrix,
    /// Mutants that could not be evaluated at all (sandbox or patch
    /// failure) with the reason. They are conservatively treated as
    /// surviving but are not part of the matrix.
    pub unevaluated: Vec<(String, String)>,
}

struct NameIndex {
    /// Fully-qualified method name -> owning test-case id.
    by_name: BTreeMap<String, String>,
    all_ids: BTreeSet<String>,
}

impl NameIndex {
    fn new(tests: &[TestCase]) -> Self {
        let mut by_name = BTreeMap::new();
        let mut all_ids = BTreeSet::new();
        for case in tests {
            all_ids.insert(case.id.clone());
            for name in case.qualified_names() {
                by_name.insert(name, case.id.clone());
            }
        }
        NameIndex { by_name, all_ids }
    }
}

enum Eval {
    Done(BTreeSet<String>),
    Skipped(String),
}

/// Determines which tests kill which mutants, one private sandbox per
/// mutant. Serial (`parallelism <= 1`) and parallel modes produce the same
/// matrix for the same input; parallelism is a performance concern only.
pub struct KillMatrixBuilder<'a> {
    pub sandboxes: &'a SandboxManager,
    pub runner: &'a dyn Runner,
}

impl<'a> KillMatrixBuilder<'a> {
    pub fn build(
        &self,
        mutants: &[Mutant],
        tests: &[TestCase],
        project: &Path,
        parallelism: usize,
    ) -> MatrixOutcome {
        let index = NameIndex::new(tests);

        let evals: Vec<Eval> = if parallelism <= 1 {
            mutants
                .iter()
                .map(|m| self.evaluate_mutant(m, project, &index))
                .collect()
        } else {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(parallelism)
                .build()
            {
                Ok(pool) => pool.install(|| {
                    mutants
                        .par_iter()
                        .map(|m| self.evaluate_mutant(m, project, &index))
                        .collect()
                }),
                Err(e) => {
                    warn!("falling back to serial evaluation: {}", e);
                    mutants
                        .iter()
                        .map(|m| self.evaluate_mutant(m, project, &index))
                        .collect()
                }
            }
        };

        // Fold in input order so the matrix is identical across modes.
        let mut matrix = KillMatrix::new();
        let mut unevaluated = Vec::new();
        for (mutant, eval) in mutants.iter().zip(evals) {
            match eval {
                Eval::Done(kills) => {
                    matrix.touch(&mutant.id);
                    for test_id in kills {
                        matrix.record_kill(&mutant.id, &test_id);
                    }
                }
                Eval::Skipped(reason) => unevaluated.push((mutant.id.clone(), reason)),
            }
        }
        MatrixOutcome { matrix, unevaluated }
    }

    fn evaluate_mutant(&self, mutant: &Mutant, project: &Path, index: &NameIndex) -> Eval {
        let created = self.sandboxes.create_target_sandbox(
            project,
            &mutant.class_name,
            &mutant.method_name,
            &format!("km-{}", mutant.id),
        );
        let (sandbox_id, sandbox_path) = match created {
            Ok(v) => v,
            Err(e) => {
                // Not a kill: an unevaluated mutant is logged distinctly
                // and treated as surviving.
                warn!(mutant = %mutant.id, "sandbox unavailable, mutant not evaluated: {}", e);
                return Eval::Skipped(format!("sandbox unavailable: {}", e));
            }
        };

        let eval = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.evaluate_in(&sandbox_path, mutant, index)
        }))
        .unwrap_or_else(|_| {
            // Fail-safe: an internal error defaults to survived, never to
            // killed.
            warn!(mutant = %mutant.id, "evaluation panicked; defaulting to survived");
            Eval::Done(BTreeSet::new())
        });

        self.sandboxes.cleanup(&sandbox_id);
        eval
    }

    fn evaluate_in(&self, sandbox: &Path, mutant: &Mutant, index: &NameIndex) -> Eval {
        let file = sandbox.join(&mutant.patch.file);
        let content = match std::fs::read_to_string(&file) {
            Ok(c) => c,
            Err(e) => {
                warn!(mutant = %mutant.id, "patch target unreadable, mutant not evaluated: {}", e);
                return Eval::Skipped(format!("patch target unreadable: {}", e));
            }
        };
        let mutated = match mutant.patch.apply(&content) {
            Ok(m) => m,
            Err(e) => {
                warn!(mutant = %mutant.id, "patch failed to apply, mutant not evaluated: {}", e);
                return Eval::Skipped(format!("patch failed to apply: {}", e));
            }
        };
        if let Err(e) = std::fs::write(&file, mutated) {
            warn!(mutant = %mutant.id, "patch write failed, mutant not evaluated: {}", e);
            return Eval::Skipped(format!("patch write failed: {}", e));
        }

        match self.runner.test(sandbox) {
            Ok(TestOutcome::Passed { .. }) => Eval::Done(BTreeSet::new()),
            Ok(TestOutcome::Failed { report: None }) => {
                // No structured report under failure means the build itself
                // broke, which is attributable to the mutation: killed by
                // every test.
                debug!(mutant = %mutant.id, "failure without report; killed by all tests");
                Eval::Done(index.all_ids.clone())
            }
            Ok(TestOutcome::Failed { report: Some(report) }) => {
                let mut failing: Vec<String> =
                    report.failing().into_iter().map(|(name, _)| name).collect();
                failing.extend(report.timed_out());
                if failing.is_empty() {
                    warn!(mutant = %mutant.id, "failed run reported no failing methods; killed by all tests");
                    return Eval::Done(index.all_ids.clone());
                }
                let mut kills = BTreeSet::new();
                for name in &failing {
                    match index.by_name.get(name) {
                        Some(test_id) => {
                            kills.insert(test_id.clone());
                        }
                        None => {
                            // Silent mismatches would under-count kills, so
                            // an unmatched name falls back to all tests.
                            warn!(
                                mutant = %mutant.id,
                                %name, "failing test not matched to a known case; killed by all tests"
                            );
                            return Eval::Done(index.all_ids.clone());
                        }
                    }
                }
                Eval::Done(kills)
            }
            Ok(TestOutcome::TimedOut) => {
                // A hang under mutation is kill evidence, but with no
                // report to attribute it: killed by all tests.
                debug!(mutant = %mutant.id, "test run timed out; killed by all tests");
                Eval::Done(index.all_ids.clone())
            }
            Err(e) => {
                warn!(mutant = %mutant.id, "runner error, defaulting to survived: {}", e);
                Eval::Done(BTreeSet::new())
            }
        }
    }
}
