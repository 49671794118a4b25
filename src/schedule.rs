use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::Language;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::generator::{Generator, propose_with_retries};
use crate::isolate::{self, Named};
use crate::killmatrix::KillMatrixBuilder;
use crate::mutants::{Mutant, MutantStatus};
use crate::parse;
use crate::report::CoverageReport;
use crate::runner::{CompileOutcome, CoverageOutcome, Runner};
use crate::sandbox::{SandboxManager, now_millis};
use crate::state::{RunSnapshot, RunState, save_to_path};
use crate::store::Store;
use crate::target::{Target, TargetCoordinator, TargetState};
use crate::testcase::TestCase;
use crate::verify::{TestArtifact, VerifyEngine, VerifyState};

/// Why a run stopped. Exhaustion and interruption are graceful stops, not
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    IterationCeiling,
    BudgetExhausted,
    Stalled,
    ExcellentThresholds,
    NoTargets,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Interrupted => "interrupted",
            StopReason::IterationCeiling => "iteration ceiling reached",
            StopReason::BudgetExhausted => "generation budget exhausted",
            StopReason::Stalled => "no improvement across consecutive batches",
            StopReason::ExcellentThresholds => "all quality thresholds exceeded",
            StopReason::NoTargets => "no selectable targets remain",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stop: StopReason,
    pub state: RunState,
}

/// Pluggable target selection. The scheduler pre-filters blacklisted and
/// active targets; strategies only order and truncate.
pub trait SelectionStrategy: Send + Sync {
    fn select(&self, candidates: &[Target], coverage: &CoverageReport, n: usize) -> Vec<Target>;
}

/// Configured order, first come first served.
pub struct FifoSelection;

impl SelectionStrategy for FifoSelection {
    fn select(&self, candidates: &[Target], _coverage: &CoverageReport, n: usize) -> Vec<Target> {
        candidates.iter().take(n).cloned().collect()
    }
}

/// Least-covered methods first; unmeasured methods count as uncovered.
pub struct CoverageFirstSelection;

impl SelectionStrategy for CoverageFirstSelection {
    fn select(&self, candidates: &[Target], coverage: &CoverageReport, n: usize) -> Vec<Target> {
        let mut scored: Vec<(f64, &Target)> = candidates
            .iter()
            .map(|t| {
                let key = format!("{}.{}", t.class_name, t.method_name);
                let rate = coverage
                    .methods
                    .get(&key)
                    .map(|m| {
                        let total = m.line_covered + m.line_missed;
                        if total == 0 {
                            0.0
                        } else {
                            m.line_covered as f64 / total as f64
                        }
                    })
                    .unwrap_or(0.0);
                (rate, t)
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(n).map(|(_, t)| t.clone()).collect()
    }
}

/// One worker's result. Generated artifacts travel as file contents keyed
/// by relative path: worker sandboxes are gone by the time the scheduler
/// looks at them.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub target: Target,
    pub order: usize,
    pub success: bool,
    pub reason: Option<String>,
    pub generated_files: BTreeMap<String, String>,
    pub cases: Vec<TestCase>,
    pub mutants: Vec<Mutant>,
    pub generation_calls: u32,
    pub locally_killed: usize,
}

impl WorkerReport {
    fn failure(target: Target, order: usize, reason: impl Into<String>) -> Self {
        WorkerReport {
            target,
            order,
            success: false,
            reason: Some(reason.into()),
            generated_files: BTreeMap::new(),
            cases: Vec::new(),
            mutants: Vec::new(),
            generation_calls: 0,
            locally_killed: 0,
        }
    }
}

#[derive(Clone)]
struct MergedFile {
    path: String,
    content: String,
}

impl Named for MergedFile {
    fn name(&self) -> &str {
        &self.path
    }
}

fn slug(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn capitalize(part: &str) -> String {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Logical name of the generated test class for one target.
pub fn test_class_name(target: &Target) -> String {
    format!("{}{}Test", target.class_name, capitalize(&target.method_name))
}

/// Project-relative path of the generated test file for one target.
pub fn test_rel_path(language: Language, target: &Target) -> String {
    let class = slug(&target.class_name);
    let method = slug(&target.method_name);
    match language {
        Language::Python => format!("tests/test_{}_{}.py", class, method),
        Language::Rust => format!("tests/{}_{}_test.rs", class, method),
        Language::JavaScript => format!("tests/{}_{}.test.js", class, method),
        Language::TypeScript => format!("tests/{}_{}.test.ts", class, method),
        Language::Tsx => format!("tests/{}_{}.test.tsx", class, method),
    }
}

/// Outer control loop: claim a batch of targets, fan out one worker per
/// target, then run a single synchronized merge/evaluate/coverage phase.
/// The store is the single source of truth for cross-batch state;
/// everything a worker returns is advisory until synced.
pub struct BatchScheduler {
    pub sandboxes: Arc<SandboxManager>,
    pub runner: Arc<dyn Runner>,
    pub generator: Arc<dyn Generator>,
    pub store: Arc<dyn Store>,
    pub coordinator: Arc<TargetCoordinator>,
    pub strategy: Box<dyn SelectionStrategy>,
    pub config: EngineConfig,
    pub language: Language,
    pub targets: Vec<Target>,
    pub snapshot_path: Option<PathBuf>,
    interrupt: Arc<AtomicBool>,
    state: Mutex<RunState>,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sandboxes: Arc<SandboxManager>,
        runner: Arc<dyn Runner>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn Store>,
        coordinator: Arc<TargetCoordinator>,
        strategy: Box<dyn SelectionStrategy>,
        config: EngineConfig,
        language: Language,
        targets: Vec<Target>,
    ) -> Self {
        BatchScheduler {
            sandboxes,
            runner,
            generator,
            store,
            coordinator,
            strategy,
            config,
            language,
            targets,
            snapshot_path: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(RunState::default()),
        }
    }

    /// Shared flag for external interruption: set it and the scheduler
    /// stops dispatching, finishes merging what succeeded, and persists a
    /// resumable snapshot.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Seed counters and coordinator state from a persisted snapshot.
    pub fn restore(&self, snapshot: RunSnapshot) {
        self.coordinator.restore(snapshot.processed, snapshot.blacklist);
        *self.state.lock() = snapshot.state;
    }

    pub fn state_snapshot(&self) -> RunState {
        self.state.lock().clone()
    }

    pub fn run(&self, project: &Path) -> Result<RunSummary> {
        let stop = loop {
            if self.interrupt.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }
            {
                let state = self.state.lock();
                if state.iteration >= self.config.max_iterations {
                    break StopReason::IterationCeiling;
                }
                if state.generation_calls >= self.config.generation_budget {
                    break StopReason::BudgetExhausted;
                }
            }

            // SELECT
            let claimed = self.select_batch()?;
            if claimed.is_empty() {
                break StopReason::NoTargets;
            }
            let batch = {
                let mut state = self.state.lock();
                state.iteration += 1;
                let batch = state.iteration;
                let cap = self.config.history_cap;
                state.log_action(cap, format!("batch {}: claimed {} targets", batch, claimed.len()));
                batch
            };
            info!(batch, targets = claimed.len(), "dispatching batch");

            // DISPATCH (parallel fan-out)
            let mut reports = self.dispatch(project, &claimed);
            for report in &reports {
                let cap = self.config.history_cap;
                let mut state = self.state.lock();
                state.generation_calls += report.generation_calls;
                if !report.success {
                    let reason = report.reason.clone().unwrap_or_else(|| "unknown".into());
                    state.log_action(cap, format!("target {} failed: {}", report.target, reason));
                }
            }

            // MERGE (synchronized fan-in starts here)
            let (merged, conflicts) = merge_reports(&mut reports);
            if conflicts > 0 {
                let cap = self.config.history_cap;
                let mut state = self.state.lock();
                state.merge_conflicts += conflicts;
                state.log_action(cap, format!("batch {}: {} merge conflicts", batch, conflicts));
            }

            // EVALUATE: consistent workspace, then the kill matrix.
            let removed = self.evaluate_merge(project, merged)?;
            self.record_batch_artifacts(&reports, &removed)?;
            self.evaluate_mutants(project)?;

            // SYNC from the store, never from worker memory.
            self.sync(project)?;
            self.persist();

            // CHECK-STOP
            let state = self.state.lock();
            if state.mutation_score >= self.config.excellent_mutation_score
                && state.line_coverage >= self.config.excellent_line_coverage
                && state.branch_coverage >= self.config.excellent_branch_coverage
            {
                break StopReason::ExcellentThresholds;
            }
            if state.stalled_batches >= self.config.stall_batches {
                break StopReason::Stalled;
            }
        };

        info!(%stop, "run stopped");
        self.persist();
        Ok(RunSummary {
            stop,
            state: self.state.lock().clone(),
        })
    }

    fn select_batch(&self) -> Result<Vec<Target>> {
        let coverage = self.store.coverage()?;
        let candidates: Vec<Target> = self
            .targets
            .iter()
            .filter(|t| {
                matches!(
                    self.coordinator.state(t),
                    TargetState::Available | TargetState::Processed
                )
            })
            .cloned()
            .collect();
        let picked = self
            .strategy
            .select(&candidates, &coverage, self.config.batch_size);

        let mut claimed = Vec::new();
        for target in picked {
            let was_processed = self.coordinator.state(&target) == TargetState::Processed;
            if !self.coordinator.acquire(&target, self.config.allow_reprocess) {
                continue;
            }
            if was_processed {
                // A new selection round supersedes the target's previous
                // mutants; stale ones leave active scoring but stay for
                // audit.
                self.outdate_mutants(&target)?;
            }
            claimed.push(target);
        }
        Ok(claimed)
    }

    fn outdate_mutants(&self, target: &Target) -> Result<()> {
        for mut mutant in self.store.mutants_for_target(target)? {
            if mutant.transition(MutantStatus::Outdated) {
                self.store.put_mutant(&mutant)?;
            }
        }
        Ok(())
    }

    /// Fan out one worker per claimed target, bounded by the configured
    /// pool size: targets beyond the bound wait for the previous wave.
    fn dispatch(&self, project: &Path, claimed: &[Target]) -> Vec<WorkerReport> {
        let pool = self.config.worker_count.max(1);
        let mut reports = Vec::with_capacity(claimed.len());
        let mut order = 0usize;
        for wave in claimed.chunks(pool) {
            reports.extend(self.dispatch_wave(project, wave, order));
            order += wave.len();
        }
        reports
    }

    fn dispatch_wave(&self, project: &Path, wave: &[Target], base: usize) -> Vec<WorkerReport> {
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerReport>();
        let session = format!("{:08x}", fastrand::u32(..));

        for (offset, target) in wave.iter().enumerate() {
            let order = base + offset;
            let env = WorkerEnv {
                order,
                target: target.clone(),
                project: project.to_path_buf(),
                session: session.clone(),
                language: self.language,
                config: self.config.clone(),
                sandboxes: Arc::clone(&self.sandboxes),
                runner: Arc::clone(&self.runner),
                generator: Arc::clone(&self.generator),
                store: Arc::clone(&self.store),
                coordinator: Arc::clone(&self.coordinator),
                interrupt: Arc::clone(&self.interrupt),
            };
            let tx = tx.clone();
            let spawn_tx = tx.clone();
            let fallback_target = target.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("coevolve-worker-{}", order))
                .spawn(move || {
                    let result =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| env.run()));
                    let report = result.unwrap_or_else(|_| {
                        WorkerReport::failure(fallback_target, order, "worker panicked")
                    });
                    let _ = spawn_tx.send(report);
                });
            if let Err(e) = spawned {
                let _ = tx.send(WorkerReport::failure(
                    target.clone(),
                    order,
                    format!("failed to spawn worker: {}", e),
                ));
            }
        }
        drop(tx);

        let deadline = Instant::now() + Duration::from_millis(self.config.worker_timeout_ms);
        let mut pending: HashSet<Target> = wave.iter().cloned().collect();
        let mut reports = Vec::with_capacity(wave.len());
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(report) => {
                    pending.remove(&report.target);
                    reports.push(report);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Timed-out workers: release with failure, no in-run retry. Their
        // threads clean their own sandboxes whenever they finish.
        for target in pending {
            warn!(%target, "worker timed out; releasing target");
            let cap = self.config.history_cap;
            self.state
                .lock()
                .log_action(cap, format!("target {} timed out", target));
            self.coordinator.release(&target, false);
        }
        for report in &reports {
            // A blacklisted target was already deselected by the
            // coordinator; releasing it would resurrect it as processed.
            if !self.coordinator.is_blacklisted(&report.target) {
                self.coordinator.release(&report.target, report.success);
            }
        }
        reports
    }

    /// Compile the merged batch against the workspace; on failure, strip
    /// the files the isolator blames. Returns the removed paths.
    fn evaluate_merge(
        &self,
        project: &Path,
        merged: BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        if merged.is_empty() {
            return Ok(Vec::new());
        }
        let files: Vec<MergedFile> = merged
            .into_iter()
            .map(|(path, content)| MergedFile { path, content })
            .collect();

        let validator = |subset: &[MergedFile]| -> bool {
            let id = format!("merge-{}-{:06x}", now_millis(), fastrand::u32(..));
            let path = match self.sandboxes.create(project, &id) {
                Ok(p) => p,
                Err(e) => {
                    warn!("merge validation sandbox unavailable: {}", e);
                    return false;
                }
            };
            let ok = (|| -> Result<bool> {
                for file in subset {
                    let dest = path.join(&file.path);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&dest, &file.content)?;
                }
                Ok(matches!(self.runner.compile(&path)?, CompileOutcome::Ok))
            })()
            .unwrap_or(false);
            self.sandboxes.cleanup(&id);
            ok
        };

        let blamed = isolate::isolate(&files, &validator);
        let removed: Vec<String> = blamed.iter().map(|f| f.path.clone()).collect();
        for path in &removed {
            warn!(%path, "merged file removed: workspace would not compile with it");
            let cap = self.config.history_cap;
            self.state
                .lock()
                .log_action(cap, format!("removed unmergeable file {}", path));
        }

        let surviving: Vec<&MergedFile> =
            files.iter().filter(|f| !removed.contains(&f.path)).collect();
        for file in &surviving {
            let dest = project.join(&file.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &file.content)?;
        }

        // The workspace must still compile with the survivors in place; if
        // not, roll this batch's files back to their stored content.
        if !surviving.is_empty()
            && !matches!(self.runner.compile(project)?, CompileOutcome::Ok)
        {
            warn!("workspace failed to compile after merge; reverting batch files");
            let mut rolled_back = Vec::new();
            for file in &surviving {
                let dest = project.join(&file.path);
                match self.store.file_content(&file.path)? {
                    Some(known_good) => fs::write(&dest, known_good)?,
                    None => {
                        let _ = fs::remove_file(&dest);
                    }
                }
                rolled_back.push(file.path.clone());
            }
            return Ok(removed.into_iter().chain(rolled_back).collect());
        }

        for file in surviving {
            self.store.put_file_content(&file.path, &file.content)?;
        }
        Ok(removed)
    }

    /// Persist cases and mutants from successful workers, skipping cases
    /// whose files did not survive the merge.
    fn record_batch_artifacts(&self, reports: &[WorkerReport], removed: &[String]) -> Result<()> {
        for report in reports.iter().filter(|r| r.success) {
            for case in &report.cases {
                if removed.contains(&case.rel_path) {
                    debug!(case = %case.id, "case dropped with its unmergeable file");
                    continue;
                }
                self.store.put_test_case(case)?;
                self.store.map_class_file(&case.class_name, &case.rel_path)?;
            }
            for mutant in &report.mutants {
                self.store.put_mutant(mutant)?;
            }
        }
        Ok(())
    }

    /// Authoritative evaluation pass: rebuild the kill matrix for all
    /// still-valid mutants against the current test set.
    fn evaluate_mutants(&self, project: &Path) -> Result<()> {
        let valid: Vec<Mutant> = self
            .store
            .all_mutants()?
            .into_iter()
            .filter(|m| m.status() == MutantStatus::Valid)
            .collect();
        if valid.is_empty() {
            return Ok(());
        }
        let tests = self.store.current_test_cases()?;
        let builder = KillMatrixBuilder {
            sandboxes: &self.sandboxes,
            runner: self.runner.as_ref(),
        };
        let outcome = builder.build(&valid, &tests, project, self.config.mutant_parallelism);
        let now = now_millis();
        for mutant in &valid {
            if !outcome.matrix.contains(&mutant.id) {
                continue;
            }
            let mut updated = mutant.clone();
            if updated.record_evaluation(outcome.matrix.killers_of(&mutant.id), now) {
                self.store.put_mutant(&updated)?;
            }
        }
        for (id, reason) in &outcome.unevaluated {
            let cap = self.config.history_cap;
            self.state
                .lock()
                .log_action(cap, format!("mutant {} not evaluated: {}", id, reason));
        }
        Ok(())
    }

    /// Recompute global statistics from the store and refresh coverage. A
    /// coverage failure keeps the stale values rather than aborting.
    fn sync(&self, project: &Path) -> Result<()> {
        let mutants = self.store.all_mutants()?;
        let killed = mutants
            .iter()
            .filter(|m| m.status() == MutantStatus::Killed)
            .count();
        let survived = mutants
            .iter()
            .filter(|m| m.status() == MutantStatus::Survived)
            .count();
        let total = mutants.iter().filter(|m| m.is_active()).count();
        let evaluated = killed + survived;
        let score = if evaluated > 0 {
            killed as f64 / evaluated as f64
        } else {
            0.0
        };

        match self.runner.test_with_coverage(project) {
            Ok(CoverageOutcome::Ok { coverage }) => self.store.put_coverage(&coverage)?,
            Ok(_) | Err(_) => {
                warn!("coverage collection failed; proceeding with stale coverage values");
            }
        }
        let coverage = self.store.coverage()?;

        let cap = self.config.history_cap;
        let threshold = self.config.improvement_threshold;
        let mut state = self.state.lock();
        let delta = (score - state.mutation_score).max(coverage.line_rate() - state.line_coverage);
        state.mutants_total = total;
        state.mutants_killed = killed;
        state.mutants_survived = survived;
        state.mutation_score = score;
        state.line_coverage = coverage.line_rate();
        state.branch_coverage = coverage.branch_rate();
        state.log_improvement(cap, delta);
        if delta >= threshold {
            state.stalled_batches = 0;
        } else {
            state.stalled_batches += 1;
        }
        Ok(())
    }

    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let snapshot = RunSnapshot {
            state: self.state.lock().clone(),
            processed: self.coordinator.processed_snapshot(),
            blacklist: self.coordinator.blacklist_snapshot(),
            active: self.coordinator.active_snapshot(),
        };
        save_to_path(&snapshot, path);
    }
}

/// Merge all workers' generated files, keyed by relative path. Identical
/// content deduplicates silently; divergent content keeps the first-seen
/// version and counts a conflict. Reports are folded in worker order so
/// "first" is deterministic regardless of completion order.
pub fn merge_reports(reports: &mut [WorkerReport]) -> (BTreeMap<String, String>, usize) {
    reports.sort_by_key(|r| r.order);
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    let mut conflicts = 0;
    for report in reports.iter().filter(|r| r.success) {
        for (path, content) in &report.generated_files {
            match merged.get(path) {
                None => {
                    merged.insert(path.clone(), content.clone());
                }
                Some(existing) if existing == content => {}
                Some(_) => {
                    conflicts += 1;
                    warn!(%path, source = %report.target, "merge conflict; first generated version wins");
                }
            }
        }
    }
    (merged, conflicts)
}

/// Everything one worker needs, owned, so the thread borrows nothing from
/// the scheduler.
struct WorkerEnv {
    order: usize,
    target: Target,
    project: PathBuf,
    session: String,
    language: Language,
    config: EngineConfig,
    sandboxes: Arc<SandboxManager>,
    runner: Arc<dyn Runner>,
    generator: Arc<dyn Generator>,
    store: Arc<dyn Store>,
    coordinator: Arc<TargetCoordinator>,
    interrupt: Arc<AtomicBool>,
}

impl WorkerEnv {
    fn run(&self) -> WorkerReport {
        match self.try_run() {
            Ok(report) => report,
            Err(e) => WorkerReport::failure(self.target.clone(), self.order, e.to_string()),
        }
    }

    fn worker_id(&self) -> String {
        format!("w{}-{}", self.order, self.session)
    }

    fn try_run(&self) -> Result<WorkerReport> {
        if self.interrupt.load(Ordering::SeqCst) {
            return Ok(WorkerReport::failure(
                self.target.clone(),
                self.order,
                "interrupted before start",
            ));
        }
        let Some(class_rel) = self.store.class_file(&self.target.class_name)? else {
            return Ok(WorkerReport::failure(
                self.target.clone(),
                self.order,
                "no source file mapped for class",
            ));
        };

        let (sandbox_id, sandbox) = self.sandboxes.create_target_sandbox(
            &self.project,
            &self.target.class_name,
            &self.target.method_name,
            &self.worker_id(),
        )?;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.run_in(&sandbox, &class_rel)
        }));
        // Cleanup happens whatever the worker did; no sandbox outlives its
        // owning call stack.
        self.sandboxes.cleanup(&sandbox_id);
        match result {
            Ok(report) => report,
            Err(_) => Ok(WorkerReport::failure(
                self.target.clone(),
                self.order,
                "worker panicked",
            )),
        }
    }

    fn run_in(&self, sandbox: &Path, class_rel: &str) -> Result<WorkerReport> {
        let code = fs::read_to_string(sandbox.join(class_rel))?;
        let existing: Vec<String> = self
            .store
            .current_test_cases()?
            .into_iter()
            .filter(|c| c.target_class == self.target.class_name)
            .flat_map(|c| c.methods.into_iter().map(|m| m.body))
            .collect();

        // Generation is read-only on source, so tests and mutants are
        // proposed concurrently.
        let attempts = self.config.generation_attempts;
        let ((test_bodies, test_calls), (patches, mutant_calls)) = rayon::join(
            || {
                propose_with_retries(attempts, || {
                    self.generator.propose_tests(
                        &self.target.class_name,
                        &self.target.method_name,
                        &code,
                        &existing,
                    )
                })
            },
            || {
                propose_with_retries(attempts, || {
                    self.generator.propose_mutants(
                        &self.target.class_name,
                        &code,
                        Some(&self.target.method_name),
                    )
                })
            },
        );
        let mut calls = test_calls + mutant_calls;

        if self.interrupt.load(Ordering::SeqCst) {
            let mut report =
                WorkerReport::failure(self.target.clone(), self.order, "interrupted");
            report.generation_calls = calls;
            return Ok(report);
        }

        // Assemble the candidate test class on top of the current merged
        // content, if any.
        let rel_path = test_rel_path(self.language, &self.target);
        let mut content = self.store.file_content(&rel_path)?.unwrap_or_default();
        let mut added = 0usize;
        for body in &test_bodies {
            match parse::method_names(body, self.language).first() {
                Some(name) => {
                    content = parse::merge_method(&content, self.language, name, body);
                    added += 1;
                }
                None => debug!(target = %self.target, "unparsable candidate test skipped"),
            }
        }

        let mutants = self.validate_mutants(sandbox, patches)?;

        if added == 0 && mutants.is_empty() {
            return Ok(WorkerReport {
                target: self.target.clone(),
                order: self.order,
                success: true,
                reason: Some("generator produced no candidates".into()),
                generated_files: BTreeMap::new(),
                cases: Vec::new(),
                mutants: Vec::new(),
                generation_calls: calls,
                locally_killed: 0,
            });
        }

        let case_id = format!(
            "{}-{}",
            slug(&self.target.class_name),
            slug(&self.target.method_name)
        );
        let artifact = TestArtifact {
            case_id: case_id.clone(),
            class_name: test_class_name(&self.target),
            target: self.target.clone(),
            rel_path: rel_path.clone(),
            language: self.language,
            content,
        };

        let engine = VerifyEngine {
            sandboxes: &self.sandboxes,
            runner: self.runner.as_ref(),
            generator: self.generator.as_ref(),
            store: self.store.as_ref(),
            coordinator: &self.coordinator,
            max_compile_repairs: self.config.max_compile_repairs,
            repair_attempts: self.config.generation_attempts,
            worker: self.worker_id(),
        };
        let outcome = if added > 0 {
            engine.verify(sandbox, &artifact)?
        } else {
            // Nothing new to verify; keep whatever is already merged.
            crate::verify::VerifyOutcome {
                state: VerifyState::Repaired,
                content: (!artifact.content.is_empty()).then(|| artifact.content.clone()),
                retained: parse::method_names(&artifact.content, self.language),
                dropped: Vec::new(),
                repaired: Vec::new(),
                trace: Vec::new(),
                generation_calls: 0,
            }
        };
        calls += outcome.generation_calls;

        if outcome.state == VerifyState::Discarded {
            let mut report = WorkerReport::failure(
                self.target.clone(),
                self.order,
                "verification discarded generated tests",
            );
            report.generation_calls = calls;
            report.mutants = mutants;
            return Ok(report);
        }

        let final_content = outcome.content.unwrap_or_default();
        let mut case = TestCase::new(
            case_id.clone(),
            test_class_name(&self.target),
            self.target.class_name.clone(),
            rel_path.clone(),
        );
        // Preserve version continuity with the stored case, if any.
        if let Some(previous) = self.store.test_case(&case_id)? {
            case = previous;
        }
        for name in parse::method_names(&final_content, self.language) {
            if let Some(body) = parse::extract_method(&final_content, self.language, &name) {
                case.upsert_method(&name, &body);
            }
        }

        // Advisory local evaluation inside this worker's sandbox; the
        // authoritative pass happens in the synchronized phase.
        let locally_killed = self.local_kill_count(sandbox, &rel_path, &final_content, &mutants, &case);

        let mut generated_files = BTreeMap::new();
        if !final_content.is_empty() {
            generated_files.insert(rel_path, final_content);
        }
        Ok(WorkerReport {
            target: self.target.clone(),
            order: self.order,
            success: true,
            reason: None,
            generated_files,
            cases: vec![case],
            mutants,
            generation_calls: calls,
            locally_killed,
        })
    }

    /// A patch that applies cleanly makes its mutant Valid; anything else
    /// is Invalid and excluded from evaluation.
    fn validate_mutants(
        &self,
        sandbox: &Path,
        patches: Vec<crate::mutants::Patch>,
    ) -> Result<Vec<Mutant>> {
        let stamp = now_millis();
        let mut mutants = Vec::with_capacity(patches.len());
        for (i, patch) in patches.into_iter().enumerate() {
            let id = format!(
                "{}-{}-{}-{}",
                slug(&self.target.class_name),
                slug(&self.target.method_name),
                stamp,
                i
            );
            let mut mutant = Mutant::new(
                id,
                self.target.class_name.clone(),
                self.target.method_name.clone(),
                patch,
            );
            let applies = fs::read_to_string(sandbox.join(&mutant.patch.file))
                .ok()
                .and_then(|content| mutant.patch.apply(&content).ok())
                .is_some();
            if applies {
                mutant.transition(MutantStatus::Valid);
            } else {
                debug!(mutant = %mutant.id, "patch does not apply; mutant invalid");
                mutant.transition(MutantStatus::Invalid);
            }
            mutants.push(mutant);
        }
        Ok(mutants)
    }

    fn local_kill_count(
        &self,
        sandbox: &Path,
        rel_path: &str,
        content: &str,
        mutants: &[Mutant],
        case: &TestCase,
    ) -> usize {
        let valid: Vec<Mutant> = mutants
            .iter()
            .filter(|m| m.status() == MutantStatus::Valid)
            .cloned()
            .collect();
        if valid.is_empty() || content.is_empty() {
            return 0;
        }
        let dest = sandbox.join(rel_path);
        if let Some(parent) = dest.parent() {
            if fs::create_dir_all(parent).is_err() {
                return 0;
            }
        }
        if fs::write(&dest, content).is_err() {
            return 0;
        }
        let builder = KillMatrixBuilder {
            sandboxes: &self.sandboxes,
            runner: self.runner.as_ref(),
        };
        let outcome = builder.build(
            &valid,
            std::slice::from_ref(case),
            sandbox,
            self.config.mutant_parallelism,
        );
        outcome.matrix.killed_count()
    }
}
