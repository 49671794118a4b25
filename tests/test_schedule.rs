mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use coevolve::Language;
use coevolve::config::EngineConfig;
use coevolve::generator::Generator;
use coevolve::mutants::MutantStatus;
use coevolve::report::MethodVerdict;
use coevolve::runner::{Runner, TestOutcome};
use coevolve::sandbox::SandboxManager;
use coevolve::schedule::{
    BatchScheduler, FifoSelection, StopReason, WorkerReport, merge_reports,
};
use coevolve::store::{MemoryStore, Store};
use coevolve::target::{Target, TargetCoordinator, TargetState};
use tempfile::TempDir;

use common::{
    ScriptedGenerator, ScriptedRunner, full_coverage, read_in, report_with, sample_project,
    subtraction_patch,
};

fn quick_config() -> EngineConfig {
    EngineConfig {
        batch_size: 4,
        worker_count: 4,
        mutant_parallelism: 1,
        max_iterations: 1,
        generation_budget: 100,
        stall_batches: 3,
        worker_timeout_ms: 10_000,
        ..EngineConfig::default()
    }
}

struct Rig {
    _scratch: TempDir,
    sandboxes: Arc<SandboxManager>,
    store: Arc<dyn Store>,
    coordinator: Arc<TargetCoordinator>,
}

impl Rig {
    fn new() -> Self {
        let scratch = TempDir::new().unwrap();
        let sandboxes = Arc::new(SandboxManager::new(scratch.path()));
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.map_class_file("Calc", "src/calc.py").unwrap();
        Rig {
            _scratch: scratch,
            sandboxes,
            store,
            coordinator: Arc::new(TargetCoordinator::new()),
        }
    }

    fn scheduler(
        &self,
        runner: Arc<dyn Runner>,
        generator: Arc<dyn Generator>,
        config: EngineConfig,
        targets: Vec<Target>,
    ) -> BatchScheduler {
        BatchScheduler::new(
            Arc::clone(&self.sandboxes),
            runner,
            generator,
            Arc::clone(&self.store),
            Arc::clone(&self.coordinator),
            Box::new(FifoSelection),
            config,
            Language::Python,
            targets,
        )
    }
}

fn report(target: &Target, order: usize, files: &[(&str, &str)]) -> WorkerReport {
    WorkerReport {
        target: target.clone(),
        order,
        success: true,
        reason: None,
        generated_files: files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect::<BTreeMap<String, String>>(),
        cases: Vec::new(),
        mutants: Vec::new(),
        generation_calls: 0,
        locally_killed: 0,
    }
}

#[test]
fn merge_deduplicates_identical_content_silently() {
    let a = Target::new("Calc", "add");
    let b = Target::new("Calc", "sub");
    let mut reports = vec![
        report(&a, 0, &[("tests/foo_test.py", "def test_x():\n    pass\n")]),
        report(&b, 1, &[("tests/foo_test.py", "def test_x():\n    pass\n")]),
    ];
    let (merged, conflicts) = merge_reports(&mut reports);
    assert_eq!(conflicts, 0);
    assert_eq!(merged.len(), 1);
}

#[test]
fn merge_counts_conflicts_and_keeps_first_writer() {
    let a = Target::new("Calc", "add");
    let b = Target::new("Calc", "sub");
    // Completion order is reversed; worker order must still win.
    let mut reports = vec![
        report(&b, 1, &[("tests/foo_test.py", "def test_x():\n    assert False\n")]),
        report(&a, 0, &[("tests/foo_test.py", "def test_x():\n    assert True\n")]),
    ];
    let (merged, conflicts) = merge_reports(&mut reports);
    assert_eq!(conflicts, 1);
    assert_eq!(merged.len(), 1);
    assert!(merged["tests/foo_test.py"].contains("assert True"));
}

#[test]
fn failed_workers_contribute_nothing_to_the_merge() {
    let a = Target::new("Calc", "add");
    let mut failed = report(&a, 0, &[("tests/foo_test.py", "content")]);
    failed.success = false;
    let (merged, conflicts) = merge_reports(&mut [failed]);
    assert!(merged.is_empty());
    assert_eq!(conflicts, 0);
}

/// Full batch loop: one target, one generated test, one killable mutant.
#[test]
fn batch_run_kills_mutant_and_reaches_excellence() {
    let project = sample_project();
    let rig = Rig::new();

    let mut runner = ScriptedRunner::passing();
    runner.on_test = Box::new(|sandbox| {
        if read_in(sandbox, "src/calc.py").contains("a - b") {
            TestOutcome::Failed {
                report: Some(report_with(&[(
                    "CalcAddTest.test_add",
                    MethodVerdict::Failed {
                        message: "expected 3, got -1".into(),
                    },
                )])),
            }
        } else {
            TestOutcome::Passed { report: None }
        }
    });
    runner.on_coverage = Box::new(|_| full_coverage("Calc.add"));

    let mut generator = ScriptedGenerator::silent();
    generator.on_tests =
        Box::new(|| vec!["def test_add():\n    assert add(1, 2) == 3\n".to_string()]);
    generator.on_mutants = Box::new(|| vec![subtraction_patch()]);

    let target = Target::new("Calc", "add");
    let scheduler = rig.scheduler(
        Arc::new(runner),
        Arc::new(generator),
        quick_config(),
        vec![target.clone()],
    );
    let summary = scheduler.run(project.path()).unwrap();

    assert_eq!(summary.stop, StopReason::ExcellentThresholds);
    assert_eq!(summary.state.iteration, 1);
    assert_eq!(summary.state.mutants_total, 1);
    assert_eq!(summary.state.mutants_killed, 1);
    assert_eq!(summary.state.mutants_survived, 0);
    assert!((summary.state.mutation_score - 1.0).abs() < 1e-9);
    assert!((summary.state.line_coverage - 1.0).abs() < 1e-9);

    // The merged test file landed in the workspace and the store.
    let merged = read_in(project.path(), "tests/test_calc_add.py");
    assert!(merged.contains("test_add"));
    assert_eq!(
        rig.store.file_content("tests/test_calc_add.py").unwrap().unwrap(),
        merged
    );
    // Mutant reached Killed with its killer recorded.
    let mutants = rig.store.all_evaluated_mutants().unwrap();
    assert_eq!(mutants.len(), 1);
    assert_eq!(mutants[0].status(), MutantStatus::Killed);
    assert_eq!(mutants[0].killed_by, vec!["calc-add".to_string()]);
    // The test case is current, version 1.
    let cases = rig.store.current_test_cases().unwrap();
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].methods.len(), 1);
    assert_eq!(cases[0].methods[0].version, 1);

    assert_eq!(rig.coordinator.state(&target), TargetState::Processed);
    assert_eq!(rig.sandboxes.live_count(), 0);
}

#[test]
fn surviving_mutant_keeps_score_below_excellence() {
    let project = sample_project();
    let rig = Rig::new();

    // Tests never fail, so the mutant survives.
    let mut runner = ScriptedRunner::passing();
    runner.on_coverage = Box::new(|_| full_coverage("Calc.add"));
    let mut generator = ScriptedGenerator::silent();
    generator.on_tests =
        Box::new(|| vec!["def test_add():\n    assert add(1, 2) == 3\n".to_string()]);
    generator.on_mutants = Box::new(|| vec![subtraction_patch()]);

    let scheduler = rig.scheduler(
        Arc::new(runner),
        Arc::new(generator),
        quick_config(),
        vec![Target::new("Calc", "add")],
    );
    let summary = scheduler.run(project.path()).unwrap();

    assert_eq!(summary.stop, StopReason::IterationCeiling);
    assert_eq!(summary.state.mutants_survived, 1);
    assert_eq!(summary.state.mutants_killed, 0);
    assert_eq!(summary.state.mutation_score, 0.0);
}

#[test]
fn stalled_batches_stop_the_run() {
    let project = sample_project();
    let rig = Rig::new();

    let runner = ScriptedRunner::passing();
    let generator = ScriptedGenerator::silent();
    let config = EngineConfig {
        max_iterations: 10,
        stall_batches: 2,
        ..quick_config()
    };
    let scheduler = rig.scheduler(
        Arc::new(runner),
        Arc::new(generator),
        config,
        vec![Target::new("Calc", "add")],
    );
    let summary = scheduler.run(project.path()).unwrap();

    assert_eq!(summary.stop, StopReason::Stalled);
    assert_eq!(summary.state.iteration, 2);
    assert_eq!(summary.state.stalled_batches, 2);
}

#[test]
fn interrupt_stops_before_dispatching() {
    let project = sample_project();
    let rig = Rig::new();

    let scheduler = rig.scheduler(
        Arc::new(ScriptedRunner::passing()),
        Arc::new(ScriptedGenerator::silent()),
        quick_config(),
        vec![Target::new("Calc", "add")],
    );
    scheduler.interrupt_handle().store(true, Ordering::SeqCst);
    let summary = scheduler.run(project.path()).unwrap();

    assert_eq!(summary.stop, StopReason::Interrupted);
    assert_eq!(summary.state.iteration, 0);
}

#[test]
fn timed_out_worker_releases_its_target_with_failure() {
    let project = sample_project();
    let rig = Rig::new();

    let runner = ScriptedRunner::passing();
    let mut generator = ScriptedGenerator::silent();
    generator.on_tests = Box::new(|| {
        std::thread::sleep(Duration::from_millis(400));
        Vec::new()
    });
    let config = EngineConfig {
        worker_timeout_ms: 50,
        generation_attempts: 1,
        ..quick_config()
    };
    let target = Target::new("Calc", "add");
    let scheduler = rig.scheduler(
        Arc::new(runner),
        Arc::new(generator),
        config,
        vec![target.clone()],
    );
    let summary = scheduler.run(project.path()).unwrap();

    assert_eq!(summary.stop, StopReason::IterationCeiling);
    // Released with failure: available again, not processed.
    assert_eq!(rig.coordinator.state(&target), TargetState::Available);
    assert!(read_in(project.path(), "tests/test_calc_add.py").is_empty());

    // The straggler finishes on its own and cleans its sandbox.
    std::thread::sleep(Duration::from_millis(800));
    assert_eq!(rig.sandboxes.live_count(), 0);
}

#[test]
fn panicking_worker_is_contained_and_target_released() {
    let project = sample_project();
    let rig = Rig::new();

    let mut generator = ScriptedGenerator::silent();
    generator.on_tests = Box::new(|| panic!("generator exploded"));
    let target = Target::new("Calc", "add");
    let scheduler = rig.scheduler(
        Arc::new(ScriptedRunner::passing()),
        Arc::new(generator),
        quick_config(),
        vec![target.clone()],
    );
    let summary = scheduler.run(project.path()).unwrap();

    assert_eq!(summary.stop, StopReason::IterationCeiling);
    assert_eq!(rig.coordinator.state(&target), TargetState::Available);
    assert_eq!(rig.sandboxes.live_count(), 0);
}

#[test]
fn discarded_artifact_blacklists_target_until_no_targets_remain() {
    let project = sample_project();
    let rig = Rig::new();

    // Generated tests never compile and the generator cannot repair them.
    let mut runner = ScriptedRunner::passing();
    runner.on_compile = Box::new(|sandbox| {
        if read_in(sandbox, "tests/test_calc_add.py").contains("test_broken") {
            coevolve::runner::CompileOutcome::Failed {
                diagnostic: "name 'nonsense' is not defined".into(),
            }
        } else {
            coevolve::runner::CompileOutcome::Ok
        }
    });
    let mut generator = ScriptedGenerator::silent();
    generator.on_tests = Box::new(|| vec!["def test_broken():\n    nonsense\n".to_string()]);

    let config = EngineConfig {
        max_iterations: 5,
        ..quick_config()
    };
    let target = Target::new("Calc", "add");
    let scheduler = rig.scheduler(
        Arc::new(runner),
        Arc::new(generator),
        config,
        vec![target.clone()],
    );
    let summary = scheduler.run(project.path()).unwrap();

    // Batch 1 blacklists the only target; batch 2 finds nothing to claim.
    assert_eq!(summary.stop, StopReason::NoTargets);
    assert_eq!(rig.coordinator.state(&target), TargetState::Blacklisted);
    assert_eq!(rig.coordinator.blacklist_snapshot().len(), 1);
    assert_eq!(rig.sandboxes.live_count(), 0);
}

#[test]
fn snapshot_is_persisted_and_restorable() {
    let project = sample_project();
    let rig = Rig::new();
    let state_dir = TempDir::new().unwrap();
    let state_path = state_dir.path().join("state.json");

    let mut scheduler = rig.scheduler(
        Arc::new(ScriptedRunner::passing()),
        Arc::new(ScriptedGenerator::silent()),
        quick_config(),
        vec![Target::new("Calc", "add")],
    );
    scheduler.snapshot_path = Some(state_path.clone());
    scheduler.run(project.path()).unwrap();

    let snapshot = coevolve::state::load_from_path(&state_path).expect("snapshot written");
    assert_eq!(snapshot.state.iteration, 1);
    assert_eq!(snapshot.processed, vec![Target::new("Calc", "add")]);

    // A fresh scheduler restored from the snapshot resumes past the
    // processed target when reprocessing is disabled.
    let rig2 = Rig::new();
    let config = EngineConfig {
        allow_reprocess: false,
        max_iterations: 3,
        ..quick_config()
    };
    let scheduler2 = rig2.scheduler(
        Arc::new(ScriptedRunner::passing()),
        Arc::new(ScriptedGenerator::silent()),
        config,
        vec![Target::new("Calc", "add")],
    );
    scheduler2.restore(snapshot);
    let summary = scheduler2.run(project.path()).unwrap();
    assert_eq!(summary.stop, StopReason::NoTargets);
}

#[test]
fn reprocessed_target_outdates_previous_mutants() {
    let project = sample_project();
    let rig = Rig::new();

    let mut runner = ScriptedRunner::passing();
    runner.on_coverage = Box::new(|_| full_coverage("Calc.add"));
    let mut generator = ScriptedGenerator::silent();
    generator.on_tests =
        Box::new(|| vec!["def test_add():\n    assert add(1, 2) == 3\n".to_string()]);
    generator.on_mutants = Box::new(|| vec![subtraction_patch()]);

    let config = EngineConfig {
        max_iterations: 2,
        // Coverage stays flat after batch 1, keep going anyway.
        stall_batches: 5,
        ..quick_config()
    };
    let scheduler = rig.scheduler(
        Arc::new(runner),
        Arc::new(generator),
        config,
        vec![Target::new("Calc", "add")],
    );
    scheduler.run(project.path()).unwrap();

    let all = rig.store.all_mutants().unwrap();
    let outdated = all
        .iter()
        .filter(|m| m.status() == MutantStatus::Outdated)
        .count();
    // Batch 2 superseded batch 1's mutant.
    assert!(outdated >= 1, "expected at least one outdated mutant, got {:?}", all);
}
