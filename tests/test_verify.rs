mod common;

use coevolve::Language;
use coevolve::report::MethodVerdict;
use coevolve::runner::{CompileOutcome, TestOutcome};
use coevolve::sandbox::SandboxManager;
use coevolve::store::{MemoryStore, Store};
use coevolve::target::{Target, TargetCoordinator};
use coevolve::verify::{TestArtifact, VerifyEngine, VerifyState};
use tempfile::TempDir;

use common::{ScriptedGenerator, ScriptedRunner, read_in, report_with, sample_project};

const REL_PATH: &str = "tests/test_calc_add.py";

fn artifact(content: &str) -> TestArtifact {
    TestArtifact {
        case_id: "calc-add".into(),
        class_name: "CalcAddTest".into(),
        target: Target::new("Calc", "add"),
        rel_path: REL_PATH.into(),
        language: Language::Python,
        content: content.into(),
    }
}

struct Fixture {
    _scratch: TempDir,
    sandboxes: SandboxManager,
    store: MemoryStore,
    coordinator: TargetCoordinator,
}

impl Fixture {
    fn new() -> Self {
        let scratch = TempDir::new().unwrap();
        let sandboxes = SandboxManager::new(scratch.path());
        Fixture {
            _scratch: scratch,
            sandboxes,
            store: MemoryStore::new(),
            coordinator: TargetCoordinator::new(),
        }
    }

    fn engine<'a>(
        &'a self,
        runner: &'a ScriptedRunner,
        generator: &'a ScriptedGenerator,
    ) -> VerifyEngine<'a> {
        VerifyEngine {
            sandboxes: &self.sandboxes,
            runner,
            generator,
            store: &self.store,
            coordinator: &self.coordinator,
            max_compile_repairs: 2,
            repair_attempts: 2,
            worker: "w0".into(),
        }
    }
}

#[test]
fn clean_artifact_passes_straight_through() {
    let project = sample_project();
    let fixture = Fixture::new();
    let runner = ScriptedRunner::passing();
    let generator = ScriptedGenerator::silent();
    let engine = fixture.engine(&runner, &generator);

    let content = "def test_add():\n    assert True\n\ndef test_zero():\n    assert True\n";
    let outcome = engine.verify(project.path(), &artifact(content)).unwrap();

    assert_eq!(outcome.state, VerifyState::Repaired);
    assert_eq!(outcome.content.as_deref(), Some(content));
    assert_eq!(outcome.retained, vec!["test_add".to_string(), "test_zero".to_string()]);
    assert!(outcome.dropped.is_empty());
    assert!(outcome.trace.contains(&VerifyState::CompileOk));
    assert!(outcome.trace.contains(&VerifyState::Pass));
    assert_eq!(fixture.sandboxes.live_count(), 0);
}

#[test]
fn compile_failure_is_repaired_within_bounds() {
    let project = sample_project();
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::passing();
    runner.on_compile = Box::new(|sandbox| {
        if read_in(sandbox, REL_PATH).contains("SYNTAX_ERR") {
            CompileOutcome::Failed {
                diagnostic: "invalid syntax at line 2".into(),
            }
        } else {
            CompileOutcome::Ok
        }
    });
    let mut generator = ScriptedGenerator::silent();
    generator.on_repair = Box::new(|code, _diag| Some(code.replace("SYNTAX_ERR", "True")));
    let engine = fixture.engine(&runner, &generator);

    let content = "def test_add():\n    assert SYNTAX_ERR\n";
    let outcome = engine.verify(project.path(), &artifact(content)).unwrap();

    assert_eq!(outcome.state, VerifyState::Repaired);
    assert!(outcome.content.unwrap().contains("assert True"));
    assert!(outcome.trace.contains(&VerifyState::CompileFail));
    assert!(outcome.trace.contains(&VerifyState::CompileOk));
    assert!(outcome.generation_calls >= 1);
    assert!(!fixture.coordinator.is_blacklisted(&Target::new("Calc", "add")));
}

#[test]
fn exhausted_compile_repair_blacklists_the_target() {
    let project = sample_project();
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::passing();
    runner.on_compile = Box::new(|_| CompileOutcome::Failed {
        diagnostic: "unresolved reference".into(),
    });
    let generator = ScriptedGenerator::silent();
    let engine = fixture.engine(&runner, &generator);

    let outcome = engine
        .verify(project.path(), &artifact("def test_add():\n    assert broken\n"))
        .unwrap();

    assert_eq!(outcome.state, VerifyState::Discarded);
    assert!(outcome.content.is_none());
    assert!(fixture.coordinator.is_blacklisted(&Target::new("Calc", "add")));
    let blacklist = fixture.coordinator.blacklist_snapshot();
    assert!(blacklist[0].1.contains("compile repair exhausted"));
    assert_eq!(fixture.sandboxes.live_count(), 0);
}

#[test]
fn failing_method_is_repaired_and_verified_alone() {
    let project = sample_project();
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::passing();
    runner.on_test = Box::new(|sandbox| {
        if read_in(sandbox, REL_PATH).contains("bug") {
            TestOutcome::Failed {
                report: Some(report_with(&[
                    ("CalcAddTest.test_good", MethodVerdict::Passed),
                    (
                        "CalcAddTest.test_bad",
                        MethodVerdict::Failed {
                            message: "expected 1".into(),
                        },
                    ),
                ])),
            }
        } else {
            TestOutcome::Passed { report: None }
        }
    });
    let mut generator = ScriptedGenerator::silent();
    generator.on_repair = Box::new(|code, _| Some(code.replace("bug", "1")));
    let engine = fixture.engine(&runner, &generator);

    let content = "def test_good():\n    assert True\n\ndef test_bad():\n    assert bug == 1\n";
    let outcome = engine.verify(project.path(), &artifact(content)).unwrap();

    assert_eq!(outcome.state, VerifyState::Repaired);
    assert_eq!(outcome.repaired, vec!["test_bad".to_string()]);
    assert!(outcome.dropped.is_empty());
    let fixed = outcome.content.unwrap();
    assert!(fixed.contains("assert 1 == 1"));
    assert!(fixed.contains("test_good"));
    assert!(outcome.trace.contains(&VerifyState::PartialFail));
}

#[test]
fn unrepairable_method_is_dropped_keeping_the_rest() {
    let project = sample_project();
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::passing();
    runner.on_test = Box::new(|sandbox| {
        if read_in(sandbox, REL_PATH).contains("bug") {
            TestOutcome::Failed {
                report: Some(report_with(&[(
                    "CalcAddTest.test_bad",
                    MethodVerdict::Failed {
                        message: "expected 1".into(),
                    },
                )])),
            }
        } else {
            TestOutcome::Passed { report: None }
        }
    });
    let generator = ScriptedGenerator::silent();
    let engine = fixture.engine(&runner, &generator);

    let content = "def test_good():\n    assert True\n\ndef test_bad():\n    assert bug == 1\n";
    let outcome = engine.verify(project.path(), &artifact(content)).unwrap();

    assert_eq!(outcome.state, VerifyState::Repaired);
    assert_eq!(outcome.dropped, vec!["test_bad".to_string()]);
    assert_eq!(outcome.retained, vec!["test_good".to_string()]);
    assert!(!outcome.content.unwrap().contains("test_bad"));
}

#[test]
fn timed_out_methods_are_never_repaired_only_dropped() {
    let project = sample_project();
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::passing();
    runner.on_test = Box::new(|sandbox| {
        if read_in(sandbox, REL_PATH).contains("spin") {
            TestOutcome::Failed {
                report: Some(report_with(&[
                    ("CalcAddTest.test_good", MethodVerdict::Passed),
                    ("CalcAddTest.test_spin", MethodVerdict::TimedOut),
                ])),
            }
        } else {
            TestOutcome::Passed { report: None }
        }
    });
    let mut generator = ScriptedGenerator::silent();
    // A repair would "succeed" if it were ever asked for; it must not be.
    generator.on_repair = Box::new(|code, _| Some(code.replace("spin", "True")));
    let engine = fixture.engine(&runner, &generator);

    let content = "def test_good():\n    assert True\n\ndef test_spin():\n    spin()\n";
    let outcome = engine.verify(project.path(), &artifact(content)).unwrap();

    assert_eq!(outcome.state, VerifyState::Repaired);
    assert_eq!(outcome.dropped, vec!["test_spin".to_string()]);
    assert!(outcome.repaired.is_empty());
    assert_eq!(outcome.generation_calls, 0);
}

#[test]
fn hang_is_localized_by_binary_search_over_methods() {
    let project = sample_project();
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::passing();
    // The whole run hangs with no report when the hanging method is in the
    // executed set.
    runner.on_test = Box::new(|sandbox| {
        if read_in(sandbox, REL_PATH).contains("while_hang") {
            TestOutcome::TimedOut
        } else {
            TestOutcome::Passed { report: None }
        }
    });
    let generator = ScriptedGenerator::silent();
    let engine = fixture.engine(&runner, &generator);

    let content = "def test_m1():\n    assert True\n\n\
                   def test_m2():\n    assert True\n\n\
                   def test_m3():\n    while_hang()\n\n\
                   def test_m4():\n    assert True\n";
    let outcome = engine.verify(project.path(), &artifact(content)).unwrap();

    assert_eq!(outcome.state, VerifyState::Repaired);
    assert_eq!(outcome.dropped, vec!["test_m3".to_string()]);
    assert_eq!(
        outcome.retained,
        vec!["test_m1".to_string(), "test_m2".to_string(), "test_m4".to_string()]
    );
    assert!(outcome.trace.contains(&VerifyState::Timeout));
    assert_eq!(fixture.sandboxes.live_count(), 0);
}

#[test]
fn artifact_with_no_surviving_methods_is_discarded() {
    let project = sample_project();
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::passing();
    runner.on_test = Box::new(|sandbox| {
        if read_in(sandbox, REL_PATH).contains("bug") {
            TestOutcome::Failed {
                report: Some(report_with(&[(
                    "CalcAddTest.test_bad",
                    MethodVerdict::Failed {
                        message: "always wrong".into(),
                    },
                )])),
            }
        } else {
            TestOutcome::Passed { report: None }
        }
    });
    let generator = ScriptedGenerator::silent();
    let engine = fixture.engine(&runner, &generator);

    let outcome = engine
        .verify(project.path(), &artifact("def test_bad():\n    assert bug\n"))
        .unwrap();

    assert_eq!(outcome.state, VerifyState::Discarded);
    assert!(fixture.coordinator.is_blacklisted(&Target::new("Calc", "add")));
}

#[test]
fn reverification_of_repaired_artifact_is_idempotent() {
    let project = sample_project();
    let fixture = Fixture::new();
    let runner = ScriptedRunner::passing();
    let generator = ScriptedGenerator::silent();
    let engine = fixture.engine(&runner, &generator);

    let content = "def test_add():\n    assert True\n\ndef test_zero():\n    assert True\n";
    let first = engine.verify(project.path(), &artifact(content)).unwrap();
    assert_eq!(first.state, VerifyState::Repaired);

    let again = engine
        .verify(project.path(), &artifact(&first.content.clone().unwrap()))
        .unwrap();
    assert_eq!(again.state, VerifyState::Repaired);
    assert_eq!(again.retained, first.retained);
    assert!(again.dropped.is_empty());
    assert_eq!(again.content, first.content);
}

#[test]
fn concurrently_merged_store_content_is_grafted_before_acceptance() {
    let project = sample_project();
    let fixture = Fixture::new();
    let runner = ScriptedRunner::passing();
    let generator = ScriptedGenerator::silent();

    // Another worker already merged a different method into the store.
    fixture
        .store
        .put_file_content(REL_PATH, "def test_extra():\n    assert True\n")
        .unwrap();

    let engine = fixture.engine(&runner, &generator);
    let outcome = engine
        .verify(project.path(), &artifact("def test_add():\n    assert True\n"))
        .unwrap();

    assert_eq!(outcome.state, VerifyState::Repaired);
    let merged = outcome.content.unwrap();
    assert!(merged.contains("test_extra"));
    assert!(merged.contains("test_add"));
    assert_eq!(outcome.retained, vec!["test_add".to_string()]);
}
