#![allow(dead_code)]

use std::fs;
use std::path::Path;

use coevolve::error::Result;
use coevolve::generator::Generator;
use coevolve::mutants::Patch;
use coevolve::report::{MethodCoverage, MethodVerdict, TestReport};
use coevolve::runner::{CompileOutcome, CoverageOutcome, Runner, TestOutcome};
use tempfile::TempDir;

pub const CALC_SOURCE: &str = "def add(a, b):\n    return a + b\n";

/// A small Python project tree: one source file and a marker file.
pub fn sample_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src").join("calc.py"), CALC_SOURCE).unwrap();
    fs::write(root.join("pyproject.toml"), "[project]\nname = \"calc\"\n").unwrap();
    dir
}

/// Patch flipping `a + b` to `a - b` in the sample project.
pub fn subtraction_patch() -> Patch {
    Patch {
        file: "src/calc.py".into(),
        start_line: 2,
        end_line: 2,
        original: "    return a + b".into(),
        mutated: "    return a - b".into(),
    }
}

pub fn report_with(entries: &[(&str, MethodVerdict)]) -> TestReport {
    let mut report = TestReport::default();
    for (name, verdict) in entries {
        report.outcomes.insert(name.to_string(), verdict.clone());
    }
    report
}

pub fn full_coverage(method: &str) -> CoverageOutcome {
    let mut coverage = coevolve::report::CoverageReport::default();
    coverage.methods.insert(
        method.to_string(),
        MethodCoverage {
            line_covered: 10,
            line_missed: 0,
            branch_covered: 2,
            branch_missed: 0,
        },
    );
    CoverageOutcome::Ok { coverage }
}

type CompileFn = dyn Fn(&Path) -> CompileOutcome + Send + Sync;
type TestFn = dyn Fn(&Path) -> TestOutcome + Send + Sync;
type CoverageFn = dyn Fn(&Path) -> CoverageOutcome + Send + Sync;

/// Runner whose behavior is scripted per call site, usually by inspecting
/// the sandbox contents it is pointed at.
pub struct ScriptedRunner {
    pub on_compile: Box<CompileFn>,
    pub on_test: Box<TestFn>,
    pub on_coverage: Box<CoverageFn>,
}

impl ScriptedRunner {
    /// Everything compiles and passes; coverage collection fails.
    pub fn passing() -> Self {
        ScriptedRunner {
            on_compile: Box::new(|_| CompileOutcome::Ok),
            on_test: Box::new(|_| TestOutcome::Passed { report: None }),
            on_coverage: Box::new(|_| CoverageOutcome::Failed {
                diagnostic: "no coverage configured".into(),
            }),
        }
    }
}

impl Runner for ScriptedRunner {
    fn compile(&self, project: &Path) -> Result<CompileOutcome> {
        Ok((self.on_compile)(project))
    }

    fn test(&self, project: &Path) -> Result<TestOutcome> {
        Ok((self.on_test)(project))
    }

    fn test_with_coverage(&self, project: &Path) -> Result<CoverageOutcome> {
        Ok((self.on_coverage)(project))
    }
}

type TestsFn = dyn Fn() -> Vec<String> + Send + Sync;
type MutantsFn = dyn Fn() -> Vec<Patch> + Send + Sync;
type RepairFn = dyn Fn(&str, &str) -> Option<String> + Send + Sync;

pub struct ScriptedGenerator {
    pub on_tests: Box<TestsFn>,
    pub on_mutants: Box<MutantsFn>,
    pub on_repair: Box<RepairFn>,
}

impl ScriptedGenerator {
    /// Proposes nothing and never repairs.
    pub fn silent() -> Self {
        ScriptedGenerator {
            on_tests: Box::new(Vec::new),
            on_mutants: Box::new(Vec::new),
            on_repair: Box::new(|_, _| None),
        }
    }
}

impl Generator for ScriptedGenerator {
    fn propose_mutants(
        &self,
        _class_name: &str,
        _code: &str,
        _target_method: Option<&str>,
    ) -> Result<Vec<Patch>> {
        Ok((self.on_mutants)())
    }

    fn propose_tests(
        &self,
        _class_name: &str,
        _method_signature: &str,
        _code: &str,
        _existing_tests: &[String],
    ) -> Result<Vec<String>> {
        Ok((self.on_tests)())
    }

    fn repair(&self, code: &str, diagnostic: &str) -> Result<Option<String>> {
        Ok((self.on_repair)(code, diagnostic))
    }
}

/// Read a file inside a sandbox, empty string if absent.
pub fn read_in(sandbox: &Path, rel: &str) -> String {
    fs::read_to_string(sandbox.join(rel)).unwrap_or_default()
}
