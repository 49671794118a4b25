use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::Language;
use crate::error::Result;
use crate::generator::{Generator, repair_with_retries};
use crate::isolate;
use crate::parse;
use crate::report::TestReport;
use crate::runner::{CompileOutcome, Runner, TestOutcome};
use crate::sandbox::SandboxManager;
use crate::store::Store;
use crate::target::{Target, TargetCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    Written,
    Compiling,
    CompileOk,
    CompileFail,
    Running,
    Pass,
    PartialFail,
    Timeout,
    Repaired,
    Discarded,
}

/// A generated test class under verification. `content` is the full file
/// text; methods are located in it on demand via the grammar walks.
#[derive(Debug, Clone)]
pub struct TestArtifact {
    pub case_id: String,
    pub class_name: String,
    pub target: Target,
    pub rel_path: String,
    pub language: Language,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// Terminal state: Repaired or Discarded.
    pub state: VerifyState,
    /// Final accepted file content when repaired.
    pub content: Option<String>,
    /// Methods of this artifact that survived verification.
    pub retained: Vec<String>,
    pub dropped: Vec<String>,
    pub repaired: Vec<String>,
    /// Visited states, in order, for observability.
    pub trace: Vec<VerifyState>,
    pub generation_calls: u32,
}

/// Compiles, runs, and incrementally repairs or discards generated test
/// code until the remaining set is self-consistent. Each check runs in its
/// own disposable sandbox; the caller's project tree is never modified.
pub struct VerifyEngine<'a> {
    pub sandboxes: &'a SandboxManager,
    pub runner: &'a dyn Runner,
    pub generator: &'a dyn Generator,
    pub store: &'a dyn Store,
    pub coordinator: &'a TargetCoordinator,
    /// Bound on class-level compile repair rounds.
    pub max_compile_repairs: u32,
    /// Bound on generator calls per repair request.
    pub repair_attempts: u32,
    /// Worker identity used in sandbox ids.
    pub worker: String,
}

impl VerifyEngine<'_> {
    pub fn verify(&self, project: &Path, artifact: &TestArtifact) -> Result<VerifyOutcome> {
        let lang = artifact.language;
        let mut trace = vec![VerifyState::Written];
        let mut calls = 0u32;
        let mut content = artifact.content.clone();
        let mut dropped: Vec<String> = Vec::new();
        let mut repaired: Vec<String> = Vec::new();

        // Compile phase with bounded repair.
        let mut repairs = 0u32;
        loop {
            trace.push(VerifyState::Compiling);
            match self.compile_content(project, artifact, &content)? {
                CompileOutcome::Ok => {
                    trace.push(VerifyState::CompileOk);
                    break;
                }
                outcome => {
                    trace.push(VerifyState::CompileFail);
                    let diagnostic = match outcome {
                        CompileOutcome::Failed { diagnostic } => diagnostic,
                        _ => "compilation timed out".to_string(),
                    };
                    if repairs >= self.max_compile_repairs {
                        return Ok(self.discard_compile(artifact, &diagnostic, trace, calls, dropped));
                    }
                    repairs += 1;
                    let (fixed, made) =
                        repair_with_retries(self.generator, &content, &diagnostic, self.repair_attempts);
                    calls += made;
                    match fixed {
                        Some(f) => content = f,
                        // Nothing new to compile; retrying is pointless.
                        None => {
                            return Ok(self.discard_compile(artifact, &diagnostic, trace, calls, dropped));
                        }
                    }
                }
            }
        }

        // Run phase.
        trace.push(VerifyState::Running);
        let mut mutated = content != artifact.content;
        match self.test_content(project, artifact, &content)? {
            TestOutcome::Passed { .. } => trace.push(VerifyState::Pass),
            TestOutcome::TimedOut => {
                trace.push(VerifyState::Timeout);
                let implicated = self.isolate_methods(project, artifact, &content);
                if implicated.is_empty() {
                    // Cross-test dependency: nothing attributable, the
                    // whole artifact goes.
                    return Ok(self.discard(
                        artifact,
                        "hang not attributable to a single method",
                        trace,
                        calls,
                        dropped,
                    ));
                }
                info!(target = %artifact.target, methods = ?implicated, "dropping hanging methods");
                content = parse::remove_methods(&content, lang, &implicated);
                dropped.extend(implicated);
                mutated = true;
            }
            TestOutcome::Failed { report: Some(report) } => {
                trace.push(VerifyState::PartialFail);
                let (new_content, mut d, mut r, made) =
                    self.repair_failures(project, artifact, &content, &report)?;
                calls += made;
                content = new_content;
                dropped.append(&mut d);
                repaired.append(&mut r);
                mutated = true;
            }
            TestOutcome::Failed { report: None } => {
                // Compiled but failed without a structured report; localize
                // the same way a hang is localized, no repair possible.
                trace.push(VerifyState::PartialFail);
                let implicated = self.isolate_methods(project, artifact, &content);
                if implicated.is_empty() {
                    return Ok(self.discard(
                        artifact,
                        "failure not attributable to a single method",
                        trace,
                        calls,
                        dropped,
                    ));
                }
                content = parse::remove_methods(&content, lang, &implicated);
                dropped.extend(implicated);
                mutated = true;
            }
        }

        let retained = parse::method_names(&content, lang);
        if retained.is_empty() {
            return Ok(self.discard(artifact, "no methods survived verification", trace, calls, dropped));
        }

        // Reload from the authoritative store before acceptance so content
        // merged by other workers meanwhile is not lost.
        let mut final_content = content.clone();
        if let Some(merged) = self.store.file_content(&artifact.rel_path)? {
            if merged != artifact.content && merged != content {
                let mut acc = merged;
                for name in &retained {
                    if let Some(body) = parse::extract_method(&content, lang, name) {
                        acc = parse::merge_method(&acc, lang, name, &body);
                    }
                }
                final_content = acc;
                mutated = true;
            }
        }

        if mutated {
            let compile_ok = matches!(
                self.compile_content(project, artifact, &final_content)?,
                CompileOutcome::Ok
            );
            let tests_ok = compile_ok
                && matches!(
                    self.test_content(project, artifact, &final_content)?,
                    TestOutcome::Passed { .. }
                );
            if !tests_ok {
                return Ok(self.discard(
                    artifact,
                    "repaired artifact failed confirmation run",
                    trace,
                    calls,
                    dropped,
                ));
            }
        }

        trace.push(VerifyState::Repaired);
        Ok(VerifyOutcome {
            state: VerifyState::Repaired,
            content: Some(final_content),
            retained,
            dropped,
            repaired,
            trace,
            generation_calls: calls,
        })
    }

    /// Per-method repair driven by the structured report. Timeouts are
    /// never repaired, only dropped; failing methods get one independent
    /// repair attempt verified in isolation.
    fn repair_failures(
        &self,
        project: &Path,
        artifact: &TestArtifact,
        content: &str,
        report: &TestReport,
    ) -> Result<(String, Vec<String>, Vec<String>, u32)> {
        let lang = artifact.language;
        let mut calls = 0u32;
        let mut dropped = Vec::new();
        let mut repaired = Vec::new();
        let mut acc = content.to_string();

        let timed: Vec<String> = report
            .timed_out()
            .iter()
            .map(|q| simple_name(q).to_string())
            .filter(|n| parse::extract_method(&acc, lang, n).is_some())
            .collect();
        if !timed.is_empty() {
            info!(target = %artifact.target, methods = ?timed, "dropping timed-out methods");
            acc = parse::remove_methods(&acc, lang, &timed);
            dropped.extend(timed);
        }

        for (qualified, message) in report.failing() {
            let name = simple_name(&qualified).to_string();
            let Some(body) = parse::extract_method(&acc, lang, &name) else {
                warn!(target = %artifact.target, %name, "failing method not present in artifact");
                continue;
            };
            let (fixed, made) =
                repair_with_retries(self.generator, &body, &message, self.repair_attempts);
            calls += made;
            let mut keep = false;
            if let Some(new_body) = fixed {
                let solo = parse::keep_only_method(&acc, lang, &name);
                if let Some(solo) = parse::replace_method(&solo, lang, &name, &new_body) {
                    if self.passes_alone(project, artifact, &solo)? {
                        if let Some(next) = parse::replace_method(&acc, lang, &name, &new_body) {
                            acc = next;
                            repaired.push(name.clone());
                            keep = true;
                        }
                    }
                }
            }
            if !keep {
                acc = parse::remove_methods(&acc, lang, std::slice::from_ref(&name));
                dropped.push(name);
            }
        }
        Ok((acc, dropped, repaired, calls))
    }

    /// Localize hanging/failing methods by binary search: a subset
    /// validates when the class reduced to those methods compiles and
    /// passes in its own sandbox.
    fn isolate_methods(&self, project: &Path, artifact: &TestArtifact, content: &str) -> Vec<String> {
        let lang = artifact.language;
        let names = parse::method_names(content, lang);
        if names.is_empty() {
            return Vec::new();
        }
        let validator = |subset: &[String]| -> bool {
            let doomed: Vec<String> = names
                .iter()
                .filter(|n| !subset.contains(*n))
                .cloned()
                .collect();
            let reduced = parse::remove_methods(content, lang, &doomed);
            let compiled = matches!(
                self.compile_content(project, artifact, &reduced),
                Ok(CompileOutcome::Ok)
            );
            compiled
                && matches!(
                    self.test_content(project, artifact, &reduced),
                    Ok(TestOutcome::Passed { .. })
                )
        };
        isolate::isolate(&names, &validator)
    }

    fn passes_alone(&self, project: &Path, artifact: &TestArtifact, solo: &str) -> Result<bool> {
        if !matches!(self.compile_content(project, artifact, solo)?, CompileOutcome::Ok) {
            return Ok(false);
        }
        Ok(matches!(
            self.test_content(project, artifact, solo)?,
            TestOutcome::Passed { .. }
        ))
    }

    fn compile_content(
        &self,
        project: &Path,
        artifact: &TestArtifact,
        content: &str,
    ) -> Result<CompileOutcome> {
        self.in_sandbox(project, artifact, content, |path| self.runner.compile(path))
    }

    fn test_content(
        &self,
        project: &Path,
        artifact: &TestArtifact,
        content: &str,
    ) -> Result<TestOutcome> {
        self.in_sandbox(project, artifact, content, |path| self.runner.test(path))
    }

    /// Run a check against a disposable sandbox holding `content` at the
    /// artifact's path. The sandbox is cleaned up whatever the result.
    fn in_sandbox<T>(
        &self,
        project: &Path,
        artifact: &TestArtifact,
        content: &str,
        check: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let worker = format!("{}-{:06x}", self.worker, fastrand::u32(..));
        let (id, path) = self.sandboxes.create_target_sandbox(
            project,
            &artifact.target.class_name,
            &artifact.target.method_name,
            &worker,
        )?;
        let result = (|| {
            let file = path.join(&artifact.rel_path);
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&file, content)?;
            check(&path)
        })();
        self.sandboxes.cleanup(&id);
        result
    }

    fn discard_compile(
        &self,
        artifact: &TestArtifact,
        diagnostic: &str,
        mut trace: Vec<VerifyState>,
        calls: u32,
        dropped: Vec<String>,
    ) -> VerifyOutcome {
        // The previously-known-good content in the store stays
        // authoritative; nothing from this artifact is accepted.
        warn!(
            target = %artifact.target,
            "compile repair bound exhausted, keeping known-good content and blacklisting"
        );
        self.coordinator.blacklist(
            &artifact.target,
            format!("compile repair exhausted: {}", first_line(diagnostic)),
        );
        trace.push(VerifyState::Discarded);
        VerifyOutcome {
            state: VerifyState::Discarded,
            content: None,
            retained: Vec::new(),
            dropped,
            repaired: Vec::new(),
            trace,
            generation_calls: calls,
        }
    }

    fn discard(
        &self,
        artifact: &TestArtifact,
        reason: &str,
        mut trace: Vec<VerifyState>,
        calls: u32,
        dropped: Vec<String>,
    ) -> VerifyOutcome {
        warn!(target = %artifact.target, reason, "artifact discarded");
        self.coordinator.blacklist(&artifact.target, reason.to_string());
        trace.push(VerifyState::Discarded);
        VerifyOutcome {
            state: VerifyState::Discarded,
            content: None,
            retained: Vec::new(),
            dropped,
            repaired: Vec::new(),
            trace,
            generation_calls: calls,
        }
    }
}

fn simple_name(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}
