use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Result;
use crate::report::{self, CoverageReport, TestReport};

/// Compilation outcome. Timeout is a distinguished result, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    Ok,
    Failed { diagnostic: String },
    TimedOut,
}

/// Test-run outcome. A missing report on failure implies the build itself
/// broke inside the test command.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    Passed { report: Option<TestReport> },
    Failed { report: Option<TestReport> },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoverageOutcome {
    Ok { coverage: CoverageReport },
    Failed { diagnostic: String },
    TimedOut,
}

/// Compiles and executes a project directory. Implementations must be safe
/// to call concurrently from multiple workers against disjoint sandboxes.
pub trait Runner: Send + Sync {
    fn compile(&self, project: &Path) -> Result<CompileOutcome>;
    fn test(&self, project: &Path) -> Result<TestOutcome>;
    fn test_with_coverage(&self, project: &Path) -> Result<CoverageOutcome>;
}

pub fn parse_test_cmd(cmd: &str) -> (String, Vec<String>) {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    if parts.len() > 1 {
        (
            parts[0].to_string(),
            parts[1..].iter().map(|s| s.to_string()).collect(),
        )
    } else {
        (cmd.to_string(), vec![])
    }
}

enum ExecResult {
    Exited {
        success: bool,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(String),
}

/// Spawn a command in `working_dir` and poll until exit or deadline,
/// killing the child on timeout.
fn run_with_timeout(cmd_line: &str, working_dir: &Path, timeout: Duration) -> ExecResult {
    let (program, args) = parse_test_cmd(cmd_line);
    let mut cmd = Command::new(&program);
    for arg in &args {
        cmd.arg(arg);
    }
    let child = cmd
        .current_dir(working_dir)
        .env("OBJC_DISABLE_INITIALIZE_FORK_SAFETY", "YES")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match child {
        Ok(c) => c,
        Err(e) => return ExecResult::SpawnFailed(format!("failed to run {}: {}", cmd_line, e)),
    };

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(exit_status)) => {
                let mut stdout = String::new();
                let mut stderr = String::new();
                if let Some(mut s) = child.stdout.take() {
                    let _ = std::io::Read::read_to_string(&mut s, &mut stdout);
                }
                if let Some(mut s) = child.stderr.take() {
                    let _ = std::io::Read::read_to_string(&mut s, &mut stderr);
                }
                return ExecResult::Exited {
                    success: exit_status.success(),
                    stdout,
                    stderr,
                };
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return ExecResult::TimedOut;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return ExecResult::SpawnFailed(format!("wait on {} failed: {}", cmd_line, e)),
        }
    }
}

/// Subprocess-backed runner. Commands run with the sandbox as working
/// directory; structured reports are read from configured relative paths
/// after each run (and removed, so a stale report never masks a crash).
pub struct ProcessRunner {
    pub compile_cmd: String,
    pub test_cmd: String,
    pub coverage_cmd: String,
    /// Relative path where the test command writes its JSON report.
    pub report_file: PathBuf,
    /// Relative path where the coverage command writes its JSON report.
    pub coverage_file: PathBuf,
    pub timeout_ms: u64,
}

impl ProcessRunner {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn take_report(&self, project: &Path) -> Option<String> {
        let path = project.join(&self.report_file);
        let content = std::fs::read_to_string(&path).ok();
        let _ = std::fs::remove_file(&path);
        content
    }

    fn take_coverage(&self, project: &Path) -> Option<String> {
        let path = project.join(&self.coverage_file);
        let content = std::fs::read_to_string(&path).ok();
        let _ = std::fs::remove_file(&path);
        content
    }
}

impl Runner for ProcessRunner {
    fn compile(&self, project: &Path) -> Result<CompileOutcome> {
        match run_with_timeout(&self.compile_cmd, project, self.timeout()) {
            ExecResult::Exited { success: true, .. } => Ok(CompileOutcome::Ok),
            ExecResult::Exited {
                success: false,
                stdout,
                stderr,
            } => Ok(CompileOutcome::Failed {
                diagnostic: format!("{}\n{}", stdout, stderr),
            }),
            ExecResult::TimedOut => Ok(CompileOutcome::TimedOut),
            ExecResult::SpawnFailed(msg) => Ok(CompileOutcome::Failed { diagnostic: msg }),
        }
    }

    fn test(&self, project: &Path) -> Result<TestOutcome> {
        match run_with_timeout(&self.test_cmd, project, self.timeout()) {
            ExecResult::Exited { success, stderr, .. } => {
                let report = self.take_report(project).and_then(|c| report::parse_test_report(&c));
                if report.is_none() {
                    debug!(project = %project.display(), "test run left no structured report: {}", stderr);
                }
                if success {
                    Ok(TestOutcome::Passed { report })
                } else {
                    Ok(TestOutcome::Failed { report })
                }
            }
            ExecResult::TimedOut => Ok(TestOutcome::TimedOut),
            ExecResult::SpawnFailed(_) => Ok(TestOutcome::Failed { report: None }),
        }
    }

    fn test_with_coverage(&self, project: &Path) -> Result<CoverageOutcome> {
        match run_with_timeout(&self.coverage_cmd, project, self.timeout()) {
            ExecResult::Exited { success: true, .. } => {
                match self
                    .take_coverage(project)
                    .and_then(|c| report::parse_coverage_report(&c))
                {
                    Some(coverage) => Ok(CoverageOutcome::Ok { coverage }),
                    None => Ok(CoverageOutcome::Failed {
                        diagnostic: "coverage run produced no parsable report".into(),
                    }),
                }
            }
            ExecResult::Exited { success: false, stdout, stderr } => Ok(CoverageOutcome::Failed {
                diagnostic: format!("{}\n{}", stdout, stderr),
            }),
            ExecResult::TimedOut => Ok(CoverageOutcome::TimedOut),
            ExecResult::SpawnFailed(msg) => Ok(CoverageOutcome::Failed { diagnostic: msg }),
        }
    }
}
