use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::mutants::Patch;

/// Black-box candidate proposer. May return empty results on failure;
/// callers retry a bounded number of times and otherwise treat the outcome
/// as "no candidates".
pub trait Generator: Send + Sync {
    /// Propose mutant patches for a class, optionally scoped to one method.
    fn propose_mutants(
        &self,
        class_name: &str,
        code: &str,
        target_method: Option<&str>,
    ) -> Result<Vec<Patch>>;

    /// Propose test method bodies for a method under test.
    fn propose_tests(
        &self,
        class_name: &str,
        method_signature: &str,
        code: &str,
        existing_tests: &[String],
    ) -> Result<Vec<String>>;

    /// Repair code given a compiler diagnostic or test failure message.
    /// None means the generator could not produce a fix.
    fn repair(&self, code: &str, diagnostic: &str) -> Result<Option<String>>;
}

pub const DEFAULT_GENERATION_ATTEMPTS: u32 = 3;

/// Retry a proposal call until it yields candidates or the attempt bound is
/// exhausted. Returns the candidates (possibly empty) and the number of
/// calls actually made, for budget accounting.
pub fn propose_with_retries<T, F>(attempts: u32, mut call: F) -> (Vec<T>, u32)
where
    F: FnMut() -> Result<Vec<T>>,
{
    let mut calls = 0;
    for _ in 0..attempts.max(1) {
        calls += 1;
        match call() {
            Ok(candidates) if !candidates.is_empty() => return (candidates, calls),
            Ok(_) => {}
            Err(e) => warn!("generation call failed: {}", e),
        }
    }
    (Vec::new(), calls)
}

/// Retry a repair call. Returns the repaired code (if any) and call count.
pub fn repair_with_retries(
    generator: &dyn Generator,
    code: &str,
    diagnostic: &str,
    attempts: u32,
) -> (Option<String>, u32) {
    let mut calls = 0;
    for _ in 0..attempts.max(1) {
        calls += 1;
        match generator.repair(code, diagnostic) {
            Ok(Some(fixed)) if fixed != code => return (Some(fixed), calls),
            Ok(_) => {}
            Err(e) => warn!("repair call failed: {}", e),
        }
    }
    (None, calls)
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum GeneratorRequest<'a> {
    ProposeMutants {
        class_name: &'a str,
        code: &'a str,
        target_method: Option<&'a str>,
    },
    ProposeTests {
        class_name: &'a str,
        method_signature: &'a str,
        code: &'a str,
        existing_tests: &'a [String],
    },
    Repair {
        code: &'a str,
        diagnostic: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum GeneratorResponse {
    Mutants(Vec<Patch>),
    Tests(Vec<String>),
    Repaired(Option<String>),
}

/// Adapter that shells out to an external generator process. One JSON
/// request on stdin, one JSON response on stdout, per invocation.
pub struct CommandGenerator {
    pub cmd: String,
    pub timeout_ms: u64,
}

impl CommandGenerator {
    fn invoke(&self, request: &GeneratorRequest<'_>) -> Result<GeneratorResponse> {
        let payload = serde_json::to_string(request)
            .map_err(|e| EngineError::Generator(format!("encode request: {}", e)))?;

        let (program, args) = crate::runner::parse_test_cmd(&self.cmd);
        let mut cmd = Command::new(&program);
        for arg in &args {
            cmd.arg(arg);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Generator(format!("failed to run {}: {}", self.cmd, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .map_err(|e| EngineError::Generator(format!("write request: {}", e)))?;
        }

        let deadline = Duration::from_millis(self.timeout_ms);
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut stdout = String::new();
                    if let Some(mut s) = child.stdout.take() {
                        let _ = std::io::Read::read_to_string(&mut s, &mut stdout);
                    }
                    if !status.success() {
                        return Err(EngineError::Generator(format!(
                            "{} exited with {}",
                            self.cmd, status
                        )));
                    }
                    return serde_json::from_str(&stdout)
                        .map_err(|e| EngineError::Generator(format!("decode response: {}", e)));
                }
                Ok(None) => {
                    if start.elapsed() > deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(EngineError::Timeout(self.timeout_ms));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(EngineError::Generator(format!("wait on {}: {}", self.cmd, e)));
                }
            }
        }
    }
}

impl Generator for CommandGenerator {
    fn propose_mutants(
        &self,
        class_name: &str,
        code: &str,
        target_method: Option<&str>,
    ) -> Result<Vec<Patch>> {
        match self.invoke(&GeneratorRequest::ProposeMutants {
            class_name,
            code,
            target_method,
        })? {
            GeneratorResponse::Mutants(patches) => Ok(patches),
            _ => Err(EngineError::Generator("unexpected response kind".into())),
        }
    }

    fn propose_tests(
        &self,
        class_name: &str,
        method_signature: &str,
        code: &str,
        existing_tests: &[String],
    ) -> Result<Vec<String>> {
        match self.invoke(&GeneratorRequest::ProposeTests {
            class_name,
            method_signature,
            code,
            existing_tests,
        })? {
            GeneratorResponse::Tests(tests) => Ok(tests),
            _ => Err(EngineError::Generator("unexpected response kind".into())),
        }
    }

    fn repair(&self, code: &str, diagnostic: &str) -> Result<Option<String>> {
        match self.invoke(&GeneratorRequest::Repair { code, diagnostic })? {
            GeneratorResponse::Repaired(fixed) => Ok(fixed),
            _ => Err(EngineError::Generator("unexpected response kind".into())),
        }
    }
}
