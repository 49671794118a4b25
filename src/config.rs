use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Language;
use crate::error::{EngineError, Result};
use crate::target::Target;

/// Knobs for the batch loop. Everything has a workable default so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Targets claimed per batch.
    pub batch_size: usize,
    /// Concurrent workers (one per claimed target, capped here).
    pub worker_count: usize,
    /// Parallelism of the kill-matrix builder.
    pub mutant_parallelism: usize,
    pub max_iterations: u32,
    /// Total generator-call ceiling for the run.
    pub generation_budget: u32,
    /// Consecutive no-improvement batches before stopping.
    pub stall_batches: u32,
    /// Minimum mutation-score or line-coverage delta that counts as
    /// improvement.
    pub improvement_threshold: f64,
    pub excellent_mutation_score: f64,
    pub excellent_line_coverage: f64,
    pub excellent_branch_coverage: f64,
    /// Wall-clock bound on one worker before its target is released as
    /// failed.
    pub worker_timeout_ms: u64,
    /// Whether processed targets may be selected again in later batches.
    pub allow_reprocess: bool,
    /// Class-level compile repair rounds before blacklisting.
    pub max_compile_repairs: u32,
    /// Generator calls per proposal/repair request.
    pub generation_attempts: u32,
    /// Cap on the action and improvement logs.
    pub history_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            batch_size: 4,
            worker_count: 4,
            mutant_parallelism: 4,
            max_iterations: 10,
            generation_budget: 200,
            stall_batches: 3,
            improvement_threshold: 0.01,
            excellent_mutation_score: 0.9,
            excellent_line_coverage: 0.9,
            excellent_branch_coverage: 0.8,
            worker_timeout_ms: 300_000,
            allow_reprocess: true,
            max_compile_repairs: 3,
            generation_attempts: 3,
            history_cap: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub compile_cmd: String,
    pub test_cmd: String,
    pub coverage_cmd: String,
    pub report_file: String,
    pub coverage_file: String,
    pub timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            compile_cmd: "true".into(),
            test_cmd: "pytest".into(),
            coverage_cmd: "pytest --cov".into(),
            report_file: "report.json".into(),
            coverage_file: "coverage.json".into(),
            timeout_ms: 60_000,
        }
    }
}

/// Full project configuration, loaded from JSON and merged with CLI flags
/// (CLI wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub language: Language,
    /// (class, method) pairs eligible for selection.
    pub targets: Vec<Target>,
    /// Class name -> project-relative source file.
    pub class_files: BTreeMap<String, String>,
    /// External generator command (JSON over stdin/stdout).
    pub generator_cmd: String,
    #[serde(default = "default_generator_timeout_ms")]
    pub generator_timeout_ms: u64,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

fn default_generator_timeout_ms() -> u64 {
    120_000
}

pub fn load(path: &Path) -> Result<ProjectConfig> {
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data)
        .map_err(|e| EngineError::Store(format!("invalid config {}: {}", path.display(), e)))
}
