use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::target::Target;

/// Global run counters and bounded history. Mutated only under the
/// scheduler's own lock; workers never reach into this directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub iteration: u32,
    pub mutants_total: usize,
    pub mutants_killed: usize,
    pub mutants_survived: usize,
    pub mutation_score: f64,
    pub line_coverage: f64,
    pub branch_coverage: f64,
    pub generation_calls: u32,
    pub merge_conflicts: usize,
    pub stalled_batches: u32,
    pub action_log: VecDeque<String>,
    pub improvement_log: VecDeque<f64>,
}

impl RunState {
    pub fn log_action(&mut self, cap: usize, action: impl Into<String>) {
        self.action_log.push_back(action.into());
        while self.action_log.len() > cap {
            self.action_log.pop_front();
        }
    }

    pub fn log_improvement(&mut self, cap: usize, delta: f64) {
        self.improvement_log.push_back(delta);
        while self.improvement_log.len() > cap {
            self.improvement_log.pop_front();
        }
    }
}

/// Serializable snapshot sufficient to resume a run after interruption.
/// Previously-active targets are recorded so a resume can report them;
/// their claims do not survive the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub state: RunState,
    pub processed: Vec<Target>,
    pub blacklist: Vec<(Target, String)>,
    pub active: Vec<Target>,
}

pub fn default_state_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".coevolve-state.json")
}

pub fn save_to_path(snapshot: &RunSnapshot, path: &Path) {
    match serde_json::to_string(snapshot) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!(path = %path.display(), "failed to persist run state: {}", e);
            }
        }
        Err(e) => warn!("failed to encode run state: {}", e),
    }
}

pub fn load_from_path(path: &Path) -> Option<RunSnapshot> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}
