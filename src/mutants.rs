use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A single localized source modification. Line range plus exact original
/// text so application can detect drift in the underlying file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Project-relative path of the file the patch targets.
    pub file: String,
    /// 1-based first line of the replaced region.
    pub start_line: usize,
    /// 1-based last line of the replaced region (inclusive).
    pub end_line: usize,
    pub original: String,
    pub mutated: String,
}

impl Patch {
    /// Apply to full file content. Fails if the line range is out of bounds
    /// or the text at the range no longer matches `original`.
    pub fn apply(&self, content: &str) -> Result<String, EngineError> {
        if self.start_line == 0 || self.end_line < self.start_line {
            return Err(EngineError::PatchApplication {
                file: self.file.clone(),
                reason: format!("invalid line range {}..{}", self.start_line, self.end_line),
            });
        }
        let lines: Vec<&str> = content.lines().collect();
        if self.end_line > lines.len() {
            return Err(EngineError::PatchApplication {
                file: self.file.clone(),
                reason: format!(
                    "range {}..{} exceeds file length {}",
                    self.start_line,
                    self.end_line,
                    lines.len()
                ),
            });
        }
        let region = lines[self.start_line - 1..self.end_line].join("\n");
        if region != self.original.trim_end_matches('\n') {
            return Err(EngineError::PatchApplication {
                file: self.file.clone(),
                reason: format!("text at lines {}..{} does not match", self.start_line, self.end_line),
            });
        }
        let mut out: Vec<&str> = Vec::with_capacity(lines.len());
        out.extend_from_slice(&lines[..self.start_line - 1]);
        out.extend(self.mutated.trim_end_matches('\n').lines());
        out.extend_from_slice(&lines[self.end_line..]);
        let mut joined = out.join("\n");
        if content.ends_with('\n') {
            joined.push('\n');
        }
        Ok(joined)
    }

    /// Deleted/inserted lines only, for display and audit logs.
    pub fn render_diff(&self) -> String {
        use similar::TextDiff;
        let diff = TextDiff::from_lines(self.original.as_str(), self.mutated.as_str());
        let mut output = String::new();
        for change in diff.iter_all_changes() {
            match change.tag() {
                similar::ChangeTag::Delete => output.push_str(&format!("- {}", change)),
                similar::ChangeTag::Insert => output.push_str(&format!("+ {}", change)),
                _ => {}
            }
        }
        output
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutantStatus {
    Pending,
    Valid,
    Invalid,
    Killed,
    Survived,
    Outdated,
}

impl MutantStatus {
    /// Allowed lifecycle edges. Pending resolves once to Valid or Invalid;
    /// a Valid mutant resolves once per evaluation epoch to Killed,
    /// Survived, or Outdated. Killed/Survived may only move to Outdated.
    fn can_transition(self, next: MutantStatus) -> bool {
        use MutantStatus::*;
        matches!(
            (self, next),
            (Pending, Valid)
                | (Pending, Invalid)
                | (Valid, Killed)
                | (Valid, Survived)
                | (Valid, Outdated)
                | (Killed, Outdated)
                | (Survived, Outdated)
        )
    }
}

/// One mutant: identity, owning target, exactly one patch. Immutable after
/// creation except for status and evaluation fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutant {
    pub id: String,
    pub class_name: String,
    pub method_name: String,
    pub patch: Patch,
    status: MutantStatus,
    pub killed_by: Vec<String>,
    pub evaluated_at_ms: Option<u64>,
}

impl Mutant {
    pub fn new(
        id: impl Into<String>,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        patch: Patch,
    ) -> Self {
        Mutant {
            id: id.into(),
            class_name: class_name.into(),
            method_name: method_name.into(),
            patch,
            status: MutantStatus::Pending,
            killed_by: Vec::new(),
            evaluated_at_ms: None,
        }
    }

    pub fn status(&self) -> MutantStatus {
        self.status
    }

    /// Attempt a status transition. Returns false (and leaves the mutant
    /// untouched) if the edge is not in the lifecycle.
    pub fn transition(&mut self, next: MutantStatus) -> bool {
        if self.status.can_transition(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Record the outcome of an evaluation pass. Empty killers means the
    /// mutant survived. No-op (returns false) unless the mutant is Valid.
    pub fn record_evaluation(&mut self, killers: Vec<String>, now_ms: u64) -> bool {
        let next = if killers.is_empty() {
            MutantStatus::Survived
        } else {
            MutantStatus::Killed
        };
        if !self.transition(next) {
            return false;
        }
        self.killed_by = killers;
        self.evaluated_at_ms = Some(now_ms);
        true
    }

    /// Counts toward active scoring. Invalid and Outdated mutants are kept
    /// for audit but excluded.
    pub fn is_active(&self) -> bool {
        !matches!(self.status, MutantStatus::Invalid | MutantStatus::Outdated)
    }
}

/// Sparse mapping from mutant id to the set of test-case ids observed to
/// fail against it. Append-only within one evaluation pass; a new pass
/// builds a new matrix rather than mutating an old one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillMatrix {
    kills: BTreeMap<String, BTreeSet<String>>,
}

impl KillMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mutant in the evaluation set with no kills yet.
    pub fn touch(&mut self, mutant_id: &str) {
        self.kills.entry(mutant_id.to_string()).or_default();
    }

    pub fn record_kill(&mut self, mutant_id: &str, test_id: &str) {
        self.kills
            .entry(mutant_id.to_string())
            .or_default()
            .insert(test_id.to_string());
    }

    /// A mutant is killed iff its entry is non-empty.
    pub fn is_killed(&self, mutant_id: &str) -> bool {
        self.kills.get(mutant_id).is_some_and(|s| !s.is_empty())
    }

    pub fn killers_of(&self, mutant_id: &str) -> Vec<String> {
        self.kills
            .get(mutant_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, mutant_id: &str) -> bool {
        self.kills.contains_key(mutant_id)
    }

    pub fn killed_count(&self) -> usize {
        self.kills.values().filter(|s| !s.is_empty()).count()
    }

    pub fn evaluated_count(&self) -> usize {
        self.kills.len()
    }

    pub fn mutant_ids(&self) -> impl Iterator<Item = &String> {
        self.kills.keys()
    }
}
