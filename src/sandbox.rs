use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{EngineError, Result};

const SKIP_NAMES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "target",
    "dist",
    "build",
    ".next",
    ".nuxt",
];

const SKIP_SUFFIXES: &[&str] = &[".pyc", ".pyo", ".class"];

fn should_skip(name: &str) -> bool {
    SKIP_NAMES.iter().any(|s| *s == name) || SKIP_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn copy_dir_filtered(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if should_skip(&name_str) {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_dir_filtered(&src_path, &dst_path)?;
        } else if ft.is_file() {
            fs::copy(&src_path, &dst_path)?;
        }
        // Skip symlinks and other special files
    }
    Ok(())
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Creates and destroys isolated copies of a project tree under one
/// scratch root. The registry of live sandboxes is shared across workers;
/// no two live sandboxes ever share a filesystem path because ids map
/// one-to-one onto directories and id collisions are rejected.
pub struct SandboxManager {
    scratch_root: PathBuf,
    registry: Mutex<HashMap<String, PathBuf>>,
}

impl SandboxManager {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        SandboxManager {
            scratch_root: scratch_root.into(),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Copy `source_tree` into a fresh directory, excluding build artifacts
    /// and VCS metadata. Fails if the id collides with a live sandbox or
    /// the copy cannot complete.
    pub fn create(&self, source_tree: &Path, id: &str) -> Result<PathBuf> {
        let dest = self.scratch_root.join(id);
        {
            let mut registry = self.registry.lock();
            if registry.contains_key(id) {
                return Err(EngineError::SandboxCreation(format!(
                    "sandbox id '{}' is already live",
                    id
                )));
            }
            registry.insert(id.to_string(), dest.clone());
        }
        if let Err(e) = copy_dir_filtered(source_tree, &dest) {
            self.registry.lock().remove(id);
            let _ = fs::remove_dir_all(&dest);
            return Err(EngineError::SandboxCreation(format!(
                "failed to copy {} into {}: {}",
                source_tree.display(),
                dest.display(),
                e
            )));
        }
        Ok(dest)
    }

    /// Derive a collision-resistant id from the target plus timestamp and
    /// worker identity, then create the sandbox.
    pub fn create_target_sandbox(
        &self,
        source_tree: &Path,
        class_name: &str,
        method_name: &str,
        worker: &str,
    ) -> Result<(String, PathBuf)> {
        let id = format!(
            "{}-{}-{}-{}",
            sanitize(class_name),
            sanitize(method_name),
            now_millis(),
            sanitize(worker),
        );
        let path = self.create(source_tree, &id)?;
        Ok((id, path))
    }

    /// Remove the sandbox directory and unregister it. Idempotent: an
    /// unknown id is logged as a warning, never an error, so workers can
    /// always clean up in a finally-equivalent block.
    pub fn cleanup(&self, id: &str) {
        let removed = self.registry.lock().remove(id);
        match removed {
            Some(path) => {
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!(id, path = %path.display(), "failed to remove sandbox directory: {}", e);
                }
            }
            None => warn!(id, "cleanup of unknown sandbox id"),
        }
    }

    pub fn live(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn live_count(&self) -> usize {
        self.registry.lock().len()
    }
}
