use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::Result;
use crate::mutants::{Mutant, MutantStatus};
use crate::report::CoverageReport;
use crate::target::Target;
use crate::testcase::{TestCase, TestMethod};

/// Authoritative persistence for mutants, test cases, class-file mappings,
/// workspace file contents, and coverage. The store is the only place
/// cross-batch state is durably merged; worker memory is advisory until
/// synced here.
pub trait Store: Send + Sync {
    fn put_mutant(&self, mutant: &Mutant) -> Result<()>;
    fn mutant(&self, id: &str) -> Result<Option<Mutant>>;
    fn all_mutants(&self) -> Result<Vec<Mutant>>;
    /// Mutants that have completed an evaluation pass (killed or survived).
    fn all_evaluated_mutants(&self) -> Result<Vec<Mutant>>;
    fn mutants_for_target(&self, target: &Target) -> Result<Vec<Mutant>>;

    fn put_test_case(&self, case: &TestCase) -> Result<()>;
    fn test_case(&self, id: &str) -> Result<Option<TestCase>>;
    /// The current test-case set, one entry per case id.
    fn current_test_cases(&self) -> Result<Vec<TestCase>>;
    /// All recorded versions of one method, oldest first.
    fn method_history(&self, case_id: &str, method_name: &str) -> Result<Vec<TestMethod>>;

    fn map_class_file(&self, class_name: &str, rel_path: &str) -> Result<()>;
    fn class_file(&self, class_name: &str) -> Result<Option<String>>;

    /// Known-good merged content of a workspace file.
    fn put_file_content(&self, rel_path: &str, content: &str) -> Result<()>;
    fn file_content(&self, rel_path: &str) -> Result<Option<String>>;
    fn all_files(&self) -> Result<BTreeMap<String, String>>;

    fn put_coverage(&self, coverage: &CoverageReport) -> Result<()>;
    fn coverage(&self) -> Result<CoverageReport>;
}

#[derive(Default)]
struct MemoryInner {
    mutants: BTreeMap<String, Mutant>,
    cases: BTreeMap<String, TestCase>,
    method_history: HashMap<(String, String), Vec<TestMethod>>,
    class_files: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
    coverage: CoverageReport,
}

/// In-memory reference store. Everything sits behind one lock; reads clone
/// out so callers never hold store state across their own locking.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put_mutant(&self, mutant: &Mutant) -> Result<()> {
        self.inner
            .lock()
            .mutants
            .insert(mutant.id.clone(), mutant.clone());
        Ok(())
    }

    fn mutant(&self, id: &str) -> Result<Option<Mutant>> {
        Ok(self.inner.lock().mutants.get(id).cloned())
    }

    fn all_mutants(&self) -> Result<Vec<Mutant>> {
        Ok(self.inner.lock().mutants.values().cloned().collect())
    }

    fn all_evaluated_mutants(&self) -> Result<Vec<Mutant>> {
        Ok(self
            .inner
            .lock()
            .mutants
            .values()
            .filter(|m| matches!(m.status(), MutantStatus::Killed | MutantStatus::Survived))
            .cloned()
            .collect())
    }

    fn mutants_for_target(&self, target: &Target) -> Result<Vec<Mutant>> {
        Ok(self
            .inner
            .lock()
            .mutants
            .values()
            .filter(|m| m.class_name == target.class_name && m.method_name == target.method_name)
            .cloned()
            .collect())
    }

    fn put_test_case(&self, case: &TestCase) -> Result<()> {
        let mut inner = self.inner.lock();
        for method in &case.methods {
            let key = (case.id.clone(), method.name.clone());
            let history = inner.method_history.entry(key).or_default();
            if history.last().map(|m| m.version) != Some(method.version) {
                history.push(method.clone());
            }
        }
        inner.cases.insert(case.id.clone(), case.clone());
        Ok(())
    }

    fn test_case(&self, id: &str) -> Result<Option<TestCase>> {
        Ok(self.inner.lock().cases.get(id).cloned())
    }

    fn current_test_cases(&self) -> Result<Vec<TestCase>> {
        Ok(self.inner.lock().cases.values().cloned().collect())
    }

    fn method_history(&self, case_id: &str, method_name: &str) -> Result<Vec<TestMethod>> {
        Ok(self
            .inner
            .lock()
            .method_history
            .get(&(case_id.to_string(), method_name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn map_class_file(&self, class_name: &str, rel_path: &str) -> Result<()> {
        self.inner
            .lock()
            .class_files
            .insert(class_name.to_string(), rel_path.to_string());
        Ok(())
    }

    fn class_file(&self, class_name: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().class_files.get(class_name).cloned())
    }

    fn put_file_content(&self, rel_path: &str, content: &str) -> Result<()> {
        self.inner
            .lock()
            .files
            .insert(rel_path.to_string(), content.to_string());
        Ok(())
    }

    fn file_content(&self, rel_path: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().files.get(rel_path).cloned())
    }

    fn all_files(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.inner.lock().files.clone())
    }

    fn put_coverage(&self, coverage: &CoverageReport) -> Result<()> {
        self.inner.lock().coverage = coverage.clone();
        Ok(())
    }

    fn coverage(&self) -> Result<CoverageReport> {
        Ok(self.inner.lock().coverage.clone())
    }
}
