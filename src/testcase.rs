use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One generated test method. The version is bumped only when the body
/// actually changes, so repeated identical writes are idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMethod {
    pub name: String,
    pub body: String,
    pub version: u32,
}

impl TestMethod {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        TestMethod {
            name: name.into(),
            body: body.into(),
            version: 1,
        }
    }
}

/// A generated test class owning an ordered collection of methods.
/// Methods are uniquely keyed by (case id, method name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    /// Name of the test class itself.
    pub class_name: String,
    /// Name of the class under test.
    pub target_class: String,
    /// Project-relative path of the test file.
    pub rel_path: String,
    pub methods: Vec<TestMethod>,
}

impl TestCase {
    pub fn new(
        id: impl Into<String>,
        class_name: impl Into<String>,
        target_class: impl Into<String>,
        rel_path: impl Into<String>,
    ) -> Self {
        TestCase {
            id: id.into(),
            class_name: class_name.into(),
            target_class: target_class.into(),
            rel_path: rel_path.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(&self, name: &str) -> Option<&TestMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Insert or update a method. Returns the resulting version; the
    /// version only increases when the body differs.
    pub fn upsert_method(&mut self, name: &str, body: &str) -> u32 {
        if let Some(m) = self.methods.iter_mut().find(|m| m.name == name) {
            if m.body != body {
                m.body = body.to_string();
                m.version += 1;
            }
            m.version
        } else {
            self.methods.push(TestMethod::new(name, body));
            1
        }
    }

    pub fn remove_method(&mut self, name: &str) -> bool {
        let before = self.methods.len();
        self.methods.retain(|m| m.name != name);
        self.methods.len() != before
    }

    /// Fully-qualified method names as they appear in test reports.
    pub fn qualified_names(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|m| format!("{}.{}", self.class_name, m.name))
            .collect()
    }
}

/// Merged "current" view across all cases targeting one class: the latest
/// version of each method name wins. Later-versioned duplicates shadow
/// earlier ones regardless of which case they came from.
pub fn current_view<'a, I>(cases: I) -> BTreeMap<String, &'a TestMethod>
where
    I: IntoIterator<Item = &'a TestCase>,
{
    let mut view: BTreeMap<String, &'a TestMethod> = BTreeMap::new();
    for case in cases {
        for method in &case.methods {
            match view.get(&method.name) {
                Some(existing) if existing.version >= method.version => {}
                _ => {
                    view.insert(method.name.clone(), method);
                }
            }
        }
    }
    view
}
