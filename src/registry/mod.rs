//! Suite registry
//!
//! The registry is a tree of suites loaded once from YAML manifests at
//! startup. Structure, hook commands, and source-file tags are read-only
//! after loading; only the transient per-run marks are mutated, and only
//! inside the single-flight run window.

pub mod filter;
pub mod path_match;
pub mod walker;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::common::{Error, Result};

/// A named grouping of tests, optionally nesting further suites
#[derive(Debug, Clone, Deserialize)]
pub struct SuiteNode {
    /// Suite title; fully-qualified titles join ancestor titles with a space
    pub title: String,

    /// Source file this suite is attributed to
    ///
    /// Tagged at load time for top-level manifest suites; descendants
    /// without their own tag inherit the nearest ancestor's at traversal
    /// time. Never resolved upward from descendants.
    #[serde(rename = "file", default)]
    pub source_file: Option<String>,

    /// Lifecycle hook commands
    #[serde(flatten)]
    pub hooks: Hooks,

    /// Test cases directly owned by this suite
    #[serde(default)]
    pub tests: Vec<TestCase>,

    /// Nested suites
    #[serde(default)]
    pub children: Vec<SuiteNode>,

    /// Transient run state, cleared by [`Registry::reset_transient_state`]
    #[serde(skip)]
    pub marks: SuiteMarks,
}

/// Shell commands run around a suite's tests
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub before_all: Option<String>,
    #[serde(default)]
    pub after_all: Option<String>,
    #[serde(default)]
    pub before_each: Option<String>,
    #[serde(default)]
    pub after_each: Option<String>,
}

/// A single test case: a shell command whose exit status decides the outcome
#[derive(Debug, Clone, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub command: String,

    /// Report the test as pending instead of executing it
    #[serde(default)]
    pub skip: bool,

    /// Transient run state
    #[serde(skip)]
    pub marks: TestMarks,
}

/// Transient per-suite run state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuiteMarks {
    /// A lifecycle hook failed, skipping the rest of the suite
    pub hook_failed: bool,
    /// All selected tests of the suite were visited
    pub completed: bool,
}

/// Transient per-test run state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestMarks {
    pub outcome: Option<TestOutcome>,
    pub attempts: u32,
    pub duration_ms: Option<u64>,
}

/// Outcome of one executed (or skipped) test
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Pending,
}

/// Top-level manifest file schema
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    suites: Vec<SuiteNode>,
}

/// The loaded suite tree
#[derive(Debug, Default)]
pub struct Registry {
    roots: Vec<SuiteNode>,
}

impl Registry {
    /// Build a registry from already-constructed roots (used by tests)
    pub fn new(roots: Vec<SuiteNode>) -> Self {
        Self { roots }
    }

    /// Load every YAML manifest under `dir`, recursively
    ///
    /// Files are visited in sorted order so registration order is stable.
    /// Top-level suites without an explicit `file:` are tagged with the
    /// manifest's path relative to `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::ManifestDirMissing(dir.display().to_string()));
        }

        let mut roots = Vec::new();
        for manifest_path in yaml_files(dir)? {
            let content = std::fs::read_to_string(&manifest_path).map_err(|e| Error::FileRead {
                path: manifest_path.display().to_string(),
                error: e.to_string(),
            })?;
            let manifest: Manifest = serde_yaml::from_str(&content)
                .map_err(|e| Error::manifest_parse(&manifest_path, e))?;

            let tag = manifest_path
                .strip_prefix(dir)
                .unwrap_or(&manifest_path)
                .to_string_lossy()
                .replace('\\', "/");

            for mut suite in manifest.suites {
                if suite.source_file.is_none() {
                    suite.source_file = Some(tag.clone());
                }
                roots.push(suite);
            }
        }

        Ok(Self { roots })
    }

    /// Ordered top-level suites
    pub fn roots(&self) -> &[SuiteNode] {
        &self.roots
    }

    /// Number of top-level suites, reported by the health endpoint
    pub fn top_level_count(&self) -> usize {
        self.roots.len()
    }

    /// Clear all transient run state so the tree can be run again cleanly
    ///
    /// Structure, hooks, and source-file tags are untouched.
    pub fn reset_transient_state(&mut self) {
        fn reset(node: &mut SuiteNode) {
            node.marks = SuiteMarks::default();
            for test in &mut node.tests {
                test.marks = TestMarks::default();
            }
            for child in &mut node.children {
                reset(child);
            }
        }
        for root in &mut self.roots {
            reset(root);
        }
    }

    /// Mutable access to a node addressed by its child-index path
    pub fn node_at_mut(&mut self, path: &[usize]) -> Option<&mut SuiteNode> {
        let (first, rest) = path.split_first()?;
        let mut node = self.roots.get_mut(*first)?;
        for index in rest {
            node = node.children.get_mut(*index)?;
        }
        Some(node)
    }
}

/// Collect `*.yaml`/`*.yml` files under `dir` in sorted order
fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![dir.to_path_buf()];
    while let Some(current) = dirs.pop() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&current)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                dirs.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
