//! Partitioning of local tests by the remote fixture they depend on.
//!
//! Local tests run on the DUT, but a test's fixture chain may bottom out in a remote fixture
//! that runs on the orchestrator's side. Such tests can only run while that fixture is set
//! up, so they are grouped by it, and each group is run between a push and a pop of the
//! fixture.

use std::collections::{BTreeMap, HashMap, HashSet};

use dutrun_protocol::{BundleEntity, Entity};
use thiserror::Error;

/// Bound on the length of a fixture chain. Real chains are a handful of fixtures long.
pub const MAX_FIXTURE_DEPTH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CategorizeError {
    #[error("remote fixture {name} has parent fixture {parent}; remote fixtures cannot have parents")]
    RemoteFixtureHasParent { name: String, parent: String },
    #[error("remote fixture {name} is defined by both bundle {first} and bundle {second}")]
    DuplicateRemoteFixture {
        name: String,
        first: String,
        second: String,
    },
    #[error("fixture {name} not found in bundle {bundle}")]
    UnknownFixture { bundle: String, name: String },
    #[error("cycle detected at fixture {name} in bundle {bundle} (strengthened check)")]
    Cycle { bundle: String, name: String },
    #[error(
        "fixture chain from {name} in bundle {bundle} is longer than {MAX_FIXTURE_DEPTH} (strengthened check)"
    )]
    TooDeep { bundle: String, name: String },
}

/// Tests of one bundle that depend on the same remote fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureGroup {
    /// The remote fixture to set up around these tests, or empty for none.
    pub remote_fixture: String,
    pub tests: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleTests {
    pub bundle: String,
    /// Sorted by remote fixture name, so the group without a remote fixture comes first.
    pub groups: Vec<FixtureGroup>,
}

impl BundleTests {
    pub fn num_tests(&self) -> usize {
        self.groups.iter().map(|g| g.tests.len()).sum()
    }
}

/// Parent links of every known fixture, split by where the fixture runs.
#[derive(Debug, Default)]
pub struct FixtureGraph {
    /// bundle -> fixture -> parent, for fixtures of local bundles.
    local_parents: HashMap<String, HashMap<String, String>>,
    /// Names of fixtures provided by remote bundles and not shadowed by a local fixture,
    /// with their bundle.
    remote: BTreeMap<String, String>,
}

impl FixtureGraph {
    pub fn new(fixtures: &[BundleEntity]) -> Result<Self, CategorizeError> {
        let mut local_parents: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut local_names = HashSet::new();
        for f in fixtures.iter().filter(|f| f.is_local()) {
            local_parents
                .entry(f.bundle.clone())
                .or_default()
                .insert(f.entity.name.clone(), f.entity.fixture.clone());
            local_names.insert(f.entity.name.as_str());
        }

        let mut remote = BTreeMap::new();
        for f in fixtures.iter().filter(|f| !f.is_local()) {
            let name = &f.entity.name;
            // A local bundle may carry its own copy of a remote fixture. The local one wins.
            if local_names.contains(name.as_str()) {
                tracing::debug!(
                    fixture = %name,
                    bundle = %f.bundle,
                    "remote fixture shadowed by a local one"
                );
                continue;
            }
            if !f.entity.fixture.is_empty() {
                return Err(CategorizeError::RemoteFixtureHasParent {
                    name: name.clone(),
                    parent: f.entity.fixture.clone(),
                });
            }
            if let Some(first) = remote.insert(name.clone(), f.bundle.clone()) {
                return Err(CategorizeError::DuplicateRemoteFixture {
                    name: name.clone(),
                    first,
                    second: f.bundle.clone(),
                });
            }
        }

        Ok(Self {
            local_parents,
            remote,
        })
    }

    pub fn is_remote(&self, name: &str) -> bool {
        self.remote.contains_key(name)
    }

    /// The remote fixture at the root of `fixture`'s chain in `bundle`, or an empty string
    /// if the chain ends without one.
    pub fn depending_remote_fixture(
        &self,
        bundle: &str,
        fixture: &str,
    ) -> Result<String, CategorizeError> {
        let parents = self.local_parents.get(bundle);
        let mut seen = HashSet::new();
        let mut name = fixture;
        loop {
            if name.is_empty() {
                return Ok(String::new());
            }
            if self.is_remote(name) {
                return Ok(name.to_string());
            }
            if !seen.insert(name) {
                return Err(CategorizeError::Cycle {
                    bundle: bundle.to_string(),
                    name: name.to_string(),
                });
            }
            if seen.len() > MAX_FIXTURE_DEPTH {
                return Err(CategorizeError::TooDeep {
                    bundle: bundle.to_string(),
                    name: fixture.to_string(),
                });
            }
            name = parents
                .and_then(|p| p.get(name))
                .map(String::as_str)
                .ok_or_else(|| CategorizeError::UnknownFixture {
                    bundle: bundle.to_string(),
                    name: name.to_string(),
                })?;
        }
    }

    /// Groups `tests` by bundle and then by remote fixture. Bundles and groups are sorted by
    /// name; tests keep their input order within a group.
    pub fn categorize(&self, tests: &[BundleEntity]) -> Result<Vec<BundleTests>, CategorizeError> {
        let mut bundles: BTreeMap<&str, BTreeMap<String, Vec<Entity>>> = BTreeMap::new();
        for t in tests {
            let remote_fixture = self.depending_remote_fixture(&t.bundle, &t.entity.fixture)?;
            bundles
                .entry(t.bundle.as_str())
                .or_default()
                .entry(remote_fixture)
                .or_default()
                .push(t.entity.clone());
        }

        Ok(bundles
            .into_iter()
            .map(|(bundle, groups)| BundleTests {
                bundle: bundle.to_string(),
                groups: groups
                    .into_iter()
                    .map(|(remote_fixture, tests)| FixtureGroup {
                        remote_fixture,
                        tests,
                    })
                    .collect(),
            })
            .collect())
    }
}
