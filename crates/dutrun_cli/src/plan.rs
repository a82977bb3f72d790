//! The test plan: every test and fixture the bundles provide, as discovered beforehand.

use std::{collections::HashSet, fs, path::Path};

use anyhow::{bail, Context};
use dutrun_protocol::BundleEntity;
use serde_derive::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    #[serde(default)]
    pub tests: Vec<BundleEntity>,
    #[serde(default)]
    pub fixtures: Vec<BundleEntity>,
}

impl Plan {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("invalid plan {}", path.display()))
    }

    /// The local tests named in `names`, or every local test if `names` is empty. Naming a
    /// test the plan does not have is an error.
    pub fn select(&self, names: &[String]) -> anyhow::Result<Vec<BundleEntity>> {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        let known: HashSet<&str> = self.tests.iter().map(|t| t.entity.name.as_str()).collect();
        let mut missing: Vec<&str> = wanted.difference(&known).copied().collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            bail!("no such tests in plan: {}", missing.join(", "));
        }

        let mut selected = vec![];
        for t in &self.tests {
            if !wanted.is_empty() && !wanted.contains(t.entity.name.as_str()) {
                continue;
            }
            if !t.is_local() {
                tracing::warn!(test = %t.entity.name, bundle = %t.bundle, "skipping remote test");
                continue;
            }
            selected.push(t.clone());
        }
        Ok(selected)
    }
}
