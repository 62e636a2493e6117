//! Snapshot of the identity pipeline for diagnosing unstable ids.

use crate::availability::FailureCount;
use crate::directory::MonitorInfo;
use crate::hardware::{CorrelationData, PhysicalDisplayHandle};
use crate::identity::IdentitySource;
use crate::store::FeatureSnapshot;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugReport {
    pub generated_at: String,
    /// Result of the refresh that produced this report, or `None` when no
    /// refresh has completed yet.
    pub refresh_outcome: Option<String>,
    pub backends: Vec<BackendReport>,
    pub correlation: CorrelationData,
    pub correlation_error: Option<String>,
    pub resolved: Vec<ResolvedEntry>,
    pub feature_tests: Vec<FeatureTestEntry>,
    pub dedup_winners: Vec<DedupEntry>,
    pub availability: Vec<FailureCount>,
    pub monitors: Vec<MonitorInfo>,
    pub stores: Vec<FeatureSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub name: String,
    pub provides_identification: bool,
    pub handles: Vec<PhysicalDisplayHandle>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntry {
    pub stable_id: String,
    pub display_name: String,
    pub backend: String,
    pub index: usize,
    pub source: IdentitySource,
    pub unstable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureTestEntry {
    pub stable_id: String,
    pub backend: String,
    pub index: usize,
    pub supported: bool,
    pub current: Option<u32>,
    pub max: Option<u32>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupEntry {
    pub stable_id: String,
    pub backend: String,
    pub index: usize,
    pub feature_supported: bool,
    pub has_identification_blob: bool,
}

impl DebugReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize debug report")
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write debug report to {}", path.display()))
    }

    pub fn unstable_ids(&self) -> Vec<&str> {
        self.resolved
            .iter()
            .filter(|r| r.unstable)
            .map(|r| r.stable_id.as_str())
            .collect()
    }
}
