//! Harvest pipeline orchestration: registry, per-repository passes, run summaries.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_storage::Repository;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod pipeline;

pub use pipeline::{maybe_build_scheduler, HarvestPipeline};

pub const CRATE_NAME: &str = "harvest-sync";

pub const REGISTRY_FILE: &str = "repositories.yaml";

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRegistry {
    pub repositories: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    /// Short slug used for fixture lookup and report naming.
    pub id: String,
    /// Bundle path relative to the workspace root; defaults to `fixtures/<id>/sample/bundle.json`.
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    #[serde(flatten)]
    pub repository: Repository,
}

pub fn load_registry(path: impl AsRef<Path>) -> Result<RepositoryRegistry> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("HARVEST_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let database_path = std::env::var("HARVEST_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("harvest.db"));
        Self::new(workspace_root, database_path)
            .with_scheduler(
                std::env::var("HARVEST_SCHEDULER_ENABLED")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(false),
                std::env::var("HARVEST_SYNC_CRON").unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            )
    }

    /// A relative database path is resolved against the workspace root.
    pub fn new(workspace_root: impl Into<PathBuf>, database_path: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let database_path = database_path.into();
        let database_path = if database_path.is_relative() {
            workspace_root.join(database_path)
        } else {
            database_path
        };
        Self {
            database_path,
            workspace_root,
            scheduler_enabled: false,
            sync_cron: "0 0 3 * * *".to_string(),
        }
    }

    pub fn with_scheduler(mut self, enabled: bool, cron: impl Into<String>) -> Self {
        self.scheduler_enabled = enabled;
        self.sync_cron = cron.into();
        self
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join(REGISTRY_FILE)
    }

    pub fn bundle_path_for(&self, entry: &RegistryEntry) -> PathBuf {
        match &entry.fixture {
            Some(path) => self.workspace_root.join(path),
            None => self
                .workspace_root
                .join("fixtures")
                .join(&entry.id)
                .join("sample")
                .join("bundle.json"),
        }
    }

    pub fn reports_dir(&self, run_id: Uuid) -> PathBuf {
        self.workspace_root.join("reports").join(run_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RepositoryStatus {
    Harvested,
    Aborted,
    SkippedDisabled,
    SkippedNotDue { next_due: i64 },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryRunReport {
    pub id: String,
    pub repository_id: i64,
    pub status: RepositoryStatus,
    pub fixture_id: Option<Uuid>,
    pub listed: usize,
    pub headers_added: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub deleted: usize,
    pub errors: usize,
    pub refreshed: usize,
}

impl RepositoryRunReport {
    pub fn new(id: impl Into<String>, repository_id: i64) -> Self {
        Self {
            id: id.into(),
            repository_id,
            status: RepositoryStatus::Harvested,
            fixture_id: None,
            listed: 0,
            headers_added: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            rejected: 0,
            deleted: 0,
            errors: 0,
            refreshed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub repositories: Vec<RepositoryRunReport>,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn harvested(&self) -> usize {
        self.repositories
            .iter()
            .filter(|r| matches!(r.status, RepositoryStatus::Harvested | RepositoryStatus::Aborted))
            .count()
    }

    pub fn total(&self, field: fn(&RepositoryRunReport) -> usize) -> usize {
        self.repositories.iter().map(field).sum()
    }
}

/// When a repository crawled at `last_crawl` is not due yet at `now`, the time it becomes due.
pub fn next_due(last_crawl: i64, repo_refresh_days: u32, now: i64) -> Option<i64> {
    if last_crawl <= 0 {
        return None;
    }
    let next_due = last_crawl + i64::from(repo_refresh_days) * SECONDS_PER_DAY;
    (next_due > now).then_some(next_due)
}

pub fn stale_cutoff(record_refresh_days: u32, now: i64) -> i64 {
    now - i64::from(record_refresh_days) * SECONDS_PER_DAY
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = HarvestPipeline::new(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_yaml_fills_repository_defaults() {
        let registry: RepositoryRegistry = serde_yaml::from_str(
            r#"
repositories:
  - id: radar
    url: https://radar.example.ca/oai
    name: RADAR
    type: oai
    item_url_pattern: https://radar.example.ca/item/%id%
    enabled: true
    abort_after_numerrors: 2
  - id: borealis
    url: https://borealis.example.ca/api
    type: dataverse
    fixture: captures/borealis.json
"#,
        )
        .unwrap();
        let radar = &registry.repositories[0];
        assert_eq!(radar.repository.repo_type, "oai");
        assert_eq!(radar.repository.abort_after_numerrors, 2);
        assert_eq!(radar.repository.record_refresh_days, 30);
        assert!(radar.repository.enabled);

        let borealis = &registry.repositories[1];
        assert!(!borealis.repository.enabled);
        assert_eq!(borealis.repository.repo_refresh_days, 7);

        let config = SyncConfig::new("/srv/harvest", "db/harvest.db");
        assert_eq!(config.database_path, PathBuf::from("/srv/harvest/db/harvest.db"));
        assert_eq!(
            config.bundle_path_for(radar),
            PathBuf::from("/srv/harvest/fixtures/radar/sample/bundle.json")
        );
        assert_eq!(
            config.bundle_path_for(borealis),
            PathBuf::from("/srv/harvest/captures/borealis.json")
        );
    }

    #[test]
    fn absolute_database_path_is_kept() {
        let config = SyncConfig::new("/srv/harvest", "/var/lib/harvest.db");
        assert_eq!(config.database_path, PathBuf::from("/var/lib/harvest.db"));
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn due_and_cutoff_arithmetic() {
        let now = 1_700_000_000;
        assert_eq!(next_due(0, 7, now), None);
        assert_eq!(next_due(now - 8 * SECONDS_PER_DAY, 7, now), None);
        assert_eq!(
            next_due(now - SECONDS_PER_DAY, 7, now),
            Some(now + 6 * SECONDS_PER_DAY)
        );
        assert_eq!(next_due(now, 0, now), None);
        assert_eq!(stale_cutoff(30, now), now - 30 * SECONDS_PER_DAY);
    }
}
