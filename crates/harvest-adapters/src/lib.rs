//! Repository adapter contract + fixture-first adapter implementation.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::HarvestRecord;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("upstream failure fetching {identifier}: {reason}")]
    Upstream { identifier: String, reason: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Result of asking a source for one identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchedRecord {
    Record(Box<HarvestRecord>),
    /// The source no longer publishes this identifier.
    Gone,
}

/// Thin mapping from one foreign catalogue to [`HarvestRecord`]s.
#[async_trait]
pub trait RepositoryAdapter: Send + Sync {
    fn repository_type(&self) -> &str;

    async fn list_identifiers(&self, ctx: &AdapterContext) -> Result<Vec<String>, AdapterError>;

    async fn fetch_record(
        &self,
        ctx: &AdapterContext,
        identifier: &str,
    ) -> Result<FetchedRecord, AdapterError>;
}

/// Captured harvest of one repository, replayable offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub repository_type: String,
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<HarvestRecord>,
    /// Identifiers still listed by the source but withdrawn.
    #[serde(default)]
    pub removed: Vec<String>,
    /// Identifiers whose fetch fails upstream.
    #[serde(default)]
    pub failing: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn deterministic_fixture_id(bundle: &FixtureBundle) -> Uuid {
    let source = format!(
        "{}:{}:{}",
        bundle.repository_type,
        bundle.fixture_id,
        bundle.captured_from_url.as_deref().unwrap_or("<fixture>")
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    repository_type: String,
    records: HashMap<String, HarvestRecord>,
    listing: Vec<String>,
    removed: BTreeSet<String>,
    failing: BTreeSet<String>,
}

impl FixtureAdapter {
    pub fn new(bundle: FixtureBundle) -> Self {
        let mut listing: Vec<String> = bundle.records.iter().map(|r| r.identifier.clone()).collect();
        for id in bundle.removed.iter().chain(&bundle.failing) {
            if !listing.contains(id) {
                listing.push(id.clone());
            }
        }
        Self {
            repository_type: bundle.repository_type,
            records: bundle
                .records
                .into_iter()
                .map(|r| (r.identifier.clone(), r))
                .collect(),
            listing,
            removed: bundle.removed.into_iter().collect(),
            failing: bundle.failing.into_iter().collect(),
        }
    }

    /// Load a bundle and check it was captured from the expected kind of repository.
    pub fn for_repository(
        path: impl AsRef<Path>,
        repository_type: &str,
    ) -> Result<Self, AdapterError> {
        let bundle = load_fixture_bundle(path)?;
        if !repository_type.is_empty() && bundle.repository_type != repository_type {
            return Err(AdapterError::Message(format!(
                "bundle repository_type={} does not match repository type={}",
                bundle.repository_type, repository_type
            )));
        }
        Ok(Self::new(bundle))
    }
}

#[async_trait]
impl RepositoryAdapter for FixtureAdapter {
    fn repository_type(&self) -> &str {
        &self.repository_type
    }

    async fn list_identifiers(&self, _ctx: &AdapterContext) -> Result<Vec<String>, AdapterError> {
        Ok(self.listing.clone())
    }

    async fn fetch_record(
        &self,
        _ctx: &AdapterContext,
        identifier: &str,
    ) -> Result<FetchedRecord, AdapterError> {
        if self.failing.contains(identifier) {
            return Err(AdapterError::Upstream {
                identifier: identifier.to_string(),
                reason: "fixture marks identifier as failing".to_string(),
            });
        }
        if self.removed.contains(identifier) {
            return Ok(FetchedRecord::Gone);
        }
        Ok(self
            .records
            .get(identifier)
            .cloned()
            .map(|r| FetchedRecord::Record(Box::new(r)))
            .unwrap_or(FetchedRecord::Gone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
        }
    }

    fn bundle() -> FixtureBundle {
        serde_json::from_str(
            r#"{
                "fixture_id": "inline",
                "repository_type": "dataverse",
                "fetched_at": "2026-01-05T12:00:00Z",
                "records": [
                    {"identifier": "doi:10.5683/SP3/AAA", "title": "Soil cores", "pub_date": "2020"}
                ],
                "removed": ["doi:10.5683/SP3/OLD"],
                "failing": ["doi:10.5683/SP3/ERR"]
            }"#,
        )
        .expect("bundle parses")
    }

    #[tokio::test]
    async fn listing_covers_records_removed_and_failing() {
        let adapter = FixtureAdapter::new(bundle());
        let ids = adapter.list_identifiers(&ctx()).await.unwrap();
        assert_eq!(
            ids,
            ["doi:10.5683/SP3/AAA", "doi:10.5683/SP3/OLD", "doi:10.5683/SP3/ERR"]
        );
        assert_eq!(adapter.repository_type(), "dataverse");
    }

    #[tokio::test]
    async fn fetch_distinguishes_record_gone_and_failure() {
        let adapter = FixtureAdapter::new(bundle());
        match adapter.fetch_record(&ctx(), "doi:10.5683/SP3/AAA").await.unwrap() {
            FetchedRecord::Record(record) => assert_eq!(record.title, "Soil cores"),
            FetchedRecord::Gone => panic!("expected record"),
        }
        assert_eq!(
            adapter.fetch_record(&ctx(), "doi:10.5683/SP3/OLD").await.unwrap(),
            FetchedRecord::Gone
        );
        assert_eq!(
            adapter.fetch_record(&ctx(), "never-listed").await.unwrap(),
            FetchedRecord::Gone
        );
        let err = adapter
            .fetch_record(&ctx(), "doi:10.5683/SP3/ERR")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Upstream { .. }));
    }

    #[test]
    fn fixture_ids_are_deterministic() {
        let a = deterministic_fixture_id(&bundle());
        let b = deterministic_fixture_id(&bundle());
        assert_eq!(a, b);
    }
}
