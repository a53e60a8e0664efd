use std::path::{Path, PathBuf};

use chrono::Utc;
use harvest_adapters::{
    load_fixture_bundle, AdapterContext, AdapterError, FetchedRecord, FixtureAdapter,
    RepositoryAdapter,
};
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_bundle_path(repository: &str) -> PathBuf {
    workspace_root()
        .join("fixtures")
        .join(repository)
        .join("sample")
        .join("bundle.json")
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::new_v4(),
        started_at: Utc::now(),
    }
}

#[test]
fn radar_bundle_parses_mixed_scalar_and_list_fields() {
    let bundle = load_fixture_bundle(fixture_bundle_path("radar")).expect("radar bundle");
    assert_eq!(bundle.repository_type, "oai");
    assert_eq!(bundle.records.len(), 3);

    let ocean = &bundle.records[0];
    assert_eq!(ocean.contributor.as_deref(), Some(&["Smith, J.".to_string()][..]));
    assert_eq!(ocean.geobboxes.as_ref().map(Vec::len), Some(2));
    assert_eq!(ocean.crdc.as_ref().map(Vec::len), Some(1));
    assert_eq!(
        ocean.affiliation.as_ref().map(|a| a[0].ror()),
        Some(Some("https://ror.org/04sjchr03"))
    );

    let ice = &bundle.records[1];
    assert_eq!(
        ice.source_url.as_deref(),
        Some("https://radar.example.ca/source/ICE2")
    );
}

#[tokio::test]
async fn radar_adapter_lists_and_fetches() {
    let adapter =
        FixtureAdapter::for_repository(fixture_bundle_path("radar"), "oai").expect("adapter");
    let ctx = ctx();
    let ids = adapter.list_identifiers(&ctx).await.unwrap();
    assert_eq!(ids.len(), 5);

    let withdrawn = adapter
        .fetch_record(&ctx, "oai:radar.example.ca:10.5072_FK2_WITHDRAWN")
        .await
        .unwrap();
    assert_eq!(withdrawn, FetchedRecord::Gone);

    let failing = adapter
        .fetch_record(&ctx, "oai:radar.example.ca:10.5072_FK2_TIMEOUT")
        .await;
    assert!(matches!(failing, Err(AdapterError::Upstream { .. })));
}

#[test]
fn mismatched_repository_type_is_rejected() {
    let err = FixtureAdapter::for_repository(fixture_bundle_path("borealis"), "oai").unwrap_err();
    assert!(err.to_string().contains("does not match"));
}

#[test]
fn missing_bundle_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let err = FixtureAdapter::for_repository(dir.path().join("absent.json"), "oai").unwrap_err();
    assert!(err.to_string().contains("absent.json"));
}
