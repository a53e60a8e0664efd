//! Record lifecycle: locate-or-create, scalar change detection, soft deletion.

use harvest_core::{
    normalize_pub_date, record_uuid, resolve_item_url, FieldKind, HarvestRecord, ValueTable,
    RECORD_ID_COLUMN,
};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, Row};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::FieldReport;
use crate::{now_timestamp, Result, Session, StoreError};

/// Repository a record is written under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryContext {
    pub repository_id: i64,
    pub item_url_pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum RejectReason {
    #[error("record has no title in either language")]
    MissingTitle,
    #[error("publication date {0:?} is not YYYY, YYYY-MM or YYYY-MM-DD")]
    InvalidPubDate(String),
    #[error("no item URL could be resolved")]
    NoItemUrl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub record_id: Uuid,
    pub scalars_changed: bool,
    pub fields: Vec<FieldReport>,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WriteOutcome {
    Created(WriteReport),
    Updated(WriteReport),
    Rejected(RejectReason),
}

impl WriteOutcome {
    pub fn report(&self) -> Option<&WriteReport> {
        match self {
            Self::Created(report) | Self::Updated(report) => Some(report),
            Self::Rejected(_) => None,
        }
    }

    pub fn changed(&self) -> bool {
        self.report().is_some_and(|r| r.changed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRecord {
    pub record_id: Uuid,
    pub repository_id: i64,
    pub local_identifier: String,
    pub title: String,
    pub title_fr: String,
    pub pub_date: String,
    pub series: String,
    pub source_url: String,
    pub item_url: String,
    pub deleted: bool,
    pub modified_timestamp: i64,
    pub upstream_modified_timestamp: i64,
    pub downstream_harvested: bool,
    pub files_size: i64,
    /// Set whenever the reported file size changes; cleared by the export acknowledgement.
    pub files_altered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleRecord {
    pub record_id: Uuid,
    pub local_identifier: String,
    pub modified_timestamp: i64,
    pub files_size: i64,
    pub files_altered: bool,
}

/// Scalar columns compared to decide whether a record's content changed.
#[derive(Debug, PartialEq, Eq)]
struct Scalars {
    title: String,
    title_fr: String,
    pub_date: String,
    series: String,
    item_url: String,
    source_url: String,
    files_size: i64,
}

const RECORD_COLUMNS: &str = "record_uuid, repository_id, local_identifier, title, title_fr, \
     pub_date, series, source_url, item_url, deleted, modified_timestamp, \
     upstream_modified_timestamp, downstream_harvested, files_size, files_altered";

fn parse_record_id(raw: String) -> Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|_| StoreError::MalformedRecordId(raw))
}

fn stored_record(row: &SqliteRow) -> Result<StoredRecord> {
    Ok(StoredRecord {
        record_id: parse_record_id(row.try_get("record_uuid")?)?,
        repository_id: row.try_get("repository_id")?,
        local_identifier: row.try_get("local_identifier")?,
        title: row.try_get("title")?,
        title_fr: row.try_get("title_fr")?,
        pub_date: row.try_get("pub_date")?,
        series: row.try_get("series")?,
        source_url: row.try_get("source_url")?,
        item_url: row.try_get("item_url")?,
        deleted: row.try_get::<i64, _>("deleted")? != 0,
        modified_timestamp: row.try_get("modified_timestamp")?,
        upstream_modified_timestamp: row.try_get("upstream_modified_timestamp")?,
        downstream_harvested: row.try_get::<i64, _>("downstream_harvested")? != 0,
        files_size: row.try_get("files_size")?,
        files_altered: row.try_get::<i64, _>("files_altered")? != 0,
    })
}

impl StoredRecord {
    fn scalars(&self) -> Scalars {
        Scalars {
            title: self.title.clone(),
            title_fr: self.title_fr.clone(),
            pub_date: self.pub_date.clone(),
            series: self.series.clone(),
            item_url: self.item_url.clone(),
            source_url: self.source_url.clone(),
            files_size: self.files_size,
        }
    }
}

impl Session {
    /// Merge one incoming record into the store.
    pub async fn write_record(
        &mut self,
        record: &HarvestRecord,
        repository: &RepositoryContext,
    ) -> Result<WriteOutcome> {
        let span = info_span!("write_record", identifier = %record.identifier);
        self.write_record_inner(record, repository)
            .instrument(span)
            .await
    }

    async fn write_record_inner(
        &mut self,
        record: &HarvestRecord,
        repository: &RepositoryContext,
    ) -> Result<WriteOutcome> {
        if !record.has_title() {
            return Ok(WriteOutcome::Rejected(RejectReason::MissingTitle));
        }
        let Some(pub_date) = normalize_pub_date(&record.pub_date) else {
            return Ok(WriteOutcome::Rejected(RejectReason::InvalidPubDate(
                record.pub_date.clone(),
            )));
        };
        let item_url = record
            .item_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| {
                resolve_item_url(
                    &record.identifier,
                    repository.item_url_pattern.as_deref(),
                    record.source_url.as_deref(),
                )
            });
        let Some(item_url) = item_url else {
            return Ok(WriteOutcome::Rejected(RejectReason::NoItemUrl));
        };

        let incoming = Scalars {
            title: record.title.clone(),
            title_fr: record.title_fr.clone(),
            pub_date,
            series: record.series.clone(),
            item_url: item_url.clone(),
            source_url: record.source_url.clone().unwrap_or_default(),
            files_size: record.files_size,
        };

        let mut existing = self
            .find_record(&record.identifier, repository.repository_id)
            .await?;
        if existing.is_none() {
            if let Some(id) = record_uuid(&item_url) {
                existing = self.record(id).await?;
                if existing.is_some() {
                    debug!(record = %id, "adopting record stored under the same item URL");
                }
            }
        }

        let now = now_timestamp();
        let (record_id, created, scalars_changed) = match existing {
            Some(stored) => {
                // Header stubs have never carried content.
                let first_content = stored.upstream_modified_timestamp == 0;
                let changed = stored.deleted || stored.scalars() != incoming;
                let files_altered =
                    stored.files_altered || stored.files_size != incoming.files_size;
                self.update_scalars(
                    stored.record_id,
                    record,
                    repository,
                    &incoming,
                    files_altered,
                    now,
                )
                .await?;
                (stored.record_id, first_content, changed)
            }
            None => {
                let Some(id) = record_uuid(&item_url) else {
                    return Ok(WriteOutcome::Rejected(RejectReason::NoItemUrl));
                };
                self.insert_record(id, record, repository, &incoming, now)
                    .await?;
                (id, true, true)
            }
        };

        let mut fields = Vec::with_capacity(FieldKind::ALL.len() + 1);
        for kind in FieldKind::ALL {
            let change = self.reconcile(record, record_id, kind).await?;
            fields.push(FieldReport {
                field: kind.field_name(),
                change,
            });
        }
        let change = self.reconcile_domain_metadata(record, record_id).await?;
        fields.push(FieldReport {
            field: "domain_metadata",
            change,
        });

        let changed = scalars_changed || fields.iter().any(|f| f.change.changed());
        if changed {
            sqlx::query(
                "UPDATE records SET upstream_modified_timestamp = ?, downstream_harvested = 0
                 WHERE record_uuid = ?",
            )
            .bind(now)
            .bind(record_id.to_string())
            .execute(&mut *self.conn)
            .await?;
        }
        debug!(record = %record_id, created, changed, "record written");

        let report = WriteReport {
            record_id,
            scalars_changed,
            fields,
            changed,
        };
        Ok(if created {
            WriteOutcome::Created(report)
        } else {
            WriteOutcome::Updated(report)
        })
    }

    async fn insert_record(
        &mut self,
        record_id: Uuid,
        record: &HarvestRecord,
        repository: &RepositoryContext,
        scalars: &Scalars,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO records (record_uuid, repository_id, local_identifier, title, title_fr,
                pub_date, series, source_url, item_url, deleted, modified_timestamp,
                upstream_modified_timestamp, downstream_harvested, files_size, files_altered)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 0, ?, 1)",
        )
        .bind(record_id.to_string())
        .bind(repository.repository_id)
        .bind(&record.identifier)
        .bind(&scalars.title)
        .bind(&scalars.title_fr)
        .bind(&scalars.pub_date)
        .bind(&scalars.series)
        .bind(&scalars.source_url)
        .bind(&scalars.item_url)
        .bind(now)
        .bind(now)
        .bind(scalars.files_size)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn update_scalars(
        &mut self,
        record_id: Uuid,
        record: &HarvestRecord,
        repository: &RepositoryContext,
        scalars: &Scalars,
        files_altered: bool,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE records SET repository_id = ?, local_identifier = ?, title = ?, title_fr = ?,
                pub_date = ?, series = ?, source_url = ?, item_url = ?, deleted = 0,
                modified_timestamp = ?, files_size = ?, files_altered = ?
             WHERE record_uuid = ?",
        )
        .bind(repository.repository_id)
        .bind(&record.identifier)
        .bind(&scalars.title)
        .bind(&scalars.title_fr)
        .bind(&scalars.pub_date)
        .bind(&scalars.series)
        .bind(&scalars.source_url)
        .bind(&scalars.item_url)
        .bind(now)
        .bind(scalars.files_size)
        .bind(files_altered)
        .bind(record_id.to_string())
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn record(&mut self, record_id: Uuid) -> Result<Option<StoredRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE record_uuid = ?");
        let row = sqlx::query(&sql)
            .bind(record_id.to_string())
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(stored_record).transpose()
    }

    pub async fn find_record(
        &mut self,
        local_identifier: &str,
        repository_id: i64,
    ) -> Result<Option<StoredRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE local_identifier = ? AND repository_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(local_identifier)
            .bind(repository_id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(stored_record).transpose()
    }

    /// Register an identifier seen in a listing. The stub is immediately stale so
    /// the next refresh pass fetches it.
    pub async fn write_header(
        &mut self,
        local_identifier: &str,
        item_url_pattern: Option<&str>,
        repository_id: i64,
    ) -> Result<bool> {
        if self.find_record(local_identifier, repository_id).await?.is_some() {
            return Ok(false);
        }
        let Some(item_url) = resolve_item_url(local_identifier, item_url_pattern, None) else {
            warn!(identifier = local_identifier, "no item URL for header; skipped");
            return Ok(false);
        };
        let Some(record_id) = record_uuid(&item_url) else {
            return Ok(false);
        };
        let done = sqlx::query(
            "INSERT OR IGNORE INTO records (record_uuid, repository_id, local_identifier, item_url,
                deleted, modified_timestamp, upstream_modified_timestamp, downstream_harvested)
             VALUES (?, ?, ?, ?, 0, 0, 0, 0)",
        )
        .bind(record_id.to_string())
        .bind(repository_id)
        .bind(local_identifier)
        .bind(&item_url)
        .execute(&mut *self.conn)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Soft-delete a record and drop every association and record-scoped row it owns.
    /// Shared value rows are kept. The record is pending export again so the
    /// deletion reaches downstream. Runs in one transaction.
    pub async fn delete_record(&mut self, record_id: Uuid) -> Result<bool> {
        let id = record_id.to_string();
        let now = now_timestamp();
        let mut tx = self.conn.begin().await?;

        let done = sqlx::query(
            "UPDATE records SET deleted = 1, modified_timestamp = ?, upstream_modified_timestamp = ?,
                downstream_harvested = 0
             WHERE record_uuid = ? AND deleted = 0",
        )
        .bind(now)
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for table in ValueTable::ALL {
            let target = match (table.crosstable(), table.is_record_scoped()) {
                (Some(crosstable), _) => crosstable,
                (None, true) => table.name(),
                (None, false) => continue,
            };
            let sql = format!("DELETE FROM {target} WHERE {RECORD_ID_COLUMN} = ?");
            sqlx::query(&sql).bind(&id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(record = %record_id, "record soft-deleted");
        Ok(true)
    }

    /// Mark a record as visited without touching its content.
    pub async fn touch_record(&mut self, record_id: Uuid) -> Result<bool> {
        let done = sqlx::query("UPDATE records SET modified_timestamp = ? WHERE record_uuid = ?")
            .bind(now_timestamp())
            .bind(record_id.to_string())
            .execute(&mut *self.conn)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn get_stale_records(
        &mut self,
        cutoff: i64,
        repository_id: i64,
        limit: i64,
    ) -> Result<Vec<StaleRecord>> {
        let rows = sqlx::query(
            "SELECT record_uuid, local_identifier, modified_timestamp, files_size, files_altered
             FROM records
             WHERE modified_timestamp < ? AND repository_id = ? AND deleted = 0
             ORDER BY modified_timestamp ASC, local_identifier ASC
             LIMIT ?",
        )
        .bind(cutoff)
        .bind(repository_id)
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<StaleRecord> {
                Ok(StaleRecord {
                    record_id: parse_record_id(row.try_get("record_uuid")?)?,
                    local_identifier: row.try_get("local_identifier")?,
                    modified_timestamp: row.try_get("modified_timestamp")?,
                    files_size: row.try_get("files_size")?,
                    files_altered: row.try_get::<i64, _>("files_altered")? != 0,
                })
            })
            .collect()
    }

    /// Physically remove soft-deleted records.
    pub async fn purge_deleted_records(&mut self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM records WHERE deleted = 1")
            .execute(&mut *self.conn)
            .await?;
        Ok(done.rows_affected())
    }

    pub async fn mark_downstream_harvested(&mut self, record_id: Uuid) -> Result<bool> {
        let done = sqlx::query("UPDATE records SET downstream_harvested = 1, files_altered = 0 WHERE record_uuid = ?")
            .bind(record_id.to_string())
            .execute(&mut *self.conn)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Records the export step has not picked up yet.
    pub async fn pending_downstream(&mut self, limit: i64) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT record_uuid FROM records
             WHERE downstream_harvested = 0 AND title != ''
             ORDER BY upstream_modified_timestamp ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await?;
        ids.into_iter().map(parse_record_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{count, temp_store};
    use crate::Store;

    fn context() -> RepositoryContext {
        RepositoryContext {
            repository_id: 1,
            item_url_pattern: Some("https://data.example.org/dataset/%id%".to_string()),
        }
    }

    fn sample() -> HarvestRecord {
        let mut record = HarvestRecord::new("ds-1");
        record.title = "Ocean temperatures".into();
        record.pub_date = "2021-03-09".into();
        record.creator = Some(vec!["Smith, J.".into()]);
        record.tags = Some(vec!["climate".into()]);
        record
    }

    async fn force_upstream(session: &mut Session, record_id: Uuid, value: i64) {
        sqlx::query("UPDATE records SET upstream_modified_timestamp = ? WHERE record_uuid = ?")
            .bind(value)
            .bind(record_id.to_string())
            .execute(&mut *session.conn)
            .await
            .unwrap();
    }

    async fn open() -> (tempfile::TempDir, Store) {
        temp_store().await
    }

    #[tokio::test]
    async fn create_then_repeat_then_grow_tags() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let mut record = sample();

        let first = session.write_record(&record, &context()).await.unwrap();
        let WriteOutcome::Created(report) = &first else {
            panic!("expected create, got {first:?}");
        };
        assert!(report.changed);
        let record_id = report.record_id;
        assert_eq!(
            record_id,
            record_uuid("https://data.example.org/dataset/ds-1").unwrap()
        );

        force_upstream(&mut session, record_id, 1).await;
        let second = session.write_record(&record, &context()).await.unwrap();
        assert!(matches!(second, WriteOutcome::Updated(_)));
        assert!(!second.changed());
        let stored = session.record(record_id).await.unwrap().unwrap();
        assert_eq!(stored.upstream_modified_timestamp, 1);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM tags").await, 1);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM creators").await, 1);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records").await, 1);

        record.tags = Some(vec!["climate".into(), "ocean".into()]);
        let third = session.write_record(&record, &context()).await.unwrap();
        assert!(third.changed());
        let tags = third
            .report()
            .unwrap()
            .fields
            .iter()
            .find(|f| f.field == "tags")
            .unwrap()
            .change;
        assert_eq!((tags.inserted, tags.linked), (1, 1));
        let stored = session.record(record_id).await.unwrap().unwrap();
        assert!(stored.upstream_modified_timestamp > 1);
        assert!(!stored.downstream_harvested);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records_x_tags").await, 2);
    }

    #[tokio::test]
    async fn scalar_difference_alone_marks_change() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let mut record = sample();
        session.write_record(&record, &context()).await.unwrap();

        record.series = "Coastal monitoring".into();
        let outcome = session.write_record(&record, &context()).await.unwrap();
        let report = outcome.report().unwrap();
        assert!(report.scalars_changed);
        assert!(report.changed);
        assert!(report.fields.iter().all(|f| !f.change.changed()));
    }

    #[tokio::test]
    async fn missing_scalars_reject_without_touching_stored_version() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let record = sample();
        let record_id = session
            .write_record(&record, &context())
            .await
            .unwrap()
            .report()
            .unwrap()
            .record_id;

        let mut untitled = record.clone();
        untitled.title.clear();
        untitled.tags = None;
        assert_eq!(
            session.write_record(&untitled, &context()).await.unwrap(),
            WriteOutcome::Rejected(RejectReason::MissingTitle)
        );

        let mut undated = record.clone();
        undated.pub_date = "someday".into();
        assert_eq!(
            session.write_record(&undated, &context()).await.unwrap(),
            WriteOutcome::Rejected(RejectReason::InvalidPubDate("someday".into()))
        );

        let mut unlocatable = HarvestRecord::new("local-only");
        unlocatable.title = "Untraceable".into();
        unlocatable.pub_date = "2020".into();
        let bare = RepositoryContext {
            repository_id: 1,
            item_url_pattern: None,
        };
        assert_eq!(
            session.write_record(&unlocatable, &bare).await.unwrap(),
            WriteOutcome::Rejected(RejectReason::NoItemUrl)
        );

        let stored = session.record(record_id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Ocean temperatures");
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records_x_tags").await, 1);
    }

    #[tokio::test]
    async fn french_title_alone_is_enough() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let mut record = sample();
        record.title.clear();
        record.title_fr = "Températures océaniques".into();
        record.pub_date = "2021-03-09T12:00:00Z".into();
        let outcome = session.write_record(&record, &context()).await.unwrap();
        let stored = session
            .record(outcome.report().unwrap().record_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.pub_date, "2021-03-09");
        assert_eq!(stored.title_fr, "Températures océaniques");
    }

    #[tokio::test]
    async fn delete_cascades_links_but_keeps_shared_values() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let mut first = sample();
        first.description = Some(vec!["Long description".into()]);
        first.geopoints = Some(vec![harvest_core::GeoPoint::new(45.0, -73.0)]);
        let mut second = sample();
        second.identifier = "ds-2".into();

        let first_id = session
            .write_record(&first, &context())
            .await
            .unwrap()
            .report()
            .unwrap()
            .record_id;
        session.write_record(&second, &context()).await.unwrap();

        assert!(session.delete_record(first_id).await.unwrap());
        assert!(!session.delete_record(first_id).await.unwrap());

        let stored = session.record(first_id).await.unwrap().unwrap();
        assert!(stored.deleted);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM tags").await, 1);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records_x_tags").await, 1);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records_x_creators").await, 1);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM descriptions").await, 0);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM geopoint").await, 0);
    }

    #[tokio::test]
    async fn reappearing_record_is_undeleted_and_changed() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let record = sample();
        let record_id = session
            .write_record(&record, &context())
            .await
            .unwrap()
            .report()
            .unwrap()
            .record_id;
        session.delete_record(record_id).await.unwrap();

        let outcome = session.write_record(&record, &context()).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Updated(_)));
        assert!(outcome.report().unwrap().scalars_changed);
        let stored = session.record(record_id).await.unwrap().unwrap();
        assert!(!stored.deleted);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records_x_tags").await, 1);
    }

    #[tokio::test]
    async fn same_item_url_in_another_repository_is_adopted() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let mut record = sample();
        record.item_url = Some("https://doi.org/10.1/abc".into());
        let first = session.write_record(&record, &context()).await.unwrap();

        let mirror = RepositoryContext {
            repository_id: 2,
            item_url_pattern: None,
        };
        let second = session.write_record(&record, &mirror).await.unwrap();
        assert!(matches!(second, WriteOutcome::Updated(_)));
        assert_eq!(
            first.report().unwrap().record_id,
            second.report().unwrap().record_id
        );
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records").await, 1);
    }

    #[tokio::test]
    async fn headers_are_stale_stubs_written_once() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let pattern = Some("https://data.example.org/dataset/%id%");
        assert!(session.write_header("ds-9", pattern, 1).await.unwrap());
        assert!(!session.write_header("ds-9", pattern, 1).await.unwrap());
        assert!(!session.write_header("not-a-link", None, 1).await.unwrap());

        let stale = session.get_stale_records(now_timestamp(), 1, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].local_identifier, "ds-9");
        assert_eq!(stale[0].modified_timestamp, 0);

        let mut record = sample();
        record.identifier = "ds-9".into();
        let outcome = session.write_record(&record, &context()).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Created(_)));
        assert!(outcome.changed());
        assert!(session.get_stale_records(1, 1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_records_respect_limit_repository_and_deletion() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let pattern = Some("https://data.example.org/dataset/%id%");
        for id in ["a", "b", "c"] {
            session.write_header(id, pattern, 1).await.unwrap();
        }
        session
            .write_header("other", Some("https://elsewhere.example/%id%"), 2)
            .await
            .unwrap();
        let b = session.find_record("b", 1).await.unwrap().unwrap().record_id;
        session.delete_record(b).await.unwrap();

        let stale = session.get_stale_records(1, 1, 10).await.unwrap();
        let names: Vec<_> = stale.iter().map(|s| s.local_identifier.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
        assert_eq!(session.get_stale_records(1, 1, 1).await.unwrap().len(), 1);

        let a = stale[0].record_id;
        assert!(session.touch_record(a).await.unwrap());
        assert_eq!(session.get_stale_records(1, 1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_soft_deleted_records() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let record_id = session
            .write_record(&sample(), &context())
            .await
            .unwrap()
            .report()
            .unwrap()
            .record_id;
        let mut other = sample();
        other.identifier = "ds-2".into();
        session.write_record(&other, &context()).await.unwrap();

        session.delete_record(record_id).await.unwrap();
        assert_eq!(session.purge_deleted_records().await.unwrap(), 1);
        assert_eq!(session.record(record_id).await.unwrap(), None);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records").await, 1);
    }

    #[tokio::test]
    async fn downstream_acknowledgement_clears_pending_until_next_change() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let mut record = sample();
        let record_id = session
            .write_record(&record, &context())
            .await
            .unwrap()
            .report()
            .unwrap()
            .record_id;
        assert_eq!(session.pending_downstream(10).await.unwrap(), vec![record_id]);

        assert!(session.mark_downstream_harvested(record_id).await.unwrap());
        assert!(session.pending_downstream(10).await.unwrap().is_empty());
        session.write_record(&record, &context()).await.unwrap();
        assert!(session.pending_downstream(10).await.unwrap().is_empty());

        record.title = "Ocean temperatures, revised".into();
        session.write_record(&record, &context()).await.unwrap();
        assert_eq!(session.pending_downstream(10).await.unwrap(), vec![record_id]);
    }

    #[tokio::test]
    async fn rights_text_is_deduplicated_across_records() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let rights = "CC-BY 4.0\nhttps://creativecommons.org/licenses/by/4.0/".to_string();
        for id in ["ds-1", "ds-2"] {
            let mut record = sample();
            record.identifier = id.into();
            record.rights = Some(vec![rights.clone()]);
            session.write_record(&record, &context()).await.unwrap();
            session.write_record(&record, &context()).await.unwrap();
        }
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM rights").await, 1);
        assert_eq!(count(&mut session, "SELECT COUNT(*) FROM records_x_rights").await, 2);
    }

    #[tokio::test]
    async fn deleting_an_exported_record_queues_it_for_export_again() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let record_id = session
            .write_record(&sample(), &context())
            .await
            .unwrap()
            .report()
            .unwrap()
            .record_id;
        session.mark_downstream_harvested(record_id).await.unwrap();
        assert!(session.pending_downstream(10).await.unwrap().is_empty());

        assert!(session.delete_record(record_id).await.unwrap());
        let stored = session.record(record_id).await.unwrap().unwrap();
        assert!(stored.deleted);
        assert!(!stored.downstream_harvested);
        assert_eq!(session.pending_downstream(10).await.unwrap(), vec![record_id]);
    }

    #[tokio::test]
    async fn file_size_change_flags_files_and_content() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        let mut record = sample();
        record.files_size = 2_048;
        let record_id = session
            .write_record(&record, &context())
            .await
            .unwrap()
            .report()
            .unwrap()
            .record_id;
        let stored = session.record(record_id).await.unwrap().unwrap();
        assert_eq!(stored.files_size, 2_048);
        assert!(stored.files_altered);

        session.mark_downstream_harvested(record_id).await.unwrap();
        let unchanged = session.write_record(&record, &context()).await.unwrap();
        assert!(!unchanged.changed());
        assert!(!session.record(record_id).await.unwrap().unwrap().files_altered);

        record.files_size = 4_096;
        let grown = session.write_record(&record, &context()).await.unwrap();
        assert!(grown.report().unwrap().scalars_changed);
        assert!(grown.changed());
        let stored = session.record(record_id).await.unwrap().unwrap();
        assert_eq!(stored.files_size, 4_096);
        assert!(stored.files_altered);
        assert!(!stored.downstream_harvested);
    }

    #[tokio::test]
    async fn stale_records_carry_file_state() {
        let (_dir, store) = open().await;
        let mut session = store.session().await.unwrap();
        session
            .write_header("ds-7", Some("https://data.example.org/dataset/%id%"), 1)
            .await
            .unwrap();
        let stale = session.get_stale_records(1, 1, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].files_size, 0);
        assert!(stale[0].files_altered);
    }
}
