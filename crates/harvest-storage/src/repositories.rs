//! Repository registry rows: one per harvested (url, set) pair.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

use crate::records::RepositoryContext;
use crate::{now_timestamp, Result, Session};

fn default_abort_after_numerrors() -> u32 {
    5
}
fn default_max_records_updated_per_run() -> u32 {
    100
}
fn default_update_log_after_numitems() -> u32 {
    100
}
fn default_record_refresh_days() -> u32 {
    30
}
fn default_repo_refresh_days() -> u32 {
    7
}

/// Configuration of one source, as declared in the registry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub url: String,
    #[serde(default)]
    pub set: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub repo_type: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub item_url_pattern: Option<String>,
    #[serde(default)]
    pub homepage_url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_abort_after_numerrors")]
    pub abort_after_numerrors: u32,
    #[serde(default = "default_max_records_updated_per_run")]
    pub max_records_updated_per_run: u32,
    #[serde(default = "default_update_log_after_numitems")]
    pub update_log_after_numitems: u32,
    #[serde(default = "default_record_refresh_days")]
    pub record_refresh_days: u32,
    #[serde(default = "default_repo_refresh_days")]
    pub repo_refresh_days: u32,
}

impl Repository {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            set: String::new(),
            name: String::new(),
            repo_type: String::new(),
            thumbnail: None,
            item_url_pattern: None,
            homepage_url: None,
            enabled: false,
            abort_after_numerrors: default_abort_after_numerrors(),
            max_records_updated_per_run: default_max_records_updated_per_run(),
            update_log_after_numitems: default_update_log_after_numitems(),
            record_refresh_days: default_record_refresh_days(),
            repo_refresh_days: default_repo_refresh_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRepository {
    pub repository_id: i64,
    #[serde(flatten)]
    pub repository: Repository,
    pub last_crawl_timestamp: i64,
    pub item_count: i64,
}

impl StoredRepository {
    pub fn context(&self) -> RepositoryContext {
        RepositoryContext {
            repository_id: self.repository_id,
            item_url_pattern: self.repository.item_url_pattern.clone(),
        }
    }
}

fn stored_repository(row: &SqliteRow) -> Result<StoredRepository> {
    let count = |name: &str| -> Result<u32> {
        Ok(u32::try_from(row.try_get::<i64, _>(name)?).unwrap_or_default())
    };
    Ok(StoredRepository {
        repository_id: row.try_get("repository_id")?,
        repository: Repository {
            url: row.try_get("repository_url")?,
            set: row.try_get("repository_set")?,
            name: row.try_get("repository_name")?,
            repo_type: row.try_get("repository_type")?,
            thumbnail: row.try_get("repository_thumbnail")?,
            item_url_pattern: row.try_get("item_url_pattern")?,
            homepage_url: row.try_get("homepage_url")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            abort_after_numerrors: count("abort_after_numerrors")?,
            max_records_updated_per_run: count("max_records_updated_per_run")?,
            update_log_after_numitems: count("update_log_after_numitems")?,
            record_refresh_days: count("record_refresh_days")?,
            repo_refresh_days: count("repo_refresh_days")?,
        },
        last_crawl_timestamp: row.try_get("last_crawl_timestamp")?,
        item_count: row.try_get("item_count")?,
    })
}

const REPOSITORY_SELECT: &str = "SELECT r.*,
        (SELECT COUNT(*) FROM records rec
         WHERE rec.repository_id = r.repository_id AND rec.deleted = 0) AS item_count
     FROM repositories r";

impl Session {
    /// Insert or refresh the configuration row of a repository; returns its id.
    pub async fn upsert_repository(&mut self, repository: &Repository) -> Result<i64> {
        if let Some(id) = self.repository_id(&repository.url, &repository.set).await? {
            sqlx::query(
                "UPDATE repositories SET repository_url = ?, repository_name = ?,
                    repository_type = ?, repository_thumbnail = ?, item_url_pattern = ?,
                    homepage_url = ?, enabled = ?, abort_after_numerrors = ?,
                    max_records_updated_per_run = ?, update_log_after_numitems = ?,
                    record_refresh_days = ?, repo_refresh_days = ?
                 WHERE repository_id = ?",
            )
            .bind(&repository.url)
            .bind(&repository.name)
            .bind(&repository.repo_type)
            .bind(&repository.thumbnail)
            .bind(&repository.item_url_pattern)
            .bind(&repository.homepage_url)
            .bind(repository.enabled)
            .bind(repository.abort_after_numerrors)
            .bind(repository.max_records_updated_per_run)
            .bind(repository.update_log_after_numitems)
            .bind(repository.record_refresh_days)
            .bind(repository.repo_refresh_days)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
            debug!(repository_id = id, url = %repository.url, "repository updated");
            return Ok(id);
        }

        let done = sqlx::query(
            "INSERT INTO repositories (repository_url, repository_set, repository_name,
                repository_type, repository_thumbnail, item_url_pattern, homepage_url, enabled,
                last_crawl_timestamp, abort_after_numerrors, max_records_updated_per_run,
                update_log_after_numitems, record_refresh_days, repo_refresh_days)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
        )
        .bind(&repository.url)
        .bind(&repository.set)
        .bind(&repository.name)
        .bind(&repository.repo_type)
        .bind(&repository.thumbnail)
        .bind(&repository.item_url_pattern)
        .bind(&repository.homepage_url)
        .bind(repository.enabled)
        .bind(repository.abort_after_numerrors)
        .bind(repository.max_records_updated_per_run)
        .bind(repository.update_log_after_numitems)
        .bind(repository.record_refresh_days)
        .bind(repository.repo_refresh_days)
        .execute(&mut *self.conn)
        .await?;
        let id = done.last_insert_rowid();
        info!(repository_id = id, url = %repository.url, "repository registered");
        Ok(id)
    }

    /// Lookup by (url, set). A source that moved from `http:` to `https:` still
    /// resolves to its original row.
    pub async fn repository_id(&mut self, url: &str, set: &str) -> Result<Option<i64>> {
        let mut candidates = vec![url.to_string()];
        if let Some(rest) = url.strip_prefix("https:") {
            candidates.push(format!("http:{rest}"));
        }
        for candidate in candidates {
            let id: Option<i64> = sqlx::query_scalar(
                "SELECT repository_id FROM repositories
                 WHERE repository_url = ? AND repository_set = ?",
            )
            .bind(&candidate)
            .bind(set)
            .fetch_optional(&mut *self.conn)
            .await?;
            if id.is_some() {
                return Ok(id);
            }
        }
        Ok(None)
    }

    pub async fn repository(&mut self, repository_id: i64) -> Result<Option<StoredRepository>> {
        let sql = format!("{REPOSITORY_SELECT} WHERE r.repository_id = ?");
        let row = sqlx::query(&sql)
            .bind(repository_id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(stored_repository).transpose()
    }

    pub async fn list_repositories(&mut self) -> Result<Vec<StoredRepository>> {
        let sql = format!("{REPOSITORY_SELECT} ORDER BY r.repository_id");
        let rows = sqlx::query(&sql).fetch_all(&mut *self.conn).await?;
        rows.iter().map(stored_repository).collect()
    }

    pub async fn last_crawl(&mut self, repository_id: i64) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT last_crawl_timestamp FROM repositories WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_optional(&mut *self.conn)
        .await?)
    }

    pub async fn update_last_crawl(&mut self, repository_id: i64) -> Result<i64> {
        let now = now_timestamp();
        sqlx::query("UPDATE repositories SET last_crawl_timestamp = ? WHERE repository_id = ?")
            .bind(now)
            .bind(repository_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(now)
    }

    pub async fn set_repository_enabled(&mut self, repository_id: i64, enabled: bool) -> Result<bool> {
        let done = sqlx::query("UPDATE repositories SET enabled = ? WHERE repository_id = ?")
            .bind(enabled)
            .bind(repository_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}
