use tracing::debug;

use crate::{Result, Session};

/// Schema version recorded under the `dbversion` setting.
pub const DB_VERSION: i64 = 1;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS settings (
        setting_id INTEGER PRIMARY KEY AUTOINCREMENT,
        setting_name TEXT NOT NULL UNIQUE,
        setting_value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS repositories (
        repository_id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_url TEXT NOT NULL,
        repository_set TEXT NOT NULL DEFAULT '',
        repository_name TEXT NOT NULL DEFAULT '',
        repository_type TEXT NOT NULL DEFAULT '',
        repository_thumbnail TEXT,
        item_url_pattern TEXT,
        homepage_url TEXT,
        enabled INTEGER NOT NULL DEFAULT 0,
        last_crawl_timestamp INTEGER NOT NULL DEFAULT 0,
        abort_after_numerrors INTEGER NOT NULL DEFAULT 5,
        max_records_updated_per_run INTEGER NOT NULL DEFAULT 100,
        update_log_after_numitems INTEGER NOT NULL DEFAULT 100,
        record_refresh_days INTEGER NOT NULL DEFAULT 30,
        repo_refresh_days INTEGER NOT NULL DEFAULT 7,
        UNIQUE (repository_url, repository_set)
    )",
    "CREATE TABLE IF NOT EXISTS records (
        record_uuid TEXT PRIMARY KEY,
        repository_id INTEGER NOT NULL,
        local_identifier TEXT NOT NULL,
        title TEXT NOT NULL DEFAULT '',
        title_fr TEXT NOT NULL DEFAULT '',
        pub_date TEXT NOT NULL DEFAULT '',
        series TEXT NOT NULL DEFAULT '',
        source_url TEXT NOT NULL DEFAULT '',
        item_url TEXT NOT NULL DEFAULT '',
        deleted INTEGER NOT NULL DEFAULT 0,
        modified_timestamp INTEGER NOT NULL DEFAULT 0,
        upstream_modified_timestamp INTEGER NOT NULL DEFAULT 0,
        downstream_harvested INTEGER NOT NULL DEFAULT 0,
        files_size INTEGER NOT NULL DEFAULT 0,
        files_altered INTEGER NOT NULL DEFAULT 1,
        UNIQUE (repository_id, local_identifier)
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_stale
        ON records (repository_id, deleted, modified_timestamp)",
    "CREATE TABLE IF NOT EXISTS creators (
        creator_id INTEGER PRIMARY KEY AUTOINCREMENT,
        creator TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS records_x_creators (
        records_x_creators_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        creator_id INTEGER NOT NULL,
        is_contributor INTEGER NOT NULL DEFAULT 0,
        UNIQUE (record_uuid, creator_id, is_contributor)
    )",
    "CREATE TABLE IF NOT EXISTS publishers (
        publisher_id INTEGER PRIMARY KEY AUTOINCREMENT,
        publisher TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS records_x_publishers (
        records_x_publishers_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        publisher_id INTEGER NOT NULL,
        UNIQUE (record_uuid, publisher_id)
    )",
    "CREATE TABLE IF NOT EXISTS affiliations (
        affiliation_id INTEGER PRIMARY KEY AUTOINCREMENT,
        affiliation TEXT NOT NULL,
        affiliation_ror TEXT NOT NULL DEFAULT '',
        UNIQUE (affiliation, affiliation_ror)
    )",
    "CREATE TABLE IF NOT EXISTS records_x_affiliations (
        records_x_affiliations_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        affiliation_id INTEGER NOT NULL,
        UNIQUE (record_uuid, affiliation_id)
    )",
    "CREATE TABLE IF NOT EXISTS access (
        access_id INTEGER PRIMARY KEY AUTOINCREMENT,
        access TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS records_x_access (
        records_x_access_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        access_id INTEGER NOT NULL,
        UNIQUE (record_uuid, access_id)
    )",
    "CREATE TABLE IF NOT EXISTS rights (
        rights_id INTEGER PRIMARY KEY AUTOINCREMENT,
        rights_hash TEXT NOT NULL UNIQUE,
        rights TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS records_x_rights (
        records_x_rights_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        rights_id INTEGER NOT NULL,
        UNIQUE (record_uuid, rights_id)
    )",
    "CREATE TABLE IF NOT EXISTS tags (
        tag_id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag TEXT NOT NULL,
        language TEXT NOT NULL,
        UNIQUE (tag, language)
    )",
    "CREATE TABLE IF NOT EXISTS records_x_tags (
        records_x_tags_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        tag_id INTEGER NOT NULL,
        UNIQUE (record_uuid, tag_id)
    )",
    "CREATE TABLE IF NOT EXISTS subjects (
        subject_id INTEGER PRIMARY KEY AUTOINCREMENT,
        subject TEXT NOT NULL,
        language TEXT NOT NULL,
        UNIQUE (subject, language)
    )",
    "CREATE TABLE IF NOT EXISTS records_x_subjects (
        records_x_subjects_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        subject_id INTEGER NOT NULL,
        UNIQUE (record_uuid, subject_id)
    )",
    "CREATE TABLE IF NOT EXISTS geoplace (
        geoplace_id INTEGER PRIMARY KEY AUTOINCREMENT,
        place_name TEXT NOT NULL DEFAULT '',
        country TEXT NOT NULL DEFAULT '',
        province_state TEXT NOT NULL DEFAULT '',
        city TEXT NOT NULL DEFAULT '',
        other TEXT NOT NULL DEFAULT '',
        UNIQUE (place_name, country, province_state, city, other)
    )",
    "CREATE TABLE IF NOT EXISTS records_x_geoplace (
        records_x_geoplace_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        geoplace_id INTEGER NOT NULL,
        UNIQUE (record_uuid, geoplace_id)
    )",
    "CREATE TABLE IF NOT EXISTS descriptions (
        description_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        description_hash TEXT NOT NULL,
        language TEXT NOT NULL,
        description TEXT NOT NULL,
        UNIQUE (record_uuid, description_hash, language)
    )",
    "CREATE TABLE IF NOT EXISTS geobbox (
        geobbox_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        west_lon REAL NOT NULL,
        east_lon REAL NOT NULL,
        north_lat REAL NOT NULL,
        south_lat REAL NOT NULL,
        UNIQUE (record_uuid, west_lon, east_lon, north_lat, south_lat)
    )",
    "CREATE TABLE IF NOT EXISTS geopoint (
        geopoint_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        lat REAL NOT NULL,
        lon REAL NOT NULL,
        UNIQUE (record_uuid, lat, lon)
    )",
    "CREATE TABLE IF NOT EXISTS geofile (
        geofile_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        filename TEXT NOT NULL,
        uri TEXT NOT NULL,
        UNIQUE (record_uuid, filename, uri)
    )",
    "CREATE TABLE IF NOT EXISTS crdc (
        crdc_id INTEGER PRIMARY KEY AUTOINCREMENT,
        crdc_code TEXT NOT NULL UNIQUE,
        crdc_group_en TEXT NOT NULL DEFAULT '',
        crdc_group_fr TEXT NOT NULL DEFAULT '',
        crdc_class_en TEXT NOT NULL DEFAULT '',
        crdc_class_fr TEXT NOT NULL DEFAULT '',
        crdc_field_en TEXT NOT NULL DEFAULT '',
        crdc_field_fr TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS records_x_crdc (
        records_x_crdc_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        crdc_id INTEGER NOT NULL,
        UNIQUE (record_uuid, crdc_id)
    )",
    "CREATE TABLE IF NOT EXISTS domain_schemas (
        schema_id INTEGER PRIMARY KEY AUTOINCREMENT,
        namespace TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS domain_metadata (
        metadata_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL,
        schema_id INTEGER NOT NULL,
        field_name TEXT NOT NULL,
        field_value TEXT NOT NULL,
        UNIQUE (record_uuid, schema_id, field_name, field_value)
    )",
    "CREATE INDEX IF NOT EXISTS idx_descriptions_record ON descriptions (record_uuid)",
    "CREATE INDEX IF NOT EXISTS idx_geobbox_record ON geobbox (record_uuid)",
    "CREATE INDEX IF NOT EXISTS idx_geopoint_record ON geopoint (record_uuid)",
    "CREATE INDEX IF NOT EXISTS idx_geofile_record ON geofile (record_uuid)",
    "CREATE INDEX IF NOT EXISTS idx_domain_metadata_record ON domain_metadata (record_uuid)",
];

pub(crate) async fn initialize(session: &mut Session) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *session.conn).await?;
    }
    session
        .set_setting("dbversion", &DB_VERSION.to_string())
        .await?;
    debug!(statements = STATEMENTS.len(), "schema initialized");
    Ok(())
}

impl Session {
    pub async fn get_setting(&mut self, name: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT setting_value FROM settings WHERE setting_name = ?")
                .bind(name)
                .fetch_optional(&mut *self.conn)
                .await?,
        )
    }

    pub async fn set_setting(&mut self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (setting_name, setting_value) VALUES (?, ?)
             ON CONFLICT (setting_name) DO UPDATE SET setting_value = excluded.setting_value",
        )
        .bind(name)
        .bind(value)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }
}
