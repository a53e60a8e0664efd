//! Value and association primitives. Table and column names come only from the
//! static catalogue in `harvest_core`; every value is bound, never interpolated.

use harvest_core::{Column, ColumnValue, Scope, ValueTable, RECORD_ID_COLUMN};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite};
use tracing::warn;
use uuid::Uuid;

use crate::{Result, Session};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &'q ColumnValue) -> SqliteQuery<'q> {
    match value {
        ColumnValue::Text(text) => query.bind(text.as_str()),
        ColumnValue::Real(real) => query.bind(*real),
        ColumnValue::Integer(int) => query.bind(*int),
    }
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, columns: &'q [Column]) -> SqliteQuery<'q> {
    for column in columns {
        query = bind_value(query, &column.value);
    }
    query
}

fn conditions<'a>(prefix: &str, columns: impl IntoIterator<Item = &'a Column>) -> String {
    columns
        .into_iter()
        .map(|c| format!(" AND {prefix}{} = ?", c.name))
        .collect()
}

impl Session {
    pub async fn find_value(&mut self, table: ValueTable, key: &[Column]) -> Result<Option<i64>> {
        let filter = conditions("", key);
        let sql = format!(
            "SELECT {id} FROM {name} WHERE 1 = 1{filter} LIMIT 1",
            id = table.id_column(),
            name = table.name(),
        );
        let row = bind_all(sqlx::query(&sql), key)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(row.map(|r| r.try_get::<i64, _>(0)).transpose()?)
    }

    /// Insert a value row. A unique violation yields `None` so the caller can skip the value.
    pub async fn insert_value(
        &mut self,
        table: ValueTable,
        key: &[Column],
        payload: &[Column],
    ) -> Result<Option<i64>> {
        let columns: Vec<&Column> = key.iter().chain(payload).collect();
        let names = columns.iter().map(|c| c.name).collect::<Vec<_>>().join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({names}) VALUES ({placeholders})",
            table.name()
        );
        let mut query = sqlx::query(&sql);
        for column in &columns {
            query = bind_value(query, &column.value);
        }
        match query.execute(&mut *self.conn).await {
            Ok(done) => Ok(Some(done.last_insert_rowid())),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                warn!(table = table.name(), error = %err, "value insert hit unique constraint");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Rewrite payload columns when they differ from what is stored; true if a row changed.
    pub async fn refresh_value(
        &mut self,
        table: ValueTable,
        value_id: i64,
        payload: &[Column],
    ) -> Result<bool> {
        if payload.is_empty() {
            return Ok(false);
        }
        let assignments = payload
            .iter()
            .map(|c| format!("{} = ?", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let unchanged = payload
            .iter()
            .map(|c| format!("{} IS ?", c.name))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "UPDATE {name} SET {assignments} WHERE {id} = ? AND NOT ({unchanged})",
            name = table.name(),
            id = table.id_column(),
        );
        let query = bind_all(sqlx::query(&sql), payload).bind(value_id);
        let done = bind_all(query, payload).execute(&mut *self.conn).await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn delete_value(&mut self, table: ValueTable, value_id: i64) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            table.name(),
            table.id_column()
        );
        let done = sqlx::query(&sql)
            .bind(value_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Link a record to a shared value; false when the link already exists.
    pub async fn link_record(
        &mut self,
        table: ValueTable,
        value_id: i64,
        record_id: Uuid,
        edge: &[Column],
    ) -> Result<bool> {
        let Some(crosstable) = table.crosstable() else {
            return Ok(false);
        };
        let extra_names: String = edge.iter().map(|c| format!(", {}", c.name)).collect();
        let extra_slots = ", ?".repeat(edge.len());
        let sql = format!(
            "INSERT OR IGNORE INTO {crosstable} ({RECORD_ID_COLUMN}, {id}{extra_names}) VALUES (?, ?{extra_slots})",
            id = table.id_column(),
        );
        let query = sqlx::query(&sql).bind(record_id.to_string()).bind(value_id);
        let done = bind_all(query, edge).execute(&mut *self.conn).await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn unlink_record(
        &mut self,
        table: ValueTable,
        value_id: i64,
        record_id: Uuid,
        edge: &[Column],
    ) -> Result<u64> {
        let Some(crosstable) = table.crosstable() else {
            return Ok(0);
        };
        let filter = conditions("", edge);
        let sql = format!(
            "DELETE FROM {crosstable} WHERE {RECORD_ID_COLUMN} = ? AND {id} = ?{filter}",
            id = table.id_column(),
        );
        let query = sqlx::query(&sql).bind(record_id.to_string()).bind(value_id);
        let done = bind_all(query, edge).execute(&mut *self.conn).await?;
        Ok(done.rows_affected())
    }

    /// Ids of the values currently associated with a record, restricted to one field's scope.
    pub async fn associated_values(
        &mut self,
        table: ValueTable,
        record_id: Uuid,
        scope: Option<&Scope>,
    ) -> Result<Vec<i64>> {
        let id = table.id_column();
        let name = table.name();
        let (sql, filter) = match (table.crosstable(), scope) {
            (Some(crosstable), Some(Scope::Value(column))) => (
                format!(
                    "SELECT x.{id} FROM {crosstable} x JOIN {name} v ON v.{id} = x.{id}
                     WHERE x.{RECORD_ID_COLUMN} = ?{}",
                    conditions("v.", [column])
                ),
                Some(column),
            ),
            (Some(crosstable), Some(Scope::Link(column))) => (
                format!(
                    "SELECT {id} FROM {crosstable} WHERE {RECORD_ID_COLUMN} = ?{}",
                    conditions("", [column])
                ),
                Some(column),
            ),
            (Some(crosstable), None) => (
                format!("SELECT {id} FROM {crosstable} WHERE {RECORD_ID_COLUMN} = ?"),
                None,
            ),
            (None, Some(Scope::Value(column) | Scope::Link(column))) => (
                format!(
                    "SELECT {id} FROM {name} WHERE {RECORD_ID_COLUMN} = ?{}",
                    conditions("", [column])
                ),
                Some(column),
            ),
            (None, None) => (
                format!("SELECT {id} FROM {name} WHERE {RECORD_ID_COLUMN} = ?"),
                None,
            ),
        };
        let mut query = sqlx::query(&sql).bind(record_id.to_string());
        if let Some(column) = filter {
            query = bind_value(query, &column.value);
        }
        let rows = query.fetch_all(&mut *self.conn).await?;
        let mut ids = rows
            .iter()
            .map(|r| r.try_get::<i64, _>(0))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}
