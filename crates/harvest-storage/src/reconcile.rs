//! Set-difference reconciliation of one multi-valued field against what is stored.

use std::collections::HashSet;

use harvest_core::{
    domain_metadata_triples, Column, FieldKind, HarvestRecord, NormalizedValue, Rejection, Scope,
    ValueTable,
};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Result, Session};

/// Effect of reconciling one field of one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub inserted: usize,
    pub linked: usize,
    pub updated: usize,
    pub removed: usize,
    pub rejected: usize,
}

impl FieldChange {
    pub fn changed(&self) -> bool {
        self.inserted + self.linked + self.updated + self.removed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldReport {
    pub field: &'static str,
    pub change: FieldChange,
}

impl Session {
    /// Reconcile one field of `record` against the values stored for `record_id`.
    pub async fn reconcile(
        &mut self,
        record: &HarvestRecord,
        record_id: Uuid,
        kind: FieldKind,
    ) -> Result<FieldChange> {
        let scope = kind.scope();
        let (incoming, rejected) = match kind.normalize(record, record_id) {
            Some(values) => (Some(values.values), values.rejected),
            None => (None, Vec::new()),
        };
        log_rejections(record, &rejected);

        let mut change = self
            .apply_values(kind.table(), record_id, scope.as_ref(), incoming)
            .await?;
        change.rejected = rejected.len();
        Ok(change)
    }

    /// Domain metadata is reconciled like any record-scoped field once each
    /// namespace has been resolved to its `domain_schemas` row.
    pub async fn reconcile_domain_metadata(
        &mut self,
        record: &HarvestRecord,
        record_id: Uuid,
    ) -> Result<FieldChange> {
        let Some(metadata) = domain_metadata_triples(record) else {
            return self
                .apply_values(ValueTable::DomainMetadata, record_id, None, None)
                .await;
        };
        log_rejections(record, &metadata.rejected);

        let mut values = Vec::with_capacity(metadata.triples.len());
        for triple in &metadata.triples {
            let schema_key = triple.schema_key();
            let schema_id = match self.find_value(ValueTable::DomainSchemas, &schema_key).await? {
                Some(id) => id,
                None => match self
                    .insert_value(ValueTable::DomainSchemas, &schema_key, &[])
                    .await?
                {
                    Some(id) => id,
                    None => continue,
                },
            };
            values.push(triple.normalized(schema_id, record_id));
        }

        let mut change = self
            .apply_values(ValueTable::DomainMetadata, record_id, None, Some(values))
            .await?;
        change.rejected = metadata.rejected.len();
        Ok(change)
    }

    /// `None` means the field is absent from the incoming record: every scoped
    /// association is detached.
    async fn apply_values(
        &mut self,
        table: ValueTable,
        record_id: Uuid,
        scope: Option<&Scope>,
        incoming: Option<Vec<NormalizedValue>>,
    ) -> Result<FieldChange> {
        let existing: HashSet<i64> = self
            .associated_values(table, record_id, scope)
            .await?
            .into_iter()
            .collect();
        let mut kept = HashSet::new();
        let mut change = FieldChange::default();

        for value in incoming.into_iter().flatten() {
            let value_id = match self.find_value(table, &value.key).await? {
                Some(id) => {
                    if table.refreshes_payload()
                        && self.refresh_value(table, id, &value.payload).await?
                    {
                        change.updated += 1;
                    }
                    id
                }
                None => match self.insert_value(table, &value.key, &value.payload).await? {
                    Some(id) => {
                        change.inserted += 1;
                        id
                    }
                    None => continue,
                },
            };

            if !kept.insert(value_id) || existing.contains(&value_id) {
                continue;
            }
            if self.link_record(table, value_id, record_id, &value.edge).await? {
                change.linked += 1;
            }
        }

        let link_filter: Vec<Column> = match scope {
            Some(Scope::Link(column)) => vec![column.clone()],
            _ => Vec::new(),
        };
        for stale in existing.difference(&kept) {
            if table.crosstable().is_some() {
                self.unlink_record(table, *stale, record_id, &link_filter)
                    .await?;
            } else {
                self.delete_value(table, *stale).await?;
            }
            change.removed += 1;
        }

        if change.changed() {
            debug!(
                table = table.name(),
                record = %record_id,
                inserted = change.inserted,
                linked = change.linked,
                updated = change.updated,
                removed = change.removed,
                "field reconciled"
            );
        }
        Ok(change)
    }
}

fn log_rejections(record: &HarvestRecord, rejected: &[Rejection]) {
    for rejection in rejected {
        warn!(identifier = %record.identifier, %rejection, "dropped value");
    }
}
