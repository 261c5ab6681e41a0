use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use rtb_core::{
    ports::StatusRepository,
    status::{NewStatus, ObjectType, Status, StatusCode, StatusMetadata},
    Result,
};
use uuid::Uuid;

use crate::database::{parse_ts, parse_uuid, storage_err, ts, Database};

const COLUMNS: &str = "id, object_type, object_id, status, seq, error_message, metadata, created_at";

/// Append-only status log. `seq` is assigned inside the insert statement, so
/// it is gap-free and strictly increasing per object.
pub struct SqliteStatuses {
    db: Database,
}

impl SqliteStatuses {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

struct StatusRow {
    id: String,
    object_type: String,
    object_id: String,
    status: i16,
    seq: i64,
    error_message: Option<String>,
    metadata: String,
    created_at: String,
}

impl StatusRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            object_type: row.get(1)?,
            object_id: row.get(2)?,
            status: row.get(3)?,
            seq: row.get(4)?,
            error_message: row.get(5)?,
            metadata: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_domain(self) -> Result<Status> {
        // Metadata written by a newer build may not parse; keep the row usable.
        let metadata = serde_json::from_str::<StatusMetadata>(&self.metadata).unwrap_or_else(|e| {
            tracing::warn!(status_id = %self.id, error = %e, "unreadable status metadata");
            StatusMetadata::None
        });
        Ok(Status {
            id: parse_uuid(&self.id)?,
            object_type: ObjectType::parse(&self.object_type)?,
            object_id: parse_uuid(&self.object_id)?,
            status: StatusCode::from_code(self.status)?,
            seq: self.seq,
            error_message: self.error_message,
            metadata,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[async_trait]
impl StatusRepository for SqliteStatuses {
    async fn insert(&self, status: NewStatus) -> Result<Status> {
        let id = Uuid::new_v4();
        let metadata = serde_json::to_string(&status.metadata)?;
        let row = (
            id.to_string(),
            status.object_type.as_str(),
            status.object_id.to_string(),
            status.status.code(),
            status.error_message.clone(),
            metadata,
            ts(&status.created_at),
        );
        let seq = self
            .db
            .connection()
            .call(move |conn| {
                conn.query_row(
                    "INSERT INTO statuses (id, object_type, object_id, status, seq, error_message, \
                     metadata, created_at) \
                     VALUES (?1, ?2, ?3, ?4, \
                       (SELECT COALESCE(MAX(seq), 0) + 1 FROM statuses \
                        WHERE object_type = ?2 AND object_id = ?3), \
                       ?5, ?6, ?7) \
                     RETURNING seq",
                    params![row.0, row.1, row.2, row.3, row.4, row.5, row.6],
                    |r| r.get::<_, i64>(0),
                )
            })
            .await
            .map_err(storage_err)?;

        Ok(Status {
            id,
            object_type: status.object_type,
            object_id: status.object_id,
            status: status.status,
            seq,
            error_message: status.error_message,
            metadata: status.metadata,
            created_at: status.created_at,
        })
    }

    async fn latest(&self, object_type: ObjectType, object_id: Uuid) -> Result<Option<Status>> {
        let (kind, id) = (object_type.as_str(), object_id.to_string());
        let row = self
            .db
            .connection()
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM statuses WHERE object_type = ?1 AND object_id = ?2 \
                         ORDER BY created_at DESC, seq DESC LIMIT 1"
                    ),
                    params![kind, id],
                    StatusRow::from_row,
                )
                .optional()
            })
            .await
            .map_err(storage_err)?;
        row.map(StatusRow::into_domain).transpose()
    }

    async fn list_by_object(
        &self,
        object_type: ObjectType,
        object_id: Uuid,
    ) -> Result<Vec<Status>> {
        let (kind, id) = (object_type.as_str(), object_id.to_string());
        let rows = self
            .db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM statuses WHERE object_type = ?1 AND object_id = ?2 \
                     ORDER BY created_at ASC, seq ASC"
                ))?;
                let rows = stmt
                    .query_map(params![kind, id], StatusRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(StatusRow::into_domain).collect()
    }
}
