//! PostgreSQL implementation of InstanceStore
//!
//! Each instance is one row holding the JSONB snapshot plus the columns the
//! scheduler queries on (status, next due time, correlation id). Bookmark
//! names are mirrored into `workflow_bookmarks` so signal routing does not
//! have to scan snapshots. The revision column enforces optimistic concurrency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::instance::WorkflowInstance;

/// PostgreSQL implementation of InstanceStore
///
/// # Example
///
/// ```ignore
/// use clinicflow_engine::PostgresInstanceStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/clinicflow").await?;
/// let store = PostgresInstanceStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

impl PostgresInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and build a store from a database URL
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn replace_bookmarks(
        tx: &mut Transaction<'_, Postgres>,
        instance: &WorkflowInstance,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workflow_bookmarks WHERE instance_id = $1")
            .bind(instance.id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for bookmark in &instance.bookmarks {
            sqlx::query(
                r#"
                INSERT INTO workflow_bookmarks (instance_id, name, activity_id, kind, due_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(instance.id)
            .bind(&bookmark.name)
            .bind(&bookmark.activity_id)
            .bind(kind_name(bookmark.kind))
            .bind(bookmark.due_at)
            .bind(bookmark.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }
}

fn kind_name(kind: crate::instance::BookmarkKind) -> &'static str {
    use crate::instance::BookmarkKind;
    match kind {
        BookmarkKind::Signal => "signal",
        BookmarkKind::Event => "event",
        BookmarkKind::Timer => "timer",
        BookmarkKind::AsyncActivity => "async_activity",
    }
}

fn snapshot(instance: &WorkflowInstance) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(instance).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let snapshot: serde_json::Value = row.get("snapshot");
    let revision: i64 = row.get("revision");
    let mut instance: WorkflowInstance =
        serde_json::from_value(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
    instance.revision = revision as u64;
    Ok(instance)
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn create(&self, instance: &WorkflowInstance) -> Result<u64, StoreError> {
        let mut stored = instance.clone();
        stored.revision = 1;
        let data = snapshot(&stored)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, workflow_id, definition_version, status, correlation_id, priority,
                 revision, next_due_at, created_at, updated_at, snapshot)
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(stored.id)
        .bind(&stored.workflow_id)
        .bind(stored.version as i32)
        .bind(stored.status.as_str())
        .bind(&stored.correlation_id)
        .bind(stored.priority as i16)
        .bind(stored.next_due_at)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .bind(&data)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(stored.id));
        }

        Self::replace_bookmarks(&mut tx, &stored).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(workflow_id = %stored.workflow_id, "created instance");
        Ok(1)
    }

    #[instrument(skip(self))]
    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT snapshot, revision FROM workflow_instances WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load instance: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::InstanceNotFound(id))?;

        from_row(&row)
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id, revision = instance.revision))]
    async fn save(&self, instance: &WorkflowInstance) -> Result<u64, StoreError> {
        let revision = instance.revision + 1;
        let mut stored = instance.clone();
        stored.revision = revision;
        let data = snapshot(&stored)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $3, correlation_id = $4, priority = $5, revision = $6,
                next_due_at = $7, updated_at = $8, snapshot = $9
            WHERE id = $1 AND revision = $2
            "#,
        )
        .bind(stored.id)
        .bind(instance.revision as i64)
        .bind(stored.status.as_str())
        .bind(&stored.correlation_id)
        .bind(stored.priority as i16)
        .bind(revision as i64)
        .bind(stored.next_due_at)
        .bind(stored.updated_at)
        .bind(&data)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to save instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            let row = sqlx::query("SELECT revision FROM workflow_instances WHERE id = $1")
                .bind(stored.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

            return match row {
                Some(row) => Err(StoreError::ConcurrencyConflict {
                    expected: instance.revision,
                    actual: row.get::<i64, _>("revision") as u64,
                }),
                None => Err(StoreError::InstanceNotFound(stored.id)),
            };
        }

        Self::replace_bookmarks(&mut tx, &stored).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(revision, status = %stored.status, "saved instance");
        Ok(revision)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        // workflow_bookmarks rows cascade
        let result = sqlx::query("DELETE FROM workflow_instances WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete instance: {}", e);
                StoreError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_bookmark(
        &self,
        name: &str,
        correlation_id: Option<&str>,
        workflow_id: Option<&str>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT i.id
            FROM workflow_bookmarks b
            JOIN workflow_instances i ON i.id = b.instance_id
            WHERE b.name = $1
              AND ($2::text IS NULL OR i.correlation_id = $2)
              AND ($3::text IS NULL OR i.workflow_id = $3)
            ORDER BY i.created_at, i.id
            "#,
        )
        .bind(name)
        .bind(correlation_id)
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find instances by bookmark: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM workflow_instances
            WHERE next_due_at IS NOT NULL AND next_due_at <= $1
            ORDER BY next_due_at
            LIMIT 500
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find due instances: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        filter: &InstanceFilter,
        page: Pagination,
    ) -> Result<Page<WorkflowInstance>, StoreError> {
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM workflow_instances
            WHERE ($1::text IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR correlation_id = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
            "#,
        )
        .bind(&filter.workflow_id)
        .bind(status)
        .bind(&filter.correlation_id)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count instances: {}", e);
            StoreError::Database(e.to_string())
        })?
        .get("total");

        let rows = sqlx::query(
            r#"
            SELECT snapshot, revision FROM workflow_instances
            WHERE ($1::text IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR correlation_id = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
            ORDER BY created_at DESC, id DESC
            OFFSET $6 LIMIT $7
            "#,
        )
        .bind(&filter.workflow_id)
        .bind(status)
        .bind(&filter.correlation_id)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(page.offset() as i64)
        .bind(page.limit() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list instances: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let items = rows.iter().map(from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page_number: page.page_number,
            page_size: page.page_size,
        })
    }
}
