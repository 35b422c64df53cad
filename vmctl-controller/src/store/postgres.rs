use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;
use vmctl_common::{ObjectMeta, ResourceKey, VmResource, VmSpec, VmStatus};

use super::{plan_status_update, plan_update, KeyStream, ResourceStore, StoreError, WriteOutcome};

/// Channel fed by the `vm_resources_notify` trigger; payload is `namespace/name`.
pub const EVENTS_CHANNEL: &str = "vm_resource_events";

const SELECT_COLUMNS: &str = "namespace, name, uid, resource_version, generation, finalizers, \
     deletion_timestamp, created_at, spec, status";

#[derive(sqlx::FromRow)]
struct VmResourceRow {
    namespace: String,
    name: String,
    uid: Uuid,
    resource_version: i64,
    generation: i64,
    finalizers: Vec<String>,
    deletion_timestamp: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    spec: Json<VmSpec>,
    status: Json<VmStatus>,
}

impl From<VmResourceRow> for VmResource {
    fn from(row: VmResourceRow) -> Self {
        VmResource {
            metadata: ObjectMeta {
                namespace: row.namespace,
                name: row.name,
                uid: row.uid,
                resource_version: row.resource_version,
                generation: row.generation,
                finalizers: row.finalizers,
                deletion_timestamp: row.deletion_timestamp,
                creation_timestamp: row.created_at,
            },
            spec: row.spec.0,
            status: row.status.0,
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("connected to database");
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../sqlx-migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        key: &ResourceKey,
    ) -> Result<VmResource, StoreError> {
        let row: Option<VmResourceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM vm_resources WHERE namespace = $1 AND name = $2 FOR UPDATE",
            SELECT_COLUMNS
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(VmResource::from)
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn delete_row(
        tx: &mut Transaction<'_, Postgres>,
        key: &ResourceKey,
        version: i64,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            "DELETE FROM vm_resources WHERE namespace = $1 AND name = $2 AND resource_version = $3",
        )
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(version)
        .execute(&mut **tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: version,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn get(&self, key: &ResourceKey) -> Result<VmResource, StoreError> {
        let row: Option<VmResourceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM vm_resources WHERE namespace = $1 AND name = $2",
            SELECT_COLUMNS
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(VmResource::from)
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn create(&self, key: &ResourceKey, spec: VmSpec) -> Result<VmResource, StoreError> {
        spec.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let row: Option<VmResourceRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO vm_resources (namespace, name, uid, resource_version, generation, spec)
            VALUES ($1, $2, $3, 1, 1, $4)
            ON CONFLICT (namespace, name) DO NOTHING
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(Uuid::new_v4())
        .bind(Json(&spec))
        .fetch_optional(&self.pool)
        .await?;
        row.map(VmResource::from)
            .ok_or_else(|| StoreError::AlreadyExists(key.clone()))
    }

    async fn update(&self, record: &VmResource) -> Result<Option<VmResource>, StoreError> {
        let key = record.key();
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_row(&mut tx, &key).await?;

        let result = match plan_update(&current, record)? {
            WriteOutcome::Unchanged(current) => Some(current),
            WriteOutcome::Changed(next) => {
                let res = sqlx::query(
                    r#"
                    UPDATE vm_resources
                    SET finalizers = $3,
                        spec = $4,
                        generation = $5,
                        resource_version = $6
                    WHERE namespace = $1 AND name = $2 AND resource_version = $7
                    "#,
                )
                .bind(&key.namespace)
                .bind(&key.name)
                .bind(&next.metadata.finalizers)
                .bind(Json(&next.spec))
                .bind(next.metadata.generation)
                .bind(next.metadata.resource_version)
                .bind(current.metadata.resource_version)
                .execute(&mut *tx)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(StoreError::Conflict {
                        key,
                        expected: record.metadata.resource_version,
                    });
                }
                Some(next)
            }
            WriteOutcome::Removed => {
                Self::delete_row(&mut tx, &key, current.metadata.resource_version).await?;
                None
            }
        };
        tx.commit().await?;
        Ok(result)
    }

    async fn update_status(&self, record: &VmResource) -> Result<VmResource, StoreError> {
        let key = record.key();
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_row(&mut tx, &key).await?;

        let next = match plan_status_update(&current, record)? {
            WriteOutcome::Changed(next) => next,
            WriteOutcome::Unchanged(current) => {
                tx.commit().await?;
                return Ok(current);
            }
            WriteOutcome::Removed => {
                return Err(StoreError::Invalid(
                    "status writes never remove records".to_string(),
                ))
            }
        };
        let res = sqlx::query(
            r#"
            UPDATE vm_resources
            SET status = $3,
                resource_version = $4
            WHERE namespace = $1 AND name = $2 AND resource_version = $5
            "#,
        )
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(Json(&next.status))
        .bind(next.metadata.resource_version)
        .bind(current.metadata.resource_version)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                key,
                expected: record.metadata.resource_version,
            });
        }
        tx.commit().await?;
        Ok(next)
    }

    async fn request_delete(&self, key: &ResourceKey) -> Result<Option<VmResource>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_row(&mut tx, key).await?;

        if current.metadata.finalizers.is_empty() {
            Self::delete_row(&mut tx, key, current.metadata.resource_version).await?;
            tx.commit().await?;
            return Ok(None);
        }
        if current.metadata.is_being_deleted() {
            tx.commit().await?;
            return Ok(Some(current));
        }

        let row: VmResourceRow = sqlx::query_as(&format!(
            r#"
            UPDATE vm_resources
            SET deletion_timestamp = NOW(),
                resource_version = resource_version + 1
            WHERE namespace = $1 AND name = $2
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(row.into()))
    }

    async fn list(&self) -> Result<Vec<VmResource>, StoreError> {
        let rows: Vec<VmResourceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM vm_resources ORDER BY namespace, name",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(VmResource::from).collect())
    }

    async fn watch(&self) -> Result<KeyStream, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(EVENTS_CHANNEL).await?;
        info!(channel = EVENTS_CHANNEL, "listening for record changes");

        let stream = listener.into_stream().filter_map(|event| async move {
            match event {
                Ok(notification) => match notification.payload().parse::<ResourceKey>() {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed change notification");
                        None
                    }
                },
                Err(e) => {
                    // PgListener reconnects on its own; keys missed meanwhile come back on resync.
                    warn!(error = %e, "change listener error");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
