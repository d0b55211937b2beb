//! PostgreSQL store backed by `sqlx`.
//!
//! Every entity type shares one table:
//!
//! ```sql
//! engine_record(entity_type TEXT, id TEXT, revision BIGINT, data JSONB)
//! ```
//!
//! Sessions are real transactions. Conditional writes are plain
//! `UPDATE ... WHERE revision = $expected` statements whose affected row
//! count is reported back to the engine.

use super::{Condition, EntityRecord, RecordQuery, Storage, StorageSession};
use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS engine_record (
    entity_type TEXT NOT NULL,
    id TEXT NOT NULL,
    revision BIGINT NOT NULL,
    data JSONB NOT NULL,
    PRIMARY KEY (entity_type, id)
)
"#;

/// PostgreSQL-backed [`Storage`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool using the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(config.connect_options())
            .await?;

        tracing::info!(
            url = %config.display_url(),
            max_connections = config.max_connections,
            "Database connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the record table if it does not exist yet.
    pub async fn ensure_schema(&self) -> EngineResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl Storage for PgStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn open_session(&self) -> EngineResult<Box<dyn StorageSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

struct PgSession {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgSession {
    fn tx(&mut self) -> EngineResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .get_mut()
            .as_mut()
            .ok_or_else(|| EngineError::Storage("transaction already finished".to_string()))
    }
}

fn record_from_row(row: &PgRow) -> EngineResult<EntityRecord> {
    Ok(EntityRecord {
        entity_type: row.try_get("entity_type")?,
        id: row.try_get("id")?,
        revision: row.try_get("revision")?,
        data: row.try_get::<Value, _>("data")?,
    })
}

fn push_condition(builder: &mut QueryBuilder<'_, Postgres>, condition: &Condition) {
    match condition {
        Condition::Eq { field, value } if value.is_null() => {
            push_condition(builder, &Condition::is_null(field.clone()));
        }
        Condition::Eq { field, value } => {
            builder.push("(data -> ");
            builder.push_bind(field.clone());
            builder.push(") = ");
            builder.push_bind(sqlx::types::Json(value.clone()));
        }
        Condition::IsNull { field } => {
            builder.push("COALESCE(jsonb_typeof(data -> ");
            builder.push_bind(field.clone());
            builder.push("), 'null') = 'null'");
        }
        Condition::AtMost { field, value } => {
            // Casting is only safe once the type is known to be numeric.
            builder.push("CASE WHEN jsonb_typeof(data -> ");
            builder.push_bind(field.clone());
            builder.push(") = 'number' THEN (data ->> ");
            builder.push_bind(field.clone());
            builder.push(")::bigint <= ");
            builder.push_bind(*value);
            builder.push(" ELSE FALSE END");
        }
        Condition::Any(conditions) if conditions.is_empty() => {
            builder.push("FALSE");
        }
        Condition::Any(conditions) => {
            for (i, nested) in conditions.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder.push("(");
                push_condition(builder, nested);
                builder.push(")");
            }
        }
    }
}

#[async_trait]
impl StorageSession for PgSession {
    async fn find(&mut self, entity_type: &str, id: &str) -> EngineResult<Option<EntityRecord>> {
        let tx = self.tx()?;
        let row = sqlx::query(
            "SELECT entity_type, id, revision, data FROM engine_record WHERE entity_type = $1 AND id = $2",
        )
        .bind(entity_type)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn query(&mut self, query: &RecordQuery) -> EngineResult<Vec<EntityRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT entity_type, id, revision, data FROM engine_record WHERE entity_type = ",
        );
        builder.push_bind(query.entity_type.clone());
        for condition in &query.conditions {
            builder.push(" AND (");
            push_condition(&mut builder, condition);
            builder.push(")");
        }
        builder.push(" ORDER BY ");
        if let Some(field) = &query.order_by {
            builder.push("(data ->> ");
            builder.push_bind(field.clone());
            builder.push(")::bigint ASC NULLS FIRST, ");
        }
        builder.push("id ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let tx = self.tx()?;
        let rows = builder.build().fetch_all(&mut **tx).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn insert(&mut self, record: &EntityRecord) -> EngineResult<()> {
        let tx = self.tx()?;
        let result = sqlx::query(
            "INSERT INTO engine_record (entity_type, id, revision, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.entity_type)
        .bind(&record.id)
        .bind(record.revision)
        .bind(sqlx::types::Json(&record.data))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                EngineError::conflict(&record.entity_type, &record.id, "row already exists"),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&mut self, record: &EntityRecord, expected_revision: i64) -> EngineResult<u64> {
        let tx = self.tx()?;
        let result = sqlx::query(
            "UPDATE engine_record SET revision = $3, data = $4 \
             WHERE entity_type = $1 AND id = $2 AND revision = $5",
        )
        .bind(&record.entity_type)
        .bind(&record.id)
        .bind(record.revision)
        .bind(sqlx::types::Json(&record.data))
        .bind(expected_revision)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete(
        &mut self,
        entity_type: &str,
        id: &str,
        expected_revision: i64,
    ) -> EngineResult<u64> {
        let tx = self.tx()?;
        let result = sqlx::query(
            "DELETE FROM engine_record WHERE entity_type = $1 AND id = $2 AND revision = $3",
        )
        .bind(entity_type)
        .bind(id)
        .bind(expected_revision)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> EngineResult<()> {
        if let Some(tx) = self.tx.get_mut().take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> EngineResult<()> {
        if let Some(tx) = self.tx.get_mut().take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
