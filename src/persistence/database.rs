use crate::persistence::store::{EntityRecord, RecordStore};
use crate::scheduler::budget::WindowLedger;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Instant;
use tracing::info;

#[derive(Clone)]
pub struct PgRecordStore {
    pub pool: PgPool,
}

fn observe<T>(table: &'static str, op: &'static str, res: &Result<T, sqlx::Error>, start: Instant) {
    let status = if res.is_ok() { "success" } else { "error" };
    metrics::counter!("record_store_queries_total", "table" => table, "op" => op, "status" => status)
        .increment(1);
    metrics::histogram!("record_store_query_duration_seconds", "table" => table, "op" => op)
        .record(start.elapsed().as_secs_f64());
}

impl PgRecordStore {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_records (
                entity TEXT PRIMARY KEY,
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Single row: the current window ledger.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS window_ledger (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                ledger JSONB NOT NULL,
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("record store tables initialized (Postgres)");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_entity(&self, entity: &str) -> Result<Option<EntityRecord>> {
        let start = Instant::now();
        let row = sqlx::query("SELECT record FROM entity_records WHERE entity = $1")
            .bind(entity)
            .fetch_optional(&self.pool)
            .await;
        observe("entity_records", "select", &row, start);

        match row? {
            Some(row) => {
                let Json(record): Json<EntityRecord> = row.try_get("record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn save_entity(&self, record: &EntityRecord) -> Result<()> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            INSERT INTO entity_records (entity, record, updated_at)
            VALUES ($1, $2, CURRENT_TIMESTAMP)
            ON CONFLICT (entity) DO UPDATE SET
                record = EXCLUDED.record,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.entity)
        .bind(Json(record))
        .execute(&self.pool)
        .await;
        observe("entity_records", "upsert", &res, start);
        res?;
        Ok(())
    }

    async fn load_window(&self) -> Result<Option<WindowLedger>> {
        let start = Instant::now();
        let row = sqlx::query("SELECT ledger FROM window_ledger WHERE id = 1")
            .fetch_optional(&self.pool)
            .await;
        observe("window_ledger", "select", &row, start);

        match row? {
            Some(row) => {
                let Json(ledger): Json<WindowLedger> = row.try_get("ledger")?;
                Ok(Some(ledger))
            }
            None => Ok(None),
        }
    }

    async fn save_window(&self, ledger: &WindowLedger) -> Result<()> {
        let start = Instant::now();
        let res = sqlx::query(
            r#"
            INSERT INTO window_ledger (id, ledger, updated_at)
            VALUES (1, $1, CURRENT_TIMESTAMP)
            ON CONFLICT (id) DO UPDATE SET
                ledger = EXCLUDED.ledger,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(Json(ledger))
        .execute(&self.pool)
        .await;
        observe("window_ledger", "upsert", &res, start);
        res?;
        Ok(())
    }
}
