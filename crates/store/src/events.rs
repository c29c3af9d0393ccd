use crate::{shorten, StoreResult};
use chrono::Utc;
use courier_primitives::Event;
use sqlx::{postgres::PgRow, PgPool, Row};

/// Registry of configured event subscriptions.
#[derive(Clone)]
pub struct EventStore {
    suffix: String,
    db: PgPool,
    rdb: PgPool,
}

const COLUMNS: &str = "contract, event_signature, name, created_at, updated_at";

impl EventStore {
    pub fn new(suffix: &str, db: PgPool, rdb: PgPool) -> Self {
        Self { suffix: suffix.to_string(), db, rdb }
    }

    fn table(&self) -> String {
        format!("t_events_{}", self.suffix)
    }

    pub async fn create_table(&self) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {}(
                contract TEXT NOT NULL,
                event_signature TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp,
                UNIQUE (contract, event_signature)
            );
            "#,
            self.table()
        ))
        .execute(&self.db)
        .await?;

        let short = shorten(&self.suffix, 6);
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_events_{short}_contract_signature \
             ON {} (contract, event_signature);",
            self.table()
        ))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Register a subscription, updating the human name on conflict.
    pub async fn add_event(&self, event: &Event) -> StoreResult<()> {
        let now = Utc::now();

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (contract, event_signature, name, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (contract, event_signature)
            DO UPDATE SET name = EXCLUDED.name, updated_at = EXCLUDED.updated_at
            "#,
            self.table()
        ))
        .bind(&event.contract)
        .bind(&event.event_signature)
        .bind(&event.name)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn get_event(
        &self,
        contract: &str,
        event_signature: &str,
    ) -> StoreResult<Option<Event>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE contract = $1 AND event_signature = $2",
            self.table()
        ))
        .bind(contract)
        .bind(event_signature)
        .fetch_optional(&self.rdb)
        .await?;

        Ok(row.as_ref().map(row_to_event))
    }

    /// All configured subscriptions, oldest first.
    pub async fn get_events(&self) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} ORDER BY created_at ASC",
            self.table()
        ))
        .fetch_all(&self.rdb)
        .await?;

        Ok(rows.iter().map(row_to_event).collect())
    }

    /// Whether any subscription exists for the contract (case-insensitive).
    pub async fn event_exists(&self, contract: &str) -> StoreResult<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 AS one FROM {} WHERE LOWER(contract) = LOWER($1) LIMIT 1",
            self.table()
        ))
        .bind(contract)
        .fetch_optional(&self.rdb)
        .await?;

        Ok(row.is_some())
    }
}

fn row_to_event(row: &PgRow) -> Event {
    Event {
        contract: row.get("contract"),
        event_signature: row.get("event_signature"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
