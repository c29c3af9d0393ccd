use crate::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use courier_primitives::{decrypt, encrypt};
use sqlx::{PgPool, Row};

/// A sponsor row: the paymaster contract address and its signing key.
#[derive(Clone, Debug)]
pub struct Sponsor {
    pub contract: String,
    pub private_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store of paymaster signing keys, encrypted at rest with the database
/// secret.
#[derive(Clone)]
pub struct SponsorStore {
    suffix: String,
    db: PgPool,
    rdb: PgPool,
    secret: String,
}

impl SponsorStore {
    pub fn new(suffix: &str, db: PgPool, rdb: PgPool, secret: &str) -> Self {
        Self { suffix: suffix.to_string(), db, rdb, secret: secret.to_string() }
    }

    fn table(&self) -> String {
        format!("t_sponsors_{}", self.suffix)
    }

    pub async fn create_table(&self) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {}(
                contract TEXT NOT NULL PRIMARY KEY,
                pk TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp
            );
            "#,
            self.table()
        ))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Store a sponsor's key, encrypting it before it leaves the process.
    pub async fn add_sponsor(&self, contract: &str, private_key: &str) -> StoreResult<()> {
        let encrypted = encrypt(private_key, &self.secret)?;
        let now = Utc::now();

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (contract, pk, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (contract)
            DO UPDATE SET pk = EXCLUDED.pk, updated_at = EXCLUDED.updated_at
            "#,
            self.table()
        ))
        .bind(contract)
        .bind(encrypted)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Fetch and decrypt the signing key for a paymaster contract.
    pub async fn get_sponsor(&self, contract: &str) -> StoreResult<Sponsor> {
        let row = sqlx::query(&format!(
            "SELECT contract, pk, created_at, updated_at FROM {} \
             WHERE LOWER(contract) = LOWER($1)",
            self.table()
        ))
        .bind(contract)
        .fetch_optional(&self.rdb)
        .await?
        .ok_or(StoreError::NotFound)?;

        let encrypted: String = row.try_get("pk")?;

        Ok(Sponsor {
            contract: row.try_get("contract")?,
            private_key: decrypt(&encrypted, &self.secret)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
