use crate::{shorten, StoreResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::{fmt, str::FromStr};

/// Status of a persisted user operation.
///
/// Transitions are monotone; the only legal edges are the ones encoded in
/// [`UserOpStatus::allowed_sources`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserOpStatus {
    Pending,
    Submitted,
    Success,
    Reverted,
    Timeout,
}

impl UserOpStatus {
    /// The states a transition into `self` may start from.
    pub fn allowed_sources(self) -> &'static [UserOpStatus] {
        match self {
            UserOpStatus::Pending => &[],
            UserOpStatus::Submitted => &[UserOpStatus::Pending],
            UserOpStatus::Success => &[UserOpStatus::Submitted, UserOpStatus::Timeout],
            UserOpStatus::Reverted => {
                &[UserOpStatus::Pending, UserOpStatus::Submitted, UserOpStatus::Timeout]
            }
            UserOpStatus::Timeout => &[UserOpStatus::Submitted],
        }
    }

    pub fn can_transition_from(self, from: UserOpStatus) -> bool {
        self.allowed_sources().contains(&from)
    }
}

impl fmt::Display for UserOpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserOpStatus::Pending => "pending",
            UserOpStatus::Submitted => "submitted",
            UserOpStatus::Success => "success",
            UserOpStatus::Reverted => "reverted",
            UserOpStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for UserOpStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UserOpStatus::Pending),
            "submitted" => Ok(UserOpStatus::Submitted),
            "success" => Ok(UserOpStatus::Success),
            "reverted" => Ok(UserOpStatus::Reverted),
            "timeout" => Ok(UserOpStatus::Timeout),
            _ => Err(eyre::eyre!("unknown user operation status: {s}")),
        }
    }
}

/// A persisted user operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredUserOp {
    pub user_op_hash: String,
    pub tx_hash: Option<String>,
    pub status: UserOpStatus,
    pub valid_until: i64,
    pub valid_after: i64,
    pub sender: String,
    pub paymaster: String,
    pub entry_point: String,
    pub user_op: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable state machine for user operations, keyed by the operation hash.
#[derive(Clone)]
pub struct UserOpStore {
    suffix: String,
    db: PgPool,
    rdb: PgPool,
}

const COLUMNS: &str = "user_op_hash, tx_hash, status, valid_until, valid_after, sender, \
                       paymaster, entry_point, user_op, created_at, updated_at";

impl UserOpStore {
    pub fn new(suffix: &str, db: PgPool, rdb: PgPool) -> Self {
        Self { suffix: suffix.to_string(), db, rdb }
    }

    fn table(&self) -> String {
        format!("t_userops_{}", self.suffix)
    }

    pub async fn create_table(&self) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {}(
                user_op_hash TEXT NOT NULL PRIMARY KEY,
                tx_hash TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                valid_until BIGINT NOT NULL,
                valid_after BIGINT NOT NULL,
                sender TEXT NOT NULL,
                paymaster TEXT NOT NULL,
                entry_point TEXT NOT NULL,
                user_op JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp
            );
            "#,
            self.table()
        ))
        .execute(&self.db)
        .await?;

        let short = shorten(&self.suffix, 6);
        for (name, columns) in [
            ("status", "(status)"),
            ("valid_after", "(valid_after)"),
            ("tx_hash", "(tx_hash)"),
            ("status_valid_after", "(status, valid_after)"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_userops_{short}_{name} ON {} {columns};",
                self.table()
            ))
            .execute(&self.db)
            .await?;
        }

        Ok(())
    }

    /// Insert a freshly submitted operation as `pending`; resubmissions of
    /// the same hash are no-ops.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_user_op(
        &self,
        user_op_hash: &str,
        valid_until: i64,
        valid_after: i64,
        sender: &str,
        paymaster: &str,
        entry_point: &str,
        user_op: &Value,
    ) -> StoreResult<()> {
        let now = Utc::now();

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (user_op_hash, status, valid_until, valid_after, sender, paymaster,
                            entry_point, user_op, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_op_hash) DO NOTHING
            "#,
            self.table()
        ))
        .bind(user_op_hash)
        .bind(UserOpStatus::Pending.to_string())
        .bind(valid_until)
        .bind(valid_after)
        .bind(sender)
        .bind(paymaster)
        .bind(entry_point)
        .bind(user_op)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Move an operation to `status`. The update only applies when the
    /// current status is a legal source for the transition, which keeps the
    /// state machine monotone even under concurrent writers.
    pub async fn update_status(&self, user_op_hash: &str, status: UserOpStatus) -> StoreResult<()> {
        let sources: Vec<String> =
            status.allowed_sources().iter().map(|s| s.to_string()).collect();

        sqlx::query(&format!(
            "UPDATE {} SET status = $1, updated_at = $2 \
             WHERE user_op_hash = $3 AND status = ANY($4)",
            self.table()
        ))
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(user_op_hash)
        .bind(&sources)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Record the bundle broadcast: status and transaction hash written in
    /// the same step. A tx hash, once written, is never cleared.
    pub async fn update_status_and_tx_hash(
        &self,
        user_op_hash: &str,
        status: UserOpStatus,
        tx_hash: &str,
    ) -> StoreResult<()> {
        let sources: Vec<String> =
            status.allowed_sources().iter().map(|s| s.to_string()).collect();

        sqlx::query(&format!(
            "UPDATE {} SET status = $1, tx_hash = $2, updated_at = $3 \
             WHERE user_op_hash = $4 AND status = ANY($5)",
            self.table()
        ))
        .bind(status.to_string())
        .bind(tx_hash)
        .bind(Utc::now())
        .bind(user_op_hash)
        .bind(&sources)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn get_user_op(&self, user_op_hash: &str) -> StoreResult<Option<StoredUserOp>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE user_op_hash = $1",
            self.table()
        ))
        .bind(user_op_hash)
        .fetch_optional(&self.rdb)
        .await?;

        row.as_ref().map(row_to_userop).transpose()
    }

    pub async fn get_by_tx_hash(&self, tx_hash: &str) -> StoreResult<Option<StoredUserOp>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE tx_hash = $1",
            self.table()
        ))
        .bind(tx_hash)
        .fetch_optional(&self.rdb)
        .await?;

        row.as_ref().map(row_to_userop).transpose()
    }

    /// Pending operations that are still inside their validity window,
    /// soonest `valid_after` first.
    pub async fn pending_by_valid_after(&self, limit: i64) -> StoreResult<Vec<StoredUserOp>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM {}
            WHERE status = $1 AND valid_until > $2
            ORDER BY valid_after ASC
            LIMIT $3
            "#,
            self.table()
        ))
        .bind(UserOpStatus::Pending.to_string())
        .bind(Utc::now().timestamp())
        .bind(limit)
        .fetch_all(&self.rdb)
        .await?;

        rows.iter().map(row_to_userop).collect()
    }

    /// Pending operations whose validity window already closed.
    pub async fn expired_pending(&self) -> StoreResult<Vec<StoredUserOp>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE status = $1 AND valid_until <= $2",
            self.table()
        ))
        .bind(UserOpStatus::Pending.to_string())
        .bind(Utc::now().timestamp())
        .fetch_all(&self.rdb)
        .await?;

        rows.iter().map(row_to_userop).collect()
    }

    /// Expire every pending operation whose `valid_until` has passed.
    pub async fn mark_expired_reverted(&self) -> StoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = $1, updated_at = $2 \
             WHERE status = $3 AND valid_until <= $4",
            self.table()
        ))
        .bind(UserOpStatus::Reverted.to_string())
        .bind(Utc::now())
        .bind(UserOpStatus::Pending.to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Timed-out operations last touched more than `minutes` ago.
    pub async fn timeout_older_than(&self, minutes: i64) -> StoreResult<Vec<StoredUserOp>> {
        let cutoff = Utc::now() - Duration::minutes(minutes);

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE status = $1 AND updated_at <= $2",
            self.table()
        ))
        .bind(UserOpStatus::Timeout.to_string())
        .bind(cutoff)
        .fetch_all(&self.rdb)
        .await?;

        rows.iter().map(row_to_userop).collect()
    }
}

fn row_to_userop(row: &PgRow) -> StoreResult<StoredUserOp> {
    let status: String = row.try_get("status")?;

    Ok(StoredUserOp {
        user_op_hash: row.try_get("user_op_hash")?,
        tx_hash: row.try_get("tx_hash")?,
        status: UserOpStatus::from_str(&status)?,
        valid_until: row.try_get("valid_until")?,
        valid_after: row.try_get("valid_after")?,
        sender: row.try_get("sender")?,
        paymaster: row.try_get("paymaster")?,
        entry_point: row.try_get("entry_point")?,
        user_op: row.try_get("user_op")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_the_lifecycle() {
        use UserOpStatus::*;

        let legal = [
            (Pending, Submitted),
            (Submitted, Success),
            (Submitted, Reverted),
            (Submitted, Timeout),
            (Timeout, Success),
            (Timeout, Reverted),
            (Pending, Reverted),
        ];

        for (from, to) in legal {
            assert!(to.can_transition_from(from), "{from} -> {to} should be legal");
        }

        let illegal = [
            (Success, Reverted),
            (Success, Pending),
            (Reverted, Success),
            (Reverted, Submitted),
            (Timeout, Submitted),
            (Pending, Success),
            (Pending, Timeout),
            (Submitted, Pending),
        ];

        for (from, to) in illegal {
            assert!(!to.can_transition_from(from), "{from} -> {to} should be illegal");
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        use UserOpStatus::*;

        for status in [Pending, Submitted, Success, Reverted, Timeout] {
            assert_eq!(status.to_string().parse::<UserOpStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<UserOpStatus>().is_err());
    }
}
