use crate::{shorten, StoreError, StoreResult};
use chrono::{DateTime, Duration, Utc};
use courier_primitives::{consts, Log, LogStatus};
use ethers::types::U256;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use std::str::FromStr;

/// Attribute filters: `data.<key> = <value>` predicates, AND-composed.
pub type DataFilters = Vec<(String, String)>;

/// A page request shared by the filtered queries.
#[derive(Clone, Copy, Debug)]
pub struct LogPage {
    pub limit: i64,
    pub offset: i64,
}

/// Idempotent, content-addressed store of log records.
#[derive(Clone)]
pub struct LogStore {
    suffix: String,
    db: PgPool,
    rdb: PgPool,
}

const COLUMNS: &str =
    "hash, tx_hash, created_at, updated_at, nonce, sender, dest, value, data, extra_data, status";

impl LogStore {
    pub fn new(suffix: &str, db: PgPool, rdb: PgPool) -> Self {
        Self { suffix: suffix.to_string(), db, rdb }
    }

    fn table(&self) -> String {
        format!("t_logs_{}", self.suffix)
    }

    pub async fn create_table(&self) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {}(
                hash TEXT NOT NULL PRIMARY KEY,
                tx_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp,
                nonce BIGINT NOT NULL,
                sender TEXT NOT NULL,
                dest TEXT NOT NULL,
                value TEXT NOT NULL,
                data JSONB DEFAULT NULL,
                extra_data JSONB DEFAULT NULL,
                status TEXT NOT NULL DEFAULT 'success'
            );
            "#,
            self.table()
        ))
        .execute(&self.db)
        .await?;

        let short = shorten(&self.suffix, 6);
        for (name, columns) in [
            ("tx_hash", "(tx_hash)"),
            ("dest", "(dest)"),
            ("dest_date", "(dest, created_at)"),
            ("dest_topic_date", "(dest, (data->>'topic'), created_at)"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_logs_{short}_{name} ON {} {columns};",
                self.table()
            ))
            .execute(&self.db)
            .await?;
        }

        Ok(())
    }

    /// Insert a single record; conflicts on `hash` are no-ops (the
    /// optimistic path never overwrites what the indexer confirmed).
    pub async fn add_log(&self, log: &Log) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (hash) DO NOTHING
            "#,
            self.table()
        ))
        .bind(&log.hash)
        .bind(&log.tx_hash)
        .bind(log.created_at)
        .bind(log.updated_at)
        .bind(log.nonce)
        .bind(&log.sender)
        .bind(&log.to)
        .bind(log.value.to_string())
        .bind(&log.data)
        .bind(&log.extra_data)
        .bind(log.status.to_string())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Insert records, upserting on `hash` (the indexer path: the confirmed
    /// record replaces any optimistic one with the same content hash).
    pub async fn add_logs(&self, logs: &[Log]) -> StoreResult<()> {
        for log in logs {
            sqlx::query(&format!(
                r#"
                INSERT INTO {t} ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (hash) DO UPDATE SET
                    tx_hash = EXCLUDED.tx_hash,
                    nonce = EXCLUDED.nonce,
                    sender = EXCLUDED.sender,
                    dest = EXCLUDED.dest,
                    value = EXCLUDED.value,
                    data = COALESCE(EXCLUDED.data, {t}.data),
                    extra_data = COALESCE(EXCLUDED.extra_data, {t}.extra_data),
                    status = EXCLUDED.status,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at
                "#,
                t = self.table()
            ))
            .bind(&log.hash)
            .bind(&log.tx_hash)
            .bind(log.created_at)
            .bind(log.updated_at)
            .bind(log.nonce)
            .bind(&log.sender)
            .bind(&log.to)
            .bind(log.value.to_string())
            .bind(&log.data)
            .bind(&log.extra_data)
            .bind(log.status.to_string())
            .execute(&self.db)
            .await?;
        }

        Ok(())
    }

    /// Set a record's status. Success is terminal: rows already at
    /// `success` are left untouched.
    pub async fn set_status(&self, hash: &str, status: LogStatus) -> StoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = $1, updated_at = $2 WHERE hash = $3 AND status != 'success'",
            self.table()
        ))
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(hash)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Remove a record unless it already confirmed.
    pub async fn remove_log(&self, hash: &str) -> StoreResult<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE hash = $1 AND status != 'success'",
            self.table()
        ))
        .bind(hash)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Purge optimistic records that never confirmed.
    pub async fn remove_old_in_progress(&self) -> StoreResult<()> {
        let cutoff = Utc::now() - Duration::seconds(consts::logs::IN_PROGRESS_TTL_SECS);

        sqlx::query(&format!(
            "DELETE FROM {} WHERE created_at <= $1 AND status IN ('sending', 'pending')",
            self.table()
        ))
        .bind(cutoff)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn get_log(&self, hash: &str) -> StoreResult<Log> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE hash = $1",
            self.table()
        ))
        .bind(hash)
        .fetch_optional(&self.rdb)
        .await?
        .ok_or(StoreError::NotFound)?;

        row_to_log(&row)
    }

    /// Refresh in-memory records from storage; records without a stored
    /// counterpart are returned unchanged.
    pub async fn update_logs_from_db(&self, logs: &mut [Log]) -> StoreResult<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let hashes: Vec<String> = logs.iter().map(|l| l.hash.clone()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE hash = ANY($1)",
            self.table()
        ))
        .bind(&hashes)
        .fetch_all(&self.rdb)
        .await?;

        let mut stored: HashMap<String, Log> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let log = row_to_log(row)?;
            stored.insert(log.hash.clone(), log);
        }

        for log in logs.iter_mut() {
            if let Some(fresh) = stored.get(&log.hash) {
                log.update_from(fresh);
            }
        }

        Ok(())
    }

    /// Newest-first page of records for a contract and topic up to
    /// `max_date`, with no attribute filtering.
    pub async fn all_paginated(
        &self,
        contract: &str,
        topic: &str,
        max_date: DateTime<Utc>,
        page: LogPage,
    ) -> StoreResult<Vec<Log>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM {}
            WHERE dest = $1 AND data->>'topic' = $2 AND created_at <= $3
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
            self.table()
        ))
        .bind(contract)
        .bind(topic)
        .bind(max_date)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.rdb)
        .await?;

        rows.iter().map(row_to_log).collect()
    }

    /// Newest-first page filtered by data attributes. A second filter map
    /// widens the result: the two conjunctions are unioned in one query and
    /// ordered together.
    pub async fn paginated(
        &self,
        contract: &str,
        topic: &str,
        max_date: DateTime<Utc>,
        filters: &DataFilters,
        or_filters: &DataFilters,
        page: LogPage,
    ) -> StoreResult<Vec<Log>> {
        self.filtered(
            contract,
            topic,
            "created_at <= ",
            max_date,
            filters,
            or_filters,
            page,
        )
        .await
    }

    /// Newest-first page of records created at or after `from_date`.
    pub async fn new_logs(
        &self,
        contract: &str,
        topic: &str,
        from_date: DateTime<Utc>,
        filters: &DataFilters,
        or_filters: &DataFilters,
        page: LogPage,
    ) -> StoreResult<Vec<Log>> {
        self.filtered(
            contract,
            topic,
            "created_at >= ",
            from_date,
            filters,
            or_filters,
            page,
        )
        .await
    }

    /// Unfiltered variant of [`new_logs`](Self::new_logs).
    pub async fn all_new_logs(
        &self,
        contract: &str,
        topic: &str,
        from_date: DateTime<Utc>,
        page: LogPage,
    ) -> StoreResult<Vec<Log>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM {}
            WHERE dest = $1 AND data->>'topic' = $2 AND created_at >= $3
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
            self.table()
        ))
        .bind(contract)
        .bind(topic)
        .bind(from_date)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.rdb)
        .await?;

        rows.iter().map(row_to_log).collect()
    }

    async fn filtered(
        &self,
        contract: &str,
        topic: &str,
        date_op: &str,
        date: DateTime<Utc>,
        filters: &DataFilters,
        or_filters: &DataFilters,
        page: LogPage,
    ) -> StoreResult<Vec<Log>> {
        // Sanitize once; the placeholder and bind paths below both walk
        // these lists, so they cannot drift out of lockstep.
        let filters = identifier_filters(filters);
        let or_filters = identifier_filters(or_filters);

        let mut sql = format!(
            "SELECT {COLUMNS} FROM {t} WHERE dest = $1 AND data->>'topic' = $2 AND {date_op}$3",
            t = self.table()
        );
        let mut arg = 3usize;

        arg = push_data_filters(&mut sql, arg, &filters);

        if !filters.is_empty() && !or_filters.is_empty() {
            sql.push_str(&format!(
                " UNION ALL SELECT {COLUMNS} FROM {t} WHERE dest = ${} AND data->>'topic' = ${} AND {date_op}${}",
                arg + 1,
                arg + 2,
                arg + 3,
                t = self.table()
            ));
            arg += 3;
            arg = push_data_filters(&mut sql, arg, &or_filters);
        }

        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            arg + 1,
            arg + 2
        ));

        let mut query = sqlx::query(&sql).bind(contract).bind(topic).bind(date);
        for (_, value) in &filters {
            query = query.bind(value);
        }
        if !filters.is_empty() && !or_filters.is_empty() {
            query = query.bind(contract).bind(topic).bind(date);
            for (_, value) in &or_filters {
                query = query.bind(value);
            }
        }
        query = query.bind(page.limit).bind(page.offset);

        let rows = query.fetch_all(&self.rdb).await?;
        rows.iter().map(row_to_log).collect()
    }
}

/// Keep only filters whose key is a plain identifier. Keys are
/// interpolated into the SQL, so anything else is dropped before either
/// the placeholders or the binds see it.
fn identifier_filters(filters: &DataFilters) -> Vec<&(String, String)> {
    filters
        .iter()
        .filter(|(key, _)| {
            !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .collect()
}

/// Append `data->>'<key>' = $n` predicates for pre-sanitized filters.
fn push_data_filters(sql: &mut String, mut arg: usize, filters: &[&(String, String)]) -> usize {
    for (key, _) in filters {
        arg += 1;
        sql.push_str(&format!(" AND data->>'{key}' = ${arg}"));
    }
    arg
}

fn row_to_log(row: &PgRow) -> StoreResult<Log> {
    let value: String = row.try_get("value")?;
    let status: String = row.try_get("status")?;

    Ok(Log {
        hash: row.try_get("hash")?,
        tx_hash: row.try_get("tx_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        nonce: row.try_get("nonce")?,
        sender: row.try_get("sender")?,
        to: row.try_get("dest")?,
        value: U256::from_dec_str(&value)
            .map_err(|e| StoreError::Encoding(e.to_string()))?,
        data: row.try_get::<Option<Value>, _>("data")?,
        extra_data: row.try_get::<Option<Value>, _>("extra_data")?,
        status: LogStatus::from_str(&status)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_filters_extend_the_query_with_numbered_args() {
        let mut sql = String::from("WHERE dest = $1 AND data->>'topic' = $2 AND created_at <= $3");
        let filters =
            vec![("from".to_string(), "0xA".to_string()), ("to".to_string(), "0xB".to_string())];
        let filters = identifier_filters(&filters);

        let next = push_data_filters(&mut sql, 3, &filters);

        assert_eq!(next, 5);
        assert!(sql.ends_with("AND data->>'from' = $4 AND data->>'to' = $5"));
    }

    #[test]
    fn non_identifier_filter_keys_are_dropped() {
        let filters = vec![
            ("from'; DROP TABLE".to_string(), "x".to_string()),
            ("foo!".to_string(), "bar".to_string()),
            ("".to_string(), "empty".to_string()),
            ("ok_key".to_string(), "kept".to_string()),
        ];

        let sanitized = identifier_filters(&filters);

        assert_eq!(sanitized.len(), 1);
        assert_eq!(sanitized[0].0, "ok_key");
    }

    #[test]
    fn placeholder_count_matches_sanitized_filter_count() {
        // The bind loop walks the same sanitized list, so every emitted
        // placeholder has exactly one bound value.
        let filters = vec![
            ("from".to_string(), "0xA".to_string()),
            ("foo!".to_string(), "bar".to_string()),
            ("to".to_string(), "0xB".to_string()),
        ];
        let sanitized = identifier_filters(&filters);

        let mut sql = String::new();
        let next = push_data_filters(&mut sql, 3, &sanitized);

        assert_eq!(next - 3, sanitized.len());
        assert_eq!(sql.matches('$').count(), sanitized.len());
    }
}
