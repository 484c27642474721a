use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::common::policy_from_row;
use crate::{
    db::{
        error::{DbError, DbResult},
        ident::quote_ident,
        repos::{CleanupTransaction, TtlPolicyRepo},
    },
    models::{CreateTtlPolicy, TtlPolicy},
};

pub struct SqliteTtlPolicyRepo {
    pool: SqlitePool,
}

impl SqliteTtlPolicyRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TtlPolicyRepo for SqliteTtlPolicyRepo {
    async fn upsert(&self, input: &CreateTtlPolicy) -> DbResult<TtlPolicy> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO ttl_index_table
                (table_name, column_name, expire_after_seconds, active, created_at, updated_at)
            VALUES (?, ?, ?, 1, ?, ?)
            ON CONFLICT (table_name, column_name) DO UPDATE SET
                expire_after_seconds = excluded.expire_after_seconds,
                active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&input.table_name)
        .bind(&input.column_name)
        .bind(input.expire_after_seconds)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&input.table_name, &input.column_name)
            .await?
            .ok_or(DbError::NotFound)
    }

    async fn delete(&self, table_name: &str, column_name: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM ttl_index_table
            WHERE table_name = ? AND column_name = ?
            "#,
        )
        .bind(table_name)
        .bind(column_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, table_name: &str, column_name: &str) -> DbResult<Option<TtlPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT table_name, column_name, expire_after_seconds, active, created_at, updated_at
            FROM ttl_index_table
            WHERE table_name = ? AND column_name = ?
            "#,
        )
        .bind(table_name)
        .bind(column_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(policy_from_row))
    }

    async fn list(&self) -> DbResult<Vec<TtlPolicy>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name, column_name, expire_after_seconds, active, created_at, updated_at
            FROM ttl_index_table
            ORDER BY table_name, column_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(policy_from_row).collect())
    }

    async fn column_type(
        &self,
        table_name: &str,
        column_name: &str,
    ) -> DbResult<Option<String>> {
        let row = sqlx::query("SELECT type FROM pragma_table_info(?) WHERE name = ?")
            .bind(table_name)
            .bind(column_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("type")))
    }

    async fn begin_cleanup(&self) -> DbResult<Box<dyn CleanupTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteCleanupTransaction { tx }))
    }
}

pub struct SqliteCleanupTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl CleanupTransaction for SqliteCleanupTransaction {
    async fn policy_table_installed(&mut self) -> DbResult<bool> {
        let installed: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'ttl_index_table'
            )
            "#,
        )
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(installed)
    }

    async fn active_policies(&mut self) -> DbResult<Vec<TtlPolicy>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name, column_name, expire_after_seconds, active, created_at, updated_at
            FROM ttl_index_table
            WHERE active = 1
            ORDER BY table_name, column_name
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.iter().map(policy_from_row).collect())
    }

    async fn expire_rows(&mut self, policy: &TtlPolicy) -> DbResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(policy.expire_after_seconds);

        // julianday() normalizes every date/time text format SQLite accepts,
        // including offsets, so the comparison is chronological. Numeric
        // values are Unix times, not Julian day numbers.
        let column = quote_ident(&policy.column_name);
        let query = format!(
            "DELETE FROM {table} WHERE \
             CASE WHEN typeof({column}) IN ('integer', 'real') \
                  THEN julianday({column}, 'unixepoch') \
                  ELSE julianday({column}) \
             END < julianday(?)",
            table = quote_ident(&policy.table_name),
        );

        let result = sqlx::query(&query)
            .bind(cutoff)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
