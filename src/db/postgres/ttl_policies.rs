use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    db::{
        error::DbResult,
        ident::quote_ident,
        repos::{CleanupTransaction, TtlPolicyRepo},
    },
    models::{CreateTtlPolicy, TtlPolicy},
};

pub struct PostgresTtlPolicyRepo {
    write_pool: PgPool,
    read_pool: PgPool,
}

impl PostgresTtlPolicyRepo {
    pub fn new(write_pool: PgPool, read_pool: Option<PgPool>) -> Self {
        let read_pool = read_pool.unwrap_or_else(|| write_pool.clone());
        Self {
            write_pool,
            read_pool,
        }
    }
}

fn policy_from_row(row: &PgRow) -> TtlPolicy {
    TtlPolicy {
        table_name: row.get("table_name"),
        column_name: row.get("column_name"),
        expire_after_seconds: row.get("expire_after_seconds"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl TtlPolicyRepo for PostgresTtlPolicyRepo {
    async fn upsert(&self, input: &CreateTtlPolicy) -> DbResult<TtlPolicy> {
        let row = sqlx::query(
            r#"
            INSERT INTO ttl_index_table (table_name, column_name, expire_after_seconds)
            VALUES ($1, $2, $3)
            ON CONFLICT (table_name, column_name) DO UPDATE SET
                expire_after_seconds = EXCLUDED.expire_after_seconds,
                active = TRUE,
                updated_at = NOW()
            RETURNING table_name, column_name, expire_after_seconds, active, created_at, updated_at
            "#,
        )
        .bind(&input.table_name)
        .bind(&input.column_name)
        .bind(input.expire_after_seconds)
        .fetch_one(&self.write_pool)
        .await?;

        Ok(policy_from_row(&row))
    }

    async fn delete(&self, table_name: &str, column_name: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM ttl_index_table
            WHERE table_name = $1 AND column_name = $2
            "#,
        )
        .bind(table_name)
        .bind(column_name)
        .execute(&self.write_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, table_name: &str, column_name: &str) -> DbResult<Option<TtlPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT table_name, column_name, expire_after_seconds, active, created_at, updated_at
            FROM ttl_index_table
            WHERE table_name = $1 AND column_name = $2
            "#,
        )
        .bind(table_name)
        .bind(column_name)
        .fetch_optional(&self.read_pool)
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
        .fetch_all(&self.read_pool)
        .await?;

        Ok(rows.iter().map(policy_from_row).collect())
    }

    async fn column_type(
        &self,
        table_name: &str,
        column_name: &str,
    ) -> DbResult<Option<String>> {
        // Resolve the table through the search path, the same way the
        // expiration DELETE will.
        let data_type: Option<String> = sqlx::query_scalar(
            r#"
            SELECT c.data_type::text
            FROM information_schema.columns c
            WHERE c.table_name = $1
              AND c.column_name = $2
              AND c.table_schema = ANY (current_schemas(false))
            ORDER BY array_position(current_schemas(false), c.table_schema::name)
            LIMIT 1
            "#,
        )
        .bind(table_name)
        .bind(column_name)
        .fetch_optional(&self.write_pool)
        .await?;

        Ok(data_type)
    }

    async fn begin_cleanup(&self) -> DbResult<Box<dyn CleanupTransaction>> {
        let tx = self.write_pool.begin().await?;
        Ok(Box::new(PostgresCleanupTransaction { tx }))
    }
}

pub struct PostgresCleanupTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CleanupTransaction for PostgresCleanupTransaction {
    async fn policy_table_installed(&mut self) -> DbResult<bool> {
        let installed: bool =
            sqlx::query_scalar("SELECT to_regclass('ttl_index_table') IS NOT NULL")
                .fetch_one(&mut *self.tx)
                .await?;

        Ok(installed)
    }

    async fn active_policies(&mut self) -> DbResult<Vec<TtlPolicy>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name, column_name, expire_after_seconds, active, created_at, updated_at
            FROM ttl_index_table
            WHERE active
            ORDER BY table_name, column_name
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.iter().map(policy_from_row).collect())
    }

    async fn expire_rows(&mut self, policy: &TtlPolicy) -> DbResult<u64> {
        let query = format!(
            "DELETE FROM {} WHERE {} < NOW() - ($1::bigint * INTERVAL '1 second')",
            quote_ident(&policy.table_name),
            quote_ident(&policy.column_name),
        );

        let result = sqlx::query(&query)
            .bind(policy.expire_after_seconds)
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
