use sqlx::{Row, sqlite::SqliteRow};
use uuid::Uuid;

use crate::{
    db::error::{DbError, DbResult},
    models::TtlPolicy,
};

/// Parse a UUID string from the database, returning a DbError on failure
pub fn parse_uuid(s: &str) -> DbResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| DbError::Internal(format!("Invalid UUID in database: {}", e)))
}

pub fn policy_from_row(row: &SqliteRow) -> TtlPolicy {
    TtlPolicy {
        table_name: row.get("table_name"),
        column_name: row.get("column_name"),
        expire_after_seconds: row.get("expire_after_seconds"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
