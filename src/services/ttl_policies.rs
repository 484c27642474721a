use std::sync::Arc;

use validator::Validate;

use crate::{
    db::{DbError, DbPool},
    models::{CreateTtlPolicy, TemporalType, TtlPolicy},
};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid policy: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Column {table}.{column} must be of type timestamp, timestamptz or date")]
    NotTemporal { table: String, column: String },

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Registration API for TTL policies.
#[derive(Clone)]
pub struct TtlPolicyService {
    db: Arc<DbPool>,
}

impl TtlPolicyService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Create a policy, or update the threshold of an existing one.
    ///
    /// Fails without writing anything when the column is missing or isn't a
    /// timestamp or date column.
    pub async fn create_policy(
        &self,
        table_name: &str,
        column_name: &str,
        expire_after_seconds: i64,
    ) -> Result<bool, PolicyError> {
        let input = CreateTtlPolicy {
            table_name: table_name.to_string(),
            column_name: column_name.to_string(),
            expire_after_seconds,
        };
        input.validate()?;

        if !self.is_temporal(table_name, column_name).await? {
            return Err(PolicyError::NotTemporal {
                table: table_name.to_string(),
                column: column_name.to_string(),
            });
        }

        let policy = self.db.ttl_policies().upsert(&input).await?;
        tracing::info!(
            table = %policy.table_name,
            column = %policy.column_name,
            expire_after_seconds = policy.expire_after_seconds,
            "TTL policy created"
        );
        Ok(true)
    }

    /// Remove a policy. Returns false if there was none.
    pub async fn drop_policy(&self, table_name: &str, column_name: &str) -> Result<bool, PolicyError> {
        let removed = self.db.ttl_policies().delete(table_name, column_name).await?;
        if removed {
            tracing::info!(table = %table_name, column = %column_name, "TTL policy dropped");
        }
        Ok(removed)
    }

    pub async fn get_policy(
        &self,
        table_name: &str,
        column_name: &str,
    ) -> Result<Option<TtlPolicy>, PolicyError> {
        Ok(self.db.ttl_policies().get(table_name, column_name).await?)
    }

    pub async fn list_policies(&self) -> Result<Vec<TtlPolicy>, PolicyError> {
        Ok(self.db.ttl_policies().list().await?)
    }

    /// Whether the column is a timestamp, timestamptz or date column.
    ///
    /// A missing table or column is not temporal. Catalog access failures
    /// are returned as errors.
    pub async fn is_temporal(&self, table_name: &str, column_name: &str) -> Result<bool, PolicyError> {
        let declared = self
            .db
            .ttl_policies()
            .column_type(table_name, column_name)
            .await?;
        Ok(declared
            .as_deref()
            .and_then(TemporalType::from_type_name)
            .is_some())
    }
}
