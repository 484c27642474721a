use async_trait::async_trait;

use crate::{
    db::error::DbResult,
    models::{CreateTtlPolicy, TtlPolicy},
};

#[async_trait]
pub trait TtlPolicyRepo: Send + Sync {
    /// Create a policy, or overwrite the threshold of an existing one and
    /// reactivate it.
    async fn upsert(&self, input: &CreateTtlPolicy) -> DbResult<TtlPolicy>;

    /// Delete a policy. Returns true iff a row was removed.
    async fn delete(&self, table_name: &str, column_name: &str) -> DbResult<bool>;

    async fn get(&self, table_name: &str, column_name: &str) -> DbResult<Option<TtlPolicy>>;

    /// All policies, active or not, ordered by (table, column).
    async fn list(&self) -> DbResult<Vec<TtlPolicy>>;

    /// Declared type of a column as reported by the catalog, or None if the
    /// table or column doesn't exist.
    async fn column_type(&self, table_name: &str, column_name: &str)
    -> DbResult<Option<String>>;

    /// Open the transaction a single cleanup pass runs in.
    async fn begin_cleanup(&self) -> DbResult<Box<dyn CleanupTransaction>>;
}

/// One open cleanup transaction.
///
/// Dropping it without calling `commit` rolls back.
#[async_trait]
pub trait CleanupTransaction: Send {
    /// Whether the policy table still exists.
    async fn policy_table_installed(&mut self) -> DbResult<bool>;

    /// Active policies, ordered by (table, column).
    async fn active_policies(&mut self) -> DbResult<Vec<TtlPolicy>>;

    /// Delete the rows of `policy.table_name` whose `policy.column_name` is
    /// older than the threshold. Returns the number of rows deleted.
    async fn expire_rows(&mut self, policy: &TtlPolicy) -> DbResult<u64>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}
