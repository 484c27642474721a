//! Time-to-live row expiration for SQL databases.
//!
//! A TTL policy binds a `(table, column)` pair to a maximum row age. One
//! background worker per database wakes every `naptime` seconds and deletes
//! every row whose timestamp column is older than its policy allows, all
//! policies inside a single transaction.

pub mod config;
pub mod db;
pub mod host;
pub mod models;
pub mod observability;
pub mod services;
pub mod supervisor;
pub mod worker;
