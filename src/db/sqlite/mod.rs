mod common;
mod ttl_policies;
mod worker_sessions;

pub use ttl_policies::SqliteTtlPolicyRepo;
pub use worker_sessions::SqliteWorkerSessionRepo;
