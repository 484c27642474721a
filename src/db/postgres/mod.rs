mod ttl_policies;
mod worker_sessions;

pub use ttl_policies::PostgresTtlPolicyRepo;
pub use worker_sessions::PostgresWorkerSessionRepo;
