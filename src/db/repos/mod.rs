mod ttl_policies;
mod worker_sessions;

pub use ttl_policies::*;
pub use worker_sessions::*;
