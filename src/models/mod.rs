mod ttl_policy;
mod worker_session;

pub use ttl_policy::*;
pub use worker_session::*;
