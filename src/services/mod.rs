mod ttl_policies;

pub use ttl_policies::{PolicyError, TtlPolicyService};
