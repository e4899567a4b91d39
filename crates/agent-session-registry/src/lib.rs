//! Execution Registry (§4.2) and Lease Registry (§4.3): the two registries
//! the Session Authority drives to enforce one-active-execution and
//! exactly-once dispatch.

mod execution_registry;
mod lease_registry;

pub use execution_registry::ExecutionRegistry;
pub use lease_registry::LeaseRegistry;
