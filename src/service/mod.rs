//! Application services built on top of the consensus core.

pub mod backend;
pub mod replicated;

pub use backend::{CommerceBackend, InMemoryBackend};
pub use replicated::{ApplyOutcome, ReplicatedCommerce};
