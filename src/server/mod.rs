//! Business-facing HTTP surface.

pub mod gateway;
pub mod http;

pub use gateway::BusinessGateway;
