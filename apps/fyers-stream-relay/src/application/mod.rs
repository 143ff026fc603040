//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (the upstream data socket).
pub mod ports;

/// Upstream connection management, fan-out and the relay event loop.
pub mod services;
