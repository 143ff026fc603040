//! Domain Layer - Core relay types and business logic.
//!
//! This layer contains the core domain types for the relay with no
//! I/O. Types here are pure Rust with serialization support.

/// Bearer token gating the upstream connection.
pub mod credentials;

/// Market data streaming types (ticks, consumer commands, envelopes).
pub mod streaming;

/// Subscription tracking and reference counting.
pub mod subscription;
