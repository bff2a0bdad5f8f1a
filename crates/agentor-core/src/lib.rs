//! Core error definitions shared by the Agentor teams crates.
//!
//! # Main types
//!
//! - [`AgentorError`] — Unified error enum covering lookup, dependency, provider and
//!   execution failures.
//! - [`AgentorResult`] — Convenience alias for `Result<T, AgentorError>`.
//! - [`ErrorKind`] — Serializable classification carried by execution outcomes.
//! - [`Entity`] — Names the record family in a [`AgentorError::NotFound`].

/// Error enum and classification helpers.
pub mod error;

pub use error::{AgentorError, AgentorResult, Entity, ErrorKind};
