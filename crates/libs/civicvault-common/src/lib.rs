//! Shared configuration and observability plumbing for CivicVault.
//!
//! This crate holds everything the service crates need before the record
//! engine itself comes up: manifest discovery (`.civicrc`), layered
//! application configuration, and tracing subscriber setup.

pub mod config;
pub mod error;
pub mod tracing;

pub use error::{Error, Result};
