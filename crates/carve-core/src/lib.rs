//! Core types for carve: configuration, the error taxonomy, manifest reading
//! and the dependency closure that decides which crates are kept.
//!
//! The closure ([`graph::KeepSet`]) drives every later stage: pruning,
//! stubbing and manifest rewriting live in `carve-transform`, publishing in
//! `carve-sync`.

pub mod config;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod paths;

pub use error::{CarveError, ErrorKind, Result};
