//! Farm configuration.
//!
//! Parsed from TOML with `WORKFARM_*` environment overrides, or assembled
//! in code through [`crate::FarmBuilder`].

mod loading;
mod types;
mod validation;


pub use types::{BackendKind, FarmConfig, ForkOptions, Scheduling};
