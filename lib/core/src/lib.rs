//! Core types shared by the strata crates.
//!
//! This crate provides the dispatch identifier used to address workflow runs
//! (including nested sublattice runs) and the rootcause-based `Result` alias.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{DispatchId, ParseIdError};
