//! Keel Core
//!
//! Domain types, validation and error handling for the Keel pipeline
//! executor. This crate performs no I/O beyond loading pipeline files and
//! defines the shared vocabulary used by the resolver, runner and CLI.

pub mod error;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod run;
pub mod secrets;

pub use error::{Error, Result};
pub use ids::RunId;
