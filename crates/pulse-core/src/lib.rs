//! # pulse-core
//!
//! Core types, traits, and abstractions for the Pulse background job engine.
//!
//! This crate provides the job data model, the error taxonomy, the
//! [`JobStore`] persistence contract, and the shared default constants
//! that the other Pulse crates depend on.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
