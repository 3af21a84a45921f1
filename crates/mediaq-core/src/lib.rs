//! # mediaq-core
//!
//! Core crate for the mediaq job scheduler. Contains the configuration
//! schema, typed identifiers, and the unified error system.
//!
//! This crate has **no** internal dependencies on other mediaq crates.

pub mod config;
pub mod error;
pub mod result;
pub mod types;

pub use error::{AppError, ErrorKind};
pub use result::AppResult;
pub use types::id::JobId;
