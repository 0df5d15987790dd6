//! graph-smtpd Common - Shared configuration and error types
//!
//! This crate provides the configuration model and error type
//! shared by the relay core and both binaries.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{Error, Result};
