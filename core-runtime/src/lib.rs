//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the record sync engine:
//! - Logging and tracing infrastructure
//! - Client configuration
//! - Typed event bus
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that other modules depend on.
//! It establishes the logging conventions, the configuration surface and the
//! event broadcasting mechanism used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
