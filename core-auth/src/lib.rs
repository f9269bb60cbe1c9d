//! # Authentication Module
//!
//! Credential handling for the record sync engine.
//!
//! ## Overview
//!
//! The engine never signs users in. Hosts supply a
//! [`CredentialSource`](bridge_traits::CredentialSource) and this crate wraps
//! it with caching, expiry checks and single-flight refresh so concurrent
//! requests that hit a 401 trigger exactly one refresh.
//!
//! ## Features
//!
//! - Cached bearer credential with proactive refresh before expiry
//! - Concurrent refresh protection
//! - Auth event emission
//! - A fixed-token source for personal access tokens

pub mod error;
pub mod manager;
pub mod static_source;

pub use error::{AuthError, Result};
pub use manager::CredentialManager;
pub use static_source::StaticCredentialSource;
