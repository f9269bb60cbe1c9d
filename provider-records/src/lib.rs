//! # Records Provider
//!
//! Transport layer for the remote record API.
//!
//! ## Overview
//!
//! This module provides:
//! - The [`RecordApi`] trait consumed by the sync engine
//! - [`RecordsConnector`], its HTTP implementation with bearer credentials,
//!   retry with exponential backoff and `Retry-After` support
//! - The error taxonomy ([`ApiError`]) every outcome is classified into
//! - [`ConnectionMonitor`], the process-wide Online/Offline state driven by
//!   request outcomes
//! - Wire types: [`Record`], [`TableRef`], [`ListQuery`], [`RecordPage`]

pub mod api;
pub mod connection;
pub mod connector;
pub mod error;
pub mod types;

pub use api::RecordApi;
pub use connection::{ConnectionMonitor, ConnectionState};
pub use connector::{ApiBody, ApiRequest, RecordsConnector};
pub use error::{ApiError, Result};
pub use types::{Fields, ListQuery, Record, RecordPage, SortDirection, SortSpec, TableRef};
