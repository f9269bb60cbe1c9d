//! The record API seam consumed by the sync engine.

use async_trait::async_trait;
use bridge_traits::http::{MultipartFile, ProgressCallback};
use bytes::Bytes;
use serde_json::Value;

use crate::connection::ConnectionMonitor;
use crate::error::Result;
use crate::types::{Fields, ListQuery, Record, RecordPage, TableRef};

/// Remote record operations.
///
/// Each call is one logical request: implementations retry transient
/// failures internally and return a classified [`ApiError`](crate::ApiError)
/// otherwise. Implementations keep [`connection`](RecordApi::connection)
/// current with the outcome of every request.
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Connection state driven by this API's request outcomes.
    fn connection(&self) -> &ConnectionMonitor;

    async fn list_records(&self, table: &TableRef, query: &ListQuery) -> Result<RecordPage>;

    async fn get_record(&self, table: &TableRef, record_id: &str) -> Result<Record>;

    /// Create a record. `idempotency_key` lets the server collapse retries.
    async fn create_record(
        &self,
        table: &TableRef,
        fields: &Fields,
        idempotency_key: Option<&str>,
    ) -> Result<Record>;

    /// Patch the given fields, leaving others untouched.
    async fn update_record(
        &self,
        table: &TableRef,
        record_id: &str,
        fields: &Fields,
        idempotency_key: Option<&str>,
    ) -> Result<Record>;

    async fn delete_record(&self, table: &TableRef, record_id: &str) -> Result<()>;

    /// Attach a file to `field` of a record, reporting upload progress.
    async fn upload_attachment(
        &self,
        table: &TableRef,
        record_id: &str,
        field: &str,
        file: MultipartFile,
        progress: Option<ProgressCallback>,
    ) -> Result<Record>;

    /// Fetch attachment content by URL.
    async fn download_attachment(&self, url: &str) -> Result<Bytes>;

    /// Evaluate a formula in the context of one record.
    async fn evaluate_formula(
        &self,
        table: &TableRef,
        record_id: &str,
        formula: &str,
    ) -> Result<Value>;
}
