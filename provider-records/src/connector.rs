//! Record API connector implementation
//!
//! Implements [`RecordApi`] over the host's [`HttpClient`].

use async_trait::async_trait;
use bridge_traits::http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, MultipartFile, ProgressCallback, RetryPolicy,
};
use bytes::Bytes;
use core_auth::CredentialManager;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::api::RecordApi;
use crate::connection::ConnectionMonitor;
use crate::error::{ApiError, Result};
use crate::types::{
    DeleteResponse, EvaluateBody, EvaluateResponse, Fields, FieldsBody, ListQuery, Record,
    RecordPage, TableRef,
};

/// Default timeout of one attempt
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of an [`ApiRequest`].
#[derive(Clone)]
pub enum ApiBody {
    Empty,
    Json(Value),
    Multipart {
        file: MultipartFile,
        progress: Option<ProgressCallback>,
    },
}

/// One logical request against the record API.
#[derive(Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Path below the base URL, or an absolute URL
    pub path: String,
    pub query: Option<String>,
    pub body: ApiBody,
    /// Per-call override of the connector's attempt timeout
    pub timeout: Option<Duration>,
    pub idempotency_key: Option<String>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            body: ApiBody::Empty,
            timeout: None,
            idempotency_key: None,
        }
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = (!query.is_empty()).then_some(query);
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = ApiBody::Json(body);
        self
    }

    pub fn multipart(mut self, file: MultipartFile, progress: Option<ProgressCallback>) -> Self {
        self.body = ApiBody::Multipart { file, progress };
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn idempotency_key(mut self, key: Option<&str>) -> Self {
        self.idempotency_key = key.map(str::to_string);
        self
    }
}

/// HTTP connector for the record API.
///
/// # Features
///
/// - Bearer credential from [`CredentialManager`], refreshed once on 401
/// - Retries network failures, 502/503/504 and 429 with exponential
///   backoff and jitter; `Retry-After` wins for 429
/// - Drives the shared [`ConnectionMonitor`]
/// - `Idempotency-Key` header on create and update when a key is supplied
///
/// # Example
///
/// ```ignore
/// use provider_records::{RecordsConnector, RecordApi, TableRef, ListQuery};
///
/// let connector = RecordsConnector::new(http_client, credentials, "https://api.example.com");
/// let page = connector
///     .list_records(&TableRef::new("app1", "Tasks"), &ListQuery::new())
///     .await?;
/// ```
pub struct RecordsConnector {
    http_client: Arc<dyn HttpClient>,
    credentials: CredentialManager,
    base_url: String,
    retry_policy: RetryPolicy,
    request_timeout: Duration,
    connection: ConnectionMonitor,
}

impl RecordsConnector {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        credentials: CredentialManager,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            credentials,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry_policy: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection: ConnectionMonitor::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Share an existing connection monitor instead of a private one.
    pub fn with_connection(mut self, connection: ConnectionMonitor) -> Self {
        self.connection = connection;
        self
    }

    fn url_for(&self, request: &ApiRequest) -> String {
        let mut url = if request.path.starts_with("http://") || request.path.starts_with("https://")
        {
            request.path.clone()
        } else {
            format!("{}{}", self.base_url, request.path)
        };
        if let Some(query) = &request.query {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(query);
        }
        url
    }

    /// Only URLs on the API origin, under the base path, get the bearer credential.
    fn is_api_url(&self, url: &str) -> bool {
        let (Ok(base), Ok(target)) = (Url::parse(&self.base_url), Url::parse(url)) else {
            return false;
        };
        if base.scheme() != target.scheme()
            || base.host_str() != target.host_str()
            || base.port_or_known_default() != target.port_or_known_default()
        {
            return false;
        }

        let base_path = base.path().trim_end_matches('/');
        let path = target.path();
        base_path.is_empty()
            || path == base_path
            || path
                .strip_prefix(base_path)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    async fn send_once(&self, request: &ApiRequest, url: &str, token: Option<&str>) -> Result<HttpResponse> {
        let mut http_request = HttpRequest::new(request.method, url)
            .header("Accept", "application/json")
            .timeout(request.timeout.unwrap_or(self.request_timeout));

        if let Some(token) = token {
            http_request = http_request.bearer_token(token);
        }
        if let Some(key) = &request.idempotency_key {
            http_request = http_request.header("Idempotency-Key", key.clone());
        }

        let response = match &request.body {
            ApiBody::Empty => self.http_client.execute(http_request).await?,
            ApiBody::Json(body) => {
                let http_request = http_request.json(body)?;
                self.http_client.execute(http_request).await?
            }
            ApiBody::Multipart { file, progress } => {
                self.http_client
                    .upload_multipart(http_request, file.clone(), progress.clone())
                    .await?
            }
        };

        Ok(response)
    }

    /// Execute one logical request with credential, retry and classification.
    ///
    /// Returns the first 2xx response, or the classified error once retries
    /// are exhausted or the outcome is not retryable.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn request(&self, request: ApiRequest) -> Result<HttpResponse> {
        let url = self.url_for(&request);
        let authenticated = self.is_api_url(&url);

        let mut token = if authenticated {
            Some(self.credentials.access_token().await?)
        } else {
            None
        };
        let mut refreshed = false;
        let mut attempt = 1u32;

        loop {
            let error = match self.send_once(&request, &url, token.as_deref()).await {
                Ok(response) => {
                    self.connection.mark_online();

                    if response.is_success() {
                        debug!(status = response.status, attempt, "API request succeeded");
                        return Ok(response);
                    }

                    if response.status == 401 && authenticated && !refreshed {
                        refreshed = true;
                        info!("Credential rejected, refreshing once");
                        let rejected = token.take().unwrap_or_default();
                        token = Some(self.credentials.force_refresh(&rejected).await?);
                        continue;
                    }

                    ApiError::from_response(&response)
                }
                Err(error) => error,
            };

            if error.is_network() {
                self.connection.mark_offline(error.to_string());
            }

            if !error.is_retryable() || attempt >= self.retry_policy.max_attempts {
                warn!(attempt, error = %error, "API request failed");
                return Err(error);
            }

            let delay = match &error {
                ApiError::RateLimit {
                    retry_after: Some(retry_after),
                } => (*retry_after).min(self.retry_policy.max_delay),
                _ => self.retry_policy.delay_for_attempt(attempt),
            };

            warn!(
                "API request failed (attempt {}/{}): {}, retrying in {}ms",
                attempt,
                self.retry_policy.max_attempts,
                error,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn request_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.request(request).await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| ApiError::Decode(format!("{}: {}", std::any::type_name::<T>(), e)))
    }
}

#[async_trait]
impl RecordApi for RecordsConnector {
    fn connection(&self) -> &ConnectionMonitor {
        &self.connection
    }

    #[instrument(skip(self, query), fields(table = %table))]
    async fn list_records(&self, table: &TableRef, query: &ListQuery) -> Result<RecordPage> {
        let request = ApiRequest::new(HttpMethod::Get, table.path()).query(query.to_query_string());
        let page: RecordPage = self.request_json(request).await?;
        debug!("Listed {} records", page.records.len());
        Ok(page)
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn get_record(&self, table: &TableRef, record_id: &str) -> Result<Record> {
        self.request_json(ApiRequest::new(HttpMethod::Get, table.record_path(record_id)))
            .await
    }

    #[instrument(skip(self, fields), fields(table = %table))]
    async fn create_record(
        &self,
        table: &TableRef,
        fields: &Fields,
        idempotency_key: Option<&str>,
    ) -> Result<Record> {
        let body = serde_json::to_value(FieldsBody { fields })
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let request = ApiRequest::new(HttpMethod::Post, table.path())
            .json(body)
            .idempotency_key(idempotency_key);
        let record: Record = self.request_json(request).await?;
        info!(record_id = %record.id, "Created record");
        Ok(record)
    }

    #[instrument(skip(self, fields), fields(table = %table))]
    async fn update_record(
        &self,
        table: &TableRef,
        record_id: &str,
        fields: &Fields,
        idempotency_key: Option<&str>,
    ) -> Result<Record> {
        let body = serde_json::to_value(FieldsBody { fields })
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let request = ApiRequest::new(HttpMethod::Patch, table.record_path(record_id))
            .json(body)
            .idempotency_key(idempotency_key);
        self.request_json(request).await
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn delete_record(&self, table: &TableRef, record_id: &str) -> Result<()> {
        let response = self
            .request(ApiRequest::new(HttpMethod::Delete, table.record_path(record_id)))
            .await?;

        // Some deployments answer 204 with no body
        if response.body.is_empty() {
            return Ok(());
        }
        let deleted: DeleteResponse = response
            .json()
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        if deleted.deleted {
            Ok(())
        } else {
            Err(ApiError::Unexpected {
                status: response.status,
                message: format!("record {} was not deleted", record_id),
            })
        }
    }

    #[instrument(skip(self, file, progress), fields(table = %table, size = file.len()))]
    async fn upload_attachment(
        &self,
        table: &TableRef,
        record_id: &str,
        field: &str,
        file: MultipartFile,
        progress: Option<ProgressCallback>,
    ) -> Result<Record> {
        let path = format!(
            "{}/uploadAttachment/{}",
            table.record_path(record_id),
            urlencoding::encode(field)
        );
        let request = ApiRequest::new(HttpMethod::Post, path).multipart(file, progress);
        self.request_json(request).await
    }

    #[instrument(skip(self))]
    async fn download_attachment(&self, url: &str) -> Result<Bytes> {
        let response = self.request(ApiRequest::new(HttpMethod::Get, url)).await?;
        info!("Downloaded {} bytes", response.body.len());
        Ok(response.body)
    }

    #[instrument(skip(self, formula), fields(table = %table))]
    async fn evaluate_formula(
        &self,
        table: &TableRef,
        record_id: &str,
        formula: &str,
    ) -> Result<Value> {
        let body = serde_json::to_value(EvaluateBody { formula })
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let request = ApiRequest::new(
            HttpMethod::Post,
            format!("{}/evaluate", table.record_path(record_id)),
        )
        .json(body);
        let response: EvaluateResponse = self.request_json(request).await?;
        Ok(response.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::http::HttpResponse;
    use core_auth::StaticCredentialSource;
    use core_runtime::events::EventBus;
    use mockall::{mock, Sequence};
    use serde_json::json;

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
            async fn upload_multipart(
                &self,
                request: HttpRequest,
                file: MultipartFile,
                progress: Option<ProgressCallback>,
            ) -> BridgeResult<HttpResponse>;
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            use_exponential_backoff: true,
            jitter_ratio: 0.0,
        }
    }

    fn connector(mock_http: MockHttpClient) -> RecordsConnector {
        let credentials = CredentialManager::new(
            Arc::new(StaticCredentialSource::new("test_token")),
            EventBus::default(),
        );
        RecordsConnector::new(Arc::new(mock_http), credentials, "https://api.example.com/")
            .with_retry_policy(fast_policy(3))
    }

    fn tasks() -> TableRef {
        TableRef::new("app1", "Tasks")
    }

    fn record_body(id: &str) -> String {
        json!({
            "id": id,
            "fields": {"Name": "A"},
            "createdAt": "2024-01-01T00:00:00Z",
            "version": 1
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_list_records_success() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.method, HttpMethod::Get);
            assert!(req.url.starts_with("https://api.example.com/v0/app1/Tasks?"));
            assert!(req.url.contains("pageSize=10"));
            assert_eq!(
                req.headers.get("Authorization").map(String::as_str),
                Some("Bearer test_token")
            );

            let body = json!({
                "records": [{"id": "rec1", "fields": {"Name": "A"}, "createdAt": "2024-01-01T00:00:00Z"}],
                "offset": "next"
            });
            Ok(HttpResponse::new(200, body.to_string()))
        });

        let connector = connector(mock_http);
        let page = connector
            .list_records(&tasks(), &ListQuery::new().page_size(10))
            .await
            .unwrap();

        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "rec1");
        assert_eq!(page.offset.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_create_sends_idempotency_key() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.method, HttpMethod::Post);
            assert_eq!(
                req.headers.get("Idempotency-Key").map(String::as_str),
                Some("op-1")
            );
            let body: Value = serde_json::from_slice(req.body.as_ref().unwrap()).unwrap();
            assert_eq!(body, json!({"fields": {"Name": "A"}}));
            Ok(HttpResponse::new(200, record_body("rec1")))
        });

        let mut fields = Fields::new();
        fields.insert("Name".to_string(), json!("A"));

        let record = connector(mock_http)
            .create_record(&tasks(), &fields, Some("op-1"))
            .await
            .unwrap();
        assert_eq!(record.id, "rec1");
        assert_eq!(record.version, Some(1));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mut mock_http = MockHttpClient::new();
        let mut seq = Sequence::new();

        mock_http
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(503, "")));
        mock_http
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(BridgeError::Network("reset".to_string())));
        mock_http
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(200, record_body("rec1"))));

        let connector = connector(mock_http);
        let record = connector.get_record(&tasks(), "rec1").await.unwrap();

        assert_eq!(record.id, "rec1");
        assert!(connector.connection().is_online());
    }

    #[tokio::test]
    async fn test_non_retryable_status_surfaces_immediately() {
        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(404, r#"{"error":"NOT_FOUND"}"#)));

        let result = connector(mock_http).get_record(&tasks(), "missing").await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_500_is_not_retried_by_transport() {
        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(500, "boom")));

        let result = connector(mock_http).get_record(&tasks(), "rec1").await;
        assert!(matches!(result, Err(ApiError::Server { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_network_failure_marks_offline_after_retries() {
        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .times(3)
            .returning(|_| Err(BridgeError::Network("connection refused".to_string())));

        let bus = EventBus::new(8);
        let mut events = bus.subscribe();
        let connector = connector(mock_http)
            .with_connection(ConnectionMonitor::new(ConnectionState::Online).with_event_bus(bus));

        let result = connector.get_record(&tasks(), "rec1").await;

        assert!(matches!(result, Err(ApiError::Network(_))));
        assert_eq!(connector.connection().state(), ConnectionState::Offline);
        assert!(matches!(
            events.recv().await.unwrap(),
            core_runtime::events::CoreEvent::Connection(
                core_runtime::events::ConnectionEvent::Offline { .. }
            )
        ));
    }

    #[tokio::test]
    async fn test_401_refreshes_once_then_surfaces() {
        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .times(2)
            .returning(|_| Ok(HttpResponse::new(401, r#"{"error":"AUTHENTICATION_REQUIRED"}"#)));

        let result = connector(mock_http).get_record(&tasks(), "rec1").await;
        assert!(matches!(result, Err(ApiError::Authentication(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honors_retry_after() {
        let mut mock_http = MockHttpClient::new();
        let mut seq = Sequence::new();

        mock_http
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(429, "").with_header("Retry-After", "2")));
        mock_http
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(200, record_body("rec1"))));

        let connector = connector(mock_http).with_retry_policy(RetryPolicy {
            max_delay: Duration::from_secs(30),
            ..fast_policy(3)
        });

        let started = tokio::time::Instant::now();
        connector.get_record(&tasks(), "rec1").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_delete_record() {
        let mut mock_http = MockHttpClient::new();
        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.method, HttpMethod::Delete);
            assert!(req.url.ends_with("/v0/app1/Tasks/rec1"));
            Ok(HttpResponse::new(200, r#"{"id":"rec1","deleted":true}"#))
        });

        connector(mock_http).delete_record(&tasks(), "rec1").await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_uses_multipart() {
        let mut mock_http = MockHttpClient::new();
        mock_http.expect_execute().never();
        mock_http
            .expect_upload_multipart()
            .times(1)
            .returning(|req, file, progress| {
                assert!(req.url.ends_with("/v0/app1/Tasks/rec1/uploadAttachment/Files"));
                assert_eq!(file.file_name, "a.txt");
                if let Some(progress) = progress {
                    progress(file.len(), file.len());
                }
                Ok(HttpResponse::new(200, record_body("rec1")))
            });

        let reported = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = reported.clone();
        let progress: ProgressCallback = Arc::new(move |sent, total| {
            sink.lock().unwrap().push((sent, total));
        });

        connector(mock_http)
            .upload_attachment(
                &tasks(),
                "rec1",
                "Files",
                MultipartFile::new("file", "a.txt", "text/plain", &b"hello"[..]),
                Some(progress),
            )
            .await
            .unwrap();

        assert_eq!(*reported.lock().unwrap(), vec![(5, 5)]);
    }

    #[tokio::test]
    async fn test_download_from_foreign_host_has_no_credential() {
        let mut mock_http = MockHttpClient::new();
        mock_http.expect_execute().times(1).returning(|req| {
            assert!(!req.headers.contains_key("Authorization"));
            Ok(HttpResponse::new(200, vec![1u8, 2, 3]))
        });

        let data = connector(mock_http)
            .download_attachment("https://cdn.example.net/att/1")
            .await
            .unwrap();
        assert_eq!(&data[..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lookalike_host_has_no_credential() {
        let mut mock_http = MockHttpClient::new();
        mock_http.expect_execute().times(3).returning(|req| {
            assert!(!req.headers.contains_key("Authorization"), "{}", req.url);
            Ok(HttpResponse::new(200, vec![0u8]))
        });

        let connector = connector(mock_http);
        for url in [
            "https://api.example.com.attacker.net/steal",
            "http://api.example.com/v0/app1/Tasks",
            "https://api.example.com:8443/v0/app1/Tasks",
        ] {
            connector.download_attachment(url).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_api_host_download_has_credential() {
        let mut mock_http = MockHttpClient::new();
        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(
                req.headers.get("Authorization").map(String::as_str),
                Some("Bearer test_token")
            );
            Ok(HttpResponse::new(200, vec![7u8]))
        });

        let data = connector(mock_http)
            .download_attachment("https://api.example.com/attachments/1")
            .await
            .unwrap();
        assert_eq!(&data[..], &[7]);
    }

    #[tokio::test]
    async fn test_evaluate_formula() {
        let mut mock_http = MockHttpClient::new();
        mock_http.expect_execute().times(1).returning(|req| {
            assert!(req.url.ends_with("/rec1/evaluate"));
            Ok(HttpResponse::new(200, r#"{"result": 42}"#))
        });

        let value = connector(mock_http)
            .evaluate_formula(&tasks(), "rec1", "{Count} * 2")
            .await
            .unwrap();
        assert_eq!(value, json!(42));
    }

    #[tokio::test]
    async fn test_decode_error() {
        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .returning(|_| Ok(HttpResponse::new(200, "not json")));

        let result = connector(mock_http).get_record(&tasks(), "rec1").await;
        assert!(matches!(result, Err(ApiError::Decode(_))));
    }
}
