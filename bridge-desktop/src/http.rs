//! HTTP Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, MultipartFile, ProgressCallback},
};
use bytes::Bytes;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Reqwest-based HTTP client implementation
///
/// Provides HTTP operations with:
/// - Connection pooling via reqwest
/// - TLS support by default
/// - Streaming multipart uploads with progress reporting
///
/// Every call is a single attempt; retry policy lives in the transport.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new HTTP client with custom timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("recordsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Create a new HTTP client with custom configuration
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Convert bridge HttpMethod to reqwest Method
    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    /// Build reqwest request from bridge request, leaving the body to the caller
    fn build_request(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let method = Self::convert_method(request.method);
        let mut req = self.client.request(method, &request.url);

        for (key, value) in &request.headers {
            req = req.header(key, value);
        }

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        req
    }

    fn map_error(error: reqwest::Error) -> BridgeError {
        if error.is_timeout() {
            BridgeError::Timeout(error.to_string())
        } else if error.is_connect() || error.is_request() || error.is_body() {
            BridgeError::Network(error.to_string())
        } else {
            BridgeError::OperationFailed(error.to_string())
        }
    }

    async fn into_response(response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let body = response.bytes().await.map_err(Self::map_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn chunk(data: &Bytes) -> Vec<Bytes> {
        (0..data.len())
            .step_by(UPLOAD_CHUNK_SIZE)
            .map(|start| data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(data.len())))
            .collect()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!(method = %request.method, url = %request.url, "Executing HTTP request");

        let mut builder = self.build_request(&request);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        match builder.send().await {
            Ok(response) => Self::into_response(response).await,
            Err(e) => {
                warn!(error = %e, url = %request.url, "HTTP request failed");
                Err(Self::map_error(e))
            }
        }
    }

    async fn upload_multipart(
        &self,
        request: HttpRequest,
        file: MultipartFile,
        progress: Option<ProgressCallback>,
    ) -> Result<HttpResponse> {
        let total = file.len();
        debug!(
            url = %request.url,
            file_name = %file.file_name,
            bytes = total,
            "Uploading multipart file"
        );

        let mut sent = 0u64;
        let chunks = Self::chunk(&file.data);
        let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            if let Some(report) = &progress {
                report(sent, total);
            }
            Ok::<Bytes, std::io::Error>(chunk)
        }));

        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(stream),
            total,
        )
        .file_name(file.file_name.clone())
        .mime_str(&file.content_type)
        .map_err(|e| BridgeError::OperationFailed(format!("Invalid content type: {}", e)))?;

        let form = reqwest::multipart::Form::new().part(file.field_name.clone(), part);

        match self.build_request(&request).multipart(form).send().await {
            Ok(response) => Self::into_response(response).await,
            Err(e) => {
                warn!(error = %e, url = %request.url, "Multipart upload failed");
                Err(Self::map_error(e))
            }
        }
    }
}
