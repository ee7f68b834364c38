use std::time::Duration;

use futures::TryStreamExt;
use reqwest::{Client, Response};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::ValidationError;

/// Settings for fetching remote schemas
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    /// Delay before the first retry; doubled for each further attempt
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Upper bound on a downloaded schema body
    pub max_schema_bytes: u64,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30000,
            max_schema_bytes: 16 * 1024 * 1024,
            user_agent: format!("schematron-validate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Fetches Schematron schemas over HTTP(S) with timeout and backoff retry.
#[derive(Debug, Clone)]
pub struct AsyncHttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl AsyncHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ValidationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Download a schema and decode it as UTF-8 text.
    pub async fn fetch_schema(&self, url: &str) -> Result<String, ValidationError> {
        let response = self.get_with_retry(url).await?;
        let body = self.read_body(url, response).await?;
        String::from_utf8(body).map_err(|_| ValidationError::HttpStatus {
            url: url.to_string(),
            status: 200,
            message: "schema body is not valid UTF-8".to_string(),
        })
    }

    /// Stream the body, refusing anything larger than `max_schema_bytes`.
    async fn read_body(&self, url: &str, response: Response) -> Result<Vec<u8>, ValidationError> {
        let limit = self.config.max_schema_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(too_large(url, limit));
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.try_next().await? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > limit {
                return Err(too_large(url, limit));
            }
        }
        Ok(body)
    }

    async fn get_with_retry(&self, url: &str) -> Result<Response, ValidationError> {
        let mut attempt = 0;
        loop {
            let error = match self.send(url).await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let error = ValidationError::HttpStatus {
                        url: url.to_string(),
                        status: status.as_u16(),
                        message: status.canonical_reason().unwrap_or("Unknown").to_string(),
                    };
                    // 4xx will not change on retry
                    if !status.is_server_error() {
                        return Err(error);
                    }
                    error
                }
                Err(error) if Self::is_retryable(&error) => error,
                Err(error) => return Err(error),
            };

            if attempt >= self.config.retry_attempts {
                return Err(error);
            }
            let delay = self.backoff_delay(attempt);
            warn!(url, attempt, ?delay, error = %error, "schema download failed, retrying");
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send(&self, url: &str) -> Result<Response, ValidationError> {
        debug!(url, "fetching schema");
        timeout(
            Duration::from_secs(self.config.timeout_seconds),
            self.client.get(url).send(),
        )
        .await
        .map_err(|_| ValidationError::Timeout {
            url: url.to_string(),
            timeout_seconds: self.config.timeout_seconds,
        })?
        .map_err(ValidationError::from)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        let delay = self.config.retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.config.max_retry_delay_ms))
    }

    fn is_retryable(error: &ValidationError) -> bool {
        match error {
            ValidationError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            ValidationError::Timeout { .. } => true,
            _ => false,
        }
    }
}

fn too_large(url: &str, limit: u64) -> ValidationError {
    ValidationError::HttpStatus {
        url: url.to_string(),
        status: 413,
        message: format!("schema exceeds {} bytes", limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `responses` in order, one per connection.
    async fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        format!("http://{}/schema.sch", addr)
    }

    fn response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn quick_client() -> AsyncHttpClient {
        AsyncHttpClient::new(HttpClientConfig {
            timeout_seconds: 5,
            retry_attempts: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let client = AsyncHttpClient::new(HttpClientConfig {
            retry_delay_ms: 1000,
            max_retry_delay_ms: 5000,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(client.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(client.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(client.backoff_delay(3), Duration::from_millis(5000));
        assert_eq!(client.backoff_delay(80), Duration::from_millis(5000));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AsyncHttpClient::is_retryable(&ValidationError::Timeout {
            url: "http://example.com".to_string(),
            timeout_seconds: 30,
        }));
        assert!(!AsyncHttpClient::is_retryable(&ValidationError::SchemaNotFound {
            url: "http://example.com".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_fetch_schema() {
        let url = serve(vec![response("200 OK", "<schema/>")]).await;
        let text = quick_client().fetch_schema(&url).await.unwrap();
        assert_eq!(text, "<schema/>");
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let url = serve(vec![
            response("503 Service Unavailable", ""),
            response("200 OK", "<schema/>"),
        ])
        .await;
        let text = quick_client().fetch_schema(&url).await.unwrap();
        assert_eq!(text, "<schema/>");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let url = serve(vec![response("404 Not Found", "")]).await;
        let err = quick_client().fetch_schema(&url).await.unwrap_err();
        assert!(matches!(err, ValidationError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let url = serve(vec![response("200 OK", &"x".repeat(64))]).await;
        let client = AsyncHttpClient::new(HttpClientConfig {
            max_schema_bytes: 16,
            ..Default::default()
        })
        .unwrap();
        let err = client.fetch_schema(&url).await.unwrap_err();
        assert!(matches!(err, ValidationError::HttpStatus { status: 413, .. }));
    }
}
