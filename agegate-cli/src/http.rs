use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use eyre::eyre;
use reqwest::{Method, RequestBuilder, Response};

/// HTTP client for downloads and health-check pings. Sets a timeout and
/// user agent, refuses plain HTTP unless allowed, and retries transient
/// failures with exponential backoff.
pub struct Request {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: usize,
    allow_http: bool,
}

impl Request {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            max_retries: 3, // total attempts = 4
            allow_http: false,
        }
    }

    /// Permits `http://` URLs (local mirrors, tests).
    #[must_use]
    pub const fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Sets how many times a transient failure is retried.
    #[must_use]
    pub const fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    fn req(&self, method: Method, url: &str) -> eyre::Result<RequestBuilder> {
        if !self.allow_http && !url.starts_with("https://") {
            return Err(eyre!("refusing non-HTTPS URL {url}"));
        }
        Ok(self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .header(
                "User-Agent",
                format!("agegate-cli/{}", env!("CARGO_PKG_VERSION")),
            ))
    }

    /// Sends a GET with retries; non-success statuses are errors.
    pub async fn get(&self, url: &str) -> eyre::Result<Response> {
        let response = self.handle(self.req(Method::GET, url)?).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(eyre!("GET {url} returned {status}"));
        }
        Ok(response)
    }

    async fn handle(&self, request_builder: RequestBuilder) -> eyre::Result<Response> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.max_retries);

        let template = request_builder
            .try_clone()
            .ok_or_else(|| eyre!("request cannot be retried because it is not cloneable"))?;

        (|| async {
            let request_builder = template.try_clone().ok_or_else(|| {
                RequestHandleError::permanent(
                    "<unknown>".to_string(),
                    "request is not cloneable".to_string(),
                )
            })?;
            execute_request_builder(request_builder).await
        })
        .retry(backoff)
        .when(RequestHandleError::is_retryable)
        .notify(|err, delay| {
            tracing::warn!(url = %err.url, ?delay, "retrying request: {}", err.error);
        })
        .await
        .map_err(|err| eyre!("request to {} failed: {}", err.url, err.error))
    }
}

#[derive(Debug)]
struct RequestHandleError {
    url: String,
    error: String,
    retryable: bool,
}

impl RequestHandleError {
    const fn retryable(url: String, error: String) -> Self {
        Self {
            url,
            error,
            retryable: true,
        }
    }

    const fn permanent(url: String, error: String) -> Self {
        Self {
            url,
            error,
            retryable: false,
        }
    }

    const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

async fn execute_request_builder(
    request_builder: RequestBuilder,
) -> Result<Response, RequestHandleError> {
    let (client, request) = request_builder.build_split();
    let request = request.map_err(|err| {
        RequestHandleError::permanent(
            err.url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            format!("request build failed: {err}"),
        )
    })?;
    let url = request.url().to_string();

    match client.execute(request).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status == 429 || (500..600).contains(&status) {
                return Err(RequestHandleError::retryable(
                    url,
                    format!("bad status code {status}"),
                ));
            }
            Ok(resp)
        }
        Err(err) if err.is_timeout() || err.is_connect() => Err(RequestHandleError::retryable(
            url,
            format!("timeout/connect error: {err}"),
        )),
        Err(err) => Err(RequestHandleError::permanent(
            url,
            format!("request failed: {err}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn client() -> Request {
        Request::new(Duration::from_secs(5)).allow_http(true)
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", "/db")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let result = client().max_retries(1).get(&format!("{}/db", server.url())).await;
        assert!(result.is_err());
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let missing = server
            .mock("GET", "/db")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = client().get(&format!("{}/db", server.url())).await.unwrap_err();
        assert!(err.to_string().contains("404"));
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_plain_http_refused_by_default() {
        let err = Request::new(Duration::from_secs(1))
            .get("http://example.com/db")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("non-HTTPS"));
    }
}
