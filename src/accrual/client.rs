use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use std::error::Error as _;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

use super::models::{AccrualReport, AccrualResponse};
use super::AccrualSource;
use crate::error::AccrualError;
use crate::shutdown::ShutdownSignal;

const DEFAULT_RETRY_BUDGET: u32 = 3;
const DEFAULT_CONNECT_RETRY_WAIT: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the accrual service
///
/// Retries only two conditions, sharing one budget per call:
/// - 429 carrying a `Retry-After: <seconds>` directive (waits that long)
/// - connection refused (waits a short fixed pause)
pub struct AccrualClient {
    http: Client,
    base_url: String,
    retry_budget: u32,
    connect_retry_wait: Duration,
    shutdown: ShutdownSignal,
}

impl AccrualClient {
    pub fn new(base_url: &str) -> Result<Self, AccrualError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            http,
            base_url: normalize_base_url(base_url),
            retry_budget: DEFAULT_RETRY_BUDGET,
            connect_retry_wait: DEFAULT_CONNECT_RETRY_WAIT,
            shutdown: ShutdownSignal::never(),
        })
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    #[cfg(test)]
    pub fn with_connect_retry_wait(mut self, wait: Duration) -> Self {
        self.connect_retry_wait = wait;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, order_number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_number)
    }

    /// Sleeps for `wait`; returns false if shutdown cut the wait short.
    async fn pause(&self, wait: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.wait() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}

#[async_trait]
impl AccrualSource for AccrualClient {
    async fn fetch(&self, order_number: &str) -> Result<AccrualReport, AccrualError> {
        let url = self.order_url(order_number);
        let mut retries = 0;

        loop {
            let response = match self.http.get(&url).send().await {
                Ok(response) => response,
                Err(e) if is_connection_refused(&e) && retries < self.retry_budget => {
                    retries += 1;
                    warn!(order = %order_number, retries, error = %e, "Accrual service unreachable, retrying");
                    if !self.pause(self.connect_retry_wait).await {
                        return Err(e.into());
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match response.status() {
                StatusCode::OK => {
                    let body = response.bytes().await?;
                    let parsed: AccrualResponse = serde_json::from_slice(&body)?;
                    if let Some(reported) = parsed.order.as_deref().filter(|o| *o != order_number) {
                        warn!(order = %order_number, reported = %reported, "Accrual response names a different order");
                    }
                    debug!(order = %order_number, status = ?parsed.status, "Accrual status fetched");
                    return Ok(parsed.into());
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let directive = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);

                    let Some(wait) = directive.as_deref().and_then(parse_retry_after) else {
                        warn!(order = %order_number, retry_after = ?directive, "Rate limited without a usable Retry-After");
                        return Err(AccrualError::RateLimited { retry_after: directive });
                    };

                    if retries >= self.retry_budget {
                        return Err(AccrualError::RateLimited { retry_after: directive });
                    }

                    retries += 1;
                    warn!(
                        order = %order_number,
                        retries,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited by accrual service, waiting"
                    );
                    if !self.pause(wait).await {
                        return Err(AccrualError::RateLimited { retry_after: directive });
                    }
                }
                status => return Err(AccrualError::UnexpectedStatus(status.as_u16())),
            }
        }
    }
}

/// `Retry-After` in seconds. HTTP-date directives and values that do not fit
/// a `Duration` are treated as absent.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Connect failed because nothing listens on the address. DNS failures and
/// connect timeouts do not count.
fn is_connection_refused(error: &reqwest::Error) -> bool {
    if !error.is_connect() {
        return false;
    }
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            return io_error.kind() == io::ErrorKind::ConnectionRefused;
        }
        source = cause.source();
    }
    false
}

fn normalize_base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::OrderStatus;
    use axum::{extract::State, http::HeaderMap, response::IntoResponse, routing::get, Json, Router};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn processed_body() -> Json<serde_json::Value> {
        Json(serde_json::json!({
            "order": "12345678903",
            "status": "PROCESSED",
            "accrual": 500
        }))
    }

    #[test]
    fn base_url_gets_a_scheme() {
        assert_eq!(normalize_base_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(normalize_base_url("https://accrual/"), "https://accrual");
    }

    #[test]
    fn retry_after_is_seconds() {
        assert_eq!(parse_retry_after("1"), Some(Duration::from_secs(1)));
        assert_eq!(parse_retry_after(" 2 "), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("NaN"), None);
    }

    #[test]
    fn oversized_retry_after_is_treated_as_absent() {
        assert_eq!(parse_retry_after("1e20"), None);
        assert_eq!(parse_retry_after("inf"), None);
    }

    #[test]
    fn builds_with_bare_address() {
        let client = AccrualClient::new("localhost:8080").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn fetches_processed_order() {
        let base = serve(Router::new().route(
            "/api/orders/:number",
            get(|| async { processed_body() }),
        ))
        .await;

        let report = AccrualClient::new(&base).unwrap().fetch("12345678903").await.unwrap();
        assert_eq!(report.status, OrderStatus::Processed);
        assert_eq!(report.accrual, Some(dec!(500)));
    }

    #[tokio::test]
    async fn waits_for_retry_after_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/api/orders/:number",
                get(|State(calls): State<Arc<AtomicUsize>>| async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        let mut headers = HeaderMap::new();
                        headers.insert("Retry-After", "1".parse().unwrap());
                        (axum::http::StatusCode::TOO_MANY_REQUESTS, headers).into_response()
                    } else {
                        processed_body().into_response()
                    }
                }),
            )
            .with_state(calls.clone());
        let base = serve(router).await;

        let started = Instant::now();
        let report = AccrualClient::new(&base).unwrap().fetch("12345678903").await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(report.status, OrderStatus::Processed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limit_without_directive_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/api/orders/:number",
                get(|State(calls): State<Arc<AtomicUsize>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::TOO_MANY_REQUESTS
                }),
            )
            .with_state(calls.clone());
        let base = serve(router).await;

        let err = AccrualClient::new(&base).unwrap().fetch("12345678903").await.unwrap_err();
        assert!(matches!(err, AccrualError::RateLimited { retry_after: None }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absurd_retry_after_fails_without_retry() {
        let base = serve(Router::new().route(
            "/api/orders/:number",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.insert("Retry-After", "1e20".parse().unwrap());
                (axum::http::StatusCode::TOO_MANY_REQUESTS, headers)
            }),
        ))
        .await;

        let err = AccrualClient::new(&base).unwrap().fetch("12345678903").await.unwrap_err();
        match err {
            AccrualError::RateLimited { retry_after } => {
                assert_eq!(retry_after.as_deref(), Some("1e20"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_retries_stop_at_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/api/orders/:number",
                get(|State(calls): State<Arc<AtomicUsize>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut headers = HeaderMap::new();
                    headers.insert("Retry-After", "0".parse().unwrap());
                    (axum::http::StatusCode::TOO_MANY_REQUESTS, headers)
                }),
            )
            .with_state(calls.clone());
        let base = serve(router).await;

        let err = AccrualClient::new(&base).unwrap()
            .with_retry_budget(2)
            .fetch("12345678903")
            .await
            .unwrap_err();
        assert!(matches!(err, AccrualError::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_statuses_are_errors() {
        let base = serve(Router::new().route(
            "/api/orders/:number",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        ))
        .await;

        let err = AccrualClient::new(&base).unwrap().fetch("12345678903").await.unwrap_err();
        assert!(matches!(err, AccrualError::UnexpectedStatus(204)));
    }

    #[tokio::test]
    async fn undecodable_body_is_an_error() {
        let base = serve(Router::new().route(
            "/api/orders/:number",
            get(|| async { "error" }),
        ))
        .await;

        let err = AccrualClient::new(&base).unwrap().fetch("12345678903").await.unwrap_err();
        assert!(matches!(err, AccrualError::Decode(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_retried_then_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let started = Instant::now();
        let err = AccrualClient::new(&addr.to_string())
            .unwrap()
            .with_retry_budget(2)
            .with_connect_retry_wait(Duration::from_millis(50))
            .fetch("12345678903")
            .await
            .unwrap_err();

        assert!(matches!(err, AccrualError::Transport(_)));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn unresolvable_host_is_not_retried() {
        let started = Instant::now();
        let err = AccrualClient::new("accrual.invalid:8080")
            .unwrap()
            .with_retry_budget(3)
            .with_connect_retry_wait(Duration::from_secs(10))
            .fetch("12345678903")
            .await
            .unwrap_err();

        match &err {
            AccrualError::Transport(e) => assert!(!is_connection_refused(e)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
