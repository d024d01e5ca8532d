//! HTTP transport with deadline and cancellation propagation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Provider name, carried for error attribution.
    pub provider: String,
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn get(provider: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(
        provider: impl Into<String>,
        url: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            provider: provider.into(),
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self::new(status, body.to_string()).with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Deadline and cancellation carried by every outbound call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub deadline: Instant,
    /// Time budget the deadline was derived from, reported on timeout.
    pub budget: Duration,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            budget: timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Narrower context: earliest of this deadline and `now + timeout`,
    /// cancelled whenever this context is.
    pub fn child(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let (deadline, budget) = if candidate < self.deadline {
            (candidate, timeout)
        } else {
            (self.deadline, self.budget)
        };
        Self {
            deadline,
            budget,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn timeout_error(&self) -> Error {
        Error::Timeout(self.budget)
    }

    /// Run `fut` until it completes, the deadline passes, or the context is cancelled.
    ///
    /// The future is dropped on timeout or cancellation, which aborts any
    /// in-flight request it owns.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            r = tokio::time::timeout_at(self.deadline, fut) => match r {
                Ok(inner) => inner,
                Err(_) => Err(self.timeout_error()),
            },
        }
    }

    /// Sleep for `delay`, returning early with an error on cancellation or deadline.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}

/// Issues HTTP requests. Implementations must honour the context's deadline
/// and cancellation directly.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn send(&self, request: HttpRequest, ctx: &CallContext) -> Result<HttpResponse>;
}

/// Connection pool settings for [`ReqwestTransport`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub tcp_keepalive: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 8,
            tcp_keepalive: Some(Duration::from_secs(60)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn apply_to_builder(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        builder
            .pool_idle_timeout(self.idle_timeout)
            .pool_max_idle_per_host(self.max_idle_per_host)
            .tcp_keepalive(self.tcp_keepalive)
            .connect_timeout(self.connect_timeout)
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        Self::with_pool(&PoolConfig::default())
    }

    pub fn with_pool(pool: &PoolConfig) -> Result<Self> {
        let builder = pool.apply_to_builder(
            reqwest::Client::builder().user_agent(concat!("llm-verifier/", env!("CARGO_PKG_VERSION"))),
        );
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self { http })
    }

    pub fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn map_reqwest_error(provider: &str, err: reqwest::Error, budget: Duration) -> Error {
    if err.is_timeout() {
        Error::Timeout(budget)
    } else if err.is_decode() || err.is_body() {
        Error::malformed(provider, err.to_string())
    } else {
        Error::network(provider, err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest, ctx: &CallContext) -> Result<HttpResponse> {
        let remaining = ctx.remaining();
        if remaining.is_zero() {
            return Err(ctx.timeout_error());
        }

        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&request.url),
            HttpMethod::Post => self.http.post(&request.url),
        }
        .timeout(remaining);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let provider = request.provider.as_str();
        let budget = ctx.budget;
        ctx.run(async move {
            let response = builder
                .send()
                .await
                .map_err(|e| map_reqwest_error(provider, e, budget))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
                })
                .collect();
            let body = response
                .text()
                .await
                .map_err(|e| map_reqwest_error(provider, e, budget))?;
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
        .await
    }
}
