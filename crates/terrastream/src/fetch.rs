//! Network access for the tile pipeline.
//!
//! The pipeline talks to the network only through the [`Fetcher`] trait, so
//! tests can script responses without a server. [`HttpFetcher`] is the
//! `reqwest` implementation used in production.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::{Error, Result};

/// Future type for fetch operations.
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<FetchResponse>> + Send + 'a>>;

/// A completed HTTP exchange.
///
/// Non-success statuses are returned rather than turned into errors so the
/// caller can tell an expired token apart from other failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// A `200 OK` response with the given body.
    #[must_use]
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// A response with the given status and an empty body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the server rejected the request's credentials.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}

/// Performs HTTP GET requests.
///
/// Implementations return `Err` only for transport failures (connection
/// errors, timeouts); any response that arrives is returned as-is.
pub trait Fetcher: Send + Sync {
    /// GET `url`, optionally with a bearer token.
    fn get<'a>(&'a self, url: &'a str, bearer: Option<&'a str>) -> FetchFuture<'a>;
}

/// A [`Fetcher`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("terrastream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config {
                context: "http client",
                detail: e.to_string(),
            })?;
        Ok(Self { http })
    }

    /// Wrap an existing `reqwest` client.
    #[must_use]
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Fetcher for HttpFetcher {
    fn get<'a>(&'a self, url: &'a str, bearer: Option<&'a str>) -> FetchFuture<'a> {
        Box::pin(async move {
            tracing::debug!(url, "Fetching");

            let mut request = self.http.get(url);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| transport_error(url, &e))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| transport_error(url, &e))?;

            Ok(FetchResponse {
                status,
                body: body.to_vec(),
            })
        })
    }
}

fn transport_error(url: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            url: url.to_string(),
        }
    } else {
        Error::Http {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}
