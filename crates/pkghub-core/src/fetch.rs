//! Artifact fetching.
//!
//! Extraction only ever sees bytes returned from here, and this module only
//! reaches the artifact store and explicitly granted HTTP hosts. A URL on any
//! other host, including a redirect target, is refused without a request.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use pkghub_schema::ArtifactLocation;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::FetchConfig;
use crate::store::{ObjectStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("host '{0}' is not granted for artifact fetching")]
    NotGranted(String),

    #[error("artifact {location} exceeds {limit} bytes")]
    TooLarge { location: String, limit: u64 },

    #[error("transient failure fetching {location}: {reason}")]
    Transient { location: String, reason: String },

    #[error("failed to fetch {location}: {reason}")]
    Permanent { location: String, reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[async_trait]
pub trait ArtifactFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, location: &ArtifactLocation) -> Result<Bytes, FetchError>;
}

/// Reads `store:` locations from the artifact object store.
#[derive(Debug, Clone)]
pub struct StoreFetcher {
    store: Arc<dyn ObjectStore>,
    max_bytes: u64,
}

impl StoreFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, max_bytes: u64) -> Self {
        Self { store, max_bytes }
    }
}

#[async_trait]
impl ArtifactFetcher for StoreFetcher {
    async fn fetch(&self, location: &ArtifactLocation) -> Result<Bytes, FetchError> {
        let ArtifactLocation::Store { key } = location else {
            return Err(FetchError::Permanent {
                location: location.to_string(),
                reason: "not a store location".to_string(),
            });
        };
        match self.store.get(key).await {
            Ok(object) if object.meta.size > self.max_bytes => Err(FetchError::TooLarge {
                location: location.to_string(),
                limit: self.max_bytes,
            }),
            Ok(object) => Ok(object.data),
            Err(StoreError::NotFound(_)) => Err(FetchError::NotFound(location.to_string())),
            Err(e) if e.is_transient() => Err(FetchError::Transient {
                location: location.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => Err(FetchError::Permanent {
                location: location.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct HostGrant(Arc<Vec<String>>);

impl HostGrant {
    fn allows(&self, url: &Url) -> bool {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        let with_port = url.port().map(|p| format!("{host}:{p}"));
        self.0
            .iter()
            .any(|g| *g == host || with_port.as_ref().is_some_and(|hp| g == hp))
    }
}

/// Fetches `http(s)://` locations on granted hosts.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    grant: HostGrant,
    max_bytes: u64,
}

impl HttpFetcher {
    /// # Errors
    ///
    /// Returns the `reqwest` error if the HTTP client cannot be built.
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let grant = HostGrant(Arc::new(
            config
                .granted_hosts
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
        ));
        let redirect_grant = grant.clone();
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() >= 5 || !redirect_grant.allows(attempt.url()) {
                    attempt.stop()
                } else {
                    attempt.follow()
                }
            }))
            .build()?;
        Ok(Self {
            client,
            grant,
            max_bytes: config.max_artifact_bytes,
        })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, location: &ArtifactLocation) -> Result<Bytes, FetchError> {
        let ArtifactLocation::Http { url } = location else {
            return Err(FetchError::Permanent {
                location: location.to_string(),
                reason: "not an http location".to_string(),
            });
        };
        let permanent = |reason: String| FetchError::Permanent {
            location: url.clone(),
            reason,
        };
        let transient = |reason: String| FetchError::Transient {
            location: url.clone(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|e| permanent(e.to_string()))?;
        if !self.grant.allows(&parsed) {
            return Err(FetchError::NotGranted(
                parsed.host_str().unwrap_or_default().to_string(),
            ));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(FetchError::NotFound(url.clone()));
        }
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            return Err(transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(permanent(format!("HTTP {status}")));
        }
        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(FetchError::TooLarge {
                location: url.clone(),
                limit: self.max_bytes,
            });
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transient(e.to_string()))?;
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchError::TooLarge {
                    location: url.clone(),
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        tracing::debug!(location = %url, bytes = body.len(), "fetched artifact");
        Ok(body.freeze())
    }
}

/// Dispatches by location kind. Without an [`HttpFetcher`] every URL is refused.
#[derive(Debug, Clone)]
pub struct RoutingFetcher {
    store: StoreFetcher,
    http: Option<HttpFetcher>,
}

impl RoutingFetcher {
    pub fn new(store: StoreFetcher, http: Option<HttpFetcher>) -> Self {
        Self { store, http }
    }

    /// Fetcher for `store` plus the hosts granted in `config`.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the HTTP client cannot be built.
    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        config: &FetchConfig,
    ) -> Result<Self, reqwest::Error> {
        let http = if config.granted_hosts.is_empty() {
            None
        } else {
            Some(HttpFetcher::new(config)?)
        };
        Ok(Self::new(
            StoreFetcher::new(store, config.max_artifact_bytes),
            http,
        ))
    }
}

#[async_trait]
impl ArtifactFetcher for RoutingFetcher {
    async fn fetch(&self, location: &ArtifactLocation) -> Result<Bytes, FetchError> {
        match (location, &self.http) {
            (ArtifactLocation::Store { .. }, _) => self.store.fetch(location).await,
            (ArtifactLocation::Http { .. }, Some(http)) => http.fetch(location).await,
            (ArtifactLocation::Http { url }, None) => Err(FetchError::NotGranted(
                Url::parse(url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| url.clone()),
            )),
        }
    }
}
