use super::error::*;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::ClientBuilder;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Status and body of one completed GET
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Plain GET capability the sync core rides on.
///
/// Implementations return the status and body as received; a non-200
/// status is not an error at this level. Only transport failures are.
#[async_trait]
pub trait HttpGet: Send + Sync {
    async fn get(&self, url: &Url) -> Result<HttpResponse>;
}

/// reqwest-backed mirror client
#[derive(Debug, Clone)]
pub struct MirrorClient {
    http_client: reqwest::Client,
}

impl MirrorClient {
    /// Create a client with the default timeouts and user agent
    pub fn new() -> Result<Self> {
        MirrorClientBuilder::new().build()
    }

    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl HttpGet for MirrorClient {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        debug!("GET {}", url);

        let response = self.http_client.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        debug!("GET {} -> {} ({} bytes)", url, status, body.len());
        Ok(HttpResponse { status, body })
    }
}

pub struct MirrorClientBuilder {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl MirrorClientBuilder {
    pub fn new() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(10)),
            user_agent: Some(concat!("terrasync-gardener/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn build(self) -> Result<MirrorClient> {
        // One request at a time; idle connections are not kept around.
        let mut client_builder = ClientBuilder::new().pool_max_idle_per_host(0);

        if let Some(timeout) = self.timeout {
            client_builder = client_builder.timeout(timeout);
        }

        if let Some(connect_timeout) = self.connect_timeout {
            client_builder = client_builder.connect_timeout(connect_timeout);
        }

        if let Some(user_agent) = self.user_agent {
            client_builder = client_builder.user_agent(user_agent);
        }

        let http_client = client_builder.build().map_err(MirrorError::Network)?;

        Ok(MirrorClient::with_client(http_client))
    }
}

impl Default for MirrorClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
