use super::error::*;
use async_trait::async_trait;
use tracing::info;
use url::Url;

/// Finds the base URL of the mirror to synchronize from.
#[async_trait]
pub trait SourceDiscovery: Send + Sync {
    async fn find_preferred_source(&self) -> Result<Url>;
}

/// A discovery that always answers with the same configured mirror.
#[derive(Debug, Clone)]
pub struct FixedSource {
    url: Option<Url>,
}

impl FixedSource {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url.trim_end_matches('/'))?;
        Ok(Self { url: Some(url) })
    }

    /// A source with nothing configured; every lookup fails
    pub fn unavailable() -> Self {
        Self { url: None }
    }
}

#[async_trait]
impl SourceDiscovery for FixedSource {
    async fn find_preferred_source(&self) -> Result<Url> {
        match &self.url {
            Some(url) => {
                info!("Using mirror {}", url);
                Ok(url.clone())
            }
            None => Err(MirrorError::NoServerAvailable(
                "no mirror URL configured".to_string(),
            )),
        }
    }
}
