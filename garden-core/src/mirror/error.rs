use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("No server available: {0}")]
    NoServerAvailable(String),
}

impl MirrorError {
    /// HTTP status carried by this error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            MirrorError::Status { status, .. } => Some(*status),
            MirrorError::Network(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
