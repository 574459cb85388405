//! Remote mirror access
//!
//! A thin GET capability over reqwest plus the server discovery contract.
//! Status codes are handed back untouched so callers can decide what a
//! 404 or a retry means for them.

pub mod client;
pub mod discovery;
pub mod error;

pub use client::{HttpGet, HttpResponse, MirrorClient, MirrorClientBuilder};
pub use discovery::{FixedSource, SourceDiscovery};
pub use error::{MirrorError, Result};
