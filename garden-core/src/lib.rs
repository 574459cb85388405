//! Core mirror access for the TerraSync gardener
//!
//! This crate provides the HTTP GET capability and server discovery used by
//! the synchronization engine.

pub mod mirror;

pub use mirror::{
    FixedSource, HttpGet, HttpResponse, MirrorClient, MirrorClientBuilder, MirrorError,
    SourceDiscovery,
};
