//! # Sources
//!
//! Turns a user query into something the audio sink can stream.
//!
//! The engine only sees the [`TrackResolver`] trait; [`ytdlp::YtDlpResolver`]
//! is the production backend. URL-shaped queries are resolved directly,
//! anything else is treated as a search term.

pub mod ytdlp;

use async_trait::async_trait;
use thiserror::Error;

pub use ytdlp::YtDlpResolver;

/// What a resolver hands back: a display title and a direct stream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub title: String,
    pub stream_url: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no results found")]
    NoResults,
    #[error("timed out while resolving")]
    Timeout,
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("unreadable backend output: {0}")]
    InvalidOutput(String),
}

/// Query string to playable track.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<TrackDescriptor, ResolutionError>;
}

/// True for queries that should be resolved as a link instead of searched.
pub fn looks_like_url(query: &str) -> bool {
    match url::Url::parse(query.trim()) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host().is_some(),
        Err(_) => false,
    }
}
