//! Downloader collaborator interface.
//!
//! The HTTP client is not implemented in this crate; embedders supply an
//! implementation (typically reqwest-backed) behind this trait.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP error fetching {url}: {message}")]
    Http { url: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("download cancelled")]
    Cancelled,
}

/// Fetches artifacts and indexes over the network.
///
/// Implementations must be idempotent on `dest`: re-downloading to an
/// existing destination path replaces it with identical content.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` to `dest`, observing `cancel` cooperatively.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError>;
}
