//! Fatal error taxonomy for a harvest run.
//!
//! Per-image failures are not represented here: they are logged, counted and
//! left out of the output.

use std::path::PathBuf;

use thiserror::Error;

/// Conditions that stop a harvest run.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Missing or unusable input URL.
    #[error("invalid input: {0}")]
    Input(String),

    /// The browser could not load the target page.
    #[error("failed to load {url}: {reason}")]
    Navigation { url: String, reason: String },

    /// Nothing could be harvested, even after the screenshot fallback.
    #[error("no images to build PDF")]
    NoImages,

    /// The headless browser could not be started.
    #[error("failed to launch browser: {0}")]
    BrowserLaunch(String),

    /// A file-system operation failed.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarvestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
