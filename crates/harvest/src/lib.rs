//! # toonpdf harvest
//!
//! Scrapes a webtoon episode page with a headless browser and assembles its
//! panels into a single PDF, one page per panel at the panel's native size.
//!
//! ## Pipeline
//! - [`renderer`] loads the page and scrolls until lazy content stops growing
//! - [`locator`] lists panel images in reading order across all frames
//! - [`acquirer`] captures image bytes from the browser's network responses
//! - [`fallback`] takes scrolling screenshots when nothing could be captured
//! - [`assembler`] writes the PDF and removes the intermediate images
//!
//! [`job`] runs the whole thing out-of-process and tracks its outcome.

pub mod acquirer;
pub mod assembler;
pub mod error;
pub mod fallback;
pub mod job;
pub mod locator;
pub mod naming;
pub mod pipeline;
pub mod renderer;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use toonpdf_config::Configuration;
use tracing::{info, warn};

pub use error::HarvestError;
pub use pipeline::{HarvestOutcome, PageSource};

// Constants
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120 Safari/537.36";
const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 1800;
const DEFAULT_SCROLL_DELAY_MS: u64 = 400;
const DEFAULT_SCROLL_STABLE_ROUNDS: u32 = 3;
const DEFAULT_SCROLL_MAX_ROUNDS: u32 = 150;
const DEFAULT_MIN_IMAGE_SIDE: f64 = 50.0;
const DEFAULT_NETWORK_IDLE_MS: u64 = 1500;
const DEFAULT_NETWORK_IDLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_FALLBACK_OVERLAP_PX: u32 = 40;
const DEFAULT_FALLBACK_SETTLE_MS: u64 = 300;
const DEFAULT_FALLBACK_MAX_SLICES: usize = 1000;
const DEFAULT_SITE: &str = "https://www.webtoons.com";

/// Configuration for the harvest crate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Path where log files are stored
    pub logs_path: PathBuf,
    /// Root directory for job outputs
    pub jobs_path: PathBuf,
    /// Chrome/Chromium executable; `CHROME_PATH` or auto-detection when unset
    pub chrome_path: Option<PathBuf>,
    /// User agent presented by the browser
    pub user_agent: String,
    /// Browser viewport width in CSS pixels
    pub viewport_width: u32,
    /// Browser viewport height in CSS pixels
    pub viewport_height: u32,
    /// Pause after each lazy-load scroll step
    pub scroll_delay_ms: u64,
    /// Consecutive unchanged height readings that end lazy-load scrolling
    pub scroll_stable_rounds: u32,
    /// Hard cap on lazy-load scroll steps per frame
    pub scroll_max_rounds: u32,
    /// Images whose box is not larger than this on both sides are ignored
    pub min_image_side: f64,
    /// Quiet period that counts as network idle
    pub network_idle_ms: u64,
    /// Upper bound on the network idle wait
    pub network_idle_timeout_ms: u64,
    /// Overlap between consecutive fallback screenshots
    pub fallback_overlap_px: u32,
    /// Pause after each fallback scroll before the screenshot
    pub fallback_settle_ms: u64,
    /// Hard cap on fallback screenshots
    pub fallback_max_slices: usize,
    /// Stitch fallback screenshots into one tall image
    pub stitch_fallback: bool,
    /// Origin used to resolve `/`-rooted input paths
    pub default_site: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            logs_path: PathBuf::from("logs"),
            jobs_path: PathBuf::from("jobs"),
            chrome_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            viewport_width: DEFAULT_VIEWPORT_WIDTH,
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            scroll_delay_ms: DEFAULT_SCROLL_DELAY_MS,
            scroll_stable_rounds: DEFAULT_SCROLL_STABLE_ROUNDS,
            scroll_max_rounds: DEFAULT_SCROLL_MAX_ROUNDS,
            min_image_side: DEFAULT_MIN_IMAGE_SIDE,
            network_idle_ms: DEFAULT_NETWORK_IDLE_MS,
            network_idle_timeout_ms: DEFAULT_NETWORK_IDLE_TIMEOUT_MS,
            fallback_overlap_px: DEFAULT_FALLBACK_OVERLAP_PX,
            fallback_settle_ms: DEFAULT_FALLBACK_SETTLE_MS,
            fallback_max_slices: DEFAULT_FALLBACK_MAX_SLICES,
            stitch_fallback: false,
            default_site: DEFAULT_SITE.to_string(),
        }
    }
}

impl Configuration for HarvestConfig {
    fn crate_name() -> &'static str {
        "toonpdf-harvest"
    }
}

impl HarvestConfig {
    /// Browser executable, honouring the `CHROME_PATH` override.
    pub fn resolved_chrome_path(&self) -> Option<PathBuf> {
        self.chrome_path
            .clone()
            .or_else(|| std::env::var_os("CHROME_PATH").map(PathBuf::from))
    }

    pub fn scroll_delay(&self) -> Duration {
        Duration::from_millis(self.scroll_delay_ms)
    }

    pub fn network_idle(&self) -> Duration {
        Duration::from_millis(self.network_idle_ms)
    }

    pub fn network_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.network_idle_timeout_ms)
    }

    pub fn fallback_settle(&self) -> Duration {
        Duration::from_millis(self.fallback_settle_ms)
    }
}

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestOptions {
    /// Extra pause after the DOM is ready, before lazy-load scrolling
    pub wait_millis: u64,
    /// Verbose logging
    pub debug: bool,
}

/// One harvest run: where to read from and where to write.
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub file_name: String,
    pub options: HarvestOptions,
}

impl HarvestRequest {
    /// Builds a request from command-line positionals.
    ///
    /// `targets` holds up to two values in any order: the one ending in
    /// `.pdf` is the file name, the other the output directory. The directory
    /// defaults to the series name and the file name to `<dir name>.pdf`.
    pub fn resolve(
        url: &str,
        targets: &[String],
        options: HarvestOptions,
        default_site: &str,
    ) -> Result<Self, HarvestError> {
        let normalized = naming::normalize_url(url, default_site)?;
        let is_pdf = |t: &&String| t.to_lowercase().ends_with(".pdf");

        let output_dir = targets
            .iter()
            .find(|t| !is_pdf(t))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(naming::series_dir_from_url(&normalized)));

        let file_name = match targets.iter().find(is_pdf) {
            Some(name) => name.clone(),
            None => {
                let base = output_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| naming::series_dir_from_url(&normalized));
                format!("{base}.pdf")
            }
        };

        Ok(Self {
            url: normalized,
            output_dir,
            file_name,
            options,
        })
    }

    pub fn pdf_path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }
}

/// Runs the full pipeline for one episode and returns the written PDF path.
///
/// The URL is validated before the browser is started, so bad input never
/// costs a browser launch.
pub async fn harvest_episode(request: &HarvestRequest, config: &HarvestConfig) -> Result<PathBuf> {
    let url = naming::normalize_url(&request.url, &config.default_site)?;

    std::fs::create_dir_all(&request.output_dir)
        .map_err(|e| HarvestError::io(&request.output_dir, e))?;

    info!("Opening {}", url);
    let session = renderer::BrowserSession::launch(config).await?;

    let outcome = async {
        let page = session
            .render(&url, request.options.wait_millis, config)
            .await?;
        pipeline::harvest(&page, &request.output_dir, &request.pdf_path()).await
    }
    .await;

    if let Err(e) = session.close().await {
        warn!("Failed to close browser: {}", e);
    }

    let outcome = outcome.context("Harvest failed")?;
    Ok(outcome.pdf_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_reader_tuning() {
        let config = HarvestConfig::default();
        assert_eq!(config.viewport_width, 1280);
        assert_eq!(config.viewport_height, 1800);
        assert_eq!(config.scroll_stable_rounds, 3);
        assert_eq!(config.scroll_max_rounds, 150);
        assert_eq!(config.fallback_overlap_px, 40);
        assert!(!config.stitch_fallback);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: HarvestConfig = toml_from("stitch_fallback = true\nviewport_height = 900\n");
        assert!(config.stitch_fallback);
        assert_eq!(config.viewport_height, 900);
        assert_eq!(config.network_idle_ms, DEFAULT_NETWORK_IDLE_MS);
    }

    fn toml_from(text: &str) -> HarvestConfig {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("toonpdf-harvest.toml"), text).unwrap();
        toonpdf_config::Config::<HarvestConfig>::load_from(dir.path())
            .unwrap()
            .data
    }

    const EPISODE: &str = "https://www.webtoons.com/en/fantasy/tower-of-god/season-3-ep-180/viewer";

    fn resolve(targets: &[&str]) -> HarvestRequest {
        let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        HarvestRequest::resolve(EPISODE, &targets, HarvestOptions::default(), DEFAULT_SITE).unwrap()
    }

    #[test]
    fn test_request_defaults_to_series_name() {
        let request = resolve(&[]);
        assert_eq!(request.output_dir, PathBuf::from("fantasy-tower-of-god-ep180"));
        assert_eq!(request.file_name, "fantasy-tower-of-god-ep180.pdf");
    }

    #[test]
    fn test_request_targets_in_either_order() {
        let a = resolve(&["out/tog", "tog.pdf"]);
        let b = resolve(&["tog.PDF", "out/tog"]);
        assert_eq!(a.pdf_path(), PathBuf::from("out/tog/tog.pdf"));
        assert_eq!(b.output_dir, PathBuf::from("out/tog"));
        assert_eq!(b.file_name, "tog.PDF");
    }

    #[test]
    fn test_request_names_pdf_after_directory() {
        let request = resolve(&["downloads/chapter-9"]);
        assert_eq!(request.file_name, "chapter-9.pdf");
    }

    #[test]
    fn test_request_with_only_pdf_name() {
        let request = resolve(&["mine.pdf"]);
        assert_eq!(request.output_dir, PathBuf::from("fantasy-tower-of-god-ep180"));
        assert_eq!(request.file_name, "mine.pdf");
    }

    #[tokio::test]
    async fn test_blank_url_fails_before_browser_launch() {
        let dir = tempfile::tempdir().unwrap();
        let request = HarvestRequest {
            url: "   ".to_string(),
            output_dir: dir.path().join("out"),
            file_name: "episode.pdf".to_string(),
            options: HarvestOptions::default(),
        };
        let config = HarvestConfig {
            chrome_path: Some(PathBuf::from("/nonexistent/chrome")),
            ..HarvestConfig::default()
        };

        let err = harvest_episode(&request, &config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarvestError>(),
            Some(HarvestError::Input(_))
        ));
        assert!(!dir.path().join("out").exists());
    }
}
