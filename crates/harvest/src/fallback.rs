//! Screenshot fallback for pages whose images could not be captured.
//!
//! The page is walked from top to bottom one viewport at a time, with a small
//! overlap between consecutive shots so nothing falls between two slices.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use image::{GenericImage, RgbaImage};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::renderer::RenderedPage;

const TOTAL_HEIGHT_JS: &str = "() => Math.max(
    document.body ? document.body.scrollHeight : 0,
    document.documentElement.scrollHeight,
    document.body ? document.body.offsetHeight : 0,
    document.documentElement.offsetHeight,
    document.body ? document.body.clientHeight : 0,
    document.documentElement.clientHeight)";

const VIEWPORT_HEIGHT_JS: &str = "() => window.innerHeight";

const STITCHED_NAME: &str = "shot_stitched.png";

/// Scroll offsets for the slices covering `total` pixels.
///
/// Starts at 0 and advances by `viewport - overlap`. Stops once the offset
/// reaches `total`, when the step would not advance, or after `max_slices`.
pub fn slice_offsets(total: u32, viewport: u32, overlap: u32, max_slices: usize) -> Vec<u32> {
    let mut offsets = Vec::new();
    let mut y = 0u32;
    while y < total && offsets.len() < max_slices {
        offsets.push(y);
        let next = y.saturating_add(viewport).saturating_sub(overlap);
        if next <= y {
            break;
        }
        y = next;
    }
    offsets
}

pub fn slice_file_name(index: usize) -> String {
    format!("shot_{index:04}.png")
}

/// Takes viewport screenshots down the whole page.
///
/// A slice that fails is skipped. Returns the written files in order.
pub async fn capture_by_scrolling(rendered: &RenderedPage, dir: &Path) -> Result<Vec<PathBuf>> {
    let page = rendered.page();
    let config = rendered.config();

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let total: f64 = page
        .evaluate_function(TOTAL_HEIGHT_JS)
        .await?
        .into_value()
        .context("Page height is not a number")?;
    let viewport = match page.evaluate_function(VIEWPORT_HEIGHT_JS).await {
        Ok(result) => result.into_value::<f64>().unwrap_or(0.0) as u32,
        Err(_) => 0,
    };
    let viewport = if viewport == 0 {
        config.viewport_height
    } else {
        viewport
    };

    let offsets = slice_offsets(
        total.max(0.0).ceil() as u32,
        viewport,
        config.fallback_overlap_px,
        config.fallback_max_slices,
    );
    debug!(
        "Fallback: page height {}, viewport {}, {} slices",
        total,
        viewport,
        offsets.len()
    );

    let mut shots = Vec::new();
    let mut positions = Vec::new();
    for (index, y) in offsets.iter().enumerate() {
        let path = dir.join(slice_file_name(index));
        match capture_slice(rendered, *y, &path).await {
            Ok(scrolled_to) => {
                shots.push(path);
                positions.push(scrolled_to);
            }
            Err(e) => warn!("Skipping screenshot {}: {:#}", index, e),
        }
    }

    info!("{} screenshots saved (fallback)", shots.len());

    if config.stitch_fallback && shots.len() > 1 {
        let slices = shots.clone();
        let output = dir.join(STITCHED_NAME);
        let stitched = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let images = slices
                .iter()
                .map(|p| -> Result<RgbaImage> { Ok(image::open(p)?.to_rgba8()) })
                .collect::<Result<Vec<_>>>()?;
            stitch_slices(&images, &positions)?
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            Ok(output)
        })
        .await?;

        match stitched {
            Ok(path) => {
                for slice in &shots {
                    if let Err(e) = std::fs::remove_file(slice) {
                        debug!("Could not remove {}: {}", slice.display(), e);
                    }
                }
                return Ok(vec![path]);
            }
            Err(e) => warn!("Stitching failed, keeping separate slices: {:#}", e),
        }
    }

    Ok(shots)
}

/// Scrolls to `y`, waits for the page to settle and writes a PNG of the
/// viewport. Returns the scroll offset the browser actually applied.
async fn capture_slice(rendered: &RenderedPage, y: u32, path: &Path) -> Result<u32> {
    let page = rendered.page();
    let scrolled: f64 = page
        .evaluate_function(format!("() => {{ window.scrollTo(0, {y}); return window.scrollY; }}"))
        .await?
        .into_value()
        .unwrap_or(f64::from(y));
    sleep(rendered.config().fallback_settle()).await;

    let png = page
        .screenshot(
            ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(false)
                .build(),
        )
        .await?;
    tokio::fs::write(path, png)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(scrolled.max(0.0).round() as u32)
}

/// Composes slices into one tall image, each placed at its scroll position.
/// Overlapping rows are taken from the later slice.
pub fn stitch_slices(slices: &[RgbaImage], positions: &[u32]) -> Result<RgbaImage> {
    anyhow::ensure!(!slices.is_empty(), "no slices to stitch");
    anyhow::ensure!(slices.len() == positions.len(), "slice and position counts differ");

    let width = slices.iter().map(|s| s.width()).max().unwrap_or(0);
    let height = slices
        .iter()
        .zip(positions)
        .map(|(s, y)| y + s.height())
        .max()
        .unwrap_or(0);

    let mut canvas = RgbaImage::new(width, height);
    for (slice, y) in slices.iter().zip(positions) {
        canvas
            .copy_from(slice, 0, *y)
            .context("Slice does not fit the canvas")?;
    }
    Ok(canvas)
}
