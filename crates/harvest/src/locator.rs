//! Image discovery across the main document and nested frames.
//!
//! Each frame is scanned in-page for rendered `<img>` elements, `<source
//! srcset>` entries and CSS background images. The raw scan is turned into
//! candidates here in Rust: responsive sources are resolved to their largest
//! entry, tiny boxes are dropped, URLs are resolved and stripped of
//! fragments. All frames are then merged into one reading order.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::renderer::RenderedPage;

/// Density descriptors (`2x`) are compared against width descriptors
/// (`800w`) after this multiplier.
const DENSITY_TO_WIDTH: f64 = 1000.0;

static CSS_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"url\((['"]?)(.*?)(['"]?)\)"#).unwrap());

const SCAN_FRAME_JS: &str = r#"() => {
    const refs = [];
    const box = (el) => {
        const r = el && el.getBoundingClientRect ? el.getBoundingClientRect() : null;
        return r ? { top: r.top, width: r.width, height: r.height } : { top: 0, width: 0, height: 0 };
    };
    document.querySelectorAll('img').forEach((img) => {
        refs.push(Object.assign({ kind: 'img', src: img.currentSrc || img.src || '', srcset: img.getAttribute('srcset') }, box(img)));
    });
    document.querySelectorAll('source[srcset]').forEach((source) => {
        refs.push(Object.assign({ kind: 'source', src: '', srcset: source.getAttribute('srcset') }, box(source.parentElement)));
    });
    document.querySelectorAll('*').forEach((el) => {
        const bg = getComputedStyle(el).backgroundImage || '';
        if (bg && bg !== 'none') {
            refs.push(Object.assign({ kind: 'background', src: bg, srcset: null }, box(el)));
        }
    });
    return { baseUrl: document.baseURI || location.href, scrollY: window.scrollY || 0, refs };
}"#;

/// A located, not yet downloaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    /// Absolute resource URL without fragment
    pub source_url: Url,
    /// Top offset in document pixels at discovery time
    pub vertical_position: i64,
    /// Reading-order position, dense from 0
    pub sequence_index: usize,
}

/// Where an image reference came from in the DOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Img,
    Source,
    Background,
}

/// One element as reported by the in-page scan.
#[derive(Debug, Clone, Deserialize)]
pub struct RawImageRef {
    pub kind: RefKind,
    /// Displayed source for `img`, computed `background-image` for backgrounds
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub srcset: Option<String>,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Scan result of a single frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameScan {
    pub base_url: String,
    pub scroll_y: f64,
    pub refs: Vec<RawImageRef>,
}

/// An image URL with its document position, before ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedUrl {
    pub url: Url,
    pub vertical_position: i64,
}

/// Picks the entry with the largest descriptor from a `srcset` list.
///
/// Width descriptors compare directly, density descriptors after
/// multiplying by [`DENSITY_TO_WIDTH`], entries without one count as zero.
/// On ties the first listed entry wins.
pub fn pick_largest_from_srcset(srcset: &str) -> Option<&str> {
    let mut best: Option<(&str, f64)> = None;
    for entry in srcset.split(',') {
        let mut parts = entry.split_whitespace();
        let Some(url) = parts.next() else {
            continue;
        };
        let weight = parts.next().map(descriptor_weight).unwrap_or(0.0);
        if best.is_none_or(|(_, w)| weight > w) {
            best = Some((url, weight));
        }
    }
    best.map(|(url, _)| url)
}

fn descriptor_weight(descriptor: &str) -> f64 {
    if let Some(width) = descriptor.strip_suffix('w') {
        width.parse().unwrap_or(0.0)
    } else if let Some(density) = descriptor.strip_suffix('x') {
        density.parse::<f64>().map(|d| d * DENSITY_TO_WIDTH).unwrap_or(0.0)
    } else {
        0.0
    }
}

/// First `url(...)` reference of a CSS `background-image` value.
pub fn extract_css_url(value: &str) -> Option<&str> {
    CSS_URL
        .captures(value)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
}

/// Resolves a reference against the frame base and drops the fragment.
/// Only http(s) resources are kept. A blank reference resolves to nothing,
/// not to the frame's own document.
fn resolve(base: &Url, reference: &str) -> Option<Url> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    let mut url = base.join(reference).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

/// Turns one frame's raw scan into positioned URLs.
pub fn candidates_from_scan(scan: &FrameScan, min_side: f64) -> Vec<PositionedUrl> {
    let Ok(base) = Url::parse(&scan.base_url) else {
        warn!("Frame has an unusable base URL: {}", scan.base_url);
        return Vec::new();
    };

    scan.refs
        .iter()
        .filter(|r| r.width > min_side && r.height > min_side)
        .filter_map(|r| {
            let responsive = r
                .srcset
                .as_deref()
                .and_then(pick_largest_from_srcset)
                .and_then(|s| resolve(&base, s));
            let url = match r.kind {
                RefKind::Img => responsive.or_else(|| resolve(&base, &r.src)),
                RefKind::Source => responsive,
                RefKind::Background => extract_css_url(&r.src).and_then(|s| resolve(&base, s)),
            }?;
            Some(PositionedUrl {
                url,
                vertical_position: (r.top + scan.scroll_y).round() as i64,
            })
        })
        .collect()
}

/// Orders by vertical position (stable), keeps the first occurrence of each
/// URL and assigns dense sequence indices.
pub fn merge_candidates(mut found: Vec<PositionedUrl>) -> Vec<ImageCandidate> {
    found.sort_by_key(|p| p.vertical_position);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|p| seen.insert(p.url.clone()))
        .enumerate()
        .map(|(sequence_index, p)| ImageCandidate {
            source_url: p.url,
            vertical_position: p.vertical_position,
            sequence_index,
        })
        .collect()
}

/// Lists the page's images in reading order.
///
/// A frame whose scan fails is skipped.
pub async fn locate(page: &RenderedPage) -> Result<Vec<ImageCandidate>> {
    let min_side = page.config().min_image_side;
    let mut found = Vec::new();

    for (index, frame) in page.frames().await?.iter().enumerate() {
        let scan = match page.evaluate_in(frame.as_ref(), SCAN_FRAME_JS).await {
            Ok(result) => result
                .into_value::<FrameScan>()
                .context("Unexpected frame scan result"),
            Err(e) => Err(e),
        };
        match scan {
            Ok(scan) => {
                let positioned = candidates_from_scan(&scan, min_side);
                debug!(
                    "Frame {}: {} elements scanned, {} usable",
                    index,
                    scan.refs.len(),
                    positioned.len()
                );
                found.extend(positioned);
            }
            Err(e) => debug!("Skipping frame {} during image scan: {}", index, e),
        }
    }

    Ok(merge_candidates(found))
}
