//! Network-capture acquisition of located images.
//!
//! Bytes are taken from the browser's own image responses rather than
//! re-downloaded, so cookies, referrer and anti-hotlinking checks behave as
//! they do for a reader. The browser cache is bypassed while capturing so
//! every requested image produces a response with a body.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    GetResponseBodyParams, RequestId, ResourceType, SetCacheDisabledParams,
};
use futures::StreamExt;
use futures::future::join_all;
use image::ImageFormat;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::locator::ImageCandidate;
use crate::renderer::RenderedPage;

/// Extensions kept as-is in asset file names; anything else becomes `jpg`.
const KNOWN_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "avif"];

const TRIGGER_LOAD_JS: &str = r#"async (src) => {
    try {
        const el = new Image();
        el.decoding = 'sync';
        el.referrerPolicy = 'no-referrer-when-downgrade';
        el.src = new URL(src, location.href).href;
        await el.decode().catch(() => {});
    } catch (e) {}
}"#;

/// An image written to disk by the acquirer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedAsset {
    pub file_path: PathBuf,
    pub origin: ImageCandidate,
}

/// Which URLs are wanted and which have already been claimed by a response.
#[derive(Debug, Default)]
pub struct CapturePlan {
    wanted: HashMap<Url, ImageCandidate>,
    claimed: HashSet<Url>,
}

impl CapturePlan {
    pub fn new(candidates: &[ImageCandidate]) -> Self {
        Self {
            wanted: candidates
                .iter()
                .map(|c| (c.source_url.clone(), c.clone()))
                .collect(),
            claimed: HashSet::new(),
        }
    }

    /// Returns the candidate for a response URL the first time it is seen.
    pub fn claim(&mut self, response_url: &str) -> Option<ImageCandidate> {
        let mut url = Url::parse(response_url).ok()?;
        url.set_fragment(None);
        let candidate = self.wanted.get(&url)?;
        self.claimed.insert(url).then(|| candidate.clone())
    }
}

/// `NNNN.ext` named after the candidate's sequence index.
pub fn asset_file_name(candidate: &ImageCandidate) -> String {
    let ext = candidate
        .source_url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| KNOWN_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| "jpg".to_string());
    format!("{:04}.{}", candidate.sequence_index, ext)
}

/// Writes captured bytes, transcoding WebP/AVIF to lossless PNG.
pub fn store_capture(bytes: &[u8], candidate: &ImageCandidate, dir: &Path) -> Result<SavedAsset> {
    let mut file_path = dir.join(asset_file_name(candidate));

    let needs_transcode = file_path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "webp" || e == "avif");

    if needs_transcode {
        let format = ImageFormat::from_path(&file_path).unwrap_or(ImageFormat::WebP);
        let decoded = image::load_from_memory_with_format(bytes, format)
            .with_context(|| format!("Failed to decode {}", candidate.source_url))?;
        file_path.set_extension("png");
        decoded
            .save_with_format(&file_path, ImageFormat::Png)
            .with_context(|| format!("Failed to write {}", file_path.display()))?;
    } else {
        image::guess_format(bytes)
            .with_context(|| format!("Response for {} is not an image", candidate.source_url))?;
        std::fs::write(&file_path, bytes)
            .with_context(|| format!("Failed to write {}", file_path.display()))?;
    }

    Ok(SavedAsset {
        file_path,
        origin: candidate.clone(),
    })
}

/// Captures the candidates' bytes from network responses.
///
/// Per-image failures are logged and left out. Returned assets are sorted by
/// file path, which is reading order.
pub async fn acquire(
    rendered: &RenderedPage,
    candidates: &[ImageCandidate],
    dir: &Path,
) -> Result<Vec<SavedAsset>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let saved = with_cache_bypassed(rendered.page(), capture(rendered, candidates, dir)).await?;
    info!("Captured {}/{} images", saved.len(), candidates.len());
    Ok(saved)
}

/// Switches the browser's HTTP cache.
pub trait CacheControl {
    fn set_cache_disabled(&self, disabled: bool) -> impl Future<Output = Result<()>>;
}

impl CacheControl for Page {
    async fn set_cache_disabled(&self, disabled: bool) -> Result<()> {
        self.execute(SetCacheDisabledParams::new(disabled)).await?;
        Ok(())
    }
}

/// Runs `body` with the cache disabled. The cache is switched back on
/// whether `body` succeeds or fails.
pub async fn with_cache_bypassed<C: CacheControl, T>(
    cache: &C,
    body: impl Future<Output = Result<T>>,
) -> Result<T> {
    if let Err(e) = cache.set_cache_disabled(true).await {
        warn!("Could not bypass browser cache: {}", e);
    }
    let result = body.await;
    if let Err(e) = cache.set_cache_disabled(false).await {
        debug!("Could not re-enable browser cache: {}", e);
    }
    result
}

/// Triggers every candidate's load and collects what the listener stored.
async fn capture(
    rendered: &RenderedPage,
    candidates: &[ImageCandidate],
    dir: &Path,
) -> Result<Vec<SavedAsset>> {
    let page = rendered.page();
    let config = rendered.config();

    let (stop_tx, stop_rx) = oneshot::channel();
    let listener = spawn_capture_listener(page, CapturePlan::new(candidates), dir, stop_rx).await?;

    for candidate in candidates {
        let src = candidate.source_url.as_str();
        if let Err(e) = page
            .evaluate_function(format!("() => ({TRIGGER_LOAD_JS})({})", serde_json::to_string(src)?))
            .await
        {
            debug!("Load trigger failed for {}: {}", src, e);
        }
    }

    if !wait_for_network_idle(page, config.network_idle(), config.network_idle_timeout()).await? {
        debug!("Network did not go idle before the timeout");
    }

    let _ = stop_tx.send(());
    let tasks = listener.await.context("Capture listener panicked")?;
    let mut saved: Vec<SavedAsset> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|task| task.ok().flatten())
        .collect();
    saved.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    Ok(saved)
}

type CaptureTasks = Vec<JoinHandle<Option<SavedAsset>>>;

/// Subscribes before any load is triggered, then matches responses to
/// candidates until told to stop.
async fn spawn_capture_listener(
    page: &Page,
    mut plan: CapturePlan,
    dir: &Path,
    mut stop: oneshot::Receiver<()>,
) -> Result<JoinHandle<CaptureTasks>> {
    let mut responses = page.event_listener::<EventResponseReceived>().await?;
    let mut finished = page.event_listener::<EventLoadingFinished>().await?;
    let mut failed = page.event_listener::<EventLoadingFailed>().await?;
    let page = page.clone();
    let dir = dir.to_path_buf();

    Ok(tokio::spawn(async move {
        let mut awaiting: HashMap<String, (RequestId, ImageCandidate)> = HashMap::new();
        let mut tasks = Vec::new();

        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some(event) = responses.next() => {
                    let is_image = event.r#type == ResourceType::Image
                        || event.response.mime_type.starts_with("image/");
                    if !is_image {
                        continue;
                    }
                    if let Some(candidate) = plan.claim(&event.response.url) {
                        awaiting.insert(
                            event.request_id.as_ref().to_string(),
                            (event.request_id.clone(), candidate),
                        );
                    }
                }
                Some(event) = finished.next() => {
                    if let Some((request_id, candidate)) = awaiting.remove(event.request_id.as_ref()) {
                        tasks.push(tokio::spawn(fetch_and_store(
                            page.clone(),
                            request_id,
                            candidate,
                            dir.clone(),
                        )));
                    }
                }
                Some(event) = failed.next() => {
                    if let Some((_, candidate)) = awaiting.remove(event.request_id.as_ref()) {
                        warn!("Image request failed for {}: {}", candidate.source_url, event.error_text);
                    }
                }
                else => break,
            }
        }

        for (_, candidate) in awaiting.values() {
            debug!("Response body never completed for {}", candidate.source_url);
        }
        tasks
    }))
}

async fn response_bytes(page: &Page, request_id: RequestId) -> Result<Vec<u8>> {
    let body = page
        .execute(GetResponseBodyParams::new(request_id))
        .await
        .context("Response body unavailable")?;
    if body.result.base64_encoded {
        Ok(STANDARD
            .decode(&body.result.body)
            .context("Response body is not valid base64")?)
    } else {
        Ok(body.result.body.clone().into_bytes())
    }
}

async fn fetch_and_store(
    page: Page,
    request_id: RequestId,
    candidate: ImageCandidate,
    dir: PathBuf,
) -> Option<SavedAsset> {
    let stored = match response_bytes(&page, request_id).await {
        Ok(bytes) => {
            let origin = candidate.clone();
            tokio::task::spawn_blocking(move || store_capture(&bytes, &origin, &dir))
                .await
                .unwrap_or_else(|e| Err(e.into()))
        }
        Err(e) => Err(e),
    };

    match stored {
        Ok(asset) => {
            info!("Saved image {}", asset.file_path.display());
            Some(asset)
        }
        Err(e) => {
            warn!("Skipping {}: {:#}", candidate.source_url, e);
            None
        }
    }
}

/// Waits until no request starts or finishes for `idle`, bounded by `limit`.
/// Returns false when the bound was hit.
pub async fn wait_for_network_idle(page: &Page, idle: Duration, limit: Duration) -> Result<bool> {
    let mut started = page.event_listener::<EventRequestWillBeSent>().await?;
    let mut finished = page.event_listener::<EventLoadingFinished>().await?;

    let quiet = async {
        loop {
            tokio::select! {
                Some(_) = started.next() => continue,
                Some(_) = finished.next() => continue,
                _ = sleep(idle) => break,
            }
        }
    };

    Ok(timeout(limit, quiet).await.is_ok())
}
