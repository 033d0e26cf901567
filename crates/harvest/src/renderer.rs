//! Headless browser session and page rendering.
//!
//! The renderer owns one Chromium instance per job. [`BrowserSession::render`]
//! navigates to the episode, waits for the DOM, then scrolls every frame one
//! viewport at a time until the document height stops growing, so that
//! lazy-loaded panels are attached before the locator runs.

use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{EventDomContentEventFired, FrameId, NavigateParams};
use chromiumoxide::cdp::js_protocol::runtime::CallFunctionOnParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::js::EvaluationResult;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{HarvestConfig, HarvestError};

const SCROLL_ONE_VIEWPORT_JS: &str = "() => { window.scrollBy(0, window.innerHeight); }";

const DOCUMENT_HEIGHT_JS: &str = "() => { \
    const el = document.scrollingElement || document.documentElement; \
    return el ? el.scrollHeight : 0; }";

const SCROLL_TO_TOP_JS: &str = "() => { window.scrollTo(0, 0); }";

/// Tracks document height readings and decides when lazy loading has settled.
#[derive(Debug, Clone)]
pub struct HeightTracker {
    last: f64,
    stable: u32,
    threshold: u32,
}

impl HeightTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            last: 0.0,
            stable: 0,
            threshold,
        }
    }

    /// Records a reading; returns true once the height has been unchanged
    /// for `threshold` consecutive readings.
    pub fn observe(&mut self, height: f64) -> bool {
        if height == self.last {
            self.stable += 1;
            self.stable >= self.threshold
        } else {
            self.stable = 0;
            self.last = height;
            false
        }
    }
}

/// A running headless browser.
pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserSession {
    /// Starts Chromium with the configured viewport and executable.
    pub async fn launch(config: &HarvestConfig) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .window_size(config.viewport_width, config.viewport_height)
            .viewport(Viewport {
                width: config.viewport_width,
                height: config.viewport_height,
                ..Viewport::default()
            })
            .no_sandbox()
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--no-zygote")
            .arg("--hide-scrollbars");

        if let Some(path) = config.resolved_chrome_path() {
            debug!("Using browser executable {}", path.display());
            builder = builder.chrome_executable(path);
        }

        let browser_config = builder.build().map_err(HarvestError::BrowserLaunch)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| HarvestError::BrowserLaunch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        info!("Headless browser started");
        Ok(Self { browser, handler })
    }

    /// Loads `url` and scrolls it until lazy content stops appearing.
    ///
    /// Navigation failures are fatal; frames that cannot be scrolled are
    /// skipped.
    pub async fn render(
        &self,
        url: &str,
        wait_millis: u64,
        config: &HarvestConfig,
    ) -> Result<RenderedPage> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("Failed to open browser tab")?;
        page.set_user_agent(user_agent_override(config))
            .await
            .context("Failed to set user agent")?;

        navigate(&page, url).await?;
        debug!("DOM ready for {}", url);

        if wait_millis > 0 {
            debug!("Waiting {} ms for client-side rendering", wait_millis);
            sleep(Duration::from_millis(wait_millis)).await;
        }

        let rendered = RenderedPage {
            page,
            config: config.clone(),
        };
        rendered.settle_lazy_content().await?;
        Ok(rendered)
    }

    /// Closes the browser and stops its event handler.
    pub async fn close(mut self) -> Result<()> {
        let closed = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler.abort();
        closed.context("Failed to close browser")?;
        Ok(())
    }
}

/// Navigates and waits for `DOMContentLoaded`, without waiting for images.
async fn navigate(page: &Page, url: &str) -> Result<()> {
    let navigation_error = |reason: String| HarvestError::Navigation {
        url: url.to_string(),
        reason,
    };

    let mut dom_ready = page
        .event_listener::<EventDomContentEventFired>()
        .await
        .context("Failed to subscribe to page events")?;

    let response = page
        .execute(NavigateParams::new(url))
        .await
        .map_err(|e| navigation_error(e.to_string()))?;
    if let Some(reason) = response.result.error_text.clone() {
        return Err(navigation_error(reason).into());
    }

    dom_ready.next().await;
    Ok(())
}

/// A loaded page, ready for image discovery.
pub struct RenderedPage {
    pub(crate) page: Page,
    pub(crate) config: HarvestConfig,
}

impl RenderedPage {
    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Frames of the page with the main frame first.
    pub(crate) async fn frames(&self) -> Result<Vec<Option<FrameId>>> {
        let main = self.page.mainframe().await?;
        let mut frames = vec![None];
        for frame in self.page.frames().await? {
            if Some(&frame) != main.as_ref() {
                frames.push(Some(frame));
            }
        }
        Ok(frames)
    }

    /// Calls a JS function in the given frame (`None` for the main frame).
    pub(crate) async fn evaluate_in(
        &self,
        frame: Option<&FrameId>,
        function: impl Into<String>,
    ) -> Result<EvaluationResult> {
        let mut params = CallFunctionOnParams::new(function.into());
        if let Some(frame) = frame {
            let context = self
                .page
                .frame_execution_context(frame.clone())
                .await?
                .context("Frame has no execution context")?;
            params.execution_context_id = Some(context);
        }
        Ok(self.page.evaluate_function(params).await?)
    }

    async fn settle_lazy_content(&self) -> Result<()> {
        let frames = self.frames().await?;
        for (index, frame) in frames.iter().enumerate() {
            match self.scroll_until_stable(frame.as_ref()).await {
                Ok(rounds) => debug!("Frame {} settled after {} scroll steps", index, rounds),
                Err(e) if frame.is_none() => return Err(e.context("Failed to scroll page")),
                Err(e) => warn!("Skipping frame {}: {}", index, e),
            }
        }
        Ok(())
    }

    /// Scrolls one viewport at a time until the height is stable or the cap
    /// is hit, then returns to the top. Returns the number of steps taken.
    async fn scroll_until_stable(&self, frame: Option<&FrameId>) -> Result<u32> {
        let mut tracker = HeightTracker::new(self.config.scroll_stable_rounds);
        let mut rounds = 0;

        while rounds < self.config.scroll_max_rounds {
            rounds += 1;
            self.evaluate_in(frame, SCROLL_ONE_VIEWPORT_JS).await?;
            sleep(self.config.scroll_delay()).await;

            let height: f64 = self
                .evaluate_in(frame, DOCUMENT_HEIGHT_JS)
                .await?
                .into_value()
                .context("Document height is not a number")?;
            if tracker.observe(height) {
                break;
            }
        }

        self.evaluate_in(frame, SCROLL_TO_TOP_JS).await?;
        Ok(rounds)
    }
}

/// Network-level override so image requests carry the same user agent.
fn user_agent_override(config: &HarvestConfig) -> SetUserAgentOverrideParams {
    SetUserAgentOverrideParams::new(config.user_agent.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_override_uses_configured_agent() {
        let config = HarvestConfig {
            user_agent: "toonpdf-test/1.0".to_string(),
            ..HarvestConfig::default()
        };
        let params = user_agent_override(&config);
        assert_eq!(params.user_agent, "toonpdf-test/1.0");
        assert!(params.accept_language.is_none());
    }

    #[test]
    fn test_tracker_needs_consecutive_stable_readings() {
        let mut tracker = HeightTracker::new(3);
        assert!(!tracker.observe(1000.0));
        assert!(!tracker.observe(1000.0));
        assert!(!tracker.observe(1000.0));
        assert!(tracker.observe(1000.0));
    }

    #[test]
    fn test_tracker_resets_on_growth() {
        let mut tracker = HeightTracker::new(2);
        assert!(!tracker.observe(500.0));
        assert!(!tracker.observe(500.0));
        assert!(!tracker.observe(900.0));
        assert!(!tracker.observe(900.0));
        assert!(tracker.observe(900.0));
    }

    #[test]
    fn test_tracker_on_empty_document() {
        let mut tracker = HeightTracker::new(1);
        assert!(tracker.observe(0.0));
    }
}
