//! Orchestration of a single harvest: locate, acquire, fall back, assemble.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::acquirer::{self, SavedAsset};
use crate::assembler;
use crate::fallback;
use crate::locator::{self, ImageCandidate};
use crate::renderer::RenderedPage;
use crate::HarvestError;

/// What the pipeline needs from a rendered page.
pub trait PageSource {
    fn locate(&self) -> impl Future<Output = Result<Vec<ImageCandidate>>>;

    fn acquire(
        &self,
        candidates: &[ImageCandidate],
        dir: &Path,
    ) -> impl Future<Output = Result<Vec<SavedAsset>>>;

    fn capture_by_scrolling(&self, dir: &Path) -> impl Future<Output = Result<Vec<PathBuf>>>;
}

impl PageSource for RenderedPage {
    fn locate(&self) -> impl Future<Output = Result<Vec<ImageCandidate>>> {
        locator::locate(self)
    }

    fn acquire(
        &self,
        candidates: &[ImageCandidate],
        dir: &Path,
    ) -> impl Future<Output = Result<Vec<SavedAsset>>> {
        acquirer::acquire(self, candidates, dir)
    }

    fn capture_by_scrolling(&self, dir: &Path) -> impl Future<Output = Result<Vec<PathBuf>>> {
        fallback::capture_by_scrolling(self, dir)
    }
}

/// Summary of a successful harvest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestOutcome {
    pub pdf_path: PathBuf,
    pub pages: usize,
    pub candidates: usize,
    pub captured: usize,
    pub used_fallback: bool,
}

/// Runs the pipeline on an already rendered page.
///
/// Screenshots are taken only when no image could be captured. Zero located
/// images is not an error by itself.
pub async fn harvest(source: &impl PageSource, out_dir: &Path, pdf_path: &Path) -> Result<HarvestOutcome> {
    let candidates = source.locate().await.context("Image lookup failed")?;
    info!("{} images found", candidates.len());

    let assets = if candidates.is_empty() {
        Vec::new()
    } else {
        source.acquire(&candidates, out_dir).await?
    };
    let captured = assets.len();

    let (files, used_fallback) = if assets.is_empty() {
        warn!("No image captured, falling back to screenshots");
        (source.capture_by_scrolling(out_dir).await?, true)
    } else {
        (assets.into_iter().map(|a| a.file_path).collect::<Vec<_>>(), false)
    };

    if files.is_empty() {
        return Err(HarvestError::NoImages.into());
    }

    info!("Building PDF from {} images", files.len());
    let output = pdf_path.to_path_buf();
    let report = tokio::task::spawn_blocking(move || assembler::assemble(&files, &output)).await??;
    if !report.skipped.is_empty() {
        warn!("{} images left out of the PDF", report.skipped.len());
    }

    Ok(HarvestOutcome {
        pdf_path: pdf_path.to_path_buf(),
        pages: report.pages,
        candidates: candidates.len(),
        captured,
        used_fallback,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{ImageBuffer, Rgb};
    use url::Url;

    use super::*;

    /// Page double that writes real images on request.
    #[derive(Default)]
    struct FakePage {
        images: usize,
        capturable: bool,
        screenshots: usize,
        acquire_calls: AtomicUsize,
        fallback_calls: AtomicUsize,
    }

    fn write_png(path: &Path) {
        ImageBuffer::from_pixel(40, 60, Rgb([1u8, 2, 3])).save(path).unwrap();
    }

    impl PageSource for FakePage {
        async fn locate(&self) -> Result<Vec<ImageCandidate>> {
            Ok((0..self.images)
                .map(|i| ImageCandidate {
                    source_url: Url::parse(&format!("https://cdn.example.com/{i}.png")).unwrap(),
                    vertical_position: i as i64 * 100,
                    sequence_index: i,
                })
                .collect())
        }

        async fn acquire(&self, candidates: &[ImageCandidate], dir: &Path) -> Result<Vec<SavedAsset>> {
            self.acquire_calls.fetch_add(1, Ordering::SeqCst);
            if !self.capturable {
                return Ok(Vec::new());
            }
            Ok(candidates
                .iter()
                .map(|c| {
                    let file_path = dir.join(acquirer::asset_file_name(c));
                    write_png(&file_path);
                    SavedAsset {
                        file_path,
                        origin: c.clone(),
                    }
                })
                .collect())
        }

        async fn capture_by_scrolling(&self, dir: &Path) -> Result<Vec<PathBuf>> {
            self.fallback_calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..self.screenshots)
                .map(|i| {
                    let path = dir.join(fallback::slice_file_name(i));
                    write_png(&path);
                    path
                })
                .collect())
        }
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_captured_images_become_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("ep.pdf");
        let page = FakePage {
            images: 5,
            capturable: true,
            ..FakePage::default()
        };

        let outcome = harvest(&page, dir.path(), &pdf).await.unwrap();
        assert_eq!(outcome.pages, 5);
        assert_eq!(outcome.captured, 5);
        assert!(!outcome.used_fallback);
        assert_eq!(page.fallback_calls.load(Ordering::SeqCst), 0);
        assert_eq!(files_in(dir.path()), vec!["ep.pdf"]);
    }

    #[tokio::test]
    async fn test_no_candidates_uses_screenshots() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("ep.pdf");
        let page = FakePage {
            screenshots: 3,
            ..FakePage::default()
        };

        let outcome = harvest(&page, dir.path(), &pdf).await.unwrap();
        assert!(outcome.used_fallback);
        assert_eq!(outcome.pages, 3);
        assert_eq!(page.acquire_calls.load(Ordering::SeqCst), 0);
        assert_eq!(files_in(dir.path()), vec!["ep.pdf"]);
    }

    #[tokio::test]
    async fn test_failed_capture_uses_screenshots() {
        let dir = tempfile::tempdir().unwrap();
        let page = FakePage {
            images: 4,
            screenshots: 2,
            ..FakePage::default()
        };

        let outcome = harvest(&page, dir.path(), &dir.path().join("ep.pdf")).await.unwrap();
        assert_eq!(outcome.candidates, 4);
        assert_eq!(outcome.captured, 0);
        assert_eq!(outcome.pages, 2);
        assert_eq!(page.fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nothing_at_all_is_no_images() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("ep.pdf");
        let page = FakePage::default();

        let err = harvest(&page, dir.path(), &pdf).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<HarvestError>(), Some(HarvestError::NoImages)));
        assert!(!pdf.exists());
    }
}
