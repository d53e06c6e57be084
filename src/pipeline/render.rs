//! PDF rasterisation behind the [`PageRenderer`] seam.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which is CPU-bound
//! and not async-aware. `tokio::task::spawn_blocking` moves every render onto
//! the blocking pool so the async workers keep driving model calls while a
//! page is being rasterised.
//!
//! ## Why render twice?
//!
//! The analysis phase and the asset-preparation phase each render the page
//! they need instead of keeping every page bitmap alive across the whole
//! document. A 300-DPI A4 page is ~35 MB uncompressed; re-rendering the few
//! pages that carry diagrams is far cheaper than holding them all.

use crate::error::ForgeError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolution settings for one render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub dpi: u32,
    /// Cap on either dimension in pixels.
    pub max_pixels: u32,
}

/// Renders document pages to images. Page indices are 0-based.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn page_count(&self, path: &Path) -> Result<usize, ForgeError>;

    async fn render_page(
        &self,
        path: &Path,
        page_idx: usize,
        opts: RenderOptions,
    ) -> Result<DynamicImage, ForgeError>;
}

/// pdfium-backed renderer.
///
/// Binds to the library at `PDFIUM_LIB_PATH` when set, else to the system
/// library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRenderer {
    lib_path: Option<PathBuf>,
}

impl PdfiumRenderer {
    pub fn new() -> Self {
        Self {
            lib_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            lib_path: Some(path.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, ForgeError> {
        let bindings = match &self.lib_path {
            Some(p) => Pdfium::bind_to_library(p),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| ForgeError::PdfiumBindingFailed(e.to_string()))?;
        Ok(Pdfium::new(bindings))
    }

    fn page_count_blocking(&self, path: &Path) -> Result<usize, ForgeError> {
        let pdfium = self.bind()?;
        let document = load(&pdfium, path)?;
        Ok(document.pages().len() as usize)
    }

    fn render_blocking(
        &self,
        path: &Path,
        page_idx: usize,
        opts: RenderOptions,
    ) -> Result<DynamicImage, ForgeError> {
        let pdfium = self.bind()?;
        let document = load(&pdfium, path)?;
        let pages = document.pages();

        let index = u16::try_from(page_idx).map_err(|_| ForgeError::RasterisationFailed {
            page: page_idx + 1,
            detail: "page index out of range".into(),
        })?;
        let page = pages
            .get(index)
            .map_err(|e| ForgeError::RasterisationFailed {
                page: page_idx + 1,
                detail: format!("{:?}", e),
            })?;

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(opts.dpi as f32 / 72.0)
            .set_maximum_width(opts.max_pixels as i32)
            .set_maximum_height(opts.max_pixels as i32);

        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| ForgeError::RasterisationFailed {
                    page: page_idx + 1,
                    detail: format!("{:?}", e),
                })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_idx + 1,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

fn load<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, ForgeError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| ForgeError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        })
}

#[async_trait]
impl PageRenderer for PdfiumRenderer {
    async fn page_count(&self, path: &Path) -> Result<usize, ForgeError> {
        let this = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || this.page_count_blocking(&path))
            .await
            .map_err(|e| ForgeError::Internal(format!("Render task panicked: {}", e)))?
    }

    async fn render_page(
        &self,
        path: &Path,
        page_idx: usize,
        opts: RenderOptions,
    ) -> Result<DynamicImage, ForgeError> {
        let this = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || this.render_blocking(&path, page_idx, opts))
            .await
            .map_err(|e| ForgeError::Internal(format!("Render task panicked: {}", e)))?
    }
}
