//! Document rendering: source file bytes → ordered page images.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking thread pool
//! so Tokio worker threads never stall during CPU-heavy rasterisation.
//!
//! ## Why upscale?
//!
//! Pages are rendered at a linear upscaling factor (2× by default, roughly
//! 300 DPI for a letter-size page). Vision models misread small print at
//! native resolution; doubling the pixel density recovers most of it without
//! blowing past API upload limits.
//!
//! Single-frame images (JPEG/PNG) skip all of this: they are already the
//! raster the provider will see and are passed through byte-for-byte, with no
//! re-encoding that could soften text edges.

use crate::error::ExtractError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Declared format of a submitted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Multi-page document; every page is rasterised independently.
    Pdf,
    /// Single-frame image, forwarded unchanged.
    Jpeg,
    /// Single-frame image, forwarded unchanged.
    Png,
}

impl SourceKind {
    /// Infer the kind from a filename extension (case-insensitive).
    ///
    /// Mirrors the submission allow-list: pdf, jpg, jpeg, png.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    /// MIME type of the bytes as they are handed to the extraction client.
    /// PDF pages are rasterised to PNG, so the kind itself maps to image MIME.
    pub fn page_mime(self) -> &'static str {
        match self {
            Self::Pdf | Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn is_multi_page(self) -> bool {
        matches!(self, Self::Pdf)
    }
}

/// One rendered page, ready for the multimodal request body.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Encoded raster bytes (PNG for rendered PDF pages, source bytes for
    /// single-frame inputs).
    pub bytes: Vec<u8>,
    /// MIME type tag sent alongside the bytes.
    pub mime: &'static str,
}

/// Render a document into an ordered sequence of page images.
///
/// Rendering is deterministic, so there is no retry here: a malformed input
/// fails identically every time.
///
/// # Errors
/// * [`ExtractError::CorruptDocument`]: the bytes cannot be parsed as `kind`
/// * [`ExtractError::EmptyDocument`]: parsing succeeded but zero pages came out
/// * [`ExtractError::PageRenderFailed`] / [`ExtractError::PageEncodeFailed`]:
///   pdfium or PNG encoding failed on a specific page
pub async fn render(
    bytes: Vec<u8>,
    kind: SourceKind,
    scale: f32,
) -> Result<Vec<PageImage>, ExtractError> {
    // Single-frame inputs never touch pdfium; return them unchanged.
    if !kind.is_multi_page() {
        if bytes.is_empty() {
            return Err(ExtractError::EmptyDocument);
        }
        return Ok(vec![PageImage {
            bytes,
            mime: kind.page_mime(),
        }]);
    }

    tokio::task::spawn_blocking(move || render_pdf_blocking(&bytes, scale))
        .await
        .map_err(|e| ExtractError::Internal(format!("render task panicked: {e}")))?
}

/// Bind to a pdfium library: explicit `PDFIUM_LIB_PATH` first, then a copy
/// next to the executable, then the system library.
fn bind_pdfium() -> Result<Pdfium, ExtractError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        // Accept either the library file itself or the directory holding it.
        Ok(path) if !path.is_empty() => {
            if std::path::Path::new(&path).is_dir() {
                let dir = format!("{}/", path.trim_end_matches('/'));
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
            } else {
                Pdfium::bind_to_library(&path)
            }
        }
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    };
    Ok(Pdfium::new(
        bindings.map_err(|e| ExtractError::PdfiumBinding(format!("{e:?}")))?,
    ))
}

/// Blocking implementation of PDF rasterisation.
fn render_pdf_blocking(bytes: &[u8], scale: f32) -> Result<Vec<PageImage>, ExtractError> {
    let pdfium = bind_pdfium()?;

    let document =
        pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| ExtractError::CorruptDocument {
                kind: "PDF",
                detail: format!("{e:?}"),
            })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    debug!("PDF loaded: {} pages", total_pages);
    if total_pages == 0 {
        return Err(ExtractError::EmptyDocument);
    }

    let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);

    let mut images = Vec::with_capacity(total_pages);
    for (idx, page) in pages.iter().enumerate() {
        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| ExtractError::PageRenderFailed {
                    page: idx + 1,
                    detail: format!("{e:?}"),
                })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );

        images.push(PageImage {
            bytes: encode_png(&image, idx + 1)?,
            mime: "image/png",
        });
    }

    if images.is_empty() {
        return Err(ExtractError::EmptyDocument);
    }
    Ok(images)
}

/// PNG-encode a rasterised page.
///
/// PNG over JPEG because it is lossless: compression artefacts on rendered
/// text measurably degrade vision-model recognition.
fn encode_png(image: &DynamicImage, page: usize) -> Result<Vec<u8>, ExtractError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| ExtractError::PageEncodeFailed {
            page,
            detail: e.to_string(),
        })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn source_kind_from_filename() {
        assert_eq!(SourceKind::from_filename("scan.pdf"), Some(SourceKind::Pdf));
        assert_eq!(SourceKind::from_filename("SCAN.PDF"), Some(SourceKind::Pdf));
        assert_eq!(
            SourceKind::from_filename("photo.jpg"),
            Some(SourceKind::Jpeg)
        );
        assert_eq!(
            SourceKind::from_filename("photo.JPEG"),
            Some(SourceKind::Jpeg)
        );
        assert_eq!(SourceKind::from_filename("shot.png"), Some(SourceKind::Png));
        assert_eq!(SourceKind::from_filename("notes.txt"), None);
        assert_eq!(SourceKind::from_filename("no_extension"), None);
    }

    #[tokio::test]
    async fn single_frame_passthrough_is_byte_identical() {
        let bytes = vec![0x89, 0x50, 0x4E, 0x47, 1, 2, 3];
        let pages = render(bytes.clone(), SourceKind::Png, 2.0)
            .await
            .expect("passthrough succeeds");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].bytes, bytes);
        assert_eq!(pages[0].mime, "image/png");
    }

    #[tokio::test]
    async fn jpeg_passthrough_keeps_jpeg_mime() {
        let pages = render(vec![0xFF, 0xD8, 0xFF], SourceKind::Jpeg, 2.0)
            .await
            .expect("passthrough succeeds");
        assert_eq!(pages[0].mime, "image/jpeg");
    }

    #[tokio::test]
    async fn empty_single_frame_is_empty_document() {
        let err = render(Vec::new(), SourceKind::Jpeg, 2.0)
            .await
            .expect_err("empty input must fail");
        assert!(matches!(err, ExtractError::EmptyDocument));
    }

    #[test]
    fn encode_png_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255])));
        let bytes = encode_png(&img, 1).expect("encode succeeds");
        // PNG magic
        assert_eq!(&bytes[..4], &[0x89, b'P', b'N', b'G']);
    }
}
