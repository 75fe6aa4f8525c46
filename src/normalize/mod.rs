//! Turn input documents into a sequence of canonical raster pages.
//!
//! Every page we hand to the rest of the pipeline is an 8-bit grayscale or RGB
//! PNG, stored in a run-scoped temporary directory, and no larger than
//! [`NormalizeOptions::max_page_side`] on either side.

use std::{io::Cursor, sync::Arc};

use image::{DynamicImage, GrayImage, ImageFormat, ImageReader, RgbImage, imageops::FilterType};
use uuid::Uuid;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    config::NormalizeOptions,
    document::Document,
    error::{OcrError, OcrResult},
    prelude::*,
};

mod pdf;
mod tiff;

/// Image types we decode directly with [`image`]. For GIFs, we only look at
/// the first frame.
const SUPPORTED_IMAGE_TYPES: &[&str] =
    &["image/png", "image/jpeg", "image/webp", "image/gif"];

/// TIFF MIME type, handled separately due to multipage complexity.
const TIFF_MIME_TYPE: &str = "image/tiff";

/// PDF MIME type.
const PDF_MIME_TYPE: &str = "application/pdf";

/// Color depth of a canonical page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorDepth {
    Gray8,
    Rgb8,
}

/// One raster page of a document.
#[derive(Clone, Debug)]
pub struct Page {
    /// 0-based position in the document.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub color: ColorDepth,
    /// Resolution, if we know it. Rasterized PDFs always have one, and TIFFs
    /// do when they carry resolution tags.
    pub dpi: Option<u32>,
    /// Later stages must not scale the page so that either side exceeds this.
    pub max_side: u32,
    /// The document this page came from.
    pub document_id: Uuid,
    /// Where the canonical PNG lives, inside the run's scratch directory.
    path: PathBuf,
}

impl Page {
    /// Decode this page's pixels.
    pub async fn load(&self) -> Result<LoadedPage> {
        let path = self.path.clone();
        let image = spawn_blocking_propagating_panics(move || {
            image::open(&path).with_context(|| format!("failed to load page {:?}", path))
        })
        .await??;
        Ok(LoadedPage {
            page: self.clone(),
            image,
        })
    }

    /// Where the canonical PNG for this page is stored.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
impl Page {
    /// Describe an in-memory image as a page, without writing it anywhere.
    pub(crate) fn for_tests(
        index: usize,
        image: &DynamicImage,
        dpi: Option<u32>,
        document_id: Uuid,
    ) -> Page {
        let color = if image.color().has_color() {
            ColorDepth::Rgb8
        } else {
            ColorDepth::Gray8
        };
        Page {
            index,
            width: image.width(),
            height: image.height(),
            color,
            dpi,
            max_side: NormalizeOptions::default().max_page_side,
            document_id,
            path: PathBuf::new(),
        }
    }
}

/// A [`Page`] together with its decoded pixels.
#[derive(Clone, Debug)]
pub struct LoadedPage {
    pub page: Page,
    pub image: DynamicImage,
}

/// A run-scoped temporary directory. It is deleted when dropped, and problems
/// deleting it are logged rather than panicking.
#[derive(Debug)]
pub struct ScratchDir {
    tmpdir: Option<tempfile::TempDir>,
}

impl ScratchDir {
    /// Create a new scratch directory, optionally inside `root`.
    pub fn new(root: Option<&Path>) -> Result<Self> {
        let tmpdir = match root {
            Some(root) => tempfile::TempDir::with_prefix_in("docscan-run-", root),
            None => tempfile::TempDir::with_prefix("docscan-run-"),
        }
        .context("failed to create scratch directory")?;
        Ok(Self {
            tmpdir: Some(tmpdir),
        })
    }

    /// The path of this directory.
    pub fn path(&self) -> &Path {
        // Only `None` during `drop`.
        self.tmpdir
            .as_ref()
            .map(|tmpdir| tmpdir.path())
            .unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            } else {
                trace!(directory = ?tmpdir_path.display(), "deleted scratch directory");
            }
        }
    }
}

/// The pages of a document, plus the scratch directory which holds them.
///
/// Dropping a `PageSet` deletes all the page images.
#[derive(Debug)]
pub struct PageSet {
    /// The detected MIME type of the source document.
    pub mime_type: String,
    /// Pages in document order.
    pub pages: Vec<Page>,
    /// Non-fatal problems reported while converting the document.
    pub warnings: Vec<String>,
    scratch: ScratchDir,
}

impl PageSet {
    /// The run's scratch directory. Other stages may create their own
    /// temporary files in here.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Convert a document to canonical raster pages.
///
/// Fails with [`OcrError::UnsupportedFormat`] for payloads we can't identify or
/// decode, and with [`OcrError::PageLimitExceeded`] if the document has too
/// many pages, or a page with too many pixels.
#[instrument(level = "debug", skip_all, fields(document_id = %document.id()))]
pub async fn normalize(
    document: &Document,
    opts: &NormalizeOptions,
    scratch_root: Option<&Path>,
) -> OcrResult<PageSet> {
    let bytes = document.bytes().await?;
    let mime_type = document.detect_mime_type(&bytes).ok_or_else(|| {
        OcrError::UnsupportedFormat("could not identify document type".to_owned())
    })?;
    debug!(%mime_type, "Detected document type");

    let scratch = ScratchDir::new(scratch_root)?;
    let doc_id = document.id();
    let (pages, warnings) = if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
        let page = normalize_image(bytes, opts, doc_id, scratch.path()).await?;
        (vec![page], vec![])
    } else if mime_type == TIFF_MIME_TYPE {
        let opts = opts.clone();
        let dir = scratch.path().to_owned();
        spawn_blocking_propagating_panics(move || {
            let mut pages = vec![];
            let warnings = tiff::for_each_tiff_page(&bytes, &opts, |index, image, dpi| {
                pages.push(write_canonical_page(image, index, dpi, &opts, doc_id, &dir)?);
                Ok(())
            })?;
            Ok::<_, OcrError>((pages, warnings))
        })
        .await??
    } else if mime_type == PDF_MIME_TYPE {
        let pdf_path = match document.path() {
            Some(path) => path.to_owned(),
            None => {
                let path = scratch.path().join("input.pdf");
                tokio::fs::write(&path, &bytes)
                    .await
                    .with_context(|| format!("failed to write {:?}", path))?;
                path
            }
        };
        pdf::normalize_pdf(&pdf_path, opts, doc_id, scratch.path()).await?
    } else {
        return Err(OcrError::UnsupportedFormat(format!(
            "{mime_type} (supported: PNG, JPEG, WebP, GIF, TIFF, PDF)"
        )));
    };

    if pages.is_empty() {
        return Err(OcrError::UnsupportedFormat(
            "document contains no pages".to_owned(),
        ));
    }
    debug!(page_count = pages.len(), "Normalized document");
    Ok(PageSet {
        mime_type,
        pages,
        warnings,
        scratch,
    })
}

/// Normalize a single-image document.
async fn normalize_image(
    bytes: Arc<[u8]>,
    opts: &NormalizeOptions,
    doc_id: Uuid,
    dir: &Path,
) -> OcrResult<Page> {
    let opts = opts.clone();
    let dir = dir.to_owned();
    spawn_blocking_propagating_panics(move || {
        // Check the size before decoding, so huge images fail cheaply.
        let (width, height) = ImageReader::new(Cursor::new(&bytes[..]))
            .with_guessed_format()
            .context("failed to read image header")?
            .into_dimensions()
            .map_err(|err| OcrError::UnsupportedFormat(format!("corrupt image: {err}")))?;
        check_page_area(0, width, height, &opts)?;
        let image = image::load_from_memory(&bytes)
            .map_err(|err| OcrError::UnsupportedFormat(format!("corrupt image: {err}")))?;
        write_canonical_page(image, 0, None, &opts, doc_id, &dir)
    })
    .await?
}

/// Fail if a page has too many pixels.
pub(crate) fn check_page_area(
    index: usize,
    width: u32,
    height: u32,
    opts: &NormalizeOptions,
) -> OcrResult<()> {
    let area = u64::from(width) * u64::from(height);
    if area > opts.max_page_pixels {
        return Err(OcrError::PageLimitExceeded(format!(
            "page {index} is {width}x{height} pixels, more than the limit of {}",
            opts.max_page_pixels
        )));
    }
    if area == 0 {
        return Err(OcrError::UnsupportedFormat(format!("page {index} is empty")));
    }
    Ok(())
}

/// Convert an image to 8-bit gray or RGB, flattening any alpha onto white.
fn to_canonical_color(image: DynamicImage) -> (DynamicImage, ColorDepth) {
    match image {
        DynamicImage::ImageLuma8(_) => (image, ColorDepth::Gray8),
        DynamicImage::ImageRgb8(_) => (image, ColorDepth::Rgb8),
        DynamicImage::ImageLuma16(_) => (DynamicImage::ImageLuma8(image.to_luma8()), ColorDepth::Gray8),
        other if !other.color().has_alpha() => {
            (DynamicImage::ImageRgb8(other.to_rgb8()), ColorDepth::Rgb8)
        }
        other if !other.color().has_color() => {
            let la = other.to_luma_alpha8();
            let gray = GrayImage::from_fn(la.width(), la.height(), |x, y| {
                let [l, a] = la.get_pixel(x, y).0;
                image::Luma([over_white(l, a)])
            });
            (DynamicImage::ImageLuma8(gray), ColorDepth::Gray8)
        }
        other => {
            let rgba = other.to_rgba8();
            let rgb = RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
                let [r, g, b, a] = rgba.get_pixel(x, y).0;
                image::Rgb([over_white(r, a), over_white(g, a), over_white(b, a)])
            });
            (DynamicImage::ImageRgb8(rgb), ColorDepth::Rgb8)
        }
    }
}

/// Composite a channel value with the given alpha over a white background.
fn over_white(value: u8, alpha: u8) -> u8 {
    let (v, a) = (u32::from(value), u32::from(alpha));
    // Exact for a in {0, 255}, and never exceeds 255.
    ((v * a + 255 * (255 - a) + 127) / 255) as u8
}

/// Canonicalize one page image and write it to `dir`.
pub(crate) fn write_canonical_page(
    image: DynamicImage,
    index: usize,
    dpi: Option<u32>,
    opts: &NormalizeOptions,
    document_id: Uuid,
    dir: &Path,
) -> OcrResult<Page> {
    check_page_area(index, image.width(), image.height(), opts)?;
    let (mut image, color) = to_canonical_color(image);
    let mut dpi = dpi;
    if image.width().max(image.height()) > opts.max_page_side {
        let old_width = image.width();
        // `resize` preserves the aspect ratio.
        image = image.resize(opts.max_page_side, opts.max_page_side, FilterType::Lanczos3);
        dpi = dpi.map(|dpi| {
            let scaled = u64::from(dpi) * u64::from(image.width()) / u64::from(old_width);
            u32::try_from(scaled.max(1)).unwrap_or(dpi)
        });
        debug!(index, width = image.width(), height = image.height(), "Downscaled page");
    }

    let path = dir.join(format!("page-{index:05}.png"));
    image
        .save_with_format(&path, ImageFormat::Png)
        .with_context(|| format!("failed to write page {:?}", path))?;
    Ok(Page {
        index,
        width: image.width(),
        height: image.height(),
        color,
        dpi,
        max_side: opts.max_page_side,
        document_id,
        path,
    })
}
