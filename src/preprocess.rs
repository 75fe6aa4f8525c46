//! Per-page image cleanup before recognition.
//!
//! Transforms run in a fixed order: grayscale, denoise, deskew, binarize,
//! contrast. Each one can be switched off in [`PreprocessOptions`]. The output
//! is a grayscale PNG plus the list of transforms that were actually applied.
//!
//! Everything here is pure, single-threaded CPU work with no randomness, so
//! the same page and options always produce byte-identical output.

use std::io::Cursor;

use image::{
    DynamicImage, GrayImage, ImageFormat, Luma,
    imageops::{self, FilterType},
};
use imageproc::{
    contrast::stretch_contrast_mut,
    filter::median_filter,
    geometric_transformations::{Interpolation, rotate_about_center},
    integral_image::{integral_image, sum_image_pixels},
    stats::percentile,
};

use crate::{
    config::{MIN_PAGE_SIDE, PreprocessOptions},
    normalize::LoadedPage,
    prelude::*,
};

/// Pages with a known DPI are never scaled by more than this factor, in
/// either direction. Upscaling is further limited by [`Page::max_side`].
///
/// [`Page::max_side`]: crate::normalize::Page::max_side
const MAX_RESAMPLE_FACTOR: f64 = 4.0;

/// Skew estimation works on a copy no larger than this.
const SKEW_ESTIMATE_SIDE: u32 = 1000;

/// We search for skew in this range of angles, in degrees.
const SKEW_SEARCH_RANGE: f32 = 15.0;

/// Rotations smaller than this are not worth the interpolation blur.
const MIN_DESKEW_ANGLE: f32 = 0.5;

/// Pixels darker than this count as ink when estimating skew.
const INK_THRESHOLD: u8 = 128;

/// A transform applied to a page.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    /// The page was resampled to the target resolution.
    Resample { from_dpi: u32, to_dpi: u32 },
    /// A tiny page was padded with white.
    Pad { width: u32, height: u32 },
    /// A color page was reduced to grayscale.
    Grayscale,
    /// A median filter was applied.
    Denoise { radius: u32 },
    /// The page was rotated to straighten text lines.
    Deskew { angle_degrees: f32 },
    /// A skew was detected, but it was too large to trust.
    DeskewSkipped { angle_degrees: f32 },
    /// Adaptive mean thresholding was applied.
    Binarize { window: u32, bias: f32 },
    /// Intensities were stretched from `[low, high]` to the full range.
    Contrast { low: u8, high: u8 },
}

/// A page that is ready for the recognition engine.
#[derive(Clone, Debug, PartialEq)]
pub struct PreprocessedPage {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Resolution to report to the engine.
    pub dpi: u32,
    /// Grayscale PNG data.
    pub png: Vec<u8>,
    /// What we did, in order.
    pub transforms: Vec<Transform>,
}

/// Clean up a page for recognition.
///
/// Degenerate images are padded rather than rejected, so the only possible
/// error is a failure to encode the final PNG.
#[instrument(level = "debug", skip_all, fields(page = page.page.index))]
pub fn preprocess(page: &LoadedPage, options: &PreprocessOptions) -> Result<PreprocessedPage> {
    let mut transforms = vec![];

    // (1) Grayscale. Our output is always grayscale, but we only record the
    // transform when there was color to remove.
    if page.image.color().has_color() {
        transforms.push(Transform::Grayscale);
    }
    let mut gray = page.image.to_luma8();

    let dpi = match page.page.dpi {
        Some(from_dpi) if from_dpi != options.target_dpi => {
            let longest = f64::from(gray.width().max(gray.height()));
            let factor = (f64::from(options.target_dpi) / f64::from(from_dpi))
                .clamp(1.0 / MAX_RESAMPLE_FACTOR, MAX_RESAMPLE_FACTOR)
                .min(f64::from(page.page.max_side.max(1)) / longest);
            let width = scaled(gray.width(), factor);
            let height = scaled(gray.height(), factor);
            if (width, height) == gray.dimensions() {
                // Already at the size limit, which is where the normalizer
                // leaves pages it has shrunk.
                from_dpi
            } else {
                gray = imageops::resize(&gray, width, height, FilterType::Lanczos3);
                let to_dpi = scaled(from_dpi, factor);
                transforms.push(Transform::Resample { from_dpi, to_dpi });
                to_dpi
            }
        }
        Some(dpi) => dpi,
        None => options.target_dpi,
    };

    if gray.width() < MIN_PAGE_SIDE || gray.height() < MIN_PAGE_SIDE {
        gray = pad_to_min_side(&gray, MIN_PAGE_SIDE);
        transforms.push(Transform::Pad {
            width: gray.width(),
            height: gray.height(),
        });
    }

    // (2) Denoise.
    if options.denoise {
        gray = median_filter(&gray, 1, 1);
        transforms.push(Transform::Denoise { radius: 1 });
    }

    // (3) Deskew.
    if options.deskew
        && let Some(angle) = estimate_skew(&gray)
    {
        if angle.abs() > options.max_deskew_angle {
            debug!(angle, "Skew estimate too large, not rotating");
            transforms.push(Transform::DeskewSkipped {
                angle_degrees: angle,
            });
        } else {
            // `rotate_about_center` rotates clockwise, and a positive angle
            // means lines slope down to the right.
            gray = rotate_about_center(
                &gray,
                -angle.to_radians(),
                Interpolation::Bilinear,
                Luma([255]),
            );
            transforms.push(Transform::Deskew {
                angle_degrees: angle,
            });
        }
    }

    // (4) Binarize.
    if options.binarize {
        let window = options.binarize_window | 1;
        gray = adaptive_threshold(&gray, window, options.binarize_bias);
        transforms.push(Transform::Binarize {
            window,
            bias: options.binarize_bias,
        });
    }

    // (5) Contrast.
    if options.contrast
        && let Some((low, high)) = contrast_bounds(&gray)
    {
        stretch_contrast_mut(&mut gray, low, high, 0, 255);
        transforms.push(Transform::Contrast { low, high });
    }

    let (width, height) = gray.dimensions();
    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(gray)
        .write_to(&mut png, ImageFormat::Png)
        .context("failed to encode preprocessed page")?;
    trace!(?transforms, "Preprocessed page");
    Ok(PreprocessedPage {
        index: page.page.index,
        width,
        height,
        dpi,
        png: png.into_inner(),
        transforms,
    })
}

/// Scale a dimension, never returning 0.
fn scaled(value: u32, factor: f64) -> u32 {
    ((f64::from(value) * factor).round() as u32).max(1)
}

/// Pad an image with white so that each side is at least `min_side`.
fn pad_to_min_side(gray: &GrayImage, min_side: u32) -> GrayImage {
    let width = gray.width().max(min_side);
    let height = gray.height().max(min_side);
    let mut padded = GrayImage::from_pixel(width, height, Luma([255]));
    let x = i64::from((width - gray.width()) / 2);
    let y = i64::from((height - gray.height()) / 2);
    imageops::replace(&mut padded, gray, x, y);
    padded
}

/// Estimate the angle of text lines, in degrees. Positive angles mean lines
/// slope down to the right.
///
/// We use the projection-profile method: for each candidate angle, we project
/// ink pixels onto lines at that angle, and pick the angle where the profile
/// has the sharpest peaks. Returns `None` for pages with too little ink, or
/// when the skew is too small to bother correcting.
pub fn estimate_skew(gray: &GrayImage) -> Option<f32> {
    let (w, h) = gray.dimensions();
    let small;
    let img = if w.max(h) > SKEW_ESTIMATE_SIDE {
        let side = w.max(h);
        small = imageops::thumbnail(
            gray,
            (SKEW_ESTIMATE_SIDE * w / side).max(1),
            (SKEW_ESTIMATE_SIDE * h / side).max(1),
        );
        &small
    } else {
        gray
    };
    let (w, h) = img.dimensions();
    if w < 32 || h < 32 {
        return None;
    }

    let ink = img
        .enumerate_pixels()
        .filter(|(_, _, p)| p.0[0] < INK_THRESHOLD)
        .map(|(x, y, _)| (x as f32, y as f32))
        .collect::<Vec<_>>();
    let total = (w as usize) * (h as usize);
    if ink.len() * 200 < total {
        return None;
    }

    // Coarse search in half-degree steps, then refine in tenths.
    let coarse = best_angle(
        &ink,
        h,
        w,
        candidate_angles(-SKEW_SEARCH_RANGE, SKEW_SEARCH_RANGE, 0.5),
    );
    let best = best_angle(&ink, h, w, candidate_angles(coarse - 0.5, coarse + 0.5, 0.1));
    if best.abs() < MIN_DESKEW_ANGLE {
        None
    } else {
        Some(best)
    }
}

/// Angles from `start` to `end` inclusive, computed from integer steps so that
/// the sequence is exact and repeatable.
fn candidate_angles(start: f32, end: f32, step: f32) -> impl Iterator<Item = f32> {
    let steps = ((end - start) / step).round() as i32;
    (0..=steps).map(move |i| start + i as f32 * step)
}

/// Find the angle whose projection profile is sharpest. Earlier candidates win
/// ties.
fn best_angle(
    ink: &[(f32, f32)],
    height: u32,
    width: u32,
    angles: impl Iterator<Item = f32>,
) -> f32 {
    let mut best = (0.0f32, f64::NEG_INFINITY);
    for angle in angles {
        let score = projection_score(ink, height, width, angle);
        if score > best.1 {
            best = (angle, score);
        }
    }
    best.0
}

/// Sum of squared differences between adjacent bins of the ink projection
/// onto lines at `angle_deg`.
fn projection_score(ink: &[(f32, f32)], height: u32, width: u32, angle_deg: f32) -> f64 {
    let tan_a = angle_deg.to_radians().tan();
    // Projected rows can go negative by up to `width * |tan|`.
    let offset = (width as f32 * tan_a.abs()).ceil() as i64 + 1;
    let bins = height as usize + 2 * offset as usize + 1;
    let mut profile = vec![0u32; bins];
    for &(x, y) in ink {
        let row = (y - x * tan_a).round() as i64 + offset;
        if let Ok(row) = usize::try_from(row)
            && row < bins
        {
            profile[row] += 1;
        }
    }
    profile
        .windows(2)
        .map(|pair| {
            let diff = f64::from(pair[1]) - f64::from(pair[0]);
            diff * diff
        })
        .sum()
}

/// Adaptive mean thresholding. A pixel becomes black if it is darker than the
/// mean of the `window`-sized square around it by more than `bias`.
fn adaptive_threshold(gray: &GrayImage, window: u32, bias: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let r = window / 2;
    // A large white page overflows 32-bit sums.
    let integral = integral_image::<_, u64>(gray);
    GrayImage::from_fn(w, h, |x, y| {
        let (left, top) = (x.saturating_sub(r), y.saturating_sub(r));
        let (right, bottom) = ((x + r).min(w - 1), (y + r).min(h - 1));
        let count = u64::from(right - left + 1) * u64::from(bottom - top + 1);
        let [sum] = sum_image_pixels(&integral, left, top, right, bottom);
        let mean = sum as f64 / count as f64;
        let value = f64::from(gray.get_pixel(x, y).0[0]);
        Luma([if value < mean - f64::from(bias) { 0 } else { 255 }])
    })
}

/// Find the 1st and 99th percentile intensities. Returns `None` if stretching
/// would do nothing.
fn contrast_bounds(gray: &GrayImage) -> Option<(u8, u8)> {
    let low = percentile(gray, 1);
    let high = percentile(gray, 99);
    if high <= low || (low == 0 && high == 255) {
        None
    } else {
        Some((low, high))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use image::RgbImage;
    use uuid::Uuid;

    use super::*;
    use crate::{
        config::NormalizeOptions,
        normalize::{Page, write_canonical_page},
    };

    /// Draw dark horizontal "text lines" sloping at `angle` degrees.
    pub(crate) fn lined_page(width: u32, height: u32, angle: f32) -> GrayImage {
        let tan_a = angle.to_radians().tan();
        GrayImage::from_fn(width, height, |x, y| {
            let row = y as f32 - x as f32 * tan_a;
            // 6px-thick lines every 30px, with gaps between "words".
            let in_line = row.rem_euclid(30.0) < 6.0;
            let in_word = (x / 40) % 4 != 3;
            Luma([if in_line && in_word && x > 20 && x < width - 20 { 20 } else { 235 }])
        })
    }

    pub(crate) fn loaded(image: DynamicImage, dpi: Option<u32>) -> LoadedPage {
        LoadedPage {
            page: Page::for_tests(0, &image, dpi, Uuid::nil()),
            image,
        }
    }

    #[test]
    fn output_is_deterministic() {
        let page = loaded(DynamicImage::ImageLuma8(lined_page(300, 200, 3.0)), None);
        let options = PreprocessOptions::default();
        let a = preprocess(&page, &options).unwrap();
        let b = preprocess(&page, &options).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.png, b.png);
    }

    #[test]
    fn transforms_run_in_fixed_order() {
        let lines = lined_page(300, 200, 3.0);
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_fn(300, 200, |x, y| {
            let v = lines.get_pixel(x, y).0[0];
            image::Rgb([v, v, v / 2])
        }));
        let page = loaded(rgb, None);
        let out = preprocess(&page, &PreprocessOptions::default()).unwrap();
        let names = out
            .transforms
            .iter()
            .map(|t| match t {
                Transform::Grayscale => "grayscale",
                Transform::Denoise { .. } => "denoise",
                Transform::Deskew { .. } => "deskew",
                Transform::Binarize { .. } => "binarize",
                _ => "other",
            })
            .filter(|name| *name != "other")
            .collect::<Vec<_>>();
        assert_eq!(names, ["grayscale", "denoise", "deskew", "binarize"]);
    }

    #[test]
    fn disabled_transforms_are_skipped() {
        let page = loaded(DynamicImage::ImageLuma8(lined_page(300, 200, 3.0)), None);
        let options = PreprocessOptions {
            denoise: false,
            deskew: false,
            binarize: false,
            contrast: false,
            ..PreprocessOptions::default()
        };
        let out = preprocess(&page, &options).unwrap();
        assert!(out.transforms.is_empty());
        assert_eq!((out.width, out.height), (300, 200));
    }

    #[test]
    fn estimates_skew_of_sloped_lines() {
        let angle = estimate_skew(&lined_page(400, 300, 4.0)).unwrap();
        assert!((angle - 4.0).abs() <= 0.3, "estimated {angle}");
        let angle = estimate_skew(&lined_page(400, 300, -2.0)).unwrap();
        assert!((angle + 2.0).abs() <= 0.3, "estimated {angle}");
        assert_eq!(estimate_skew(&lined_page(400, 300, 0.0)), None);
    }

    #[test]
    fn blank_pages_have_no_skew() {
        let blank = GrayImage::from_pixel(200, 200, Luma([255]));
        assert_eq!(estimate_skew(&blank), None);
    }

    #[test]
    fn large_skews_are_not_applied() {
        let page = loaded(DynamicImage::ImageLuma8(lined_page(400, 300, 8.0)), None);
        let options = PreprocessOptions {
            max_deskew_angle: 5.0,
            ..PreprocessOptions::default()
        };
        let out = preprocess(&page, &options).unwrap();
        assert!(
            out.transforms
                .iter()
                .any(|t| matches!(t, Transform::DeskewSkipped { .. }))
        );
        assert!(
            !out.transforms
                .iter()
                .any(|t| matches!(t, Transform::Deskew { .. }))
        );
    }

    #[test]
    fn tiny_pages_are_padded() {
        let tiny = GrayImage::from_pixel(3, 1, Luma([0]));
        let page = loaded(DynamicImage::ImageLuma8(tiny), None);
        let out = preprocess(&page, &PreprocessOptions::default()).unwrap();
        assert_eq!((out.width, out.height), (MIN_PAGE_SIDE, MIN_PAGE_SIDE));
        assert!(matches!(out.transforms[0], Transform::Pad { .. }));
    }

    #[test]
    fn known_dpi_is_resampled() {
        let page = loaded(DynamicImage::ImageLuma8(lined_page(100, 80, 0.0)), Some(150));
        let options = PreprocessOptions {
            target_dpi: 300,
            ..PreprocessOptions::default()
        };
        let out = preprocess(&page, &options).unwrap();
        assert_eq!((out.width, out.height, out.dpi), (200, 160, 300));
        assert_eq!(
            out.transforms[0],
            Transform::Resample {
                from_dpi: 150,
                to_dpi: 300
            }
        );
    }

    #[test]
    fn adaptive_threshold_tolerates_uneven_lighting() {
        // Background brightens from left to right; ink is always 60 darker.
        let img = GrayImage::from_fn(200, 50, |x, y| {
            let background = 100 + (x / 2) as u8;
            let ink = (20..30).contains(&y) && x % 20 < 10;
            Luma([if ink { background - 60 } else { background }])
        });
        let out = adaptive_threshold(&img, 15, 10.0);
        assert_eq!(out.get_pixel(5, 25).0[0], 0);
        assert_eq!(out.get_pixel(185, 25).0[0], 0);
        assert_eq!(out.get_pixel(5, 5).0[0], 255);
        assert_eq!(out.get_pixel(185, 45).0[0], 255);
    }

    #[test]
    fn contrast_is_stretched() {
        let mut img = GrayImage::from_fn(100, 1, |x, _| Luma([100 + (x as u8) / 2]));
        let (low, high) = contrast_bounds(&img).unwrap();
        assert!(low >= 100 && high <= 150 && low < high);
        stretch_contrast_mut(&mut img, low, high, 0, 255);
        assert_eq!(img.get_pixel(0, 0).0[0], 0);
        assert_eq!(img.get_pixel(99, 0).0[0], 255);
    }

    #[tokio::test]
    async fn normalizer_downscaling_is_not_undone() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let opts = NormalizeOptions {
            max_page_side: 100,
            ..NormalizeOptions::default()
        };
        let image = DynamicImage::ImageLuma8(lined_page(400, 200, 0.0));
        let page = write_canonical_page(image, 0, Some(300), &opts, Uuid::nil(), dir.path())?;
        assert_eq!((page.width, page.height, page.dpi), (100, 50, Some(75)));

        let loaded = page.load().await?;
        let out = preprocess(&loaded, &PreprocessOptions::default())?;
        assert!(out.width <= 100 && out.height <= 100, "{}x{}", out.width, out.height);
        assert_eq!(out.dpi, 75);
        assert!(
            !out.transforms
                .iter()
                .any(|t| matches!(t, Transform::Resample { .. }))
        );
        Ok(())
    }

    #[test]
    fn upsampling_stops_at_the_page_size_limit() {
        let mut page = loaded(DynamicImage::ImageLuma8(lined_page(100, 50, 0.0)), Some(100));
        page.page.max_side = 150;
        let options = PreprocessOptions {
            target_dpi: 300,
            ..PreprocessOptions::default()
        };
        let out = preprocess(&page, &options).unwrap();
        assert_eq!((out.width, out.height, out.dpi), (150, 75, 150));
    }
}
