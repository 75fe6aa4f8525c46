//! Multi-page TIFF decoding.
//!
//! We do this the hard way, because multiple pages can be represented in many
//! different ways, depending on source. For scanned documents, the most
//! important case by far is pages represented as IFDs, which [`tiff`] handles
//! out of the box. There's another rare SubIFD representation. If we see
//! _that_, we reject the document rather than silently dropping pages.
//! Thumbnails, masks and DNG metadata are not treated as pages.

use std::io::{Cursor, Read, Seek};

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult, ifd::Value},
    tags::{IfdPointer, Tag},
};

use crate::{
    config::NormalizeOptions,
    error::{OcrError, OcrResult},
    prelude::*,
};

use super::check_page_area;

/// NewSubfileType bit definitions per TIFF 6.0 specification.
mod subfile_type {
    /// Bit 0: Reduced resolution image (thumbnail/preview).
    pub const REDUCED_RESOLUTION: u32 = 0x1;
    /// Bit 1: Single page of a multi-page document.
    pub const SINGLE_PAGE: u32 = 0x2;
    /// Bit 2: Transparency mask for another image.
    pub const TRANSPARENCY_MASK: u32 = 0x4;
    /// DNG extensions (bits 3, 4, 16): depth map, enhanced image, semantic mask.
    pub const DNG_BITS: u32 = 0x8 | 0x10 | 0x10000;
}

/// Decoder failures mean the file is corrupt or uses features we don't read.
fn corrupt(what: &str, err: impl std::fmt::Display) -> OcrError {
    OcrError::UnsupportedFormat(format!("corrupt TIFF: {what}: {err}"))
}

/// Largest resolution we believe. Anything higher is a broken tag.
const MAX_PLAUSIBLE_DPI: f64 = 10_000.0;

/// Decode each page of a TIFF in order, passing it to `on_page` along with
/// its resolution, if known.
///
/// Returns any warnings. Fails with [`OcrError::PageLimitExceeded`] as soon as
/// we find more pages than we're allowed.
pub(super) fn for_each_tiff_page(
    bytes: &[u8],
    opts: &NormalizeOptions,
    mut on_page: impl FnMut(usize, DynamicImage, Option<u32>) -> OcrResult<()>,
) -> OcrResult<Vec<String>> {
    let mut decoder =
        Decoder::new(Cursor::new(bytes)).map_err(|err| corrupt("cannot open", err))?;
    let mut warnings = Vec::new();
    let mut index = 0;
    loop {
        if index >= opts.max_pages {
            return Err(OcrError::PageLimitExceeded(format!(
                "TIFF has more than {} pages",
                opts.max_pages
            )));
        }

        validate_subifds(&mut decoder, index, &mut warnings)?;

        let (width, height) = decoder
            .dimensions()
            .map_err(|err| corrupt(&format!("dimensions of page {index}"), err))?;
        check_page_area(index, width, height, opts)?;
        let dpi = resolution_dpi(&mut decoder);
        let image = decode_tiff_image(&mut decoder, width, height, index)?;
        on_page(index, image, dpi)?;
        index += 1;

        if !decoder.more_images() {
            break;
        }
        decoder
            .next_image()
            .map_err(|err| corrupt(&format!("cannot advance to page {index}"), err))?;
    }
    debug!(page_count = index, "Decoded multipage TIFF");
    Ok(warnings)
}

/// The horizontal resolution of the current IFD, in dots per inch.
///
/// Returns `None` when the tags are missing, unitless or implausible.
fn resolution_dpi<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<u32> {
    let per_unit = match decoder.find_tag(Tag::XResolution) {
        Ok(Some(Value::Rational(n, d))) if n > 0 && d > 0 => f64::from(n) / f64::from(d),
        _ => return None,
    };
    // Inches are the default unit.
    let unit = decoder
        .find_tag_unsigned::<u16>(Tag::ResolutionUnit)
        .ok()
        .flatten()
        .unwrap_or(2);
    let dpi = match unit {
        2 => per_unit,
        3 => per_unit * 2.54,
        _ => return None,
    }
    .round();
    (1.0..=MAX_PLAUSIBLE_DPI).contains(&dpi).then_some(dpi as u32)
}

/// Make sure an IFD's SubIFDs don't hide any document content.
///
/// Thumbnails, transparency masks and DNG metadata are safe to skip. Anything
/// else might be a page, so we refuse the document.
fn validate_subifds<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    ifd_index: usize,
    warnings: &mut Vec<String>,
) -> OcrResult<()> {
    let subifd_value = match decoder.find_tag(Tag::SubIfd) {
        Ok(Some(value)) => value,
        Ok(None) | Err(_) => return Ok(()),
    };

    let subifd_offsets: Vec<u64> = match subifd_value {
        Value::Ifd(offset) => vec![u64::from(offset)],
        Value::List(list) => list
            .iter()
            .filter_map(|v| match v {
                Value::Ifd(offset) => Some(u64::from(*offset)),
                _ => None,
            })
            .collect(),
        _ => return Ok(()),
    };

    for (sub_idx, &offset) in subifd_offsets.iter().enumerate() {
        let subdir = match decoder.read_directory(IfdPointer(offset)) {
            Ok(dir) => dir,
            Err(e) => {
                warnings.push(format!(
                    "Could not read SubIFD {} of page {}: {}",
                    sub_idx, ifd_index, e
                ));
                continue;
            }
        };

        let subfile = {
            let mut ifd_decoder = decoder.read_directory_tags(&subdir);
            match ifd_decoder.find_tag(Tag::NewSubfileType) {
                Ok(Some(value)) => value.into_u32().unwrap_or(0),
                _ => 0,
            }
        };

        let skippable = subfile_type::REDUCED_RESOLUTION
            | subfile_type::TRANSPARENCY_MASK
            | subfile_type::DNG_BITS;
        if subfile & skippable != 0 {
            debug!(ifd_index, sub_idx, subfile, "Skipping non-page SubIFD");
            continue;
        }
        if subfile == 0 || subfile & subfile_type::SINGLE_PAGE != 0 {
            return Err(OcrError::UnsupportedFormat(format!(
                "TIFF has ambiguous SubIFD content in page {} (SubIFD {}, \
                 NewSubfileType={}), which may hold pages we would miss; \
                 convert it to PDF or individual images first",
                ifd_index, sub_idx, subfile
            )));
        }
    }

    Ok(())
}

/// Decode the current IFD into an image.
fn decode_tiff_image<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    width: u32,
    height: u32,
    index: usize,
) -> OcrResult<DynamicImage> {
    let color_type = decoder
        .colortype()
        .map_err(|err| corrupt(&format!("color type of page {index}"), err))?;
    let result = decoder
        .read_image()
        .map_err(|err| corrupt(&format!("cannot decode page {index}"), err))?;

    let bad_buffer = || corrupt(&format!("page {index}"), "pixel buffer has the wrong size");
    let unsupported = |what: String| {
        OcrError::UnsupportedFormat(format!("TIFF page {index} uses {what}"))
    };

    // 16-bit samples are scaled down to 8 bits.
    let data = match result {
        DecodingResult::U8(data) => data,
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => return Err(unsupported("an unsupported sample format".to_owned())),
    };

    let image = match color_type {
        ColorType::Gray(_) => DynamicImage::ImageLuma8(
            GrayImage::from_raw(width, height, data).ok_or_else(bad_buffer)?,
        ),
        ColorType::RGB(_) => DynamicImage::ImageRgb8(
            RgbImage::from_raw(width, height, data).ok_or_else(bad_buffer)?,
        ),
        ColorType::RGBA(_) => DynamicImage::ImageRgba8(
            RgbaImage::from_raw(width, height, data).ok_or_else(bad_buffer)?,
        ),
        other => return Err(unsupported(format!("color type {other:?}"))),
    };
    Ok(image)
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Luma};
    use tiff::{
        encoder::{Rational, TiffEncoder, colortype::Gray8},
        tags::ResolutionUnit,
    };

    use super::*;

    fn tiff_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([200])));
        crate::normalize::tests::encode(&image, ImageFormat::Tiff)
    }

    /// A multi-page gray TIFF, optionally with resolution tags on every page.
    fn multipage_tiff(page_count: usize, resolution: Option<(ResolutionUnit, u32)>) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        let mut encoder = TiffEncoder::new(&mut buf).unwrap();
        let data = vec![200u8; 16 * 8];
        for _ in 0..page_count {
            let mut image = encoder.new_image::<Gray8>(16, 8).unwrap();
            if let Some((unit, n)) = resolution {
                image.resolution(unit, Rational { n, d: 1 });
            }
            image.write_data(&data).unwrap();
        }
        drop(encoder);
        buf.into_inner()
    }

    fn page_dpis(bytes: &[u8], opts: &NormalizeOptions) -> OcrResult<Vec<Option<u32>>> {
        let mut dpis = vec![];
        for_each_tiff_page(bytes, opts, |_, _, dpi| {
            dpis.push(dpi);
            Ok(())
        })?;
        Ok(dpis)
    }

    #[test]
    fn single_page_tiff_yields_one_page() {
        let bytes = tiff_bytes(20, 10);
        let mut seen = vec![];
        let warnings = for_each_tiff_page(&bytes, &NormalizeOptions::default(), |index, image, _| {
            seen.push((index, image.width(), image.height()));
            Ok(())
        })
        .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(seen, vec![(0, 20, 10)]);
    }

    #[test]
    fn page_area_limit_applies() {
        let bytes = tiff_bytes(20, 10);
        let opts = NormalizeOptions {
            max_page_pixels: 100,
            ..NormalizeOptions::default()
        };
        let err = for_each_tiff_page(&bytes, &opts, |_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, OcrError::PageLimitExceeded(_)));
    }

    #[test]
    fn garbage_is_unsupported() {
        let err = for_each_tiff_page(b"II*\0garbage", &NormalizeOptions::default(), |_, _, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, OcrError::UnsupportedFormat(_)));
    }

    #[test]
    fn page_count_limit_applies() {
        let bytes = multipage_tiff(3, None);
        let opts = NormalizeOptions {
            max_pages: 2,
            ..NormalizeOptions::default()
        };
        let err = page_dpis(&bytes, &opts).unwrap_err();
        assert!(matches!(err, OcrError::PageLimitExceeded(_)), "{err:?}");

        let opts = NormalizeOptions {
            max_pages: 3,
            ..NormalizeOptions::default()
        };
        assert_eq!(page_dpis(&bytes, &opts).unwrap().len(), 3);
    }

    #[test]
    fn resolution_tags_give_dpi() {
        let opts = NormalizeOptions::default();
        let inch = multipage_tiff(2, Some((ResolutionUnit::Inch, 200)));
        assert_eq!(page_dpis(&inch, &opts).unwrap(), [Some(200), Some(200)]);
        let cm = multipage_tiff(1, Some((ResolutionUnit::Centimeter, 236)));
        assert_eq!(page_dpis(&cm, &opts).unwrap(), [Some(599)]);
        let unitless = multipage_tiff(1, Some((ResolutionUnit::None, 72)));
        assert_eq!(page_dpis(&unitless, &opts).unwrap(), [None]);
    }
}
