//! PDF rasterization, using Poppler's `pdfinfo` and `pdftocairo` CLI tools.

use std::{collections::BTreeMap, io, sync::LazyLock};

use regex::Regex;
use tokio::{process::Command, sync::Semaphore};
use uuid::Uuid;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    config::NormalizeOptions,
    error::{OcrError, OcrResult},
    prelude::*,
};

use super::{Page, check_page_area, write_canonical_page};

/// Semaphore used to limit the number of concurrent `pdftocairo` processes.
///
/// In-process CPU-bound work goes through
/// [`spawn_blocking_propagating_panics`] instead. This is only for external
/// processes that each try to use 100% of a CPU core.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let _permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    f().await
}

static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler reports repaired cross-reference tables as errors, but the output
/// is fine.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output report a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Map a failure to launch a Poppler tool to an error.
fn spawn_error(tool: &str, path: &Path, err: io::Error) -> OcrError {
    OcrError::Internal(anyhow!(err).context(format!(
        "failed to run {tool} on {:?} (is poppler-utils installed?)",
        path.display()
    )))
}

/// `pdfinfo` prints one of these for each page in the range we ask about.
static PAGE_SIZE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page\s+(\d+)\s+size:\s+([0-9.]+)\s+x\s+([0-9.]+)\s+pts")
        .expect("failed to compile regex")
});

/// Points per inch, the unit of PDF page sizes.
const POINTS_PER_INCH: f64 = 72.0;

/// What `pdfinfo` tells us about a PDF.
#[derive(Debug, PartialEq)]
pub(super) struct PdfInfo {
    pub page_count: usize,
    /// Sizes in points, for the first pages only.
    pub page_sizes: Vec<(f64, f64)>,
}

impl PdfInfo {
    /// Fail if the PDF has too many pages, or if any page we have a size for
    /// would rasterize to too many pixels.
    fn check_limits(&self, opts: &NormalizeOptions) -> OcrResult<()> {
        if self.page_count > opts.max_pages {
            return Err(OcrError::PageLimitExceeded(format!(
                "PDF has {} pages, more than the limit of {}",
                self.page_count, opts.max_pages
            )));
        }
        let to_pixels = |points: f64| {
            (points / POINTS_PER_INCH * f64::from(opts.target_dpi)).ceil() as u32
        };
        for (index, &(width, height)) in self.page_sizes.iter().enumerate() {
            check_page_area(index, to_pixels(width), to_pixels(height), opts)?;
        }
        Ok(())
    }
}

/// Parse the output of `pdfinfo -f 1 -l N`.
fn parse_pdfinfo(output: &str) -> OcrResult<PdfInfo> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties.get("Pages").ok_or_else(|| {
        OcrError::UnsupportedFormat("pdfinfo did not report a page count".to_owned())
    })?;
    let page_count = pages.parse::<usize>().map_err(|err| {
        OcrError::UnsupportedFormat(format!("bad page count {pages:?} from pdfinfo: {err}"))
    })?;
    let page_sizes = output
        .lines()
        .filter_map(|line| PAGE_SIZE_REGEX.captures(line))
        .filter_map(|caps| Some((caps[2].parse::<f64>().ok()?, caps[3].parse::<f64>().ok()?)))
        .collect();
    Ok(PdfInfo {
        page_count,
        page_sizes,
    })
}

/// Get the page count of a PDF file, plus the sizes of up to `max_pages`
/// pages.
///
/// A PDF which `pdfinfo` can't read is treated as corrupt.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub(super) async fn get_pdf_info(path: &Path, max_pages: usize) -> OcrResult<PdfInfo> {
    let output = Command::new("pdfinfo")
        .arg("-f")
        .arg("1")
        .arg("-l")
        .arg(max_pages.max(1).to_string())
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| spawn_error("pdfinfo", path, err))?;
    check_for_command_failure("pdfinfo", &output, None)
        .map_err(|err| OcrError::UnsupportedFormat(format!("unreadable PDF: {err:#}")))?;
    parse_pdfinfo(&String::from_utf8_lossy(&output.stdout))
}

/// Rasterize a PDF into canonical pages at [`NormalizeOptions::target_dpi`].
#[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi = opts.target_dpi))]
pub(super) async fn normalize_pdf(
    path: &Path,
    opts: &NormalizeOptions,
    document_id: Uuid,
    scratch: &Path,
) -> OcrResult<(Vec<Page>, Vec<String>)> {
    // Check the limits before doing any expensive work.
    let info = get_pdf_info(path, opts.max_pages).await?;
    info.check_limits(opts)?;
    let total_pages = info.page_count;

    let raw_dir = scratch.join("pdftocairo");
    tokio::fs::create_dir(&raw_dir)
        .await
        .with_context(|| format!("failed to create {:?}", raw_dir))?;

    // `pdftocairo` appends a page number to this prefix.
    let out_prefix = raw_dir.join("page");
    let output = with_cpu_semaphore(|| async {
        Command::new("pdftocairo")
            .arg("-png")
            .arg("-r")
            .arg(opts.target_dpi.to_string())
            .arg(path)
            .arg(&out_prefix)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| {
                format!(
                    "failed to run pdftocairo on {:?} (is poppler-utils installed?)",
                    path.display()
                )
            })
    })
    .await?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))
        .map_err(|err| OcrError::UnsupportedFormat(format!("cannot rasterize PDF: {err:#}")))?;
    let warnings = String::from_utf8_lossy(&output.stderr)
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    // Page numbers are zero-padded to a common width, so lexical order is
    // page order.
    let mut raw_paths = std::fs::read_dir(&raw_dir)
        .with_context(|| format!("failed to read {:?}", raw_dir))?
        .map(|entry| Ok(entry?.path()))
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read {:?}", raw_dir))?;
    raw_paths.sort();
    if raw_paths.len() != total_pages {
        return Err(OcrError::UnsupportedFormat(format!(
            "pdftocairo produced {} pages, but pdfinfo reported {}",
            raw_paths.len(),
            total_pages
        )));
    }

    let opts = opts.clone();
    let scratch = scratch.to_owned();
    let dpi = opts.target_dpi;
    let pages = spawn_blocking_propagating_panics(move || {
        raw_paths
            .iter()
            .enumerate()
            .map(|(index, raw_path)| -> OcrResult<Page> {
                let image = image::open(raw_path).map_err(|err| {
                    OcrError::UnsupportedFormat(format!("bad rasterized page {index}: {err}"))
                })?;
                let page =
                    write_canonical_page(image, index, Some(dpi), &opts, document_id, &scratch)?;
                // Recover space a bit early.
                std::fs::remove_file(raw_path)
                    .with_context(|| format!("failed to delete {:?}", raw_path))?;
                Ok(page)
            })
            .collect::<OcrResult<Vec<_>>>()
    })
    .await??;

    Ok((pages, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_error_line_works() {
        assert!(is_error_line("error: something went wrong"));
        assert!(is_error_line("ERROR: something went wrong"));
        assert!(!is_error_line("Warning: something is odd"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    const PDFINFO_OUTPUT: &str = "\
Producer:       GPL Ghostscript 9.55
Tagged:         no
Pages:          2
Encrypted:      no
Page    1 size: 612 x 792 pts (letter)
Page    1 rot:  0
Page    2 size: 1190.55 x 1683.78 pts (A2)
Page    2 rot:  90
File size:      12345 bytes
PDF version:    1.4
";

    #[test]
    fn pdfinfo_output_is_parsed() {
        let info = parse_pdfinfo(PDFINFO_OUTPUT).unwrap();
        assert_eq!(info.page_count, 2);
        assert_eq!(info.page_sizes, [(612.0, 792.0), (1190.55, 1683.78)]);
        let err = parse_pdfinfo("Producer: nobody\n").unwrap_err();
        assert!(matches!(err, OcrError::UnsupportedFormat(_)), "{err:?}");
    }

    #[test]
    fn limits_are_checked_before_rasterizing() {
        let info = parse_pdfinfo(PDFINFO_OUTPUT).unwrap();
        info.check_limits(&NormalizeOptions::default()).unwrap();

        // Letter at 300 DPI is 2550x3300, but A2 is about 4961x7016.
        let opts = NormalizeOptions {
            max_page_pixels: 10_000_000,
            ..NormalizeOptions::default()
        };
        let err = info.check_limits(&opts).unwrap_err();
        assert!(
            matches!(&err, OcrError::PageLimitExceeded(msg) if msg.starts_with("page 1 ")),
            "{err:?}"
        );

        let opts = NormalizeOptions {
            max_pages: 1,
            ..NormalizeOptions::default()
        };
        let err = info.check_limits(&opts).unwrap_err();
        assert!(matches!(err, OcrError::PageLimitExceeded(_)), "{err:?}");
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn corrupt_pdf_is_unsupported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.pdf");
        std::fs::write(&path, b"%PDF-1.4\nnot really a pdf")?;
        let err = get_pdf_info(&path, 10).await.unwrap_err();
        assert!(matches!(err, OcrError::UnsupportedFormat(_)), "{err:?}");
        Ok(())
    }
}
