//! Recognition using the `tesseract` CLI tool.
//!
//! We ask for TSV output, which reports every word with its bounding box and
//! confidence, and group words back into lines.

use std::{collections::BTreeMap, process::Output};

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    error::{OcrError, OcrResult},
    prelude::*,
};

use super::{BoundingBox, EngineRequest, RecognitionEngine, TextBlock, Word};

/// The command to run. Can be overridden with `TESSERACT_CMD`.
fn tesseract_command() -> String {
    std::env::var("TESSERACT_CMD").unwrap_or_else(|_| "tesseract".to_owned())
}

/// Engine wrapping the `tesseract` CLI tool.
#[derive(Debug)]
pub struct TesseractEngine {
    psm: u8,
}

impl TesseractEngine {
    /// Create a new `tesseract` engine using the given page segmentation
    /// mode.
    pub fn new(psm: u8) -> Self {
        Self { psm }
    }
}

#[async_trait]
impl RecognitionEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn supports_combined_languages(&self) -> bool {
        true
    }

    #[instrument(level = "debug", skip_all, fields(page = request.page_index, languages = %request.languages))]
    async fn recognize(&self, request: EngineRequest<'_>) -> OcrResult<Vec<TextBlock>> {
        let input_path = request.scratch_dir.join("input.png");
        tokio::fs::write(&input_path, request.png)
            .await
            .context("cannot write tesseract input file")?;

        // If we time out, our caller drops this future, and `kill_on_drop`
        // takes care of the process.
        let output = Command::new(tesseract_command())
            .arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(request.languages.to_string())
            .arg("--psm")
            .arg(self.psm.to_string())
            .arg("--dpi")
            .arg(request.dpi.to_string())
            .arg("tsv")
            .current_dir(request.scratch_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| OcrError::EngineCrash(format!("cannot run tesseract: {err}")))?;
        check_tesseract_output(&output)?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        let blocks = parse_tsv(&tsv)?;
        trace!(block_count = blocks.len(), "Parsed tesseract output");
        Ok(blocks)
    }
}

/// Any abnormal exit counts as a crash.
fn check_tesseract_output(output: &Output) -> OcrResult<()> {
    check_for_command_failure("tesseract", output, None)
        .map_err(|err| OcrError::EngineCrash(format!("{err:#}")))
}

/// One word row from tesseract's TSV output.
struct TsvWord {
    line_key: (u32, u32, u32, u32),
    word: Word,
}

/// Parse a single TSV row. Returns `None` for rows which aren't words.
fn parse_row(line: &str) -> Result<Option<TsvWord>> {
    let fields = line.splitn(12, '\t').collect::<Vec<_>>();
    if fields.len() < 11 {
        return Err(anyhow!("expected 12 TSV fields, found {}", fields.len()));
    }
    let num = |idx: usize| -> Result<u32> {
        fields[idx]
            .trim()
            .parse::<u32>()
            .with_context(|| format!("bad TSV field {idx}: {:?}", fields[idx]))
    };
    if num(0)? != 5 {
        return Ok(None);
    }
    let text = fields.get(11).map(|t| t.trim()).unwrap_or_default();
    let conf = fields[10]
        .trim()
        .parse::<f32>()
        .with_context(|| format!("bad TSV confidence: {:?}", fields[10]))?;
    if text.is_empty() || conf < 0.0 {
        return Ok(None);
    }
    Ok(Some(TsvWord {
        line_key: (num(1)?, num(2)?, num(3)?, num(4)?),
        word: Word {
            text: text.to_owned(),
            confidence: (conf / 100.0).clamp(0.0, 1.0),
            bbox: BoundingBox {
                x: num(6)?,
                y: num(7)?,
                width: num(8)?,
                height: num(9)?,
            },
        },
    }))
}

/// Parse `tesseract ... tsv` output into one block per line.
pub fn parse_tsv(tsv: &str) -> OcrResult<Vec<TextBlock>> {
    let mut lines: BTreeMap<(u32, u32, u32, u32), Vec<Word>> = BTreeMap::new();
    for (line_no, line) in tsv.lines().enumerate() {
        if line_no == 0 && line.starts_with("level") {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let row = parse_row(line).map_err(|err| {
            OcrError::EngineCrash(format!("unreadable tesseract output line {}: {err:#}", line_no + 1))
        })?;
        if let Some(row) = row {
            lines.entry(row.line_key).or_default().push(row.word);
        }
    }

    Ok(lines
        .into_values()
        .filter_map(|mut words| {
            words.sort_by_key(|w| w.bbox.x);
            let first = words.first()?;
            let bbox = words
                .iter()
                .skip(1)
                .fold(first.bbox, |acc, w| acc.union(&w.bbox));
            let text = words
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let confidence =
                words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32;
            Some(TextBlock {
                text,
                confidence,
                bbox,
                words,
            })
        })
        .collect())
}

/// List the languages installed for tesseract.
pub async fn list_languages() -> Result<Vec<String>> {
    let output = Command::new(tesseract_command())
        .arg("--list-langs")
        .kill_on_drop(true)
        .output()
        .await
        .context("cannot run tesseract (is it installed?)")?;
    check_for_command_failure("tesseract", &output, None)?;
    // Older versions print the list on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let listing = if stdout.trim().is_empty() { stderr } else { stdout };
    Ok(parse_language_list(&listing))
}

/// Parse the output of `tesseract --list-langs`.
fn parse_language_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of available"))
        .map(str::to_owned)
        .collect()
}
