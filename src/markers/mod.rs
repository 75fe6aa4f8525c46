//! Extraction of lab markers from recognized documents.
//!
//! This runs after the pipeline, on the [`AggregatedResult`], and uses the
//! positions of recognized words to read values out of tabular lab reports.

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{aggregate::AggregatedResult, prelude::*};

mod tsh;

/// Which marker should we look for?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// Thyroid-stimulating hormone.
    Tsh,
}

impl MarkerKind {
    /// Look for this marker in a recognized document.
    #[instrument(level = "debug", skip_all, fields(marker = ?self))]
    pub fn extract(self, result: &AggregatedResult) -> MarkerResult {
        let raw_text = result.raw_text();
        if raw_text.trim().is_empty() {
            return MarkerResult::not_found(self, MarkerError::OcrEmptyText);
        }
        let pages = result
            .pages
            .iter()
            .map(WordBox::from_page)
            .collect::<Vec<_>>();
        match self {
            MarkerKind::Tsh => tsh::extract_tsh(&raw_text, &pages),
        }
    }
}

/// How sure are we about a marker value?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerConfidence {
    Low,
    /// We found a value, but no unit.
    Medium,
    /// We found a value and a unit.
    High,
}

/// Why we could not report a marker.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerError {
    /// The document contains no text at all.
    OcrEmptyText,
    /// No plausible TSH value was found.
    TshNotFound,
}

/// A marker extracted from a document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct MarkerResult {
    pub marker: MarkerKind,

    /// Did we find a value?
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    /// Normalized unit, such as `mUI/L`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Lower bound of the reference interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_min: Option<f64>,

    /// Upper bound of the reference interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_max: Option<f64>,

    pub confidence: MarkerConfidence,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MarkerError>,
}

impl MarkerResult {
    fn not_found(marker: MarkerKind, error: MarkerError) -> Self {
        Self {
            marker,
            ok: false,
            value: None,
            unit: None,
            ref_min: None,
            ref_max: None,
            confidence: MarkerConfidence::Low,
            error: Some(error),
        }
    }
}

/// A word and its top-left corner.
#[derive(Clone, Debug, PartialEq)]
struct WordBox {
    text: String,
    left: u32,
    top: u32,
}

impl WordBox {
    /// All the words on a page. Blocks without word detail count as one word.
    fn from_page(page: &crate::aggregate::PageResult) -> Vec<WordBox> {
        page.blocks
            .iter()
            .flat_map(|block| {
                if block.words.is_empty() {
                    vec![WordBox {
                        text: block.text.clone(),
                        left: block.bbox.x,
                        top: block.bbox.y,
                    }]
                } else {
                    block
                        .words
                        .iter()
                        .map(|word| WordBox {
                            text: word.text.clone(),
                            left: word.bbox.x,
                            top: word.bbox.y,
                        })
                        .collect()
                }
            })
            .filter(|word| !word.text.trim().is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::aggregate::{PageResult, PageStatus};

    use super::*;

    #[test]
    fn empty_documents_report_empty_text() {
        let result = AggregatedResult {
            document_id: Uuid::nil(),
            pages: vec![PageResult::empty(0)],
        };
        assert_eq!(result.pages[0].status, PageStatus::Empty);
        let marker = MarkerKind::Tsh.extract(&result);
        assert!(!marker.ok);
        assert_eq!(marker.error, Some(MarkerError::OcrEmptyText));
        assert_eq!(
            serde_json::to_value(&marker).unwrap()["error"],
            "OCR_EMPTY_TEXT"
        );
    }
}
