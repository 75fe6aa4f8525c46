//! Merging per-language recognition passes into page and document results.
//!
//! Everything here is pure: no I/O, and the same inputs always produce the
//! same output, whatever order the passes arrive in.

use std::cmp::Ordering;

use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    config::{LanguageSet, MergePolicy, MergeStrategy},
    error::PageFailure,
    prelude::*,
    recognize::{RecognitionResult, TextBlock, sort_reading_order},
};

/// Placeholder used in full text for pages we could not recognize.
pub const COULD_NOT_OCR_PAGE: &str = "**COULD_NOT_OCR_PAGE**";

/// What happened to a page?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Text was found.
    Recognized,
    /// The engine ran, but found no text. Not a failure.
    Empty,
    /// The page could not be recognized. See `failure`.
    Failed,
}

/// The final result for one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageResult {
    /// 0-based page index.
    pub index: usize,

    pub status: PageStatus,

    /// Why the page failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PageFailure>,

    /// Mean of the block confidences, or 0 if there are no blocks.
    pub confidence: f32,

    /// Block texts, one per line, in reading order.
    pub text: String,

    /// Retained text blocks, in reading order.
    pub blocks: Vec<TextBlock>,
}

impl PageResult {
    /// A page with text.
    pub fn recognized(index: usize, blocks: Vec<TextBlock>) -> Self {
        if blocks.is_empty() {
            return Self::empty(index);
        }
        let confidence =
            blocks.iter().map(|b| b.confidence).sum::<f32>() / blocks.len() as f32;
        let text = blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            index,
            status: PageStatus::Recognized,
            failure: None,
            confidence,
            text,
            blocks,
        }
    }

    /// A blank page.
    pub fn empty(index: usize) -> Self {
        Self {
            index,
            status: PageStatus::Empty,
            failure: None,
            confidence: 0.0,
            text: String::new(),
            blocks: vec![],
        }
    }

    /// A page we could not recognize.
    pub fn failed(index: usize, failure: PageFailure) -> Self {
        Self {
            index,
            status: PageStatus::Failed,
            failure: Some(failure),
            confidence: 0.0,
            text: String::new(),
            blocks: vec![],
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == PageStatus::Failed
    }
}

/// The document-level result.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct AggregatedResult {
    /// The document we processed.
    pub document_id: Uuid,

    /// Page results, in input page order.
    pub pages: Vec<PageResult>,
}

impl AggregatedResult {
    /// How many pages failed?
    pub fn failed_page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_failed()).count()
    }

    /// The full text of the document. Pages are separated by a blank line,
    /// and failed pages are replaced by [`COULD_NOT_OCR_PAGE`].
    pub fn raw_text(&self) -> String {
        self.pages
            .iter()
            .map(|page| match page.status {
                PageStatus::Failed => COULD_NOT_OCR_PAGE,
                _ => page.text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// A block from one pass, competing to be kept.
struct Candidate<'a> {
    block: &'a TextBlock,
    /// Identifies the pass. Blocks from the same pass never compete.
    pass: String,
    rank: usize,
}

impl Candidate<'_> {
    /// Order candidates best-first under `strategy`. The trailing keys make
    /// this a total order, so input order never matters.
    fn priority_cmp(&self, other: &Candidate<'_>, strategy: MergeStrategy) -> Ordering {
        let by_confidence = other.block.confidence.total_cmp(&self.block.confidence);
        let by_rank = self.rank.cmp(&other.rank);
        let primary = match strategy {
            MergeStrategy::HighestConfidence => by_confidence.then(by_rank),
            MergeStrategy::LanguagePriority => by_rank.then(by_confidence),
        };
        primary
            .then_with(|| self.block.bbox.y.cmp(&other.block.bbox.y))
            .then_with(|| self.block.bbox.x.cmp(&other.block.bbox.x))
            .then_with(|| self.block.text.cmp(&other.block.text))
            .then_with(|| self.pass.cmp(&other.pass))
    }

    /// Do these candidates claim the same region?
    fn overlaps(&self, other: &Candidate<'_>, threshold: f32) -> bool {
        let a = &self.block.bbox;
        let b = &other.block.bbox;
        let smaller = a.area().min(b.area());
        if smaller == 0 {
            return false;
        }
        let shared = a.intersection_area(b);
        shared > 0 && shared as f64 / smaller as f64 >= f64::from(threshold)
    }
}

/// Merge the recognition passes for one page into a single page result.
///
/// A single pass is returned as-is. With several passes, overlapping blocks
/// from different passes compete, and the winner is chosen by
/// `policy.strategy`, with `languages` supplying the priority order. Blocks
/// that overlap nothing from another pass are all kept.
#[instrument(level = "debug", skip_all, fields(page = index, passes = results.len()))]
pub fn aggregate(
    index: usize,
    results: &[RecognitionResult],
    policy: &MergePolicy,
    languages: &LanguageSet,
) -> PageResult {
    if let [single] = results {
        return PageResult::recognized(index, single.blocks.clone());
    }

    let mut candidates = results
        .iter()
        .flat_map(|result| {
            let pass = result.languages.to_string();
            let rank = languages.rank(result.languages.primary());
            result.blocks.iter().map(move |block| Candidate {
                block,
                pass: pass.clone(),
                rank,
            })
        })
        .collect::<Vec<_>>();
    candidates.sort_by(|a, b| a.priority_cmp(b, policy.strategy));

    let mut accepted: Vec<Candidate<'_>> = vec![];
    for candidate in candidates {
        let beaten = accepted.iter().any(|kept| {
            kept.pass != candidate.pass && kept.overlaps(&candidate, policy.overlap_threshold)
        });
        if beaten {
            trace!(text = %candidate.block.text, "Dropping overlapped block");
        } else {
            accepted.push(candidate);
        }
    }

    let mut blocks = accepted
        .into_iter()
        .map(|candidate| candidate.block.clone())
        .collect::<Vec<_>>();
    sort_reading_order(&mut blocks);
    PageResult::recognized(index, blocks)
}

#[cfg(test)]
mod tests {
    use crate::{
        error::{ErrorKind, ErrorReport},
        recognize::tests::block,
    };

    use super::*;

    fn pass(lang: &str, blocks: Vec<TextBlock>) -> RecognitionResult {
        RecognitionResult {
            page_index: 0,
            languages: LanguageSet::single(lang),
            blocks,
        }
    }

    fn texts(page: &PageResult) -> Vec<&str> {
        page.blocks.iter().map(|b| b.text.as_str()).collect()
    }

    fn two_passes() -> Vec<RecognitionResult> {
        vec![
            pass(
                "fra",
                vec![
                    block("Résultat", 0.92, 10, 10, 100, 20),
                    block("Thyréostimuline", 0.60, 10, 50, 200, 20),
                ],
            ),
            pass(
                "eng",
                vec![
                    block("Resultat", 0.80, 12, 11, 98, 20),
                    block("Thyreostimulin", 0.75, 10, 50, 200, 20),
                    block("Page 1", 0.99, 400, 700, 60, 15),
                ],
            ),
        ]
    }

    #[test]
    fn overlapping_blocks_keep_the_most_confident() {
        let page = aggregate(0, &two_passes(), &MergePolicy::default(), &LanguageSet::default());
        assert_eq!(page.status, PageStatus::Recognized);
        assert_eq!(texts(&page), ["Résultat", "Thyreostimulin", "Page 1"]);
        assert!((page.confidence - (0.92 + 0.75 + 0.99) / 3.0).abs() < 1e-5);
        assert_eq!(page.text, "Résultat\nThyreostimulin\nPage 1");
    }

    #[test]
    fn language_priority_strategy_prefers_primary_language() {
        let policy = MergePolicy {
            strategy: MergeStrategy::LanguagePriority,
            ..MergePolicy::default()
        };
        let page = aggregate(0, &two_passes(), &policy, &LanguageSet::default());
        assert_eq!(texts(&page), ["Résultat", "Thyréostimuline", "Page 1"]);
    }

    #[test]
    fn confidence_ties_go_to_the_primary_language() {
        let results = vec![
            pass("eng", vec![block("Hello", 0.8, 0, 0, 50, 20)]),
            pass("fra", vec![block("Allo", 0.8, 0, 0, 50, 20)]),
        ];
        let page = aggregate(0, &results, &MergePolicy::default(), &LanguageSet::default());
        assert_eq!(texts(&page), ["Allo"]);

        let eng_first: LanguageSet = "eng+fra".parse().unwrap();
        let page = aggregate(0, &results, &MergePolicy::default(), &eng_first);
        assert_eq!(texts(&page), ["Hello"]);
    }

    #[test]
    fn merge_ignores_pass_order() {
        let forward = two_passes();
        let backward = forward.iter().cloned().rev().collect::<Vec<_>>();
        for strategy in [MergeStrategy::HighestConfidence, MergeStrategy::LanguagePriority] {
            let policy = MergePolicy {
                strategy,
                ..MergePolicy::default()
            };
            let langs = LanguageSet::default();
            assert_eq!(
                aggregate(0, &forward, &policy, &langs),
                aggregate(0, &backward, &policy, &langs),
            );
        }
    }

    #[test]
    fn disjoint_blocks_are_all_kept() {
        let results = vec![
            pass("fra", vec![block("gauche", 0.5, 0, 0, 50, 20)]),
            pass("eng", vec![block("right", 0.9, 200, 0, 50, 20)]),
        ];
        let page = aggregate(0, &results, &MergePolicy::default(), &LanguageSet::default());
        assert_eq!(texts(&page), ["gauche", "right"]);
    }

    #[test]
    fn same_pass_blocks_never_compete() {
        let results = vec![
            pass(
                "fra",
                vec![
                    block("un", 0.5, 0, 0, 50, 20),
                    block("deux", 0.9, 0, 5, 50, 20),
                ],
            ),
            pass("eng", vec![]),
        ];
        let page = aggregate(0, &results, &MergePolicy::default(), &LanguageSet::default());
        assert_eq!(page.blocks.len(), 2);
    }

    #[test]
    fn single_pass_is_unchanged() {
        let blocks = vec![
            block("first", 0.7, 0, 0, 50, 20),
            block("second", 0.9, 0, 40, 50, 20),
        ];
        let results = vec![pass("eng", blocks.clone())];
        let page = aggregate(3, &results, &MergePolicy::default(), &LanguageSet::single("eng"));
        assert_eq!(page.index, 3);
        assert_eq!(page.blocks, blocks);
    }

    #[test]
    fn no_blocks_means_empty_page_with_zero_confidence() {
        let results = vec![pass("fra", vec![]), pass("eng", vec![])];
        let page = aggregate(0, &results, &MergePolicy::default(), &LanguageSet::default());
        assert_eq!(page.status, PageStatus::Empty);
        assert_eq!(page.confidence, 0.0);
    }

    #[test]
    fn raw_text_marks_failed_pages() {
        let result = AggregatedResult {
            document_id: Uuid::nil(),
            pages: vec![
                PageResult::recognized(0, vec![block("one", 0.9, 0, 0, 10, 10)]),
                PageResult::failed(
                    1,
                    ErrorReport {
                        kind: ErrorKind::EngineCrash,
                        message: "boom".to_owned(),
                    },
                ),
                PageResult::empty(2),
            ],
        };
        assert_eq!(result.raw_text(), format!("one\n\n{COULD_NOT_OCR_PAGE}\n\n"));
        assert_eq!(result.failed_page_count(), 1);
    }
}
