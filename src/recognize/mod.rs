//! Recognition engines, and the adapter which runs them on preprocessed pages.
//!
//! An engine is anything that can turn a page image into text blocks. The
//! [`Recognizer`] wraps an engine with a per-page deadline, scoped scratch
//! storage, and our multi-language strategy: a single combined pass when the
//! engine supports it, or one pass per language otherwise.

use std::{cmp::Ordering, sync::Arc, time::Duration};

use schemars::JsonSchema;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{EngineKind, LanguageSet, RecognitionOptions},
    error::{OcrError, OcrResult},
    preprocess::PreprocessedPage,
    prelude::*,
};

pub mod echo;
pub mod tesseract;

/// A rectangle in page-pixel coordinates.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Area shared with `other`.
    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let w = self.right().min(other.right()).saturating_sub(self.x.max(other.x));
        let h = self.bottom().min(other.bottom()).saturating_sub(self.y.max(other.y));
        u64::from(w) * u64::from(h)
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BoundingBox {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    /// Vertical center, doubled to stay in integers.
    fn center_y2(&self) -> u64 {
        u64::from(self.y) * 2 + u64::from(self.height)
    }
}

/// A single recognized word.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Word {
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// A recognized region of text, usually a line.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TextBlock {
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Individual words, if the engine reports them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<Word>,
}

impl TextBlock {
    /// A total order on blocks by position, with content as a tie-breaker.
    fn position_cmp(&self, other: &TextBlock) -> Ordering {
        (self.bbox.y, self.bbox.x, self.bbox.height, self.bbox.width)
            .cmp(&(other.bbox.y, other.bbox.x, other.bbox.height, other.bbox.width))
            .then_with(|| self.text.cmp(&other.text))
            .then_with(|| self.confidence.total_cmp(&other.confidence))
    }
}

/// Sort blocks into reading order: top-to-bottom, then left-to-right.
///
/// Blocks whose vertical centers fall inside the band of the line being built
/// are treated as one line, so slightly ragged baselines still read left to
/// right. The result doesn't depend on the input order.
pub fn sort_reading_order(blocks: &mut Vec<TextBlock>) {
    blocks.sort_by(TextBlock::position_cmp);

    let mut lines: Vec<Vec<TextBlock>> = vec![];
    let mut band: Option<(u64, u64)> = None;
    for block in blocks.drain(..) {
        let center = block.bbox.center_y2();
        match (&mut band, lines.last_mut()) {
            (Some((top, bottom)), Some(line)) if center >= *top && center <= *bottom => {
                *bottom = (*bottom).max(u64::from(block.bbox.bottom()) * 2);
                line.push(block);
            }
            _ => {
                band = Some((
                    u64::from(block.bbox.y) * 2,
                    u64::from(block.bbox.bottom()) * 2,
                ));
                lines.push(vec![block]);
            }
        }
    }
    for mut line in lines {
        line.sort_by(|a, b| a.bbox.x.cmp(&b.bbox.x).then_with(|| a.position_cmp(b)));
        blocks.extend(line);
    }
}

/// The output of one recognition pass over one page.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionResult {
    pub page_index: usize,
    /// The languages this pass was run with.
    pub languages: LanguageSet,
    /// Blocks in reading order.
    pub blocks: Vec<TextBlock>,
}

/// A request to recognize a single page.
#[derive(Clone, Copy, Debug)]
pub struct EngineRequest<'a> {
    pub page_index: usize,
    /// Grayscale PNG data.
    pub png: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub languages: &'a LanguageSet,
    /// A private directory for the engine's temporary files. It is deleted
    /// after the call, whatever the outcome.
    pub scratch_dir: &'a Path,
}

/// Interface to a text-recognition engine.
#[async_trait]
pub trait RecognitionEngine: Send + Sync + 'static {
    /// A short name, for logs.
    fn name(&self) -> &'static str;

    /// Can a single invocation handle several languages at once?
    fn supports_combined_languages(&self) -> bool;

    /// Recognize the text on a page. Blocks may be returned in any order.
    ///
    /// Engines should report abnormal termination as
    /// [`OcrError::EngineCrash`]. Deadlines are enforced by the caller.
    async fn recognize(&self, request: EngineRequest<'_>) -> OcrResult<Vec<TextBlock>>;
}

/// Create the configured engine.
pub fn engine_for(options: &RecognitionOptions) -> Arc<dyn RecognitionEngine> {
    match options.engine {
        EngineKind::Tesseract => Arc::new(tesseract::TesseractEngine::new(options.psm)),
        EngineKind::Echo => Arc::new(echo::EchoEngine),
    }
}

/// Apply a deadline to an engine call.
///
/// Dropping the engine future on timeout is how we give up on it. Engines
/// which run external processes must arrange for those to be killed on drop.
async fn apply_deadline<T>(
    deadline: Instant,
    timeout: Duration,
    future: impl Future<Output = OcrResult<T>>,
) -> OcrResult<T> {
    match time::timeout_at(deadline, future).await {
        Ok(result) => result,
        Err(_elapsed) => Err(OcrError::EngineTimeout(timeout)),
    }
}

/// Runs engines on preprocessed pages.
///
/// The engine itself is passed in on each call, because callers lease it
/// from an [`EnginePool`](crate::pipeline::pool::EnginePool).
#[derive(Clone, Debug)]
pub struct Recognizer {
    page_timeout: Duration,
    separate_language_passes: bool,
}

impl Recognizer {
    pub fn new(options: &RecognitionOptions) -> Self {
        Self {
            page_timeout: options.page_timeout(),
            separate_language_passes: options.separate_language_passes,
        }
    }

    /// Plan the passes needed for a language set.
    pub fn passes(
        &self,
        engine: &dyn RecognitionEngine,
        languages: &LanguageSet,
    ) -> Vec<LanguageSet> {
        if languages.len() > 1
            && (self.separate_language_passes || !engine.supports_combined_languages())
        {
            languages.split()
        } else {
            vec![languages.clone()]
        }
    }

    /// Recognize a page, returning one result per pass.
    ///
    /// All passes share one deadline, starting now. `cancel` is checked before
    /// each engine invocation, but never interrupts one.
    ///
    /// Fails with [`OcrError::EmptyResult`] if no pass found any text.
    #[instrument(level = "debug", skip_all, fields(page = page.index, engine = engine.name()))]
    pub async fn recognize(
        &self,
        engine: &dyn RecognitionEngine,
        page: &PreprocessedPage,
        languages: &LanguageSet,
        scratch_root: &Path,
        cancel: &CancellationToken,
    ) -> OcrResult<Vec<RecognitionResult>> {
        let deadline = Instant::now() + self.page_timeout;
        let mut results = vec![];
        for pass in self.passes(engine, languages) {
            if cancel.is_cancelled() {
                return Err(OcrError::Cancelled);
            }
            let scratch = tempfile::TempDir::with_prefix_in("engine-", scratch_root)
                .context("failed to create engine scratch directory")?;
            let request = EngineRequest {
                page_index: page.index,
                png: &page.png,
                width: page.width,
                height: page.height,
                dpi: page.dpi,
                languages: &pass,
                scratch_dir: scratch.path(),
            };
            let outcome =
                apply_deadline(deadline, self.page_timeout, engine.recognize(request)).await;
            if let Err(err) = scratch.close() {
                error!("failed to delete engine scratch directory: {err}");
            }
            let mut blocks = outcome?;
            blocks.retain(|block| !block.text.trim().is_empty());
            sort_reading_order(&mut blocks);
            debug!(languages = %pass, block_count = blocks.len(), "Recognition pass finished");
            results.push(RecognitionResult {
                page_index: page.index,
                languages: pass,
                blocks,
            });
        }
        if results.iter().all(|result| result.blocks.is_empty()) {
            return Err(OcrError::EmptyResult);
        }
        Ok(results)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn block(text: &str, confidence: f32, x: u32, y: u32, w: u32, h: u32) -> TextBlock {
        TextBlock {
            text: text.to_owned(),
            confidence,
            bbox: BoundingBox {
                x,
                y,
                width: w,
                height: h,
            },
            words: vec![],
        }
    }

    #[test]
    fn bounding_box_geometry() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        let b = BoundingBox { x: 5, y: 5, width: 10, height: 10 };
        let c = BoundingBox { x: 20, y: 0, width: 5, height: 5 };
        assert_eq!(a.intersection_area(&b), 25);
        assert_eq!(a.intersection_area(&c), 0);
        assert_eq!(a.union(&b), BoundingBox { x: 0, y: 0, width: 15, height: 15 });
    }

    #[test]
    fn reading_order_is_top_to_bottom_then_left_to_right() {
        let mut blocks = vec![
            block("world", 0.9, 120, 12, 80, 20),
            block("second", 0.9, 10, 60, 100, 20),
            block("hello", 0.9, 10, 10, 90, 20),
        ];
        sort_reading_order(&mut blocks);
        let texts = blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, ["hello", "world", "second"]);
    }

    #[test]
    fn reading_order_ignores_input_order() {
        let original = vec![
            block("c", 0.5, 300, 8, 50, 20),
            block("a", 0.5, 10, 10, 50, 20),
            block("b", 0.5, 150, 14, 50, 20),
            block("d", 0.5, 10, 100, 50, 20),
        ];
        let mut forward = original.clone();
        let mut backward = original.into_iter().rev().collect::<Vec<_>>();
        sort_reading_order(&mut forward);
        sort_reading_order(&mut backward);
        assert_eq!(forward, backward);
        let texts = forward.iter().map(|b| b.text.as_str()).collect::<String>();
        assert_eq!(texts, "abcd");
    }

    struct FixedEngine {
        combined: bool,
        blocks: Vec<TextBlock>,
        delay: Duration,
    }

    #[async_trait]
    impl RecognitionEngine for FixedEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn supports_combined_languages(&self) -> bool {
            self.combined
        }

        async fn recognize(&self, request: EngineRequest<'_>) -> OcrResult<Vec<TextBlock>> {
            assert!(request.scratch_dir.is_dir());
            time::sleep(self.delay).await;
            Ok(self.blocks.clone())
        }
    }

    fn page() -> PreprocessedPage {
        PreprocessedPage {
            index: 2,
            width: 100,
            height: 100,
            dpi: 300,
            png: vec![],
            transforms: vec![],
        }
    }

    /// Run `engine` on a test page.
    async fn run(
        engine: FixedEngine,
        timeout_secs: u64,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> OcrResult<Vec<RecognitionResult>> {
        let options = RecognitionOptions {
            page_timeout_secs: timeout_secs,
            ..RecognitionOptions::default()
        };
        Recognizer::new(&options)
            .recognize(&engine, &page(), &LanguageSet::default(), scratch, cancel)
            .await
    }

    #[tokio::test]
    async fn combined_engines_get_one_pass() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let engine = FixedEngine {
            combined: true,
            blocks: vec![block("Bonjour", 0.8, 0, 0, 10, 10)],
            delay: Duration::ZERO,
        };
        let results = run(engine, 5, scratch.path(), &CancellationToken::new()).await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].languages, LanguageSet::default());
        assert_eq!(results[0].page_index, 2);
        // Engine scratch directories are cleaned up.
        assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn single_language_engines_get_one_pass_per_language() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let engine = FixedEngine {
            combined: false,
            blocks: vec![block("Hello", 0.8, 0, 0, 10, 10)],
            delay: Duration::ZERO,
        };
        let results = run(engine, 5, scratch.path(), &CancellationToken::new()).await?;
        let passes = results
            .iter()
            .map(|r| r.languages.to_string())
            .collect::<Vec<_>>();
        assert_eq!(passes, ["fra", "eng"]);
        Ok(())
    }

    #[test]
    fn separate_passes_can_be_forced() {
        let options = RecognitionOptions {
            separate_language_passes: true,
            ..RecognitionOptions::default()
        };
        let engine = FixedEngine {
            combined: true,
            blocks: vec![],
            delay: Duration::ZERO,
        };
        let recognizer = Recognizer::new(&options);
        assert_eq!(recognizer.passes(&engine, &LanguageSet::default()).len(), 2);
        assert_eq!(recognizer.passes(&engine, &LanguageSet::single("eng")).len(), 1);
    }

    #[tokio::test]
    async fn blank_output_is_an_empty_result() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let engine = FixedEngine {
            combined: true,
            blocks: vec![block("  ", 0.8, 0, 0, 10, 10)],
            delay: Duration::ZERO,
        };
        let err = run(engine, 5, scratch.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::EmptyResult), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn slow_engines_time_out() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let engine = FixedEngine {
            combined: true,
            blocks: vec![block("late", 0.8, 0, 0, 10, 10)],
            delay: Duration::from_secs(10),
        };
        let err = run(engine, 1, scratch.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::EngineTimeout(_)), "{err:?}");
        assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_before_start_never_calls_engine() -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let engine = FixedEngine {
            combined: true,
            blocks: vec![],
            delay: Duration::ZERO,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run(engine, 5, scratch.path(), &cancel).await.unwrap_err();
        assert!(matches!(err, OcrError::Cancelled));
        Ok(())
    }
}
