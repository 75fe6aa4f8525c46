//! The `ocr` subcommand.

use std::sync::{Arc, Mutex};

use clap::Args;
use futures::StreamExt as _;
use schemars::JsonSchema;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::AggregatedResult,
    async_utils::io::{count_jsonl_or_csv_records, read_jsonl_or_csv, write_output},
    cmd::StreamOpts,
    config::{ConfigOpts, LanguageSet, PipelineConfig, PreprocessOverrides, RunOverrides},
    document::Document,
    error::{ErrorReport, OcrError, OcrResult},
    markers::{MarkerKind, MarkerResult},
    pipeline::Pipeline,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Input JSONL or CSV file, with `id` and `path` fields. Defaults to
    /// standard input.
    pub input_path: Option<PathBuf>,

    /// Output file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Extract a lab marker from each recognized document.
    #[clap(long, value_enum)]
    pub marker: Option<MarkerKind>,

    #[clap(flatten)]
    pub config_opts: ConfigOpts,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,
}

/// An input record naming a document to OCR.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct OcrInput {
    /// The unique ID of this record. Copied to the output.
    pub id: Value,

    /// The document to OCR.
    pub path: PathBuf,

    /// The MIME type of the document. Detected from its contents if missing.
    #[serde(default)]
    pub mime_type: Option<String>,

    /// Languages for this document, highest priority first.
    #[serde(default)]
    pub languages: Option<LanguageSet>,

    /// Preprocessing overrides for this document.
    #[serde(default)]
    pub preprocess: Option<PreprocessOverrides>,
}

impl OcrInput {
    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            languages: self.languages.clone(),
            preprocess: self.preprocess.clone(),
        }
    }
}

/// Output status of a document.
#[derive(Clone, Copy, Debug, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    /// Every page was recognized, or was legitimately blank.
    Ok,

    /// Some pages failed. They are marked in the result.
    Incomplete,

    /// The document could not be processed.
    Failed,

    /// The run was interrupted.
    Cancelled,
}

/// An output record describing an OCRed document.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct OcrOutput {
    /// The ID of the input record.
    pub id: Value,

    /// What is the status of this document?
    pub status: OcrStatus,

    /// Any errors that occurred during processing, including failed pages.
    pub errors: Vec<ErrorReport>,

    /// The input path.
    pub path: PathBuf,

    /// Per-page results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AggregatedResult>,

    /// The text of the document. Pages which could not be recognized are
    /// replaced by `**COULD_NOT_OCR_PAGE**`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,

    /// The requested lab marker, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<MarkerResult>,
}

impl OcrOutput {
    /// Build an output record from the outcome of a run.
    fn from_run(
        input: OcrInput,
        result: OcrResult<AggregatedResult>,
        marker: Option<MarkerKind>,
    ) -> Self {
        let OcrInput { id, path, .. } = input;
        match result {
            Ok(aggregated) => {
                let errors = aggregated
                    .pages
                    .iter()
                    .filter_map(|page| {
                        let failure = page.failure.as_ref()?;
                        Some(ErrorReport {
                            kind: failure.kind,
                            message: format!("page {}: {}", page.index + 1, failure.message),
                        })
                    })
                    .collect::<Vec<_>>();
                let status = if errors.is_empty() {
                    OcrStatus::Ok
                } else {
                    OcrStatus::Incomplete
                };
                Self {
                    id,
                    status,
                    errors,
                    path,
                    raw_text: Some(aggregated.raw_text()),
                    marker: marker.map(|kind| kind.extract(&aggregated)),
                    result: Some(aggregated),
                }
            }
            Err(err) => Self {
                id,
                status: if matches!(err, OcrError::Cancelled) {
                    OcrStatus::Cancelled
                } else {
                    OcrStatus::Failed
                },
                errors: vec![err.to_report()],
                path,
                result: None,
                raw_text: None,
                marker: None,
            },
        }
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let config = PipelineConfig::load(&opts.config_opts).await?;
    let pipeline = Pipeline::from_config(config)?;

    // Count our input records, if we can, so we can show a real progress bar.
    let record_count = match &opts.input_path {
        Some(path) => count_jsonl_or_csv_records(&ui, path).await?,
        None => None,
    };
    let pb = ui.new_from_len(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing documents",
            done_msg: "OCRed documents",
        },
        opts.stream_opts.limit_len(record_count),
    );

    // On Ctrl-C, cancel everything in flight and skip everything else.
    let shutdown = CancellationToken::new();
    let interrupt_watcher = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling in-flight documents");
                shutdown.cancel();
            }
        }
    });

    let input = read_jsonl_or_csv::<OcrInput>(opts.input_path.as_deref()).await?;
    let input = opts.stream_opts.apply_stream_input_opts(input);
    let marker = opts.marker;
    let output = input
        .map(move |record| {
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            async move {
                let record = record?;
                Ok::<_, anyhow::Error>(ocr_document(&pipeline, record, marker, &shutdown).await)
            }
        })
        .buffered(opts.stream_opts.job_count())
        .boxed();
    let output = pb.wrap_stream(output);

    let counters = Arc::new(Mutex::new(OutputCounters::default()));
    let output = {
        let counters = counters.clone();
        output
            .map(move |output: Result<OcrOutput>| -> Result<OcrOutput> {
                let output = output?;
                counters.update(&output);
                Ok(output)
            })
            .boxed()
    };
    let written = write_output(opts.output_path.as_deref(), output).await;
    interrupt_watcher.abort();
    written?;
    counters.finish(&ui, opts.stream_opts.allowed_failure_rate)
}

/// Run one document through the pipeline.
#[instrument(level = "debug", skip_all, fields(id = %input.id))]
async fn ocr_document(
    pipeline: &Pipeline,
    input: OcrInput,
    marker: Option<MarkerKind>,
    shutdown: &CancellationToken,
) -> OcrOutput {
    if shutdown.is_cancelled() {
        return OcrOutput::from_run(input, Err(OcrError::Cancelled), marker);
    }

    let options = pipeline.config().run_options(&input.overrides());
    let document = Document::from_path(&input.path, input.mime_type.clone());
    let handle = pipeline.submit(document, options);
    let run_id = handle.id();
    debug!(%run_id, path = ?input.path, state = ?handle.status().state, "Submitted document");

    let run_token = handle.cancellation_token();
    let join = handle.join();
    tokio::pin!(join);
    let result = tokio::select! {
        result = &mut join => result,
        () = shutdown.cancelled() => {
            debug!(%run_id, "Cancelling run");
            run_token.cancel();
            join.await
        }
    };
    OcrOutput::from_run(input, result, marker)
}

/// Running totals for our output records.
#[derive(Clone, Debug, Default)]
struct OutputCounters {
    /// How many records did we process?
    total_record_count: usize,

    /// How many records failed or were cancelled?
    failure_count: usize,

    /// How many records were only partially recognized?
    incomplete_count: usize,

    /// How many pages failed in partially recognized records?
    failed_page_count: usize,
}

/// Counters are shared with the output stream, so we put the methods on the
/// `Mutex` itself.
trait OutputCounterExt {
    /// Update counters for an output record.
    fn update(&self, output: &OcrOutput);

    /// Report totals to the user, and fail if too many records failed.
    fn finish(self: Arc<Self>, ui: &Ui, allowed_failure_rate: f32) -> Result<()>;
}

impl OutputCounterExt for Mutex<OutputCounters> {
    fn update(&self, output: &OcrOutput) {
        // Hold a sync lock, but just for an instant to update counters.
        let mut counters = self.lock().expect("lock poisoned");
        counters.total_record_count += 1;
        match output.status {
            OcrStatus::Ok => {}
            OcrStatus::Incomplete => {
                counters.incomplete_count += 1;
                counters.failed_page_count += output.errors.len();
            }
            OcrStatus::Failed | OcrStatus::Cancelled => counters.failure_count += 1,
        }
    }

    fn finish(self: Arc<Self>, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        let counters = self.lock().expect("lock poisoned").to_owned();
        if counters.total_record_count == 0 {
            return Ok(());
        }
        let failure_rate =
            counters.failure_count as f32 / counters.total_record_count as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of documents failed, but only {:.2}% were allowed",
                counters.failure_count,
                counters.total_record_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            if counters.incomplete_count > 0 {
                ui.display_message(
                    "⚠️",
                    &format!(
                        "{} documents were incomplete ({} pages could not be recognized)",
                        counters.incomplete_count, counters.failed_page_count
                    ),
                );
            }
            if counters.failure_count > 0 {
                ui.display_message(
                    "❌",
                    &format!("{} documents could not be processed", counters.failure_count),
                );
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::{
        aggregate::PageResult,
        error::ErrorKind,
        recognize::tests::block,
    };

    use super::*;

    fn input() -> OcrInput {
        serde_json::from_value(serde_json::json!({
            "id": 7,
            "path": "scan.pdf",
            "languages": "eng",
            "preprocess": { "deskew": false },
        }))
        .unwrap()
    }

    fn output_with_status(status: OcrStatus) -> OcrOutput {
        OcrOutput::from_run(
            input(),
            match status {
                OcrStatus::Cancelled => Err(OcrError::Cancelled),
                _ => Err(OcrError::NoRecognizableContent),
            },
            None,
        )
    }

    #[test]
    fn input_records_carry_overrides() {
        let overrides = input().overrides();
        assert_eq!(overrides.languages, Some(LanguageSet::single("eng")));
        assert_eq!(overrides.preprocess.unwrap().deskew, Some(false));
    }

    #[test]
    fn partial_results_are_incomplete() {
        let aggregated = AggregatedResult {
            document_id: Uuid::nil(),
            pages: vec![
                PageResult::recognized(
                    0,
                    vec![block("TSH", 0.9, 0, 0, 30, 10), block("2,35", 0.8, 100, 0, 40, 10)],
                ),
                PageResult::failed(
                    1,
                    OcrError::EngineTimeout(std::time::Duration::from_secs(60)).to_report(),
                ),
            ],
        };
        let output = OcrOutput::from_run(input(), Ok(aggregated), Some(MarkerKind::Tsh));
        assert_eq!(output.status, OcrStatus::Incomplete);
        assert_eq!(output.errors.len(), 1);
        assert_eq!(output.errors[0].kind, ErrorKind::EngineTimeout);
        assert!(output.errors[0].message.starts_with("page 2: "));
        assert_eq!(
            output.raw_text.as_deref(),
            Some("TSH\n2,35\n\n**COULD_NOT_OCR_PAGE**")
        );
        assert_eq!(output.marker.unwrap().value, Some(2.35));

        let json = serde_json::to_value(output_with_status(OcrStatus::Failed)).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["errors"][0]["kind"], "no_recognizable_content");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn failure_rate_is_enforced() {
        let ui = Ui::init_for_tests();
        let counters = Arc::new(Mutex::new(OutputCounters::default()));
        counters.update(&output_with_status(OcrStatus::Failed));
        for _ in 0..3 {
            counters.update(&output_with_status(OcrStatus::Cancelled));
        }
        assert_eq!(counters.lock().unwrap().failure_count, 4);
        assert!(counters.clone().finish(&ui, 0.5).is_err());
        assert!(counters.finish(&ui, 1.0).is_ok());
    }
}
