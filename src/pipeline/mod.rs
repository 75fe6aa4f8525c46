//! The pipeline coordinator.
//!
//! Callers [`Pipeline::submit`] a document and get back a [`RunHandle`], which
//! they can [`join`](RunHandle::join) or [`cancel`](RunHandle::cancel). Each run
//! normalizes its document, then fans its pages out to a [`WorkerPool`] shared
//! by all runs, and reassembles the results in page order.
//!
//! Cancellation is cooperative. Page tasks check for it before preprocessing
//! and before each engine invocation, but an engine call which has already
//! started is allowed to finish or to hit its deadline. So the worst-case
//! latency of a cancellation is one page's recognition deadline.

use std::{
    panic,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use futures::{FutureExt as _, future};
use keen_retry::{ExponentialJitter, ResolvedResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    aggregate::{AggregatedResult, PageResult, PageStatus, aggregate},
    async_utils::spawn_blocking_propagating_panics,
    config::{PipelineConfig, RunOptions},
    document::Document,
    error::{OcrError, OcrResult, PageFailure},
    normalize::{Page, normalize},
    preprocess::{PreprocessedPage, preprocess},
    prelude::*,
    recognize::{RecognitionEngine, RecognitionResult, Recognizer, engine_for},
    retry::IntoRetryResult as _,
};

use self::{
    pool::EnginePool,
    run::{PipelineRun, RunState, TaskState},
    worker_pool::WorkerPool,
};

pub mod pool;
pub mod run;
pub mod worker_pool;

/// What happened to one page task.
#[derive(Debug)]
enum PageOutcome {
    Recognized(Vec<RecognitionResult>),
    Empty,
    Failed(PageFailure),
    /// Never started, because the run was cancelled.
    Cancelled,
}

impl PageOutcome {
    fn task_state(&self) -> TaskState {
        match self {
            PageOutcome::Recognized(_) => TaskState::Finished(PageStatus::Recognized),
            PageOutcome::Empty => TaskState::Finished(PageStatus::Empty),
            PageOutcome::Failed(_) => TaskState::Finished(PageStatus::Failed),
            PageOutcome::Cancelled => TaskState::Cancelled,
        }
    }
}

/// State shared by all the page tasks of one run.
struct RunContext {
    options: RunOptions,
    cancel: CancellationToken,
    record: Arc<Mutex<PipelineRun>>,
    /// The run's scratch directory. Engine leases live inside it.
    scratch_dir: PathBuf,
}

impl RunContext {
    fn set_page(&self, index: usize, state: TaskState) {
        self.record
            .lock()
            .expect("lock poisoned")
            .set_page(index, state);
    }
}

/// A page waiting for a worker.
struct PageJob {
    page: Page,
    run: Arc<RunContext>,
}

/// Processes individual pages. Shared by all runs.
struct PageProcessor {
    recognizer: Recognizer,
    engines: EnginePool,
    page_timeout: Duration,
    retry_delay: Duration,
}

impl PageProcessor {
    /// Preprocess and recognize a single page. Never fails: problems are
    /// recorded in the outcome.
    #[instrument(level = "debug", skip_all, fields(page = job.page.index))]
    async fn process(&self, job: PageJob) -> PageOutcome {
        let PageJob { page, run } = job;
        let index = page.index;
        let outcome = if run.cancel.is_cancelled() {
            PageOutcome::Cancelled
        } else {
            run.set_page(index, TaskState::Preprocessing);
            let result = match self.preprocess(&page, &run.options).await {
                Ok(preprocessed) => self.recognize_with_retry(&preprocessed, &run).await,
                Err(err) => Err(OcrError::Internal(err)),
            };
            match result {
                Ok(results) => PageOutcome::Recognized(results),
                Err(OcrError::EmptyResult) => PageOutcome::Empty,
                Err(OcrError::Cancelled) => PageOutcome::Cancelled,
                Err(err) => {
                    warn!(page = index, "Page failed: {err}");
                    PageOutcome::Failed(err.to_report())
                }
            }
        };
        run.set_page(index, outcome.task_state());
        outcome
    }

    /// Load and preprocess a page, off the async executor.
    async fn preprocess(&self, page: &Page, options: &RunOptions) -> Result<PreprocessedPage> {
        let loaded = page.load().await?;
        let options = options.preprocess.clone();
        spawn_blocking_propagating_panics(move || preprocess(&loaded, &options)).await?
    }

    /// Recognize a page, retrying exactly once if the engine crashes.
    async fn recognize_with_retry(
        &self,
        page: &PreprocessedPage,
        run: &RunContext,
    ) -> OcrResult<Vec<RecognitionResult>> {
        let attempt_number = AtomicU32::new(0);
        let max_delay_ms = self.retry_delay.as_millis().max(2).try_into().unwrap_or(1_000);
        let result = self
            .attempt(&attempt_number, page, run)
            .await
            .into_retry_result()
            .retry_with_async(|_| async {
                self.attempt(&attempt_number, page, run)
                    .await
                    .into_retry_result()
            })
            .with_exponential_jitter(|| ExponentialJitter::FromBackoffRange {
                backoff_range_millis: 1..=max_delay_ms,
                re_attempts: 1,
                jitter_ratio: 0.2,
            })
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    page = page.index,
                    "recognized after a retry (failed attempts: [{}])",
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                warn!(
                    page = page.index,
                    "giving up after {} retry with error {fatal_error}",
                    retry_errors_list.len(),
                )
            });
        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
        }
    }

    /// Lease an engine and run one recognition attempt.
    #[instrument(level = "debug", skip_all, fields(attempt_number = attempt_number.load(Ordering::SeqCst) + 1))]
    async fn attempt(
        &self,
        attempt_number: &AtomicU32,
        page: &PreprocessedPage,
        run: &RunContext,
    ) -> OcrResult<Vec<RecognitionResult>> {
        let attempt = attempt_number.fetch_add(1, Ordering::SeqCst) + 1;
        if run.cancel.is_cancelled() {
            return Err(OcrError::Cancelled);
        }
        let lease = self.engines.acquire(&run.scratch_dir).await?;
        run.set_page(
            page.index,
            TaskState::Recognizing {
                attempt,
                deadline: Instant::now() + self.page_timeout,
            },
        );
        self.recognizer
            .recognize(
                lease.engine(),
                page,
                &run.options.languages,
                lease.scratch_dir(),
                &run.cancel,
            )
            .await
    }
}

/// State shared by a pipeline and all its runs.
struct Shared {
    config: PipelineConfig,
    pages: WorkerPool<PageJob, PageOutcome>,
}

/// The OCR pipeline. Cheap to clone; clones share one worker pool.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    /// Create a pipeline using the engine named in `config`.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let engine = engine_for(&config.recognition);
        Self::new(config, engine)
    }

    /// Create a pipeline using a specific engine. Must be called from inside a
    /// Tokio runtime.
    pub fn new(config: PipelineConfig, engine: Arc<dyn RecognitionEngine>) -> Result<Self> {
        config.validate()?;
        let processor = Arc::new(PageProcessor {
            recognizer: Recognizer::new(&config.recognition),
            engines: EnginePool::new(engine, config.concurrency),
            page_timeout: config.recognition.page_timeout(),
            retry_delay: config.recognition.retry_delay(),
        });
        debug!(
            engine = processor.engines.engine_name(),
            concurrency = config.concurrency,
            "Starting pipeline"
        );
        let pages = WorkerPool::new(
            config.concurrency,
            Arc::new(move |job: PageJob| {
                let processor = processor.clone();
                async move { processor.process(job).await }.boxed()
            }),
        );
        Ok(Self {
            shared: Arc::new(Shared { config, pages }),
        })
    }

    /// Our configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Start processing a document. The work happens in the background.
    pub fn submit(&self, document: Document, options: RunOptions) -> RunHandle {
        let record = Arc::new(Mutex::new(PipelineRun::new(
            document.id(),
            options.languages.clone(),
        )));
        let cancel = CancellationToken::new();
        let run = RunTask {
            shared: self.shared.clone(),
            document,
            options,
            record: record.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.execute());
        RunHandle {
            record,
            cancel,
            task,
        }
    }
}

/// A handle to a submitted run.
pub struct RunHandle {
    record: Arc<Mutex<PipelineRun>>,
    cancel: CancellationToken,
    task: JoinHandle<OcrResult<AggregatedResult>>,
}

impl RunHandle {
    /// The unique ID of this run.
    pub fn id(&self) -> Uuid {
        self.record.lock().expect("lock poisoned").run_id
    }

    /// A snapshot of the run's progress.
    pub fn status(&self) -> PipelineRun {
        self.record.lock().expect("lock poisoned").clone()
    }

    /// Ask the run to stop. Pages which haven't started are skipped, and
    /// [`RunHandle::join`] will return [`OcrError::Cancelled`] once any
    /// in-flight pages have finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Get a token which cancels this run, for use from other tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish. By the time this returns, all the run's
    /// temporary files have been deleted.
    pub async fn join(self) -> OcrResult<AggregatedResult> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(err) => Err(OcrError::Internal(
                anyhow!(err).context("pipeline run was aborted"),
            )),
        }
    }
}

/// The background task for one run.
struct RunTask {
    shared: Arc<Shared>,
    document: Document,
    options: RunOptions,
    record: Arc<Mutex<PipelineRun>>,
    cancel: CancellationToken,
}

impl RunTask {
    fn advance(&self, state: RunState) {
        self.record.lock().expect("lock poisoned").advance(state);
    }

    #[instrument(level = "debug", skip_all, fields(document_id = %self.document.id()))]
    async fn execute(self) -> OcrResult<AggregatedResult> {
        let result = self.execute_inner().await;
        let terminal = match &result {
            Ok(_) => RunState::Completed,
            Err(OcrError::Cancelled) => RunState::Cancelled,
            Err(_) => RunState::Failed,
        };
        self.advance(terminal);
        let record = self.record.lock().expect("lock poisoned").clone();
        match &result {
            Ok(aggregated) => info!(
                run_id = %record.run_id,
                pages = aggregated.pages.len(),
                failed_pages = aggregated.failed_page_count(),
                elapsed = ?record.elapsed(),
                "Run completed"
            ),
            Err(err) => warn!(
                run_id = %record.run_id,
                settled_pages = record.settled_page_count(),
                total_pages = record.pages.len(),
                elapsed = ?record.elapsed(),
                "Run ended without a result: {err}"
            ),
        }
        result
    }

    async fn execute_inner(&self) -> OcrResult<AggregatedResult> {
        let config = &self.shared.config;

        self.advance(RunState::Normalizing);
        // Dropping `page_set` deletes the run's scratch directory, so it must
        // outlive every page task.
        let page_set = normalize(
            &self.document,
            &config.normalize,
            config.scratch_dir.as_deref(),
        )
        .await?;
        for warning in &page_set.warnings {
            warn!(%warning, "Problem reading document");
        }
        if self.cancel.is_cancelled() {
            return Err(OcrError::Cancelled);
        }

        self.advance(RunState::Processing);
        let page_count = page_set.pages.len();
        self.record
            .lock()
            .expect("lock poisoned")
            .set_page_count(page_count);
        let context = Arc::new(RunContext {
            options: self.options.clone(),
            cancel: self.cancel.clone(),
            record: self.record.clone(),
            scratch_dir: page_set.scratch_dir().to_owned(),
        });
        let mut pending = Vec::with_capacity(page_count);
        for page in &page_set.pages {
            if self.cancel.is_cancelled() {
                context.set_page(page.index, TaskState::Cancelled);
                continue;
            }
            let job = PageJob {
                page: page.clone(),
                run: context.clone(),
            };
            let index = page.index;
            // Stop waiting for a queue slot as soon as we're cancelled.
            let rx = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    context.set_page(index, TaskState::Cancelled);
                    continue;
                }
                rx = self.shared.pages.submit(job) => rx?,
            };
            pending.push(rx.map(move |outcome| (index, outcome)));
        }

        // Results arrive in completion order, and are reassembled by index.
        let mut outcomes = (0..page_count).map(|_| None).collect::<Vec<_>>();
        for (index, outcome) in future::join_all(pending).await {
            let outcome = outcome.unwrap_or_else(|_| {
                PageOutcome::Failed(
                    OcrError::Internal(anyhow!("page task was dropped")).to_report(),
                )
            });
            outcomes[index] = Some(outcome);
        }
        if self.cancel.is_cancelled() {
            return Err(OcrError::Cancelled);
        }

        self.advance(RunState::Aggregating);
        let pages = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| match outcome {
                Some(PageOutcome::Recognized(results)) => {
                    aggregate(index, &results, &config.merge, &self.options.languages)
                }
                Some(PageOutcome::Empty) => PageResult::empty(index),
                Some(PageOutcome::Failed(failure)) => PageResult::failed(index, failure),
                Some(PageOutcome::Cancelled) | None => {
                    PageResult::failed(index, OcrError::Cancelled.to_report())
                }
            })
            .collect::<Vec<_>>();
        if pages.iter().all(|page| page.is_failed()) {
            return Err(OcrError::NoRecognizableContent);
        }
        Ok(AggregatedResult {
            document_id: self.document.id(),
            pages,
        })
    }
}
