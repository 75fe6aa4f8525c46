//! Transient bookkeeping for a single pipeline run.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::{aggregate::PageStatus, config::LanguageSet, prelude::*};

/// Where a run is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Accepted,
    Normalizing,
    Processing,
    Aggregating,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    /// Is `next` a legal successor of this state?
    fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Accepted, Normalizing)
            | (Normalizing, Processing)
            | (Processing, Aggregating)
            | (Aggregating, Completed) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Where a single page is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a worker.
    Queued,
    Preprocessing,
    /// The engine is running, and must finish by `deadline`.
    Recognizing { attempt: u32, deadline: Instant },
    /// Finished with the given status.
    Finished(PageStatus),
    /// Never started, because the run was cancelled.
    Cancelled,
}

/// Coordination record for one run. Lives only as long as the run's handle.
#[derive(Clone, Debug)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub document_id: Uuid,
    pub languages: LanguageSet,
    pub state: RunState,
    /// One entry per page, once the document has been normalized.
    pub pages: Vec<TaskState>,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
}

impl PipelineRun {
    pub fn new(document_id: Uuid, languages: LanguageSet) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            document_id,
            languages,
            state: RunState::Accepted,
            pages: vec![],
            started_at: Instant::now(),
            finished_at: None,
        }
    }

    /// Move to a new state. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: RunState) {
        if !self.state.can_advance_to(next) {
            error!(run_id = %self.run_id, from = ?self.state, to = ?next, "Ignoring illegal run state transition");
            return;
        }
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "Run state changed");
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
    }

    /// Record that the document has `count` pages, all queued.
    pub fn set_page_count(&mut self, count: usize) {
        self.pages = vec![TaskState::Queued; count];
    }

    /// Update the state of one page.
    pub fn set_page(&mut self, index: usize, state: TaskState) {
        if let Some(slot) = self.pages.get_mut(index) {
            *slot = state;
        }
    }

    /// How many pages have finished, one way or another?
    pub fn settled_page_count(&self) -> usize {
        self.pages
            .iter()
            .filter(|state| matches!(state, TaskState::Finished(_) | TaskState::Cancelled))
            .count()
    }

    /// How long has this run taken so far?
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.started_at)
    }
}
