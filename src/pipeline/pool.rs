//! Scoped access to the recognition engine.
//!
//! Engines may hold expensive shared state, so we never call one without a
//! lease. A lease carries a permit (the pool is sized to the pipeline's
//! concurrency limit) and a private scratch directory. Both are released when
//! the lease is dropped, on every exit path.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{prelude::*, recognize::RecognitionEngine};

/// A pooled recognition engine.
#[derive(Clone)]
pub struct EnginePool {
    engine: Arc<dyn RecognitionEngine>,
    permits: Arc<Semaphore>,
}

impl EnginePool {
    /// Create a pool allowing `size` concurrent leases.
    pub fn new(engine: Arc<dyn RecognitionEngine>, size: usize) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// The name of the pooled engine.
    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Wait for a lease. The lease's scratch directory is created inside
    /// `scratch_root`, which should belong to the calling run.
    pub async fn acquire(&self, scratch_root: &Path) -> Result<EngineLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("engine pool was closed")?;
        let scratch = tempfile::TempDir::with_prefix_in("lease-", scratch_root)
            .context("failed to create engine lease directory")?;
        Ok(EngineLease {
            engine: self.engine.clone(),
            scratch: Some(scratch),
            _permit: permit,
        })
    }
}

/// Exclusive use of one engine slot.
pub struct EngineLease {
    engine: Arc<dyn RecognitionEngine>,
    scratch: Option<tempfile::TempDir>,
    _permit: OwnedSemaphorePermit,
}

impl EngineLease {
    pub fn engine(&self) -> &dyn RecognitionEngine {
        self.engine.as_ref()
    }

    /// Private scratch space for this lease.
    pub fn scratch_dir(&self) -> &Path {
        // Only `None` during `drop`.
        self.scratch
            .as_ref()
            .map(|dir| dir.path())
            .unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let Some(scratch) = self.scratch.take()
            && let Err(err) = scratch.close()
        {
            error!("failed to delete engine lease directory: {err}");
        }
    }
}
