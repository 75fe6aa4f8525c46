//! Input documents.

use std::sync::Arc;

use uuid::Uuid;

use crate::prelude::*;

/// Where a document's bytes live.
#[derive(Clone, Debug)]
enum Source {
    /// Bytes held in memory, as received from a caller.
    Bytes(Arc<[u8]>),
    /// A file on disk, read lazily.
    Path(PathBuf),
}

/// An input payload, plus its declared MIME type. Immutable once created.
#[derive(Clone, Debug)]
pub struct Document {
    id: Uuid,
    source: Source,
    declared_mime_type: Option<String>,
}

impl Document {
    /// Create a document from in-memory bytes.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, declared_mime_type: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: Source::Bytes(bytes.into()),
            declared_mime_type,
        }
    }

    /// Create a document backed by a file.
    pub fn from_path(path: impl Into<PathBuf>, declared_mime_type: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: Source::Path(path.into()),
            declared_mime_type,
        }
    }

    /// A unique id for this document.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The file backing this document, if any.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::Path(path) => Some(path),
            Source::Bytes(_) => None,
        }
    }

    /// Get the document's bytes, reading them from disk if needed.
    pub async fn bytes(&self) -> Result<Arc<[u8]>> {
        match &self.source {
            Source::Bytes(bytes) => Ok(bytes.clone()),
            Source::Path(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read {:?}", path.display()))?;
                Ok(bytes.into())
            }
        }
    }

    /// Work out our MIME type. We trust the content first, then the declared
    /// type, and finally the file extension.
    pub fn detect_mime_type(&self, bytes: &[u8]) -> Option<String> {
        if let Some(kind) = infer::get(bytes) {
            return Some(kind.mime_type().to_owned());
        }
        if let Some(declared) = &self.declared_mime_type {
            return Some(declared.trim().to_ascii_lowercase());
        }
        self.path()
            .and_then(|path| mime_guess::from_path(path).first_raw())
            .map(|mime| mime.to_owned())
    }
}
