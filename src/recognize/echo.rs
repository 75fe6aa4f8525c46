//! Echo engine for testing.
//!
//! This engine "recognizes" a single block covering the whole page, whose text
//! names the page and the languages requested. It needs no external tools.

use crate::{error::OcrResult, prelude::*};

use super::{BoundingBox, EngineRequest, RecognitionEngine, TextBlock};

/// Echo engine for testing.
#[derive(Debug)]
pub struct EchoEngine;

#[async_trait]
impl RecognitionEngine for EchoEngine {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn supports_combined_languages(&self) -> bool {
        true
    }

    async fn recognize(&self, request: EngineRequest<'_>) -> OcrResult<Vec<TextBlock>> {
        Ok(vec![TextBlock {
            text: format!("page {} ({})", request.page_index + 1, request.languages),
            confidence: 1.0,
            bbox: BoundingBox {
                x: 0,
                y: 0,
                width: request.width,
                height: request.height,
            },
            words: vec![],
        }])
    }
}
