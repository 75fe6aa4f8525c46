//! The `languages` subcommand.

use tokio::io::AsyncWriteExt as _;

use crate::{prelude::*, recognize::tesseract::list_languages};

/// List the languages tesseract can recognize, one per line.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_languages() -> Result<()> {
    let languages = list_languages().await?;
    debug!(count = languages.len(), "Listed tesseract languages");
    let mut out = tokio::io::stdout();
    for language in languages {
        out.write_all(format!("{language}\n").as_bytes())
            .await
            .context("failed to write language list")?;
    }
    out.flush().await.context("failed to flush language list")?;
    Ok(())
}
