//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_json_pretty,
    cmd::ocr::{OcrInput, OcrOutput},
    config::PipelineConfig,
    prelude::*,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// OCR input records.
    OcrInput,
    /// OCR output records.
    OcrOutput,
    /// The `--config` file.
    PipelineConfig,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::OcrInput => schema_for!(OcrInput),
        SchemaType::OcrOutput => schema_for!(OcrOutput),
        SchemaType::PipelineConfig => schema_for!(PipelineConfig),
    };
    write_json_pretty(schema_opts.output_path.as_deref(), &schema)
        .await
        .context("failed to write schema")
}
