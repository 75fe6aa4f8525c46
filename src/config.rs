//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is loaded once, from an optional TOML or JSON file plus
//! command-line overrides, and is immutable afterwards. Per-document settings
//! (languages, preprocessing toggles) are folded into a [`RunOptions`] value
//! that travels with each run.

use std::{fmt, sync::LazyLock, time::Duration};

use clap::{Args, ValueEnum};
use regex::Regex;
use schemars::{JsonSchema, r#gen::SchemaGenerator, schema::Schema};

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// Configuration for the whole pipeline.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// How to turn input documents into pages.
    pub normalize: NormalizeOptions,

    /// Default image transforms applied before recognition.
    pub preprocess: PreprocessOptions,

    /// How to invoke the recognition engine.
    pub recognition: RecognitionOptions,

    /// How to reconcile competing language passes.
    pub merge: MergePolicy,

    /// How many pages may be recognized at once, across all runs.
    pub concurrency: usize,

    /// Directory in which run-scoped temporary directories are created.
    /// Defaults to the system temporary directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalize: NormalizeOptions::default(),
            preprocess: PreprocessOptions::default(),
            recognition: RecognitionOptions::default(),
            merge: MergePolicy::default(),
            concurrency: num_cpus::get(),
            scratch_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Load our configuration from an optional file, and apply any
    /// command-line overrides.
    pub async fn load(opts: &ConfigOpts) -> Result<Self> {
        let mut config = match &opts.config {
            Some(path) => read_json_or_toml::<PipelineConfig>(path)
                .await
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => PipelineConfig::default(),
        };
        opts.apply_to(&mut config);
        config.validate()?;
        debug!(?config, "Loaded pipeline configuration");
        Ok(config)
    }

    /// Check for values that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be at least 1"));
        }
        if self.normalize.max_pages == 0 {
            return Err(anyhow!("normalize.max_pages must be at least 1"));
        }
        if self.normalize.target_dpi == 0 || self.preprocess.target_dpi == 0 {
            return Err(anyhow!("target_dpi must be at least 1"));
        }
        if self.normalize.max_page_side < MIN_PAGE_SIDE {
            return Err(anyhow!(
                "normalize.max_page_side must be at least {MIN_PAGE_SIDE}"
            ));
        }
        if self.recognition.page_timeout_secs == 0 {
            return Err(anyhow!("recognition.page_timeout_secs must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.merge.overlap_threshold) {
            return Err(anyhow!("merge.overlap_threshold must be between 0 and 1"));
        }
        if self.preprocess.binarize_window < 3 {
            return Err(anyhow!("preprocess.binarize_window must be at least 3"));
        }
        Ok(())
    }

    /// Build the immutable options for one run, applying any per-document
    /// overrides.
    pub fn run_options(&self, overrides: &RunOverrides) -> RunOptions {
        let languages = overrides
            .languages
            .clone()
            .unwrap_or_else(|| self.recognition.languages.clone());
        let preprocess = match &overrides.preprocess {
            Some(toggles) => toggles.apply_to(&self.preprocess),
            None => self.preprocess.clone(),
        };
        RunOptions {
            languages,
            preprocess,
        }
    }
}

/// Smallest page side we'll ever hand to the engine. Smaller images are padded.
pub const MIN_PAGE_SIDE: u32 = 32;

/// Options for the format normalizer.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizeOptions {
    /// DPI used when rasterizing PDFs.
    pub target_dpi: u32,

    /// Maximum number of pages in a single document.
    pub max_pages: usize,

    /// Maximum pixel area of a single page, before any downscaling.
    pub max_page_pixels: u64,

    /// Pages larger than this on either side are downscaled to fit.
    pub max_page_side: u32,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            target_dpi: 300,
            max_pages: 200,
            max_page_pixels: 100_000_000,
            max_page_side: 4200,
        }
    }
}

/// Options for the preprocessing stage. Each transform can be switched off.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessOptions {
    /// Apply a median filter to suppress scan speckle.
    pub denoise: bool,

    /// Estimate and correct page skew.
    pub deskew: bool,

    /// Apply adaptive (local mean) binarization.
    pub binarize: bool,

    /// Stretch contrast to the full intensity range.
    pub contrast: bool,

    /// Pages with a known resolution are resampled to this DPI.
    pub target_dpi: u32,

    /// Skew estimates larger than this (in degrees) are not applied.
    pub max_deskew_angle: f32,

    /// Side of the square window used for adaptive binarization, in pixels.
    pub binarize_window: u32,

    /// How far below the local mean a pixel must be to count as ink.
    pub binarize_bias: f32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            denoise: true,
            deskew: true,
            binarize: true,
            contrast: true,
            target_dpi: 300,
            max_deskew_angle: 10.0,
            binarize_window: 31,
            binarize_bias: 10.0,
        }
    }
}

/// Per-document preprocessing overrides. Missing fields keep the configured
/// value.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PreprocessOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoise: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deskew: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binarize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_dpi: Option<u32>,
}

impl PreprocessOverrides {
    /// Apply these overrides to a base set of options.
    pub fn apply_to(&self, base: &PreprocessOptions) -> PreprocessOptions {
        PreprocessOptions {
            denoise: self.denoise.unwrap_or(base.denoise),
            deskew: self.deskew.unwrap_or(base.deskew),
            binarize: self.binarize.unwrap_or(base.binarize),
            contrast: self.contrast.unwrap_or(base.contrast),
            target_dpi: self
                .target_dpi
                .filter(|dpi| *dpi > 0)
                .unwrap_or(base.target_dpi),
            ..base.clone()
        }
    }
}

/// Which recognition engine should we use?
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// The `tesseract` command-line tool.
    #[default]
    Tesseract,
    /// Report a fixed block per page. Useful for testing.
    Echo,
}

/// Options for the recognition adapter.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecognitionOptions {
    /// Which engine to run.
    pub engine: EngineKind,

    /// Deadline for recognizing a single page, in seconds.
    pub page_timeout_secs: u64,

    /// Tesseract page segmentation mode.
    pub psm: u8,

    /// Default languages, highest priority first.
    pub languages: LanguageSet,

    /// Run each language as its own pass, even if the engine can combine
    /// them.
    pub separate_language_passes: bool,

    /// Longest delay before retrying a crashed engine, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            page_timeout_secs: 60,
            psm: 6,
            languages: LanguageSet::default(),
            separate_language_passes: false,
            retry_delay_ms: 250,
        }
    }
}

impl RecognitionOptions {
    /// The per-page deadline.
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    /// The longest delay before our single crash retry.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// How should overlapping blocks from different language passes be resolved?
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Highest confidence wins; ties go to the higher-priority language.
    #[default]
    HighestConfidence,
    /// Higher-priority language wins; ties go to the higher confidence.
    LanguagePriority,
}

/// Merge policy for multi-language passes.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergePolicy {
    /// How to choose between competing blocks.
    pub strategy: MergeStrategy,

    /// Two blocks compete if their intersection covers at least this fraction
    /// of the smaller block.
    pub overlap_threshold: f32,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::default(),
            overlap_threshold: 0.5,
        }
    }
}

/// Language codes look like `fra`, `eng` or `chi_sim`.
static LANGUAGE_CODE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("failed to compile regex")
});

/// An ordered, non-empty, duplicate-free set of engine language codes. The
/// first language is the primary language, and wins merge ties.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LanguageSetRepr", into = "Vec<String>")]
pub struct LanguageSet(Vec<String>);

impl LanguageSet {
    /// Create a new language set.
    pub fn new<I, S>(codes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for code in codes {
            let code = code.into().trim().to_owned();
            if !LANGUAGE_CODE_REGEX.is_match(&code) {
                return Err(anyhow!("invalid language code {:?}", code));
            }
            if !out.contains(&code) {
                out.push(code);
            }
        }
        if out.is_empty() {
            return Err(anyhow!("at least one language is required"));
        }
        Ok(Self(out))
    }

    /// A set holding a single language.
    pub fn single(code: &str) -> Self {
        Self(vec![code.to_owned()])
    }

    /// The primary language.
    pub fn primary(&self) -> &str {
        &self.0[0]
    }

    /// All languages, in priority order.
    pub fn codes(&self) -> &[String] {
        &self.0
    }

    /// How many languages are in this set?
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Priority rank of a language. Lower is better. Unknown languages sort
    /// last.
    pub fn rank(&self, code: &str) -> usize {
        self.0
            .iter()
            .position(|c| c == code)
            .unwrap_or(self.0.len())
    }

    /// Split into one single-language set per language.
    pub fn split(&self) -> Vec<LanguageSet> {
        self.0.iter().map(|code| LanguageSet::single(code)).collect()
    }
}

impl Default for LanguageSet {
    fn default() -> Self {
        Self(vec!["fra".to_owned(), "eng".to_owned()])
    }
}

impl fmt::Display for LanguageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("+"))
    }
}

impl std::str::FromStr for LanguageSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        LanguageSet::new(s.split(['+', ',']).filter(|code| !code.trim().is_empty()))
    }
}

impl From<LanguageSet> for Vec<String> {
    fn from(value: LanguageSet) -> Self {
        value.0
    }
}

/// Languages may be written as `"fra+eng"` or as `["fra", "eng"]`.
#[derive(Deserialize, JsonSchema)]
#[serde(untagged)]
enum LanguageSetRepr {
    Joined(String),
    List(Vec<String>),
}

impl TryFrom<LanguageSetRepr> for LanguageSet {
    type Error = String;

    fn try_from(value: LanguageSetRepr) -> std::result::Result<Self, Self::Error> {
        let parsed = match value {
            LanguageSetRepr::Joined(joined) => joined.parse::<LanguageSet>(),
            LanguageSetRepr::List(codes) => LanguageSet::new(codes),
        };
        parsed.map_err(|err| err.to_string())
    }
}

impl JsonSchema for LanguageSet {
    fn schema_name() -> String {
        "LanguageSet".to_owned()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        LanguageSetRepr::json_schema(generator)
    }
}

/// Per-document overrides, as found in an input record.
#[derive(Clone, Debug, Default)]
pub struct RunOverrides {
    pub languages: Option<LanguageSet>,
    pub preprocess: Option<PreprocessOverrides>,
}

/// Immutable options for a single run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    /// Languages to recognize, highest priority first.
    pub languages: LanguageSet,

    /// Preprocessing transforms to apply.
    pub preprocess: PreprocessOptions,
}

/// Command-line options which override the configuration file.
#[derive(Args, Clone, Debug, Default)]
pub struct ConfigOpts {
    /// Load pipeline configuration from a TOML or JSON file.
    #[clap(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Recognition engine to use.
    #[clap(long, value_enum)]
    pub engine: Option<EngineKind>,

    /// Default languages, highest priority first, as in `fra+eng`.
    #[clap(short = 'l', long)]
    pub languages: Option<LanguageSet>,

    /// How many pages may be recognized at once.
    #[clap(long)]
    pub concurrency: Option<usize>,

    /// Deadline for recognizing one page, in seconds.
    #[clap(long)]
    pub page_timeout_secs: Option<u64>,

    /// DPI used to rasterize PDFs and to resample pages.
    #[clap(long)]
    pub dpi: Option<u32>,

    /// Maximum number of pages per document.
    #[clap(long)]
    pub max_pages: Option<usize>,

    /// Tesseract page segmentation mode.
    #[clap(long)]
    pub psm: Option<u8>,

    /// Run each language separately and merge the results.
    #[clap(long)]
    pub separate_language_passes: bool,

    /// How to choose between overlapping blocks from different languages.
    #[clap(long, value_enum)]
    pub merge_strategy: Option<MergeStrategy>,

    /// Skip all preprocessing transforms.
    #[clap(long)]
    pub no_preprocess: bool,
}

impl ConfigOpts {
    /// Apply these overrides to `config`.
    fn apply_to(&self, config: &mut PipelineConfig) {
        if let Some(engine) = self.engine {
            config.recognition.engine = engine;
        }
        if let Some(languages) = &self.languages {
            config.recognition.languages = languages.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(secs) = self.page_timeout_secs {
            config.recognition.page_timeout_secs = secs;
        }
        if let Some(dpi) = self.dpi {
            config.normalize.target_dpi = dpi;
            config.preprocess.target_dpi = dpi;
        }
        if let Some(max_pages) = self.max_pages {
            config.normalize.max_pages = max_pages;
        }
        if let Some(psm) = self.psm {
            config.recognition.psm = psm;
        }
        if self.separate_language_passes {
            config.recognition.separate_language_passes = true;
        }
        if let Some(strategy) = self.merge_strategy {
            config.merge.strategy = strategy;
        }
        if self.no_preprocess {
            let p = &mut config.preprocess;
            p.denoise = false;
            p.deskew = false;
            p.binarize = false;
            p.contrast = false;
        }
    }
}
