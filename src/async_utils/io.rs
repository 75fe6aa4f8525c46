//! I/O utilities.
//!
//! This module is responsible for reading JSON, TOML, JSONL, and CSV files, and
//! writing JSONL files. We support automatic format detection from filenames or
//! the first byte of the input, so that `docscan-ocr ocr` can read a job list
//! from a file, a pipe or standard input.
//!
//! In general, Tokio and async Rust involve some occasional magic. We try to
//! keep all of it in this file.

use std::{pin::Pin, sync::Arc, task::Context};

use futures::{TryStreamExt as _, pin_mut, stream::StreamExt as _};
use peekable::tokio::AsyncPeekable;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::{
    fs::File,
    io::{
        AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _, AsyncWrite,
        AsyncWriteExt as _, BufReader, BufWriter, ReadBuf,
    },
};
use tokio_stream::wrappers::LinesStream;

use crate::{
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::BoxedStream;

/// A smart async reader that uses [`AsyncPeekable`] to detect whether the input
/// is JSON-like or CSV.
pub struct SmartReader {
    /// Do we expect our input to be either JSON or JSONL?
    is_json_like: bool,

    /// A human-readable description of the input source, for error messages.
    description: String,

    /// Our reader, pinned because async reads may hold pointers into it.
    reader: Pin<Box<dyn AsyncBufRead + Unpin + Send + Sync + 'static>>,
}

impl SmartReader {
    /// Create a new `SmartReader` from an existing reader, sniffing the first
    /// byte.
    pub async fn new_from_reader(
        description: String,
        reader: impl AsyncRead + Unpin + Send + Sync + 'static,
    ) -> Result<Self> {
        let mut peekable = AsyncPeekable::new(Box::new(BufReader::new(reader)));
        let mut buffer = vec![0; 1];
        peekable
            .peek_exact(&mut buffer)
            .await
            .with_context(|| format!("Failed to read from {description}"))?;
        Ok(Self {
            is_json_like: buffer[0] == b'{',
            description,
            reader: Box::pin(BufReader::new(peekable)),
        })
    }

    /// Create a new `SmartReader` from a [`Path`], using the extension.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().unwrap_or_default();
        let is_json_like = ext == "json" || ext == "jsonl";
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open file at path: {:?}", path))?;
        Ok(Self {
            is_json_like,
            description: path.to_string_lossy().into_owned(),
            reader: Box::pin(BufReader::new(file)),
        })
    }

    /// Create a new `SmartReader` from either a [`Path`] or standard input.
    pub async fn new_from_path_or_stdin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::new_from_path(path).await,
            None => Self::new_from_reader("stdin".to_owned(), tokio::io::stdin()).await,
        }
    }

    /// Is our input JSON-like?
    pub fn is_json_like(&self) -> bool {
        self.is_json_like
    }
}

impl AsyncRead for SmartReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        // See https://stackoverflow.com/a/75728106 for the `Pin` dance.
        Pin::get_mut(self).reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncBufRead for SmartReader {
    fn poll_fill_buf(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<std::io::Result<&[u8]>> {
        Pin::get_mut(self).reader.as_mut().poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::get_mut(self).reader.as_mut().consume(amt)
    }
}

/// Read TOML or JSON from a file.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let mut reader = SmartReader::new_from_path(path).await?;
    let mut data = String::new();
    // Read all at once because our parsing libraries don't do async I/O.
    reader
        .read_to_string(&mut data)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    if reader.is_json_like() {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Count JSONL or CSV records in a file, so we can show a real progress bar.
///
/// Returns `None` if the input can't be counted without consuming it.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn count_jsonl_or_csv_records(ui: &Ui, path: &Path) -> Result<Option<usize>> {
    // Named pipes and other special files can only be read once.
    if !path.is_file() {
        return Ok(None);
    }

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🧮",
        msg: "Counting input records",
        done_msg: "Counted input records",
    });

    let reader = SmartReader::new_from_path(path).await?;
    let count = if reader.is_json_like() {
        LinesStream::new(reader.lines())
            .try_fold(0, |acc, line| async move {
                Ok(if line.trim().is_empty() { acc } else { acc + 1 })
            })
            .await?
    } else {
        csv_async::AsyncReaderBuilder::new()
            .create_reader(reader)
            .into_byte_records()
            .try_fold(0, |acc, _record| async move { Ok(acc + 1) })
            .await?
    };
    spinner.finish_with_message(format!("Found {count} records"));
    Ok(Some(count))
}

/// Read JSONL or CSV records from a file or stdin, and deserialize each one.
///
/// CSV cells are all strings. Empty cells are treated as missing fields, so
/// that optional columns can be left blank.
pub async fn read_jsonl_or_csv<T>(path: Option<&Path>) -> Result<BoxedStream<Result<T>>>
where
    T: DeserializeOwned + Send + 'static,
{
    let reader = SmartReader::new_from_path_or_stdin(path).await?;
    let description = Arc::new(reader.description.clone());
    if reader.is_json_like() {
        let lines = LinesStream::new(reader.lines()).try_filter(|line| {
            let keep = !line.trim().is_empty();
            async move { keep }
        });
        Ok(Box::pin(lines.map(move |line| {
            let line = line.with_context(|| format!("Failed to read {:?}", description))?;
            serde_json::from_str::<T>(&line).with_context(|| {
                format!("Failed to parse record in {:?}: {:?}", description, line)
            })
        })))
    } else {
        let mut reader = csv_async::AsyncReaderBuilder::new().create_reader(reader);
        let headers = Arc::new(
            reader
                .headers()
                .await
                .with_context(|| format!("Failed to read CSV headers from {:?}", description))?
                .to_owned(),
        );
        Ok(Box::pin(reader.into_records().map(move |record| {
            let record = record
                .with_context(|| format!("Failed to read CSV record from {:?}", description))?;
            let map = headers
                .iter()
                .zip(record.iter())
                .filter(|(_, value)| !value.is_empty())
                .map(|(header, value)| (header.to_owned(), Value::String(value.to_owned())))
                .collect::<Map<String, Value>>();
            serde_json::from_value::<T>(Value::Object(map)).with_context(|| {
                format!("Failed to parse CSV record in {:?}", description)
            })
        })))
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a stream of serializable records as JSONL to either standard output
/// or a file.
pub async fn write_output<T>(path: Option<&Path>, stream: BoxedStream<Result<T>>) -> Result<()>
where
    T: Serialize,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(record) = stream.next().await {
        let json = serde_json::to_string(&record?).context("Failed to serialize output")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write a single pretty-printed JSON value to standard output or a file.
pub async fn write_json_pretty<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let mut writer = create_writer(path).await?;
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write JSON to output")?;
    writer
        .write_all(b"\n")
        .await
        .context("Failed to write newline to output")?;
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
