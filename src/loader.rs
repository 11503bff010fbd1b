use async_trait::async_trait;
use log::{info, warn};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FetchCause, Result, ScreenerError};
use crate::table::{CellValue, Table};

/// Something that can produce the screener table.
///
/// Implementations perform no caching; the session decides when to fetch.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Fetch the full table behind `source_name`.
    ///
    /// # Errors
    /// * `ScreenerError::SourceUnavailable` carrying the underlying cause
    async fn fetch_table(&self, source_name: &str) -> Result<Table>;
}

/// Bounds any source with a timeout; expiry is reported as
/// `SourceUnavailable` with a [`FetchCause::Timeout`] cause.
pub struct TimedSource<S> {
    inner: S,
    timeout: Duration,
}

impl<S: TableSource> TimedSource<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        TimedSource { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: TableSource> TableSource for TimedSource<S> {
    async fn fetch_table(&self, source_name: &str) -> Result<Table> {
        match tokio::time::timeout(self.timeout, self.inner.fetch_table(source_name)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "fetch of '{}' timed out after {:?}",
                    source_name, self.timeout
                );
                Err(ScreenerError::source_unavailable(
                    source_name,
                    FetchCause::Timeout(self.timeout.as_secs()),
                ))
            }
        }
    }
}

#[async_trait]
impl<T: TableSource + ?Sized> TableSource for std::sync::Arc<T> {
    async fn fetch_table(&self, source_name: &str) -> Result<Table> {
        (**self).fetch_table(source_name).await
    }
}

#[async_trait]
impl<T: TableSource + ?Sized> TableSource for Box<T> {
    async fn fetch_table(&self, source_name: &str) -> Result<Table> {
        (**self).fetch_table(source_name).await
    }
}

/// Turn raw sheet values into a table
///
/// The first row is the header. Data cells are numericised (see
/// [`CellValue::numericise`]); short rows are padded, and cells past the
/// header land in unlabelled columns. Header names are kept exactly as written.
///
/// # Arguments
/// * `values` - Row-major cell text, header first
///
/// # Returns
/// * `Result<Table, FetchCause>` - The table, or `Malformed` for a duplicate header
pub fn records_to_table(values: Vec<Vec<String>>) -> std::result::Result<Table, FetchCause> {
    let mut rows = values.into_iter();
    let header = match rows.next() {
        Some(header) => header,
        None => return Ok(Table::default()),
    };

    let data = rows
        .map(|row| row.iter().map(|s| CellValue::numericise(s)).collect())
        .collect();

    Table::new(header, data)
}

/// Load a table from CSV bytes
///
/// Header row first. Values go through the same numericising as sheet data,
/// so `from_csv(to_csv(t))` gives back the cell values of `t`.
///
/// # Arguments
/// * `reader` - Any reader over UTF-8 CSV bytes
///
/// # Returns
/// * `Result<Table, FetchCause>` - The table, or `Malformed` if the CSV is invalid
///
/// # Examples
/// ```
/// use screener::loader::from_csv;
///
/// let table = from_csv("name,price\nAlpha,10\n".as_bytes()).unwrap();
/// assert_eq!(table.columns(), &["name", "price"]);
/// assert_eq!(table.row_count(), 1);
/// ```
pub fn from_csv<R: Read>(reader: R) -> std::result::Result<Table, FetchCause> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| FetchCause::Malformed(e.to_string()))?;
        values.push(record.iter().map(str::to_string).collect());
    }

    records_to_table(values)
}

/// Table source backed by a local CSV export of the sheet.
///
/// The `source_name` passed to `fetch_table` is only used in error reports.
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvFileSource { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TableSource for CsvFileSource {
    async fn fetch_table(&self, source_name: &str) -> Result<Table> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            let cause = match e.kind() {
                std::io::ErrorKind::NotFound => FetchCause::NotFound(self.path.display().to_string()),
                std::io::ErrorKind::PermissionDenied => {
                    FetchCause::PermissionDenied(self.path.display().to_string())
                }
                _ => FetchCause::Network(e.to_string()),
            };
            ScreenerError::source_unavailable(source_name, cause)
        })?;

        let table = from_csv(bytes.as_slice())
            .map_err(|cause| ScreenerError::source_unavailable(source_name, cause))?;
        info!(
            "loaded {} rows x {} columns from {}",
            table.row_count(),
            table.column_count(),
            self.path.display()
        );
        Ok(table)
    }
}
