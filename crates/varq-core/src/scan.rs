//! Per-URL scanning.
//!
//! Each worker decodes one record-batch file, applies the compiled filter
//! and the projection, and retains the surviving batches. Decoding and
//! filtering are single-threaded on purpose: parallelism already exists
//! across URLs, and nesting it would contend with the pool.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow::compute::filter as arrow_filter;
use arrow_array::{ArrayRef, BooleanArray, RecordBatch};
use arrow_ipc::reader::FileReader;

use crate::error::{max_rows_exceeded, QueryError};
use crate::predicate::{build_predicate, PredicateExpr};
use crate::query::QueryRequest;
use crate::registry::FunctionRegistry;
use crate::url_reader::UrlReader;

/// Immutable per-query scan parameters, built once by the coordinator and
/// shared by reference among workers.
#[derive(Debug)]
pub struct ScannerOptions {
    pub projection_columns: Vec<String>,
    pub filter: PredicateExpr,
    pub max_rows: usize,
}

pub fn build_scanner_options(request: &QueryRequest) -> Result<ScannerOptions, QueryError> {
    let filter = build_predicate(&request.filter_expression)?;

    if request.max_rows <= 0 {
        return Err(QueryError::InvalidArgument(format!(
            "invalid max_rows value of {}",
            request.max_rows
        )));
    }

    // The projection is the response schema contract; a zero-column
    // response has no consumer.
    if request.projection_columns.is_empty() {
        return Err(QueryError::InvalidArgument(
            "projection_columns must not be empty".to_string(),
        ));
    }

    Ok(ScannerOptions {
        projection_columns: request.projection_columns.clone(),
        filter,
        max_rows: request.max_rows as usize,
    })
}

/// Scan one URL: fetch, decode, filter, project, count.
///
/// The cancellation check happens only before any work starts; a worker
/// that is already scanning finishes its file and lets the coordinator
/// reject the aggregate.
pub fn scan_url(
    reader: &dyn UrlReader,
    url: &str,
    options: &ScannerOptions,
    num_rows: &AtomicUsize,
    registry: &FunctionRegistry,
) -> Result<Vec<RecordBatch>, QueryError> {
    if num_rows.load(Ordering::Relaxed) > options.max_rows {
        return Err(max_rows_exceeded(options.max_rows));
    }

    let data = reader
        .read(url)
        .map_err(|e| QueryError::InvalidArgument(format!("failed to read {url}: {e}")))?;

    let file_reader = FileReader::try_new(Cursor::new(data), None).map_err(|e| {
        QueryError::InvalidArgument(format!("failed to open record batch reader for {url}: {e}"))
    })?;

    let mut result = Vec::new();
    for batch in file_reader {
        let batch = batch.map_err(|e| {
            QueryError::InvalidArgument(format!("failed to read record batch for {url}: {e}"))
        })?;

        // Filter against the full schema first: the predicate may
        // reference columns outside the projection.
        let mask = options
            .filter
            .evaluate(&batch, registry)
            .and_then(|value| value.into_boolean_mask(batch.num_rows()))
            .map_err(|e| {
                QueryError::InvalidArgument(format!("failed to run filter on {url}: {e}"))
            })?;
        let filtered = filter_record_batch(&batch, &mask)?;
        let projected =
            project_batch(&filtered, &options.projection_columns).map_err(|e| {
                QueryError::InvalidArgument(format!("failed to project columns for {url}: {e}"))
            })?;

        if projected.num_rows() > 0 {
            num_rows.fetch_add(projected.num_rows(), Ordering::Relaxed);
            result.push(projected);
        }
    }

    Ok(result)
}

/// Keep the rows where the mask is true; null mask slots drop their rows.
fn filter_record_batch(
    batch: &RecordBatch,
    mask: &BooleanArray,
) -> Result<RecordBatch, QueryError> {
    if mask.len() != batch.num_rows() {
        return Err(QueryError::Internal(format!(
            "filter mask has {} rows, batch has {}",
            mask.len(),
            batch.num_rows()
        )));
    }
    let filtered: Result<Vec<ArrayRef>, _> = batch
        .columns()
        .iter()
        .map(|col| {
            arrow_filter(col.as_ref(), mask)
                .map_err(|e| QueryError::Internal(format!("filter error: {e}")))
        })
        .collect();
    RecordBatch::try_new(batch.schema(), filtered?)
        .map_err(|e| QueryError::Internal(format!("batch creation error: {e}")))
}

/// Select the named columns, in the requested order.
fn project_batch(batch: &RecordBatch, needed: &[String]) -> Result<RecordBatch, QueryError> {
    let schema = batch.schema();
    let mut indices = Vec::with_capacity(needed.len());
    for name in needed {
        let index = schema
            .index_of(name)
            .map_err(|_| QueryError::InvalidArgument(format!("column not found: {name}")))?;
        indices.push(index);
    }
    batch
        .project(&indices)
        .map_err(|e| QueryError::Internal(format!("projection failed: {e}")))
}
