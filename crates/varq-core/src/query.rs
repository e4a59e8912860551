//! The query coordinator.
//!
//! Fans one scan task per URL onto the process-wide pool, tracks the
//! global row counter, and assembles the surviving batches into a single
//! record-batch file stream. All query-scoped state is created on request
//! arrival and dropped on reply; nothing survives across queries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Instant;

use arrow_array::RecordBatch;
use arrow_ipc::writer::FileWriter;
use arrow_schema::SchemaRef;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{max_rows_exceeded, QueryError};
use crate::expr::Expression;
use crate::registry::FunctionRegistry;
use crate::scan::{build_scanner_options, scan_url};
use crate::url_reader::UrlReader;
use crate::pool::ThreadPool;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Record-batch file URLs, scanned independently and assembled in
    /// this order.
    #[serde(default)]
    pub arrow_urls: Vec<String>,
    /// Column names to retain, in response order.
    #[serde(default)]
    pub projection_columns: Vec<String>,
    #[serde(default)]
    pub filter_expression: Expression,
    /// Cap on total surviving rows across all URLs; exceeding it cancels
    /// the query.
    #[serde(default)]
    pub max_rows: i64,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub num_rows: u64,
    /// One Arrow IPC file stream under a uniform schema; empty when no
    /// rows survive.
    pub record_batches: Vec<u8>,
}

/// Process-wide query engine: the pool, the reader, and the function
/// registry live for the server's lifetime and are shared across queries.
pub struct QueryEngine {
    pool: ThreadPool,
    reader: Arc<dyn UrlReader>,
    registry: Arc<FunctionRegistry>,
}

impl QueryEngine {
    pub fn new(
        num_workers: usize,
        reader: Arc<dyn UrlReader>,
        registry: Arc<FunctionRegistry>,
    ) -> Self {
        QueryEngine {
            pool: ThreadPool::new(num_workers),
            reader,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let options = Arc::new(build_scanner_options(request)?);

        // Fan out one task per URL. The channel doubles as the countdown
        // latch: exactly one message arrives per URL.
        let num_urls = request.arrow_urls.len();
        let num_rows = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for (index, url) in request.arrow_urls.iter().enumerate() {
            let tx = tx.clone();
            let url = url.clone();
            let reader = self.reader.clone();
            let options = options.clone();
            let num_rows = num_rows.clone();
            let registry = self.registry.clone();
            self.pool.schedule(move || {
                let result = scan_url(reader.as_ref(), &url, &options, &num_rows, &registry);
                // A send failure means the coordinator abandoned the query.
                let _ = tx.send((index, result));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<Result<Vec<RecordBatch>, QueryError>>> =
            (0..num_urls).map(|_| None).collect();
        for _ in 0..num_urls {
            let (index, result) = rx
                .recv()
                .map_err(|_| QueryError::Internal("worker dropped its result slot".to_string()))?;
            slots[index] = Some(result);
        }

        // The post-latch read is the synchronization point; it observes
        // the true final total. The cap check takes priority over
        // per-URL failures.
        let total_rows = num_rows.load(Ordering::SeqCst);
        if total_rows > options.max_rows {
            return Err(max_rows_exceeded(options.max_rows));
        }

        let mut partials: Vec<Vec<RecordBatch>> = Vec::with_capacity(num_urls);
        for slot in slots {
            match slot {
                Some(Ok(batches)) => partials.push(batches),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(QueryError::Internal(
                        "missing result slot after fan-out".to_string(),
                    ))
                }
            }
        }

        // The output schema is the first non-empty partial result's.
        let schema: Option<SchemaRef> = partials
            .iter()
            .find_map(|batches| batches.first().map(|b| b.schema()));
        let Some(schema) = schema else {
            info!(
                urls = num_urls,
                num_rows = 0,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query matched no rows"
            );
            return Ok(QueryResponse {
                num_rows: 0,
                record_batches: Vec::new(),
            });
        };

        let mut writer = FileWriter::try_new(Vec::new(), &schema).map_err(|e| {
            QueryError::Internal(format!("failed to create record batch writer: {e}"))
        })?;
        for batches in &partials {
            for batch in batches {
                if batch.schema() != schema {
                    return Err(QueryError::InvalidArgument(format!(
                        "record batch schema {:?} does not match the output schema {:?}",
                        batch.schema().fields(),
                        schema.fields()
                    )));
                }
                writer.write(batch).map_err(|e| {
                    QueryError::InvalidArgument(format!("failed to write record batch: {e}"))
                })?;
            }
        }
        writer
            .finish()
            .map_err(|e| QueryError::Internal(format!("failed to finish record batch file: {e}")))?;
        let buffer = writer
            .into_inner()
            .map_err(|e| QueryError::Internal(format!("failed to flush record batch file: {e}")))?;

        info!(
            urls = num_urls,
            num_rows = total_rows,
            bytes = buffer.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query complete"
        );

        Ok(QueryResponse {
            num_rows: total_rows as u64,
            record_batches: buffer,
        })
    }
}
