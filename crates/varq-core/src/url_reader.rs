//! URL readers.
//!
//! A reader fetches a URL's entire payload as one byte buffer. Each
//! implementation recognizes its scheme prefix and rejects anything else;
//! the two shipped implementations cover `file://` paths and
//! `gs://<bucket>/<object>` objects. Readers are shared across pool
//! workers, so every implementation must be safe to call concurrently.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjPath;
use object_store::ObjectStore;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::QueryError;

pub trait UrlReader: Send + Sync {
    fn read(&self, url: &str) -> Result<Vec<u8>, QueryError>;
}

/// Reads `file://<path>` URLs from the local filesystem. Used by tests and
/// single-machine deployments.
#[derive(Debug, Default)]
pub struct LocalFileReader;

impl LocalFileReader {
    pub fn new() -> Self {
        LocalFileReader
    }
}

impl UrlReader for LocalFileReader {
    fn read(&self, url: &str) -> Result<Vec<u8>, QueryError> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| QueryError::InvalidArgument(format!("unsupported URL: {url}")))?;
        std::fs::read(path).map_err(|e| QueryError::Io(format!("failed to read {path}: {e}")))
    }
}

/// Reads `gs://<bucket>/<object>` URLs from Google Cloud Storage.
///
/// One client per bucket is built lazily and cached; `object_store`
/// clients pool connections internally and are safe to share, so the
/// cache hands each caller an `Arc` clone. Fetches run on the runtime
/// whose handle was captured at construction, which keeps this reader
/// callable from plain pool-worker threads.
pub struct GcsReader {
    runtime: Handle,
    clients: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl GcsReader {
    /// Must be created within a tokio runtime; the handle is retained for
    /// the reader's lifetime.
    pub fn new() -> Result<Self, QueryError> {
        let runtime = Handle::try_current().map_err(|_| {
            QueryError::Internal("GcsReader must be created within a tokio runtime".to_string())
        })?;
        Ok(GcsReader {
            runtime,
            clients: RwLock::new(HashMap::new()),
        })
    }

    fn client(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, QueryError> {
        if let Some(client) = self
            .clients
            .read()
            .map_err(|_| QueryError::Internal("GCS client cache poisoned".to_string()))?
            .get(bucket)
        {
            return Ok(client.clone());
        }

        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| {
                QueryError::Internal(format!("failed to build GCS client for {bucket}: {e}"))
            })?;
        debug!(bucket, "built GCS client");

        let mut clients = self
            .clients
            .write()
            .map_err(|_| QueryError::Internal("GCS client cache poisoned".to_string()))?;
        let client = clients
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(store) as Arc<dyn ObjectStore>);
        Ok(client.clone())
    }
}

impl UrlReader for GcsReader {
    fn read(&self, url: &str) -> Result<Vec<u8>, QueryError> {
        let rest = url
            .strip_prefix("gs://")
            .ok_or_else(|| QueryError::InvalidArgument(format!("unsupported URL: {url}")))?;
        let (bucket, object) = rest
            .split_once('/')
            .ok_or_else(|| QueryError::InvalidArgument(format!("incomplete blob URL: {url}")))?;
        if bucket.is_empty() || object.is_empty() {
            return Err(QueryError::InvalidArgument(format!(
                "incomplete blob URL: {url}"
            )));
        }

        let client = self.client(bucket)?;
        let path = ObjPath::from(object);
        self.runtime.block_on(async move {
            let result = client
                .get(&path)
                .await
                .map_err(|e| QueryError::Io(format!("failed to read blob {url}: {e}")))?;
            let bytes = result
                .bytes()
                .await
                .map_err(|e| QueryError::Io(format!("failed to read blob {url}: {e}")))?;
            Ok(bytes.to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn local_reader_reads_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.arrow");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"columnar bytes").unwrap();

        let reader = LocalFileReader::new();
        let url = format!("file://{}", path.display());
        assert_eq!(reader.read(&url).unwrap(), b"columnar bytes");
    }

    #[test]
    fn local_reader_rejects_other_schemes() {
        let reader = LocalFileReader::new();
        let err = reader.read("gs://bucket/object").unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
        assert!(err.to_string().contains("unsupported URL"));
    }

    #[test]
    fn local_reader_missing_file_is_io_error() {
        let reader = LocalFileReader::new();
        let err = reader.read("file:///no/such/varq/file.arrow").unwrap_err();
        assert!(matches!(err, QueryError::Io(_)));
    }

    #[tokio::test]
    async fn gcs_reader_rejects_other_schemes() {
        let reader = GcsReader::new().unwrap();
        let err = reader.read("http://x").unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn gcs_reader_rejects_incomplete_urls() {
        let reader = GcsReader::new().unwrap();
        let err = reader.read("gs://bucket-only").unwrap_err();
        assert!(err.to_string().contains("incomplete blob URL"));
    }
}
