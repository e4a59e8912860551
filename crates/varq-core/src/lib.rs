pub mod error;
pub mod expr;
pub mod kernel;
pub mod pool;
pub mod predicate;
pub mod query;
pub mod registry;
pub mod scan;
pub mod url_reader;

pub use error::{max_rows_exceeded, QueryError};
pub use expr::{Call, Expression, Literal, SetLookupValues};
pub use kernel::{SetLookupState, STRING_LIST_CONTAINS_ANY};
pub use pool::ThreadPool;
pub use predicate::{build_predicate, PredicateExpr, ScalarValue};
pub use query::{QueryEngine, QueryRequest, QueryResponse};
pub use registry::{ColumnarValue, FunctionRegistry, SetLookupOptions};
pub use scan::{build_scanner_options, scan_url, ScannerOptions};
pub use url_reader::{GcsReader, LocalFileReader, UrlReader};
