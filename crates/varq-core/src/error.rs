use thiserror::Error;

/// Engine-wide error type. The server binary maps these onto transport
/// status strings; inside the engine they propagate with `?`.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("io: {0}")]
    Io(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// The error returned once the global row counter passes the cap.
/// The message carries the cap value so clients can show the limit.
pub fn max_rows_exceeded(max_rows: usize) -> QueryError {
    QueryError::Cancelled(format!(
        "more than {max_rows} rows matched; please use a more restrictive search"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_rows_message_carries_cap() {
        let err = max_rows_exceeded(15);
        assert!(matches!(err, QueryError::Cancelled(_)));
        assert!(err.to_string().contains("15"));
    }
}
