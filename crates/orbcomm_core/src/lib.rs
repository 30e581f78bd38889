pub mod backfill;
pub mod backup;
pub mod db;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod normalize;
pub mod reconcile;
pub mod repo;
pub mod store;
pub mod sync;

#[cfg(test)]
mod tests {
    use super::error::AppError;

    #[test]
    fn app_error_is_structured() {
        let err = AppError::new("DB_TEST", "db failed").with_retryable(false);
        assert_eq!(err.code, "DB_TEST");
        assert_eq!(err.message, "db failed");
        assert_eq!(err.retryable, false);
        assert_eq!(err.to_string(), "[DB_TEST] db failed");
    }

    #[test]
    fn storage_errors_are_retryable() {
        let err = AppError::storage("DB_QUERY_FAILED", "query failed", "disk I/O error");
        assert!(err.retryable);
        assert_eq!(err.details.as_deref(), Some("disk I/O error"));
        assert_eq!(err.to_string(), "[DB_QUERY_FAILED] query failed (disk I/O error)");
    }
}
