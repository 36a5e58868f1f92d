// nc_doc_loader/src/error.rs
// Defines custom error types for the nc_doc_loader module.

use thiserror::Error;

#[derive(Debug, Error,)]
pub enum IngestorError {
    #[error("Failed to connect to database: {0}")]
    ConnectionError(String,),
    #[error("Invalid configuration: {0}")]
    ConfigurationError(String,),
    #[error("Row could not be mapped: {0}")]
    MappingError(String,),
    #[error("Field '{field}' does not hold a valid sub-document: {reason}")]
    InvalidSubDocument { field: String, reason: String, },
    #[error("Database specific error: {0}")]
    DatabaseError(String,),
    #[error("Store rejected the write: {0}")]
    WriteRejected(String,),
    #[error("Write failed after {attempts} attempt(s): {cause}")]
    WriteFailed { attempts: u32, cause: String, },
    #[error("Pipeline was cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error,),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error,),
    #[error("Other error: {0}")]
    Other(String,),
}

impl IngestorError {
    /// Whether the write retry loop may attempt the operation again.
    pub fn is_transient(&self,) -> bool {
        matches!(
            self,
            IngestorError::ConnectionError(_,)
                | IngestorError::DatabaseError(_,)
                | IngestorError::WriteRejected(_,)
        )
    }

    /// Configuration problems abort the pipeline before any write happens.
    pub fn is_configuration(&self,) -> bool {
        matches!(self, IngestorError::ConfigurationError(_,))
    }
}

pub type Result<T,> = std::result::Result<T, IngestorError,>;
