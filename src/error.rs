//! Error types for the pipeline engine

use chrono::NaiveDate;
use thiserror::Error;

/// Main error type for pipeline construction and execution
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Cyclic dependency detected at term {term}")]
    CyclicDependency { term: String },

    #[error("Duplicate pipeline column name: {name}")]
    DuplicateName { name: String },

    #[error("Asset registry unavailable for {start} to {end}: {reason}")]
    RegistryUnavailable {
        start: NaiveDate,
        end: NaiveDate,
        reason: String,
    },

    #[error("Data unavailable for field '{field}' ({bar_count} bars ending {end_date}): {reason}")]
    DataUnavailable {
        field: String,
        end_date: NaiveDate,
        bar_count: usize,
        /// Bars the store holds up to `end_date`, set when the failure is
        /// short history
        available: Option<usize>,
        reason: String,
    },

    #[error(
        "Insufficient history for {term}: requires data from {required_start}, \
         earliest available is {earliest}"
    )]
    InsufficientHistory {
        term: String,
        required_start: String,
        earliest: String,
    },

    #[error("Pipeline execution cancelled")]
    Cancelled,

    #[error("Invalid date range: {start} to {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("Invalid term: {0}")]
    InvalidTerm(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Calendar error: {0}")]
    CalendarError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl PipelineError {
    /// Whether the engine itself would ever retry this error.
    ///
    /// Always false: retry policy belongs to the bar store, not the engine.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Errors raised while validating a pipeline, before any data is fetched
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            PipelineError::CyclicDependency { .. }
                | PipelineError::DuplicateName { .. }
                | PipelineError::InvalidTerm(_)
        )
    }

    /// Errors surfaced by an external collaborator (registry, bar store)
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            PipelineError::RegistryUnavailable { .. }
                | PipelineError::DataUnavailable { .. }
                | PipelineError::InsufficientHistory { .. }
        )
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = PipelineError::DuplicateName {
            name: "sma".to_string(),
        };
        assert!(err.is_construction_error());
        assert!(!err.is_data_error());
        assert!(!err.is_retryable());

        let err = PipelineError::InsufficientHistory {
            term: "SMA_10".to_string(),
            required_start: "2024-01-02".to_string(),
            earliest: "2024-01-08".to_string(),
        };
        assert!(err.is_data_error());
        assert!(!err.is_construction_error());
        assert!(!PipelineError::Cancelled.is_data_error());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::CyclicDependency {
            term: "loop".to_string(),
        };
        assert!(err.to_string().contains("loop"));

        let start = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let msg = PipelineError::InvalidDateRange { start, end }.to_string();
        assert!(msg.contains("2024-01-10"));
        assert!(msg.contains("2024-01-05"));
    }
}
