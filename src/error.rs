use std::path::PathBuf;
use thiserror::Error;

pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No reference row matches '{sku_spec}' (record {record})")]
    NoMatchFound { record: String, sku_spec: String },

    #[error("'{sku_spec}' matches {candidates} rows equally in sheet '{sheet}' (record {record})")]
    AmbiguousMatch {
        record: String,
        sku_spec: String,
        sheet: String,
        candidates: usize,
    },

    #[error("Workbook {} is unavailable: {detail}", path.display())]
    DocumentLock { path: PathBuf, detail: String },

    #[error("Partial write at {sheet}!{row}: {detail}")]
    PartialWrite {
        sheet: String,
        row: u32,
        detail: String,
    },

    #[error("Offset desync in sheet '{sheet}': expected row {expected_row} to hold '{expected}', found '{found}'")]
    OffsetDesync {
        sheet: String,
        expected_row: u32,
        expected: String,
        found: String,
    },

    #[error("Undo unavailable for token {token}: ledger entry missing or evicted")]
    UndoUnavailable { token: String },

    #[error("Retry {id} exhausted after {attempts} attempts")]
    RetryExhausted { id: String, attempts: u32 },

    #[error("Unknown retry item: {0}")]
    UnknownRetry(String),

    #[error("Invalid row {row} in sheet '{sheet}': {detail}")]
    InvalidRow {
        sheet: String,
        row: u32,
        detail: String,
    },
}

impl ScheduleError {
    pub fn document_lock(path: impl Into<PathBuf>, detail: impl ToString) -> Self {
        Self::DocumentLock {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    pub fn partial_write(sheet: impl Into<String>, row: u32, detail: impl ToString) -> Self {
        Self::PartialWrite {
            sheet: sheet.into(),
            row,
            detail: detail.to_string(),
        }
    }

    pub fn invalid_row(sheet: impl Into<String>, row: u32, detail: impl ToString) -> Self {
        Self::InvalidRow {
            sheet: sheet.into(),
            row,
            detail: detail.to_string(),
        }
    }

    /// Errors that abort the whole in-flight call rather than a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScheduleError::DocumentLock { .. }
                | ScheduleError::OffsetDesync { .. }
                | ScheduleError::Io(_)
        )
    }

    /// Short kind label used in results and persisted retry reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleError::Io(_) => "io",
            ScheduleError::Yaml(_) => "yaml",
            ScheduleError::Json(_) => "json",
            ScheduleError::Config(_) => "config",
            ScheduleError::NoMatchFound { .. } => "no_match_found",
            ScheduleError::AmbiguousMatch { .. } => "ambiguous_match",
            ScheduleError::DocumentLock { .. } => "document_lock",
            ScheduleError::PartialWrite { .. } => "partial_write",
            ScheduleError::OffsetDesync { .. } => "offset_desync",
            ScheduleError::UndoUnavailable { .. } => "undo_unavailable",
            ScheduleError::RetryExhausted { .. } => "retry_exhausted",
            ScheduleError::UnknownRetry(_) => "unknown_retry",
            ScheduleError::InvalidRow { .. } => "invalid_row",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(ScheduleError::document_lock("a.xlsx", "busy").is_fatal());
        assert!(ScheduleError::OffsetDesync {
            sheet: "S".into(),
            expected_row: 3,
            expected: "A".into(),
            found: "B".into(),
        }
        .is_fatal());
        assert!(!ScheduleError::partial_write("S", 4, "short").is_fatal());
        assert!(!ScheduleError::NoMatchFound {
            record: "r1".into(),
            sku_spec: "1-S001".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_display_carries_context() {
        let err = ScheduleError::document_lock("plan/9296.xlsx", "session already open");
        let msg = err.to_string();
        assert!(msg.contains("9296.xlsx"));
        assert!(msg.contains("session already open"));
        assert_eq!(err.kind(), "document_lock");
    }
}
