use thiserror::Error;

/// Custom error type for template compilation, node discovery and series fetches.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FinderError {
    #[error("Template syntax error in {template:?}: {reason}")]
    TemplateSyntax { template: String, reason: String },

    #[error("Invalid query pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A branch node was handed to an operation that only accepts leaves.
    #[error("Invalid node kind: {0} is a branch, expected a leaf")]
    InvalidNodeKind(String),

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: u64, end: u64 },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The path maps onto different series under more than one template.
    #[error("Ambiguous template match for {path}: templates {templates:?} resolve to different series")]
    AmbiguousTemplateMatch { path: String, templates: Vec<usize> },

    #[error("No template resolves path: {0}")]
    UnresolvablePath(String),

    #[error("Invalid line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),
}

impl FinderError {
    /// Transient errors are worth retrying by the caller; everything else is a contract
    /// or configuration problem.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FinderError::StoreUnavailable(_) | FinderError::DeadlineExceeded
        )
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for FinderError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        FinderError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
