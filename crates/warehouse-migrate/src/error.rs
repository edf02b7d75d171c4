//! Error types for the migration library.
//!
//! Besides the error enum itself this module owns the failure taxonomy used by
//! the worker retry ladder and by the orchestrator's circuit breaker: every
//! error can be reduced to an [`ErrorKind`].

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source warehouse connection or query error
    #[error("Source warehouse error: {message}")]
    Source {
        message: String,
        sqlstate: Option<String>,
    },

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Chunk planning failed for a table
    #[error("Chunking failed for table {table}: {message}")]
    Chunking { table: String, message: String },

    /// Writing a batch into the target failed
    #[error("Load into {table} failed: {message}")]
    Load {
        table: String,
        message: String,
        sqlstate: Option<String>,
        constraint: Option<String>,
        detail: Option<String>,
    },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// A failure that will repeat for every chunk of the table
    #[error("Systemic failure on table {table}: {message}")]
    Systemic { table: String, message: String },

    /// Truncate-before-load was requested but is not provably safe
    #[error("Refusing to truncate {table}: {reason}")]
    TruncateRefused { table: String, reason: String },

    /// An explicitly requested run cannot be resumed
    #[error("Run cannot be resumed: {0}")]
    RunNotResumable(String),

    /// Status ledger error
    #[error("Status ledger error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, deadline, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

/// Failure taxonomy driving retry, fallback and abort decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network blips and anything unrecognised; retried with backoff.
    Transient,
    /// Out-of-memory during fetch or load; handled by sub-batching.
    MemoryPressure,
    /// Uniqueness violation; handled by merge fallback or insert-only skip.
    Conflict,
    /// Schema, type, permission or syntax problem; aborts the table.
    Systemic,
    /// Key collision caused by a lagging identity sequence; healed once.
    SequenceCollision,
    /// Not retryable and not classifiable (cancellation, local IO).
    Fatal,
}

/// Message fragments that signal memory exhaustion.
const MEMORY_MARKERS: &[&str] = &[
    "out of memory",
    "memory exhausted",
    "cannot allocate memory",
    "could not allocate",
    "memoryerror",
    "oom",
];

/// Message fragments that always mean a retryable condition.
const TRANSIENT_MARKERS: &[&str] = &["timeout", "timed out", "connection reset", "broken pipe"];

/// (keyword, qualifier) pairs; both must appear. An empty qualifier matches anything.
const SYSTEMIC_PATTERNS: &[(&str, &str)] = &[
    ("column", "does not exist"),
    ("column", "not found"),
    ("table", "does not exist"),
    ("table", "not found"),
    ("relation", "does not exist"),
    ("type", "mismatch"),
    ("invalid input syntax", "type"),
    ("could not convert", "type"),
    ("permission denied", ""),
    ("access denied", ""),
    ("authentication", "failed"),
    ("invalid", "credentials"),
    ("syntax error", ""),
    ("invalid sql", ""),
    ("connection refused", ""),
    ("could not connect", "database"),
];

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Chunking error
    pub fn chunking(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Chunking {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Wrap a source warehouse driver error, keeping its SQLSTATE.
    pub fn from_source_db(e: tokio_postgres::Error) -> Self {
        let sqlstate = e.code().map(|c| c.code().to_string());
        let message = match e.as_db_error() {
            Some(db) => db.message().to_string(),
            None => e.to_string(),
        };
        MigrateError::Source { message, sqlstate }
    }

    /// Wrap a target driver error raised while loading rows into `table`.
    pub fn load(table: impl Into<String>, e: &tokio_postgres::Error) -> Self {
        let (message, constraint, detail) = match e.as_db_error() {
            Some(db) => (
                db.message().to_string(),
                db.constraint().map(str::to_string),
                db.detail().map(str::to_string),
            ),
            None => (e.to_string(), None, None),
        };
        MigrateError::Load {
            table: table.into(),
            message,
            sqlstate: e.code().map(|c| c.code().to_string()),
            constraint,
            detail,
        }
    }

    /// SQLSTATE of the underlying database error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            MigrateError::Target(e) => e.code().map(|c| c.code().to_string()),
            MigrateError::Source { sqlstate, .. } | MigrateError::Load { sqlstate, .. } => {
                sqlstate.clone()
            }
            _ => None,
        }
    }

    /// The underlying message, without the variant's prefix or table name.
    pub fn inner_message(&self) -> String {
        match self {
            MigrateError::Source { message, .. }
            | MigrateError::Pool { message, .. }
            | MigrateError::Chunking { message, .. }
            | MigrateError::Load { message, .. }
            | MigrateError::Transfer { message, .. }
            | MigrateError::Systemic { message, .. } => message.clone(),
            MigrateError::TruncateRefused { reason, .. } => reason.clone(),
            MigrateError::Config(m) | MigrateError::RunNotResumable(m) | MigrateError::State(m) => {
                m.clone()
            }
            MigrateError::Target(e) => match e.as_db_error() {
                Some(db) => db.message().to_string(),
                None => e.to_string(),
            },
            MigrateError::Io(e) => e.to_string(),
            MigrateError::Yaml(e) => e.to_string(),
            MigrateError::Json(e) => e.to_string(),
            MigrateError::Cancelled => self.to_string(),
        }
    }

    /// Classify this error into the failure taxonomy.
    ///
    /// Only the SQLSTATE and the inner message are inspected; table names
    /// and variant prefixes never influence the result.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Cancelled | MigrateError::Io(_) => ErrorKind::Fatal,
            MigrateError::Config(_)
            | MigrateError::Chunking { .. }
            | MigrateError::Systemic { .. }
            | MigrateError::TruncateRefused { .. }
            | MigrateError::RunNotResumable(_)
            | MigrateError::Yaml(_) => ErrorKind::Systemic,
            _ => classify(self.sqlstate().as_deref(), &self.inner_message()),
        }
    }

    /// Whether every remaining chunk of the table would fail the same way.
    pub fn is_systemic(&self) -> bool {
        self.kind() == ErrorKind::Systemic
    }

    /// Key columns named in a uniqueness-violation detail, e.g. `Key (id)=(5) already exists.`
    pub fn conflict_key_columns(&self) -> Vec<String> {
        static KEY_RE: OnceLock<Option<Regex>> = OnceLock::new();
        let detail = match self {
            MigrateError::Load {
                detail: Some(d), ..
            } => d.as_str(),
            _ => return Vec::new(),
        };
        let re = KEY_RE.get_or_init(|| Regex::new(r"Key \((.+?)\)=\(").ok());
        re.as_ref()
            .and_then(|re| re.captures(detail))
            .map(|caps| {
                caps[1]
                    .split(',')
                    .map(|c| c.trim().trim_matches('"').to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Json(_) => 1,
            MigrateError::Source { .. } | MigrateError::Target(_) | MigrateError::Pool { .. } => 2,
            MigrateError::Chunking { .. }
            | MigrateError::Load { .. }
            | MigrateError::Transfer { .. }
            | MigrateError::Systemic { .. } => 3,
            MigrateError::State(_) | MigrateError::RunNotResumable(_) => 4,
            MigrateError::TruncateRefused { .. } => 5,
            MigrateError::Cancelled => 6,
            MigrateError::Io(_) => 7,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Classify an error from its SQLSTATE (when known) and message text.
pub fn classify(sqlstate: Option<&str>, message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    match sqlstate {
        Some("53200") => return ErrorKind::MemoryPressure,
        Some("23505") => return ErrorKind::Conflict,
        Some("57014") => return ErrorKind::Transient,
        Some(code) if code.starts_with("42") || code.starts_with("28") => {
            return ErrorKind::Systemic
        }
        _ => {}
    }

    if MEMORY_MARKERS.iter().any(|m| contains_word(&lower, m)) {
        return ErrorKind::MemoryPressure;
    }
    if lower.contains("duplicate key value violates unique constraint") {
        return ErrorKind::Conflict;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorKind::Transient;
    }
    if is_systemic_message(&lower) {
        return ErrorKind::Systemic;
    }
    ErrorKind::Transient
}

/// Match the systemic vocabulary against an already lower-cased message.
pub fn is_systemic_message(lower: &str) -> bool {
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    SYSTEMIC_PATTERNS
        .iter()
        .any(|(keyword, qualifier)| lower.contains(keyword) && lower.contains(qualifier))
}

// "oom" must not match inside words like "room" or "bloom".
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.contains(' ') || needle.len() > 4 {
        return haystack.contains(needle);
    }
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|w| w == needle)
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn load_err(message: &str, sqlstate: Option<&str>, detail: Option<&str>) -> MigrateError {
        MigrateError::Load {
            table: "public.events".into(),
            message: message.into(),
            sqlstate: sqlstate.map(str::to_string),
            constraint: None,
            detail: detail.map(str::to_string),
        }
    }

    #[test]
    fn test_memory_vocabulary() {
        assert_eq!(classify(None, "ERROR: out of memory"), ErrorKind::MemoryPressure);
        assert_eq!(classify(None, "MemoryError"), ErrorKind::MemoryPressure);
        assert_eq!(classify(None, "worker killed: OOM"), ErrorKind::MemoryPressure);
        assert_eq!(classify(Some("53200"), "whatever"), ErrorKind::MemoryPressure);
    }

    #[test]
    fn test_oom_is_not_matched_inside_words() {
        assert_eq!(classify(None, "no room left in bloom filter"), ErrorKind::Transient);
    }

    #[test]
    fn test_duplicate_key_is_conflict() {
        let msg = "duplicate key value violates unique constraint \"events_pkey\"";
        assert_eq!(classify(None, msg), ErrorKind::Conflict);
        assert_eq!(classify(Some("23505"), "x"), ErrorKind::Conflict);
    }

    #[test]
    fn test_systemic_vocabulary() {
        let cases = [
            "column \"foo\" does not exist",
            "relation \"public.events\" does not exist",
            "permission denied for table events",
            "password authentication failed for user",
            "syntax error at or near \"FROM\"",
            "connection refused",
            "invalid input syntax for type integer: \"abc\"",
        ];
        for msg in cases {
            assert_eq!(classify(None, msg), ErrorKind::Systemic, "{}", msg);
        }
    }

    #[test]
    fn test_transient_markers_override_systemic() {
        assert_eq!(
            classify(None, "could not connect to database: timeout expired"),
            ErrorKind::Transient
        );
        assert_eq!(
            classify(None, "connection reset by peer"),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_sqlstate_classes() {
        assert_eq!(classify(Some("42703"), "undefined column"), ErrorKind::Systemic);
        assert_eq!(classify(Some("28P01"), "auth"), ErrorKind::Systemic);
        assert_eq!(classify(Some("57014"), "canceling statement"), ErrorKind::Transient);
    }

    #[test]
    fn test_unknown_is_transient() {
        assert_eq!(classify(None, "something odd happened"), ErrorKind::Transient);
    }

    #[test]
    fn test_error_kind_by_variant() {
        assert_eq!(MigrateError::Cancelled.kind(), ErrorKind::Fatal);
        assert!(MigrateError::Config("bad".into()).is_systemic());
        assert!(load_err("column \"x\" does not exist", None, None).is_systemic());
        assert_eq!(
            load_err("duplicate key", Some("23505"), None).kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_kind_ignores_table_name_and_prefix() {
        // "Transfer failed for table ..." must not pair with "not found"
        let e = MigrateError::transfer("analytics.events", "file not found");
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert_eq!(e.inner_message(), "file not found");

        let e = MigrateError::Load {
            table: "analytics.type_mismatch_log".into(),
            message: "could not serialize access".into(),
            sqlstate: None,
            constraint: None,
            detail: None,
        };
        assert_eq!(e.kind(), ErrorKind::Transient);

        let e = MigrateError::transfer("analytics.events", "column \"x\" does not exist");
        assert!(e.is_systemic());
        let e = MigrateError::Source {
            message: "relation \"EVENTS\" does not exist".into(),
            sqlstate: None,
        };
        assert!(e.is_systemic());
    }

    #[test]
    fn test_conflict_key_columns() {
        let e = load_err(
            "duplicate key value violates unique constraint",
            Some("23505"),
            Some("Key (id)=(42) already exists."),
        );
        assert_eq!(e.conflict_key_columns(), vec!["id".to_string()]);

        let e = load_err("dup", Some("23505"), Some("Key (tenant_id, \"Code\")=(1, a) already exists."));
        assert_eq!(
            e.conflict_key_columns(),
            vec!["tenant_id".to_string(), "Code".to_string()]
        );

        assert!(MigrateError::Cancelled.conflict_key_columns().is_empty());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 1);
        assert_eq!(MigrateError::pool("x", "y").exit_code(), 2);
        assert_eq!(MigrateError::transfer("t", "m").exit_code(), 3);
        assert_eq!(MigrateError::State("x".into()).exit_code(), 4);
        assert_eq!(
            MigrateError::TruncateRefused {
                table: "t".into(),
                reason: "r".into()
            }
            .exit_code(),
            5
        );
        assert_eq!(MigrateError::Cancelled.exit_code(), 6);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(MigrateError::Io(io).exit_code(), 7);
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let e = MigrateError::transfer("public.events", "boom");
        let out = e.format_detailed();
        assert!(out.starts_with("Error: Transfer failed for table public.events: boom"));
    }
}
