//! Tracing instrumentation for daemon operations.
//!
//! Spans follow the OpenTelemetry database semantic conventions so that a
//! `tracing-opentelemetry` layer installed by the application exports them
//! unchanged:
//! - `db.system`: "db2i"
//! - `db.statement`: SQL statement (sanitized by default)
//! - `db.operation`: statement kind (SELECT, INSERT, CALL, ...)
//! - `server.address` / `server.port`: daemon location
//!
//! Statements are recorded after [`SanitizationConfig::sanitize`], which
//! replaces literals with a placeholder so that values never reach the
//! trace backend.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::Span;

/// Database system identifier.
pub const DB_SYSTEM: &str = "db2i";

/// Span names.
pub mod span_names {
    /// Channel open plus `connect` request.
    pub const CONNECT: &str = "db2i.connect";
    /// First page of a statement.
    pub const QUERY: &str = "db2i.query";
    /// Continuation page.
    pub const FETCH_MORE: &str = "db2i.fetch_more";
    /// CL command.
    pub const CL_COMMAND: &str = "db2i.cl_command";
    /// Statement close.
    pub const CLOSE: &str = "db2i.close";
}

/// Attribute keys.
pub mod attributes {
    /// Database system.
    pub const DB_SYSTEM: &str = "db.system";
    /// Statement text.
    pub const DB_STATEMENT: &str = "db.statement";
    /// Statement kind.
    pub const DB_OPERATION: &str = "db.operation";
    /// Daemon host.
    pub const SERVER_ADDRESS: &str = "server.address";
    /// Daemon port.
    pub const SERVER_PORT: &str = "server.port";
    /// Rows affected.
    pub const DB_ROWS_AFFECTED: &str = "db.rows_affected";
    /// Client-side job id.
    pub const DB_CONNECTION_ID: &str = "db.connection_id";
    /// Correlation id of the statement.
    pub const DB_CORRELATION_ID: &str = "db.db2i.correlation_id";
}

/// Configuration for statement sanitization.
#[derive(Debug, Clone)]
pub struct SanitizationConfig {
    /// Whether to sanitize statements.
    pub enabled: bool,
    /// Maximum length of statement to record.
    pub max_length: usize,
    /// Placeholder for removed literals.
    pub placeholder: String,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl SanitizationConfig {
    /// A configuration that records statements verbatim.
    #[must_use]
    pub fn no_sanitization() -> Self {
        Self {
            enabled: false,
            max_length: usize::MAX,
            placeholder: String::new(),
        }
    }

    /// Sanitize a statement according to the configuration.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        if !self.enabled {
            return truncate(sql, self.max_length);
        }
        truncate(&replace_literals(sql, &self.placeholder), self.max_length)
    }
}

/// Replace string, hex and numeric literals. Quoted identifiers are kept.
fn replace_literals(sql: &str, placeholder: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                // X'..' and G'..' prefixes belong to the literal
                if out.ends_with(['X', 'x', 'G', 'g'])
                    && !out[..out.len() - 1].ends_with(|ch: char| ch.is_alphanumeric() || ch == '_')
                {
                    out.pop();
                }
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                        }
                        Some('\'') | None => break,
                        Some(_) => {}
                    }
                }
                out.push_str(placeholder);
            }
            '"' => {
                out.push(c);
                for ch in chars.by_ref() {
                    out.push(ch);
                    if ch == '"' {
                        break;
                    }
                }
            }
            d if d.is_ascii_digit()
                && !out.ends_with(|ch: char| ch.is_alphanumeric() || ch == '_') =>
            {
                while chars
                    .peek()
                    .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
                {
                    chars.next();
                }
                out.push_str(placeholder);
            }
            _ => out.push(c),
        }
    }

    out
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

static LEADING_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^\s*(?:\(\s*)*([A-Za-z]+)").expect("literal pattern is valid")
});

/// Statement kind, from its leading keyword.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    let Some(keyword) = LEADING_KEYWORD
        .captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
    else {
        return "OTHER";
    };

    match keyword.as_str() {
        "SELECT" => "SELECT",
        "WITH" => "WITH",
        "VALUES" => "VALUES",
        "INSERT" => "INSERT",
        "UPDATE" => "UPDATE",
        "DELETE" => "DELETE",
        "MERGE" => "MERGE",
        "CALL" => "CALL",
        "COMMIT" => "COMMIT",
        "ROLLBACK" => "ROLLBACK",
        "CREATE" => "CREATE",
        "ALTER" => "ALTER",
        "DROP" => "DROP",
        "SET" => "SET",
        _ => "OTHER",
    }
}

/// Span covering a connect.
#[must_use]
pub fn connect_span(job: &str, host: &str, port: u16) -> Span {
    tracing::info_span!(
        "db2i.connect",
        db.system = DB_SYSTEM,
        db.connection_id = %job,
        server.address = %host,
        server.port = port,
    )
}

/// Span covering one statement request.
#[must_use]
pub fn statement_span(name: &'static str, job: &str, sql: &str, config: &SanitizationConfig) -> Span {
    let statement = config.sanitize(sql);
    match name {
        span_names::FETCH_MORE => tracing::debug_span!(
            "db2i.fetch_more",
            db.system = DB_SYSTEM,
            db.connection_id = %job,
            db.statement = %statement,
            db.rows_affected = tracing::field::Empty,
            db.db2i.correlation_id = tracing::field::Empty,
        ),
        span_names::CLOSE => tracing::debug_span!(
            "db2i.close",
            db.system = DB_SYSTEM,
            db.connection_id = %job,
        ),
        span_names::CL_COMMAND => tracing::info_span!(
            "db2i.cl_command",
            db.system = DB_SYSTEM,
            db.connection_id = %job,
            db.statement = %statement,
            db.rows_affected = tracing::field::Empty,
            db.db2i.correlation_id = tracing::field::Empty,
        ),
        _ => tracing::info_span!(
            "db2i.query",
            db.system = DB_SYSTEM,
            db.connection_id = %job,
            db.statement = %statement,
            db.operation = extract_operation(sql),
            db.rows_affected = tracing::field::Empty,
            db.db2i.correlation_id = tracing::field::Empty,
        ),
    }
}

/// Record a statement's outcome on the span from [`statement_span`].
pub fn record_result(span: &Span, correlation_id: &str, rows_affected: i64) {
    span.record(attributes::DB_CORRELATION_ID, correlation_id);
    span.record(attributes::DB_ROWS_AFFECTED, rows_affected);
}
