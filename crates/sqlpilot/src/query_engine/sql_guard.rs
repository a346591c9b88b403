//! Pre-execution checks and normalisation of generated SQL.

use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;

use crate::backends::{QueryExecutor, ResultPreview};
use crate::error::{ExecutionError, PipelineError};

lazy_static! {
    static ref SELECT_RE: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref MUTATING_RE: Regex = Regex::new(
        r"(?i)\b(DROP|DELETE|TRUNCATE|ALTER|CREATE|INSERT|UPDATE|REPLACE|GRANT|REVOKE|EXEC|EXECUTE)\b"
    )
    .unwrap();
    // `LIMIT n`, `LIMIT n OFFSET m` and `LIMIT m, n`; `count` is the row count in each form.
    static ref LIMIT_RE: Regex =
        Regex::new(r"(?i)\bLIMIT\s+(?:\d+\s*,\s*)?(?P<count>\d+)(?:\s+OFFSET\s+\d+)?\s*$").unwrap();
    static ref SPACES_RE: Regex = Regex::new(r"[ \t]+").unwrap();
}

/// Reject text that is empty, not a query, mutating, or structurally broken.
pub fn validate_sql(sql: &str) -> Result<(), PipelineError> {
    if sql.trim().is_empty() {
        return Err(PipelineError::Validation("SQL query is empty".to_string()));
    }
    let code = strip_string_literals(sql);
    if !SELECT_RE.is_match(&code) {
        return Err(PipelineError::Validation(
            "Query must contain SELECT statement".to_string(),
        ));
    }
    if let Some(m) = MUTATING_RE.find(&code) {
        return Err(PipelineError::Validation(format!(
            "Disallowed keyword detected: {}",
            m.as_str().to_uppercase()
        )));
    }
    if code.matches('(').count() != code.matches(')').count() {
        return Err(PipelineError::Validation(
            "Unbalanced parentheses in query".to_string(),
        ));
    }
    if !quotes_balanced(sql) {
        return Err(PipelineError::Validation(
            "Unbalanced single quotes in query".to_string(),
        ));
    }
    Ok(())
}

/// Trim, collapse horizontal whitespace, normalise line endings and drop trailing semicolons.
pub fn sanitize_sql(sql: &str) -> String {
    let unified = sql.trim().replace("\r\n", "\n");
    let collapsed = SPACES_RE.replace_all(&unified, " ");
    collapsed.trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string()
}

/// Append `LIMIT limit` when the query has no trailing limit clause; lower a larger count.
/// An existing offset is kept as written.
pub fn apply_row_limit(sql: &str, limit: usize) -> String {
    let sql = sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if let Some(count) = LIMIT_RE.captures(sql).and_then(|caps| caps.name("count")) {
        let existing: usize = count.as_str().parse().unwrap_or(usize::MAX);
        if existing <= limit {
            return sql.to_string();
        }
        return format!("{}{}{}", &sql[..count.start()], limit, &sql[count.end()..]);
    }
    format!("{} LIMIT {}", sql, limit)
}

/// Run an already validated query with the row cap applied, cancelling it after `timeout`.
/// One extra row is requested so the executor can tell whether the result was truncated.
pub async fn execute_limited(
    executor: &dyn QueryExecutor,
    sql: &str,
    row_limit: usize,
    timeout: Duration,
) -> Result<ResultPreview, ExecutionError> {
    let limited = apply_row_limit(sql, row_limit.saturating_add(1));
    match tokio::time::timeout(timeout, executor.execute(&limited, row_limit)).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::timeout(timeout.as_secs())),
    }
}

/// Single quotes balance once doubled (escaped) quotes inside literals are accounted for.
fn quotes_balanced(sql: &str) -> bool {
    let mut in_string = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        if in_string && chars.peek() == Some(&'\'') {
            chars.next();
            continue;
        }
        in_string = !in_string;
    }
    !in_string
}

/// Replace the contents of single-quoted literals with spaces so keyword scans ignore data.
fn strip_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if in_string && chars.peek() == Some(&'\'') {
                chars.next();
                out.push_str("  ");
                continue;
            }
            in_string = !in_string;
            out.push(c);
        } else if in_string {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}
