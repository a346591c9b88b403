//! Prompt assembly for generation, repair and summarisation, and SQL extraction from model text.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::backends::ResultPreview;

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?i)```(?:sql)?\s*([\s\S]*?)```").unwrap();
}

const LEADING_LABELS: &[&str] = &["SQL Query:", "Here is the SQL:", "Corrected SQL:", "Query:", "SQL:"];

/// Rows of the result shown to the model when summarising.
pub const SUMMARY_SAMPLE_ROWS: usize = 10;

/// A prompt and its system prompt, ready for the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    dialect: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new("SQLite")
    }
}

impl PromptBuilder {
    pub fn new(dialect: impl Into<String>) -> Self {
        Self { dialect: dialect.into() }
    }

    pub fn generation(&self, question: &str, schema: &str, history: &str, hints: &str) -> Prompt {
        let mut user = format!("Database schema:\n\n{}\n", schema);
        if !history.is_empty() {
            user.push_str(&format!(
                "\nPREVIOUS CONVERSATION CONTEXT:\n{}\n\n\
                 Resolve references such as \"those\", \"that data\" or \"the same customers\" against this context.\n",
                history
            ));
        }
        if !hints.is_empty() {
            user.push_str(hints);
            user.push('\n');
        }
        user.push_str(&format!(
            "\nWrite a SQL query answering the current question: {}\n\n\
             RULES:\n\
             - Use the {} dialect\n\
             - Reference tables by bare name, without database prefixes\n\
             - Cast text columns where a numeric or date comparison needs it\n\
             - Use COALESCE where NULLs would distort the answer\n\
             - Give computed columns meaningful aliases\n\
             - When the question refers to earlier results, build on the earlier SQL\n\n\
             Return only the SQL query.",
            question, self.dialect
        ));
        Prompt {
            system: format!(
                "You are an expert SQL developer with conversation memory. Generate valid {} SQL.",
                self.dialect
            ),
            user,
        }
    }

    pub fn repair(&self, failed_sql: &str, error: &str, schema: &str, hints: &str) -> Prompt {
        let mut user = format!(
            "This SQL query failed:\n\n```sql\n{}\n```\n\nError: {}\n\nSchema context:\n{}\n",
            failed_sql, error, schema
        );
        if !hints.is_empty() {
            user.push_str(hints);
            user.push('\n');
        }
        user.push_str(
            "\nCorrect the query so that it runs. Typical causes:\n\
             - unknown table: drop database prefixes and use names from the schema\n\
             - unknown column: match column names exactly as listed\n\
             - type mismatch: cast text columns explicitly\n\
             - syntax error: check the dialect's syntax\n\n\
             Return only the corrected SQL query.",
        );
        Prompt {
            system: format!(
                "You are an expert at debugging {} SQL. Fix the query.",
                self.dialect
            ),
            user,
        }
    }

    pub fn summary(&self, question: &str, sql: &str, preview: &ResultPreview) -> Prompt {
        let sample: Vec<Value> = preview
            .rows
            .iter()
            .take(SUMMARY_SAMPLE_ROWS)
            .map(|row| {
                let object: Map<String, Value> = preview
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(object)
            })
            .collect();
        let sample = serde_json::to_string_pretty(&sample).unwrap_or_else(|_| "[]".to_string());
        Prompt {
            system: "You are a data analyst. Be concise and insightful.".to_string(),
            user: format!(
                "Summarize this query result concisely:\n\nQuestion: {}\n\nSQL: {}\n\n\
                 Results ({} rows):\n{}\n\nGive a 2-3 sentence summary of the key findings.",
                question, sql, preview.total_rows, sample
            ),
        }
    }
}

/// Summary used when the model is unavailable for summarisation.
pub fn fallback_summary(preview: &ResultPreview) -> String {
    match preview.total_rows {
        0 => "The query ran successfully but returned no rows.".to_string(),
        1 => "The query returned 1 row.".to_string(),
        _ if preview.truncated => format!(
            "The query returned more than {} rows; showing the first {}.",
            preview.rows.len(),
            preview.rows.len()
        ),
        n => format!("The query returned {} rows.", n),
    }
}

/// Pull the SQL out of a model completion: first fenced block, else the text minus a leading label.
pub fn extract_sql(response: &str) -> String {
    if let Some(caps) = FENCED_BLOCK.captures(response) {
        return caps[1].trim().to_string();
    }
    let mut sql = response.trim();
    for label in LEADING_LABELS {
        if sql.len() >= label.len()
            && sql.is_char_boundary(label.len())
            && sql[..label.len()].eq_ignore_ascii_case(label)
        {
            sql = sql[label.len()..].trim();
        }
    }
    sql.to_string()
}
