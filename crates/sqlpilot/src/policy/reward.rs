//! Heuristic reward for a candidate query.
//!
//! Four independent sub-scores, each in [-1, 1], combined through fixed weights.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::utils::KeywordExtractor;

lazy_static! {
    static ref SELECT_RE: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref FROM_RE: Regex = Regex::new(r"(?i)\bFROM\b").unwrap();
    static ref SHAPE_RE: Regex = Regex::new(r"(?is)\bSELECT\s+.+\s+FROM\s+\w+").unwrap();
    static ref ALIAS_RE: Regex = Regex::new(r"(?i)\bAS\s+\w+").unwrap();

    static ref GOOD_PATTERNS: Vec<(&'static str, Regex)> = vec![
        ("explicit_cast", Regex::new(r"(?i)\bCAST\s*\(").unwrap()),
        ("null_handling", Regex::new(r"(?i)\bCOALESCE\s*\(").unwrap()),
        ("aliasing", Regex::new(r"(?i)\bAS\s+\w+").unwrap()),
        ("row_limit", Regex::new(r"(?i)\bLIMIT\s+\d+").unwrap()),
        ("ordering", Regex::new(r"(?i)\bORDER\s+BY\b").unwrap()),
    ];

    static ref BAD_PATTERNS: Vec<(&'static str, Regex)> = vec![
        ("select_star", Regex::new(r"(?i)\bSELECT\s+\*").unwrap()),
        ("triple_qualified_name", Regex::new(r"\b[A-Za-z_]\w*\.[A-Za-z_]\w*\.[A-Za-z_]\w*").unwrap()),
        ("inline_comment", Regex::new(r"(?m)--.*$").unwrap()),
    ];
}

const AGGREGATE_HINTS: &[&str] = &["total", "sum", "count", "average", "avg", "max", "min", "how many"];
const AGGREGATE_CALLS: &[&str] = &["sum(", "count(", "avg(", "max(", "min("];
const CASING_KEYWORDS: &[&str] = &["SELECT", "FROM", "WHERE", "JOIN"];

/// Weights of the four sub-scores. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    pub validity: f64,
    pub executability: f64,
    pub relevance: f64,
    pub style: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            validity: 0.20,
            executability: 0.30,
            relevance: 0.35,
            style: 0.15,
        }
    }
}

impl RewardWeights {
    pub fn new(validity: f64, executability: f64, relevance: f64, style: f64) -> anyhow::Result<Self> {
        let weights = Self { validity, executability, relevance, style };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let parts = [self.validity, self.executability, self.relevance, self.style];
        if parts.iter().any(|w| !(0.0..=1.0).contains(w)) {
            anyhow::bail!("reward weights must each lie in [0, 1]: {:?}", self);
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("reward weights must sum to 1.0, got {:.6}", sum);
        }
        Ok(())
    }
}

/// What happened when a candidate was run, if it was run at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded { row_count: usize },
    Failed { kind: ExecutionErrorKind },
}

impl From<&ExecutionError> for ExecutionOutcome {
    fn from(e: &ExecutionError) -> Self {
        Self::Failed { kind: e.kind }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidityChecks {
    pub has_select: bool,
    pub has_from: bool,
    pub balanced_parens: bool,
    pub balanced_quotes: bool,
    pub select_from_shape: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevanceChecks {
    pub keyword_match: f64,
    pub table_coverage: f64,
    pub aggregation_match: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleChecks {
    pub good_patterns: Vec<String>,
    pub bad_patterns: Vec<String>,
    pub readability: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub validity: f64,
    pub executability: f64,
    pub relevance: f64,
    pub style: f64,
    pub total: f64,
    pub validity_checks: ValidityChecks,
    pub relevance_checks: RelevanceChecks,
    pub style_checks: StyleChecks,
}

/// Input to one scoring call.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub sql: &'a str,
    pub question: &'a str,
    pub outcome: Option<ExecutionOutcome>,
    pub expected_tables: Option<&'a [String]>,
}

impl<'a> Candidate<'a> {
    pub fn new(sql: &'a str, question: &'a str) -> Self {
        Self { sql, question, outcome: None, expected_tables: None }
    }

    pub fn with_outcome(mut self, outcome: ExecutionOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_expected_tables(mut self, tables: &'a [String]) -> Self {
        self.expected_tables = Some(tables);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RewardScorer {
    weights: RewardWeights,
    keywords: KeywordExtractor,
}

impl RewardScorer {
    pub fn new(weights: RewardWeights) -> Self {
        Self { weights, keywords: KeywordExtractor::default() }
    }

    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    pub fn score(&self, candidate: Candidate<'_>) -> RewardBreakdown {
        let (validity, validity_checks) = self.validity(candidate.sql);
        let executability = Self::executability(candidate.outcome);
        let (relevance, relevance_checks) =
            self.relevance(candidate.sql, candidate.question, candidate.expected_tables);
        let (style, style_checks) = Self::style(candidate.sql);

        let w = &self.weights;
        let total = validity * w.validity
            + executability * w.executability
            + relevance * w.relevance
            + style * w.style;

        RewardBreakdown {
            validity,
            executability,
            relevance,
            style,
            total: total.clamp(-1.0, 1.0),
            validity_checks,
            relevance_checks,
            style_checks,
        }
    }

    pub fn validity(&self, sql: &str) -> (f64, ValidityChecks) {
        if sql.trim().is_empty() {
            return (-1.0, ValidityChecks::default());
        }
        let checks = ValidityChecks {
            has_select: SELECT_RE.is_match(sql),
            has_from: FROM_RE.is_match(sql),
            balanced_parens: parens_balanced(sql),
            balanced_quotes: sql.matches('\'').count() % 2 == 0 && sql.matches('"').count() % 2 == 0,
            select_from_shape: SHAPE_RE.is_match(sql),
        };
        let mut score = 0.0;
        if checks.has_select {
            score += 0.3;
        }
        if checks.has_from {
            score += 0.3;
        }
        if checks.balanced_parens {
            score += 0.15;
        }
        if checks.balanced_quotes {
            score += 0.15;
        }
        if checks.select_from_shape {
            score += 0.1;
        }
        (to_signed(score), checks)
    }

    pub fn executability(outcome: Option<ExecutionOutcome>) -> f64 {
        match outcome {
            None => 0.0,
            Some(ExecutionOutcome::Succeeded { row_count: 0 }) => 0.3,
            Some(ExecutionOutcome::Succeeded { .. }) => 1.0,
            Some(ExecutionOutcome::Failed { kind }) => kind.penalty(),
        }
    }

    pub fn relevance(
        &self,
        sql: &str,
        question: &str,
        expected_tables: Option<&[String]>,
    ) -> (f64, RelevanceChecks) {
        let sql_lower = sql.to_lowercase();
        let question_lower = question.to_lowercase();

        let keywords = self.keywords.extract(&question_lower);
        let matched = keywords.iter().filter(|kw| sql_lower.contains(kw.as_str())).count();
        let keyword_match = matched as f64 / keywords.len().max(1) as f64;

        let table_coverage = match expected_tables {
            Some(tables) if !tables.is_empty() => {
                let hit = tables
                    .iter()
                    .filter(|t| sql_lower.contains(&t.to_lowercase()))
                    .count();
                hit as f64 / tables.len() as f64
            }
            _ => 0.5,
        };

        let needs_aggregation = AGGREGATE_HINTS.iter().any(|kw| question_lower.contains(kw));
        let has_aggregation = AGGREGATE_CALLS.iter().any(|call| sql_lower.contains(call));
        let aggregation_match = needs_aggregation == has_aggregation;

        let score = keyword_match * 0.3
            + table_coverage * 0.4
            + if aggregation_match { 0.3 } else { 0.0 };

        (
            to_signed(score),
            RelevanceChecks { keyword_match, table_coverage, aggregation_match },
        )
    }

    pub fn style(sql: &str) -> (f64, StyleChecks) {
        let good_patterns: Vec<String> = GOOD_PATTERNS
            .iter()
            .filter(|(_, re)| re.is_match(sql))
            .map(|(name, _)| name.to_string())
            .collect();
        let bad_patterns: Vec<String> = BAD_PATTERNS
            .iter()
            .filter(|(_, re)| re.is_match(sql))
            .map(|(name, _)| name.to_string())
            .collect();

        let mut readability = 0.0;
        if CASING_KEYWORDS.iter().any(|kw| sql.contains(kw)) {
            readability += 0.33;
        }
        if ALIAS_RE.is_match(sql) {
            readability += 0.33;
        }
        if sql.contains('\n') {
            readability += 0.34;
        }

        let good = (good_patterns.len() as f64 * 0.2).min(0.5);
        let bad = (bad_patterns.len() as f64 * 0.2).min(0.5);
        let score = 0.5 + good + readability * 0.3 - bad;

        (
            to_signed(score),
            StyleChecks { good_patterns, bad_patterns, readability },
        )
    }
}

/// Map a [0, 1] score onto [-1, 1].
fn to_signed(score: f64) -> f64 {
    (score * 2.0 - 1.0).clamp(-1.0, 1.0)
}

fn parens_balanced(sql: &str) -> bool {
    let mut depth: i64 = 0;
    for c in sql.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> RewardScorer {
        RewardScorer::default()
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!(RewardWeights::default().validate().is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(RewardWeights::new(0.5, 0.5, 0.5, 0.5).is_err());
        assert!(RewardWeights::new(0.25, 0.25, 0.25, 0.25).is_ok());
        assert!(RewardWeights::new(1.2, -0.2, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_empty_query_is_maximally_invalid() {
        let (score, _) = scorer().validity("");
        assert!(score < 0.0);
        assert_eq!(score, -1.0);
        assert_eq!(scorer().validity("   \n").0, -1.0);
    }

    #[test]
    fn test_select_from_with_balanced_punctuation_is_valid() {
        let (score, checks) = scorer().validity("SELECT product, SUM(revenue) FROM sales WHERE region = 'EU'");
        assert!(score > 0.0);
        assert!(checks.has_select && checks.has_from && checks.balanced_parens && checks.balanced_quotes);
        assert!(checks.select_from_shape);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unbalanced_parens_lower_validity() {
        let (balanced, _) = scorer().validity("SELECT COUNT(id) FROM t");
        let (broken, checks) = scorer().validity("SELECT COUNT(id FROM t");
        assert!(!checks.balanced_parens);
        assert!(broken < balanced);
        let (closing_first, _) = scorer().validity("SELECT )id( FROM t");
        assert!(closing_first < balanced);
    }

    #[test]
    fn test_executability_mapping() {
        assert_eq!(RewardScorer::executability(None), 0.0);
        assert_eq!(RewardScorer::executability(Some(ExecutionOutcome::Succeeded { row_count: 12 })), 1.0);
        assert_eq!(RewardScorer::executability(Some(ExecutionOutcome::Succeeded { row_count: 0 })), 0.3);
        let syntax = RewardScorer::executability(Some(ExecutionOutcome::Failed { kind: ExecutionErrorKind::Syntax }));
        let timeout = RewardScorer::executability(Some(ExecutionOutcome::Failed { kind: ExecutionErrorKind::Timeout }));
        assert!(syntax < timeout && timeout < 0.0);
    }

    #[test]
    fn test_relevance_rewards_matching_aggregation() {
        let question = "Show total revenue by product";
        let (with_agg, checks) = scorer().relevance(
            "SELECT product, SUM(revenue) FROM sales GROUP BY product",
            question,
            None,
        );
        assert!(checks.aggregation_match);
        assert_eq!(checks.table_coverage, 0.5);
        let (without_agg, _) = scorer().relevance("SELECT product FROM sales", question, None);
        assert!(with_agg > without_agg);
    }

    #[test]
    fn test_relevance_table_coverage() {
        let expected = vec!["sales".to_string(), "products".to_string()];
        let (_, checks) = scorer().relevance("SELECT * FROM sales", "list sales", Some(&expected));
        assert!((checks.table_coverage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_style_good_and_bad_patterns() {
        let good = "SELECT CAST(amount AS INTEGER) AS amt\nFROM sales\nORDER BY amt\nLIMIT 10";
        let bad = "select * from db.schema.sales -- todo";
        let (good_score, good_checks) = RewardScorer::style(good);
        let (bad_score, bad_checks) = RewardScorer::style(bad);
        assert!(good_checks.good_patterns.contains(&"explicit_cast".to_string()));
        assert_eq!(bad_checks.bad_patterns.len(), 3);
        assert!(good_score > bad_score);
        assert!((-1.0..=1.0).contains(&good_score));
        assert!((-1.0..=1.0).contains(&bad_score));
    }

    #[test]
    fn test_total_is_weighted_sum() {
        let s = scorer();
        let sql = "SELECT product, SUM(revenue) AS total FROM sales GROUP BY product";
        let b = s.score(
            Candidate::new(sql, "total revenue by product")
                .with_outcome(ExecutionOutcome::Succeeded { row_count: 3 }),
        );
        let w = RewardWeights::default();
        let expected = b.validity * w.validity
            + b.executability * w.executability
            + b.relevance * w.relevance
            + b.style * w.style;
        assert!((b.total - expected).abs() < 1e-9);
        for sub in [b.validity, b.executability, b.relevance, b.style, b.total] {
            assert!((-1.0..=1.0).contains(&sub));
        }
    }
}
