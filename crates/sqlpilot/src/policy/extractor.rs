//! Structural scan of SQL text: referenced tables and catalogued query patterns.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

lazy_static! {
    /// Named structural features, in reporting order.
    static ref PATTERN_CATALOG: Vec<(&'static str, Regex)> = vec![
        ("GROUP BY", Regex::new(r"(?i)\bGROUP\s+BY\b").unwrap()),
        ("JOIN", Regex::new(r"(?i)\bJOIN\b").unwrap()),
        ("LEFT JOIN", Regex::new(r"(?i)\bLEFT\s+(?:OUTER\s+)?JOIN\b").unwrap()),
        ("RIGHT JOIN", Regex::new(r"(?i)\bRIGHT\s+(?:OUTER\s+)?JOIN\b").unwrap()),
        ("INNER JOIN", Regex::new(r"(?i)\bINNER\s+JOIN\b").unwrap()),
        ("CAST", Regex::new(r"(?i)\bCAST\s*\(").unwrap()),
        ("COALESCE", Regex::new(r"(?i)\bCOALESCE\s*\(").unwrap()),
        ("CASE WHEN", Regex::new(r"(?i)\bCASE\s+WHEN\b").unwrap()),
        ("ORDER BY", Regex::new(r"(?i)\bORDER\s+BY\b").unwrap()),
        ("HAVING", Regex::new(r"(?i)\bHAVING\b").unwrap()),
        ("DISTINCT", Regex::new(r"(?i)\bDISTINCT\b").unwrap()),
        ("COUNT", Regex::new(r"(?i)\bCOUNT\s*\(").unwrap()),
        ("SUM", Regex::new(r"(?i)\bSUM\s*\(").unwrap()),
        ("AVG", Regex::new(r"(?i)\bAVG\s*\(").unwrap()),
        ("MAX", Regex::new(r"(?i)\bMAX\s*\(").unwrap()),
        ("MIN", Regex::new(r"(?i)\bMIN\s*\(").unwrap()),
        ("WHERE IN", Regex::new(r"(?is)\bWHERE\b.*\bIN\s*\(").unwrap()),
        ("WHERE LIKE", Regex::new(r"(?is)\bWHERE\b.*\bLIKE\b").unwrap()),
        ("WHERE BETWEEN", Regex::new(r"(?is)\bWHERE\b.*\bBETWEEN\b").unwrap()),
        ("LIMIT", Regex::new(r"(?i)\bLIMIT\s+\d+").unwrap()),
        ("DATE_TRUNC", Regex::new(r"(?i)\bDATE_TRUNC\s*\(").unwrap()),
        ("TO_DATE", Regex::new(r"(?i)\bTO_DATE\s*\(").unwrap()),
        ("SUBSTRING", Regex::new(r"(?i)\bSUBSTR(?:ING)?\s*\(").unwrap()),
    ];

    static ref TABLE_REF: Regex =
        Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+[`"\[]?([A-Za-z_][\w.]*)"#).unwrap();
}

const RESERVED: &[&str] = &["select", "where", "and", "or", "on", "as", "lateral", "unnest"];

/// Tables and patterns found in one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFeatures {
    pub tables: Vec<String>,
    pub patterns: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PatternExtractor;

impl PatternExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Names of every catalogued feature, in reporting order.
    pub fn catalog() -> Vec<&'static str> {
        PATTERN_CATALOG.iter().map(|(name, _)| *name).collect()
    }

    /// Lowercased, deduplicated, sorted table names following FROM or JOIN.
    pub fn extract_tables(&self, sql: &str) -> Vec<String> {
        let tables: BTreeSet<String> = TABLE_REF
            .captures_iter(sql)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_lowercase())
            .filter(|name| !RESERVED.contains(&name.as_str()))
            .collect();
        tables.into_iter().collect()
    }

    /// Catalogued features present in the query.
    pub fn extract_patterns(&self, sql: &str) -> Vec<String> {
        PATTERN_CATALOG
            .iter()
            .filter(|(_, re)| re.is_match(sql))
            .map(|(name, _)| name.to_string())
            .collect()
    }

    pub fn extract(&self, sql: &str) -> QueryFeatures {
        QueryFeatures {
            tables: self.extract_tables(sql),
            patterns: self.extract_patterns(sql),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_size() {
        assert!(PatternExtractor::catalog().len() >= 20);
    }

    #[test]
    fn test_extract_tables_from_and_join() {
        let sql = "SELECT o.id, c.name FROM Orders o LEFT JOIN customers c ON o.customer_id = c.id";
        assert_eq!(PatternExtractor::new().extract_tables(sql), vec!["customers", "orders"]);
    }

    #[test]
    fn test_extract_tables_skips_subqueries_and_reserved() {
        let sql = "SELECT * FROM (SELECT id FROM sales) s";
        assert_eq!(PatternExtractor::new().extract_tables(sql), vec!["sales"]);
    }

    #[test]
    fn test_extract_tables_qualified_and_quoted() {
        let sql = "select x from \"analytics.events\" join warehouse.dim_date d on 1=1";
        assert_eq!(
            PatternExtractor::new().extract_tables(sql),
            vec!["analytics.events", "warehouse.dim_date"]
        );
    }

    #[test]
    fn test_extract_patterns_case_insensitive() {
        let sql = "select product, sum(revenue) as total from sales group by product order by total desc limit 5";
        let patterns = PatternExtractor::new().extract_patterns(sql);
        assert_eq!(patterns, vec!["GROUP BY", "ORDER BY", "SUM", "LIMIT"]);
    }

    #[test]
    fn test_where_predicates_across_lines() {
        let sql = "SELECT name\nFROM customers\nWHERE\n  region IN ('north', 'south')\n  AND name LIKE 'A%'\n  AND created_at BETWEEN '2024-01-01' AND '2024-12-31'";
        let patterns = PatternExtractor::new().extract_patterns(sql);
        for expected in ["WHERE IN", "WHERE LIKE", "WHERE BETWEEN"] {
            assert!(patterns.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_join_kinds() {
        let sql = "SELECT a.x FROM a INNER JOIN b ON a.id = b.id";
        let patterns = PatternExtractor::new().extract_patterns(sql);
        assert!(patterns.contains(&"JOIN".to_string()));
        assert!(patterns.contains(&"INNER JOIN".to_string()));
        assert!(!patterns.contains(&"LEFT JOIN".to_string()));
    }

    #[test]
    fn test_predicates() {
        let sql = "SELECT id FROM t WHERE region IN ('a','b') AND name LIKE 'x%' AND d BETWEEN 1 AND 2";
        let patterns = PatternExtractor::new().extract_patterns(sql);
        for expected in ["WHERE IN", "WHERE LIKE", "WHERE BETWEEN"] {
            assert!(patterns.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_empty_query() {
        assert_eq!(PatternExtractor::new().extract(""), QueryFeatures::default());
    }
}
