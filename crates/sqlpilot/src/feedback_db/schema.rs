//! Feedback and policy data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    ThumbsUp,
    ThumbsDown,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThumbsUp => "thumbs_up",
            Self::ThumbsDown => "thumbs_down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "thumbs_up" => Some(Self::ThumbsUp),
            "thumbs_down" => Some(Self::ThumbsDown),
            _ => None,
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, Self::ThumbsUp)
    }
}

/// Derived from the rated query at recording time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMetadata {
    pub tables: Vec<String>,
    pub patterns: Vec<String>,
    pub question_length: usize,
    pub sql_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub message_id: String,
    pub session_id: String,
    pub question: String,
    pub sql: String,
    pub polarity: Polarity,
    pub reason: Option<String>,
    pub metadata: FeedbackMetadata,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn touches_any(&self, tables: &BTreeSet<String>) -> bool {
        self.metadata
            .tables
            .iter()
            .any(|t| tables.contains(&t.to_lowercase()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintType {
    Prefer,
    Caution,
    Tip,
    Warning,
    UserFeedback,
}

impl HintType {
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Prefer => "✓",
            Self::Caution => "⚠",
            Self::Tip => "💡",
            Self::Warning => "❗",
            Self::UserFeedback => "💬",
        }
    }
}

impl fmt::Display for HintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Prefer => "PREFER",
            Self::Caution => "CAUTION",
            Self::Tip => "TIP",
            Self::Warning => "WARNING",
            Self::UserFeedback => "USER_FEEDBACK",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyHint {
    pub id: String,
    pub hint_type: HintType,
    pub description: String,
    pub weight: f64,
    pub tables: Vec<String>,
    pub pattern: Option<String>,
    pub source_feedback_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyHint {
    pub fn new(
        hint_type: HintType,
        description: impl Into<String>,
        weight: f64,
        tables: impl IntoIterator<Item = String>,
        pattern: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let tables: BTreeSet<String> = tables.into_iter().map(|t| t.to_lowercase()).collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hint_type,
            description: description.into(),
            weight: weight.clamp(0.0, 1.0),
            tables: tables.into_iter().collect(),
            pattern,
            source_feedback_count: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_source_count(mut self, count: u32) -> Self {
        self.source_feedback_count = count;
        self
    }

    /// General hints apply regardless of the tables in play.
    pub fn is_general(&self) -> bool {
        self.tables.is_empty()
    }

    fn table_set(&self) -> BTreeSet<String> {
        self.tables.iter().map(|t| t.to_lowercase()).collect()
    }

    /// Merge identity: hint type, table set and pattern.
    pub fn same_identity(&self, other: &PolicyHint) -> bool {
        self.hint_type == other.hint_type
            && self.pattern == other.pattern
            && self.table_set() == other.table_set()
    }

    pub fn applies_to(&self, tables: &BTreeSet<String>) -> bool {
        self.is_general() || self.tables.iter().any(|t| tables.contains(&t.to_lowercase()))
    }
}

/// How an upsert treats an existing hint with the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Count one more supporting event and raise the weight by 0.1, capped at 1.0.
    Reinforce,
    /// Overwrite weight, description and supporting count with the incoming values.
    Replace,
}

pub const WEIGHT_NUDGE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    pub hints: Vec<PolicyHint>,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            hints: Vec::new(),
            version: 1,
            last_updated: Utc::now(),
        }
    }
}

impl PolicyState {
    /// Merge-or-insert; returns the stored hint.
    pub fn upsert(&mut self, hint: PolicyHint, mode: MergeMode) -> PolicyHint {
        if let Some(existing) = self.hints.iter_mut().find(|h| h.same_identity(&hint)) {
            match mode {
                MergeMode::Reinforce => {
                    existing.source_feedback_count += 1;
                    existing.weight = (existing.weight + WEIGHT_NUDGE).min(1.0);
                }
                MergeMode::Replace => {
                    existing.source_feedback_count = hint.source_feedback_count;
                    existing.weight = hint.weight;
                    existing.description = hint.description;
                }
            }
            existing.updated_at = Utc::now();
            return existing.clone();
        }
        self.hints.push(hint.clone());
        hint
    }

    pub fn hints_for_context(
        &self,
        tables: &[String],
        min_weight: f64,
        cap: usize,
    ) -> Vec<PolicyHint> {
        let tables: BTreeSet<String> = tables.iter().map(|t| t.to_lowercase()).collect();
        let mut hints: Vec<PolicyHint> = self
            .hints
            .iter()
            .filter(|h| h.weight >= min_weight && h.applies_to(&tables))
            .cloned()
            .collect();
        hints.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        hints.truncate(cap);
        hints
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFeedback {
    pub thumbs_up: usize,
    pub thumbs_down: usize,
}

impl TableFeedback {
    pub fn total(&self) -> usize {
        self.thumbs_up + self.thumbs_down
    }

    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.thumbs_up as f64 / total as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegativeSample {
    pub question: String,
    pub sql: String,
    pub tables: Vec<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total_feedback: usize,
    pub thumbs_up_count: usize,
    pub thumbs_down_count: usize,
    pub success_rate: f64,
    pub feedback_by_table: BTreeMap<String, TableFeedback>,
    pub recent_negative: Vec<NegativeSample>,
    pub active_hints: usize,
}

/// Thumbs-up/down tallies over a slice of records.
pub fn tally<'a>(records: impl IntoIterator<Item = &'a FeedbackRecord>) -> TableFeedback {
    records.into_iter().fold(TableFeedback::default(), |mut acc, r| {
        if r.polarity.is_positive() {
            acc.thumbs_up += 1;
        } else {
            acc.thumbs_down += 1;
        }
        acc
    })
}
