//! Policy engine: turns feedback events and scored completion groups into hint upserts, and
//! selects and formats hints for generation prompts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::extractor::PatternExtractor;
use super::group::CompletionGroup;
use crate::error::StoreError;
use crate::feedback_db::{
    tally, FeedbackMetadata, FeedbackRecord, FeedbackStats, FeedbackStore, HintType, PolicyHint, Polarity,
};
use crate::utils::TextUtils;

const HINTS_PER_TYPE: usize = 3;
const PROMPT_HEADER: &str = "\nBASED ON PREVIOUS USER FEEDBACK:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Records required before a success rate is trusted.
    pub min_feedback_for_hint: usize,
    /// Caution/tip hints are raised below this success rate.
    pub negative_threshold: f64,
    /// Prefer hints require at least this success rate.
    pub positive_threshold: f64,
    /// Hints below this weight are not injected into prompts.
    pub min_hint_weight: f64,
    pub similar_question_threshold: f64,
    pub similar_question_window: usize,
    /// Group updates only fire for completions with `|advantage|` at least this large.
    pub min_advantage_threshold: f64,
    pub learning_rate: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_feedback_for_hint: 2,
            negative_threshold: 0.4,
            positive_threshold: 0.8,
            min_hint_weight: 0.3,
            similar_question_threshold: 0.7,
            similar_question_window: 20,
            min_advantage_threshold: 0.3,
            learning_rate: 0.1,
        }
    }
}

/// A feedback event as submitted by the caller.
#[derive(Debug, Clone)]
pub struct FeedbackEvent {
    pub message_id: String,
    pub session_id: String,
    pub question: String,
    pub sql: String,
    pub polarity: Polarity,
    pub reason: Option<String>,
}

/// Hint upserts caused by one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    pub hints_created: usize,
    pub hints_updated: usize,
    pub patterns_reinforced: Vec<String>,
    pub patterns_penalized: Vec<String>,
}

pub struct PolicyEngine {
    store: Arc<FeedbackStore>,
    extractor: PatternExtractor,
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(store: Arc<FeedbackStore>, config: PolicyConfig) -> Self {
        Self {
            store,
            extractor: PatternExtractor::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<FeedbackStore> {
        &self.store
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn extractor(&self) -> &PatternExtractor {
        &self.extractor
    }

    /// Persist a feedback event and apply its immediate policy consequences.
    pub fn record_feedback(&self, event: FeedbackEvent) -> Result<FeedbackRecord, StoreError> {
        let features = self.extractor.extract(&event.sql);
        let record = FeedbackRecord {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: FeedbackMetadata {
                tables: features.tables,
                patterns: features.patterns,
                question_length: event.question.chars().count(),
                sql_length: event.sql.chars().count(),
            },
            message_id: event.message_id,
            session_id: event.session_id,
            question: event.question,
            sql: event.sql,
            polarity: event.polarity,
            reason: event.reason.filter(|r| !r.trim().is_empty()),
            timestamp: chrono::Utc::now(),
        };

        self.store.save_feedback(record.clone())?;
        self.update_from_feedback(&record)?;

        info!(
            "Recorded {} feedback for message {} (tables: {:?}, patterns: {:?})",
            record.polarity.as_str(),
            record.message_id,
            record.metadata.tables,
            record.metadata.patterns
        );
        Ok(record)
    }

    fn update_from_feedback(&self, record: &FeedbackRecord) -> Result<(), StoreError> {
        let tables = &record.metadata.tables;
        let patterns = &record.metadata.patterns;

        match record.polarity {
            Polarity::ThumbsDown => {
                for table in tables {
                    let history = self.store.feedback_for_tables(std::slice::from_ref(table))?;
                    let counts = tally(&history);
                    if counts.total() < self.config.min_feedback_for_hint {
                        continue;
                    }
                    let rate = counts.success_rate();
                    if rate < self.config.negative_threshold {
                        let hint = PolicyHint::new(
                            HintType::Caution,
                            format!(
                                "Table '{}' has a low success rate ({:.0}%). Pay extra attention to column types and joins.",
                                table,
                                rate * 100.0
                            ),
                            (0.5 + 0.1 * counts.thumbs_down as f64).min(0.9),
                            [table.clone()],
                            None,
                        );
                        self.store.add_policy_hint(hint)?;
                        debug!("Caution hint for table {} (success rate {:.2})", table, rate);
                    }
                }

                for pattern in patterns {
                    let counts = tally(&self.store.feedback_with_pattern(pattern)?);
                    if counts.total() >= self.config.min_feedback_for_hint
                        && counts.success_rate() < self.config.negative_threshold
                    {
                        let hint = PolicyHint::new(
                            HintType::Tip,
                            format!(
                                "SQL pattern '{}' has caused issues. Ensure proper syntax and type compatibility.",
                                pattern
                            ),
                            0.5,
                            tables.iter().cloned(),
                            Some(pattern.clone()),
                        );
                        self.store.add_policy_hint(hint)?;
                    }
                }
            }
            Polarity::ThumbsUp if !tables.is_empty() => {
                for pattern in patterns {
                    let counts = tally(&self.store.feedback_with_pattern(pattern)?);
                    if counts.total() >= self.config.min_feedback_for_hint
                        && counts.success_rate() >= self.config.positive_threshold
                    {
                        let hint = PolicyHint::new(
                            HintType::Prefer,
                            format!("Pattern '{}' works well with tables: {}", pattern, tables.join(", ")),
                            0.5,
                            tables.iter().cloned(),
                            Some(pattern.clone()),
                        );
                        self.store.add_policy_hint(hint)?;
                    }
                }
            }
            Polarity::ThumbsUp => {}
        }

        if let Some(reason) = &record.reason {
            let hint = PolicyHint::new(
                HintType::UserFeedback,
                format!("User reported: {}", reason.trim()),
                0.7,
                tables.iter().cloned(),
                None,
            );
            self.store.add_policy_hint(hint)?;
        }
        Ok(())
    }

    /// Stored hints for the tables, plus one warning when the question resembles a recently
    /// rejected one.
    pub fn hints_for_question(&self, question: &str, tables: &[String]) -> Result<Vec<PolicyHint>, StoreError> {
        let mut hints = self.store.hints_for_context(tables, self.config.min_hint_weight)?;

        let recent = self.store.recent_feedback(self.config.similar_question_window)?;
        let similar = recent.iter().rev().find(|r| {
            !r.polarity.is_positive()
                && TextUtils::jaccard_similarity(question, &r.question) > self.config.similar_question_threshold
        });
        if let Some(record) = similar {
            hints.push(PolicyHint::new(
                HintType::Warning,
                "A similar question previously failed. Consider alternative approaches.",
                0.6,
                record.metadata.tables.iter().cloned(),
                None,
            ));
        }
        Ok(hints)
    }

    /// Prompt section listing hints grouped by type, at most three per type.
    pub fn format_hints_for_prompt(hints: &[PolicyHint]) -> String {
        if hints.is_empty() {
            return String::new();
        }

        let mut groups: Vec<(HintType, Vec<&PolicyHint>)> = Vec::new();
        for hint in hints {
            match groups.iter_mut().find(|(t, _)| *t == hint.hint_type) {
                Some((_, group)) => group.push(hint),
                None => groups.push((hint.hint_type, vec![hint])),
            }
        }

        let mut lines = vec![PROMPT_HEADER.to_string()];
        for (hint_type, group) in groups {
            for hint in group.into_iter().take(HINTS_PER_TYPE) {
                lines.push(format!("- {} {}: {}", hint_type.icon(), hint_type, hint.description));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }

    /// Reinforce patterns of clearly above-average completions and caution against those of
    /// clearly below-average ones.
    pub fn apply_group(&self, group: &CompletionGroup) -> Result<GroupUpdate, StoreError> {
        let threshold = self.config.min_advantage_threshold;
        let lr = self.config.learning_rate;
        let mut update = GroupUpdate::default();

        for completion in &group.completions {
            let advantage = completion.advantage;
            if advantage.abs() < threshold {
                continue;
            }
            let features = self.extractor.extract(&completion.sql);

            if advantage >= threshold {
                for pattern in &features.patterns {
                    let hint = PolicyHint::new(
                        HintType::Prefer,
                        format!("Pattern '{}' performed well (advantage: {:.2})", pattern, advantage),
                        (0.5 + advantage * lr).min(1.0),
                        features.tables.iter().cloned(),
                        Some(pattern.clone()),
                    );
                    self.store.add_policy_hint(hint)?;
                    update.hints_updated += 1;
                    update.patterns_reinforced.push(pattern.clone());
                }
            } else if features.patterns.is_empty() {
                if !features.tables.is_empty() {
                    let hint = PolicyHint::new(
                        HintType::Caution,
                        format!("Queries on these tables underperformed (advantage: {:.2})", advantage),
                        (0.5 + advantage.abs() * lr).min(0.9),
                        features.tables.iter().cloned(),
                        None,
                    );
                    self.store.add_policy_hint(hint)?;
                    update.hints_created += 1;
                }
            } else {
                for pattern in &features.patterns {
                    let hint = PolicyHint::new(
                        HintType::Caution,
                        format!("Pattern '{}' underperformed (advantage: {:.2})", pattern, advantage),
                        (0.5 + advantage.abs() * lr).min(0.9),
                        features.tables.iter().cloned(),
                        Some(pattern.clone()),
                    );
                    self.store.add_policy_hint(hint)?;
                    update.hints_created += 1;
                    update.patterns_penalized.push(pattern.clone());
                }
            }
        }

        debug!(
            "Group '{}' applied: {} reinforced, {} penalized",
            group.prompt,
            update.patterns_reinforced.len(),
            update.patterns_penalized.len()
        );
        Ok(update)
    }

    /// Recompute table success rates over all feedback and refresh caution hints. Re-running
    /// without new feedback leaves the hint set unchanged.
    pub fn analyze_and_update_policies(&self) -> Result<usize, StoreError> {
        let all = self.store.all_feedback()?;
        if all.len() < self.config.min_feedback_for_hint {
            return Ok(0);
        }

        let mut by_table: BTreeMap<&str, Vec<&FeedbackRecord>> = BTreeMap::new();
        for record in &all {
            for table in &record.metadata.tables {
                by_table.entry(table.as_str()).or_default().push(record);
            }
        }

        let mut updated = 0;
        for (table, records) in by_table {
            let counts = tally(records.iter().copied());
            if counts.total() < self.config.min_feedback_for_hint {
                continue;
            }
            let rate = counts.success_rate();
            if rate < self.config.negative_threshold {
                let hint = PolicyHint::new(
                    HintType::Caution,
                    format!(
                        "Table '{}' has {:.0}% success rate. Verify column types and relationships.",
                        table,
                        rate * 100.0
                    ),
                    0.7,
                    [table.to_string()],
                    None,
                )
                .with_source_count(counts.total() as u32);
                self.store.replace_policy_hint(hint)?;
                updated += 1;
            }
        }

        info!("Policy analysis complete. Created/updated {} hints.", updated);
        Ok(updated)
    }

    pub fn feedback_stats(&self) -> Result<FeedbackStats, StoreError> {
        self.store.aggregated_stats()
    }
}
