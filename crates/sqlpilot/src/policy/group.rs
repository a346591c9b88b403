//! Grouped completions: sample several candidates per question, score them, compute
//! group-relative advantages and fold the result into the policy.
//!
//! Nothing here touches model weights. A training step only upserts hints.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::advantage::{AdvantageCalculator, AdvantageConfig, GroupStats};
use super::engine::PolicyEngine;
use super::reward::{Candidate, ExecutionOutcome, RewardBreakdown, RewardScorer};
use crate::backends::{schema_context, QueryExecutor, SchemaRetriever, SqlGenerator};
use crate::error::{ExecutionErrorKind, GenerationError, PipelineError};
use crate::query_engine::prompts::{extract_sql, PromptBuilder};
use crate::query_engine::sql_guard::{execute_limited, sanitize_sql, validate_sql};

pub const MIN_GROUP_SIZE: usize = 2;
pub const MAX_GROUP_SIZE: usize = 16;
const MAX_TEMPERATURE: f32 = 1.5;
const TEMPERATURE_STEP: f32 = 0.1;
const STEP_HISTORY: usize = 10;
const EMA_DECAY: f64 = 0.9;
/// Rows requested per candidate; executability only needs to know whether any came back.
const CANDIDATE_ROW_LIMIT: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_size: usize,
    pub base_temperature: f32,
    pub advantage: AdvantageConfig,
    /// Execute each candidate so executability contributes to the reward.
    pub execute_candidates: bool,
    /// Per-candidate execution bound; the call is cancelled when it elapses.
    pub execution_timeout: Duration,
    pub schema_top_k: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            group_size: 4,
            base_temperature: 0.7,
            advantage: AdvantageConfig::default(),
            execute_candidates: false,
            execution_timeout: Duration::from_secs(30),
            schema_top_k: 10,
        }
    }
}

impl GroupConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(MIN_GROUP_SIZE..=MAX_GROUP_SIZE).contains(&self.group_size) {
            anyhow::bail!(
                "group size must be between {} and {}, got {}",
                MIN_GROUP_SIZE,
                MAX_GROUP_SIZE,
                self.group_size
            );
        }
        let clip = self.advantage.clip_bound;
        if !clip.is_finite() || clip < 1.0 {
            anyhow::bail!("advantage clip bound must be a finite number of at least 1.0, got {}", clip);
        }
        Ok(())
    }

    /// Sampling temperature for the `index`-th member of a group.
    pub fn temperature(&self, index: usize) -> f32 {
        (self.base_temperature + index as f32 * TEMPERATURE_STEP).min(MAX_TEMPERATURE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCompletion {
    pub sql: String,
    pub breakdown: RewardBreakdown,
    pub reward: f64,
    pub advantage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionGroup {
    pub prompt: String,
    pub completions: Vec<ScoredCompletion>,
    pub mean_reward: f64,
    pub std_reward: f64,
    pub best_index: usize,
    pub tables: Vec<String>,
    /// Patterns of the best completion.
    pub patterns: Vec<String>,
}

impl CompletionGroup {
    pub fn from_completions(
        prompt: impl Into<String>,
        completions: Vec<ScoredCompletion>,
        tables: Vec<String>,
    ) -> Self {
        let rewards: Vec<f64> = completions.iter().map(|c| c.reward).collect();
        let stats = GroupStats::of(&rewards);
        let best_index = rewards
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let patterns = completions
            .get(best_index)
            .map(|c| super::extractor::PatternExtractor::new().extract_patterns(&c.sql))
            .unwrap_or_default();

        Self {
            prompt: prompt.into(),
            completions,
            mean_reward: stats.mean,
            std_reward: stats.std,
            best_index,
            tables,
            patterns,
        }
    }

    pub fn best(&self) -> Option<&ScoredCompletion> {
        self.completions.get(self.best_index)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStep {
    pub step_number: u64,
    pub groups: Vec<CompletionGroup>,
    pub avg_reward: f64,
    pub avg_positive_advantage: f64,
    pub avg_negative_advantage: f64,
    /// Share of completions that beat their group mean.
    pub best_completion_rate: f64,
    pub hints_created: usize,
    pub hints_updated: usize,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    pub total_steps: u64,
    pub total_groups: usize,
    pub total_completions: usize,
    pub avg_reward: f64,
    pub best_completion_rate: f64,
    pub total_hints_created: usize,
    pub total_hints_updated: usize,
    pub recent_steps: VecDeque<TrainingStep>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl TrainingState {
    /// Fold a step into the running totals and moving averages.
    pub fn add_step(&mut self, step: TrainingStep) {
        let now = Utc::now();
        self.started_at.get_or_insert(now);
        self.total_steps += 1;
        self.total_groups += step.groups.len();
        self.total_completions += step.groups.iter().map(|g| g.completions.len()).sum::<usize>();

        self.avg_reward = if self.total_steps == 1 {
            step.avg_reward
        } else {
            EMA_DECAY * self.avg_reward + (1.0 - EMA_DECAY) * step.avg_reward
        };
        self.best_completion_rate =
            EMA_DECAY * self.best_completion_rate + (1.0 - EMA_DECAY) * step.best_completion_rate;

        self.total_hints_created += step.hints_created;
        self.total_hints_updated += step.hints_updated;

        self.recent_steps.push_back(step);
        while self.recent_steps.len() > STEP_HISTORY {
            self.recent_steps.pop_front();
        }
        self.last_updated = Some(now);
    }

    pub fn summary(&self) -> TrainingSummary {
        TrainingSummary {
            total_steps: self.total_steps,
            total_groups: self.total_groups,
            total_completions: self.total_completions,
            avg_reward: self.avg_reward,
            best_completion_rate: self.best_completion_rate,
            hints_created: self.total_hints_created,
            hints_updated: self.total_hints_updated,
            started_at: self.started_at,
            last_updated: self.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub total_steps: u64,
    pub total_groups: usize,
    pub total_completions: usize,
    pub avg_reward: f64,
    pub best_completion_rate: f64,
    pub hints_created: usize,
    pub hints_updated: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct GroupTrainer {
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn QueryExecutor>,
    retriever: Arc<dyn SchemaRetriever>,
    engine: Arc<PolicyEngine>,
    scorer: RewardScorer,
    advantages: AdvantageCalculator,
    prompts: PromptBuilder,
    config: GroupConfig,
    state: RwLock<TrainingState>,
}

impl GroupTrainer {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn QueryExecutor>,
        retriever: Arc<dyn SchemaRetriever>,
        engine: Arc<PolicyEngine>,
        scorer: RewardScorer,
        config: GroupConfig,
    ) -> Self {
        Self {
            generator,
            executor,
            retriever,
            engine,
            scorer,
            advantages: AdvantageCalculator::new(config.advantage),
            prompts: PromptBuilder::default(),
            config,
            state: RwLock::new(TrainingState::default()),
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Sample `group_size` candidates with increasing temperature. Failed samples are skipped;
    /// the call fails only if none succeed.
    pub async fn generate_group(&self, question: &str, schema: &str) -> Result<Vec<String>, GenerationError> {
        let prompt = self.prompts.generation(question, schema, "", "");
        let mut completions = Vec::with_capacity(self.config.group_size);
        let mut last_error = None;

        for i in 0..self.config.group_size {
            let temperature = self.config.temperature(i);
            match self.generator.generate(&prompt.user, &prompt.system, temperature).await {
                Ok(text) => {
                    let sql = extract_sql(&text);
                    if sql.is_empty() {
                        warn!("Completion {} for '{}' had no query text", i + 1, question);
                    } else {
                        completions.push(sql);
                    }
                }
                Err(e) => {
                    warn!("Completion {} for '{}' failed: {}", i + 1, question, e);
                    last_error = Some(e);
                }
            }
        }

        if completions.is_empty() {
            return Err(last_error.unwrap_or_else(|| GenerationError("no completions produced".to_string())));
        }
        Ok(completions)
    }

    /// Score a set of completions as one group. With `execute`, each candidate passes the same
    /// guard, row cap and timeout as a live query; one that fails validation is never run and
    /// scores as a syntax failure.
    pub async fn score_group(
        &self,
        question: &str,
        completions: Vec<String>,
        expected_tables: &[String],
        execute: bool,
    ) -> CompletionGroup {
        let completions: Vec<String> = completions.iter().map(|sql| sanitize_sql(sql)).collect();
        let mut outcomes: Vec<(Option<ExecutionOutcome>, Option<String>)> = Vec::with_capacity(completions.len());
        for sql in &completions {
            if !execute {
                outcomes.push((None, None));
                continue;
            }
            if let Err(e) = validate_sql(sql) {
                debug!("Not executing candidate for '{}': {}", question, e);
                outcomes.push((
                    Some(ExecutionOutcome::Failed { kind: ExecutionErrorKind::Syntax }),
                    Some(e.to_string()),
                ));
                continue;
            }
            match execute_limited(self.executor.as_ref(), sql, CANDIDATE_ROW_LIMIT, self.config.execution_timeout).await {
                Ok(preview) => outcomes.push((Some(ExecutionOutcome::Succeeded { row_count: preview.total_rows }), None)),
                Err(e) => outcomes.push((Some(ExecutionOutcome::from(&e)), Some(e.message))),
            }
        }

        let expected = (!expected_tables.is_empty()).then_some(expected_tables);
        let breakdowns: Vec<RewardBreakdown> = completions
            .par_iter()
            .zip(outcomes.par_iter())
            .map(|(sql, (outcome, _))| {
                let mut candidate = Candidate::new(sql, question);
                if let Some(outcome) = outcome {
                    candidate = candidate.with_outcome(*outcome);
                }
                if let Some(tables) = expected {
                    candidate = candidate.with_expected_tables(tables);
                }
                self.scorer.score(candidate)
            })
            .collect();

        let rewards: Vec<f64> = breakdowns.iter().map(|b| b.total).collect();
        let advantages = self.advantages.compute(&rewards);

        let scored = completions
            .into_iter()
            .zip(breakdowns)
            .zip(advantages)
            .zip(outcomes)
            .map(|(((sql, breakdown), advantage), (_, execution_error))| ScoredCompletion {
                reward: breakdown.total,
                sql,
                breakdown,
                advantage,
                execution_error,
            })
            .collect();

        CompletionGroup::from_completions(question, scored, expected_tables.to_vec())
    }

    /// One pass over `questions`: generate, score, apply to policy, record.
    pub async fn run_step(
        &self,
        questions: &[String],
        expected_tables: &HashMap<String, Vec<String>>,
    ) -> Result<TrainingStep, PipelineError> {
        let step_number = self.state().map(|s| s.total_steps + 1)?;
        let mut step = TrainingStep {
            step_number,
            timestamp: Some(Utc::now()),
            ..TrainingStep::default()
        };

        for question in questions {
            let chunks = self.retriever.retrieve_schema(question, self.config.schema_top_k).await?;
            let completions = match self.generate_group(question, &schema_context(&chunks)).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping '{}' in training step {}: {}", question, step_number, e);
                    continue;
                }
            };
            let tables = expected_tables.get(question).cloned().unwrap_or_default();
            let group = self
                .score_group(question, completions, &tables, self.config.execute_candidates)
                .await;

            let update = self.engine.apply_group(&group)?;
            step.hints_created += update.hints_created;
            step.hints_updated += update.hints_updated;
            debug!(
                "Group for '{}': mean {:.3}, std {:.3}, best #{}",
                question,
                group.mean_reward,
                group.std_reward,
                group.best_index + 1
            );
            step.groups.push(group);
        }

        let completions: Vec<&ScoredCompletion> = step.groups.iter().flat_map(|g| &g.completions).collect();
        if !completions.is_empty() {
            let n = completions.len() as f64;
            step.avg_reward = completions.iter().map(|c| c.reward).sum::<f64>() / n;
            let positive: Vec<f64> = completions.iter().map(|c| c.advantage).filter(|a| *a > 0.0).collect();
            let negative: Vec<f64> = completions.iter().map(|c| c.advantage).filter(|a| *a < 0.0).collect();
            if !positive.is_empty() {
                step.avg_positive_advantage = positive.iter().sum::<f64>() / positive.len() as f64;
            }
            if !negative.is_empty() {
                step.avg_negative_advantage = negative.iter().sum::<f64>() / negative.len() as f64;
            }
            step.best_completion_rate = positive.len() as f64 / n;
        }

        self.state
            .write()
            .map_err(|_| PipelineError::Internal("training state lock poisoned".to_string()))?
            .add_step(step.clone());

        info!(
            "Training step {} complete: {} groups, avg reward {:.3}, {} hints created, {} updated",
            step.step_number,
            step.groups.len(),
            step.avg_reward,
            step.hints_created,
            step.hints_updated
        );
        Ok(step)
    }

    pub fn state(&self) -> Result<TrainingState, PipelineError> {
        self.state
            .read()
            .map(|s| s.clone())
            .map_err(|_| PipelineError::Internal("training state lock poisoned".to_string()))
    }

    pub fn summary(&self) -> Result<TrainingSummary, PipelineError> {
        self.state().map(|s| s.summary())
    }
}
