//! Feedback-driven policy: rewards, group-relative advantages, structural extraction and the
//! engine that turns them into weighted prompt hints.

pub mod advantage;
pub mod engine;
pub mod extractor;
pub mod group;
pub mod reward;

pub use advantage::{AdvantageCalculator, AdvantageConfig, GroupStats};
pub use engine::{FeedbackEvent, GroupUpdate, PolicyConfig, PolicyEngine};
pub use extractor::{PatternExtractor, QueryFeatures};
pub use group::{CompletionGroup, GroupConfig, GroupTrainer, ScoredCompletion, TrainingState, TrainingStep, TrainingSummary};
pub use reward::{Candidate, ExecutionOutcome, RewardBreakdown, RewardScorer, RewardWeights};
