pub mod candidates;
pub mod config;
pub mod constraints;
pub mod deadline;
pub mod features;
pub mod matching;
pub mod pipeline;
pub mod scoring;

pub use candidates::{CandidateGenerator, SourceCounts};
pub use config::{ConstraintConfig, PopularityThresholds, ScoringWeights, SourceOptions};
pub use constraints::{ConstraintEngine, ConstraintViolation, RelaxationLevel};
pub use deadline::Deadline;
pub use features::{AudioFeatureProvider, FeatureProvenance};
pub use matching::TagMatching;
pub use pipeline::{Recommendation, Recommender};
pub use scoring::ScoringEngine;
