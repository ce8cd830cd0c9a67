use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{
    AudioFeatureProvider, CandidateGenerator, ConstraintConfig, ConstraintEngine,
    ConstraintViolation, Deadline, FeatureProvenance, PopularityThresholds, RelaxationLevel,
    ScoringEngine, ScoringWeights, SourceCounts, SourceOptions,
};
use crate::cache::FeatureCache;
use crate::catalog::CatalogStore;
use crate::client::MusicProvider;
use crate::error::RecommendError;
use crate::models::{ImageAnalysis, ScoredTrack};
use crate::vision::SongSuggester;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PhaseTimings {
    pub total_ms: u64,
    pub candidate_generation_ms: u64,
    pub audio_features_ms: u64,
    pub popularity_ms: u64,
    pub scoring_ms: u64,
    pub constraints_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub audio_features_hit_rate: f64,
    pub provenance: FeatureProvenance,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub total_candidates: usize,
    pub scored_tracks: usize,
    pub final_tracks: usize,
    pub sources: SourceCounts,
    pub performance: PhaseTimings,
    pub cache: CacheStats,
    pub relaxation_level: RelaxationLevel,
    pub unmet_constraints: Vec<ConstraintViolation>,
}

/// Final tracks of one request plus how they were obtained
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub tracks: Vec<ScoredTrack>,
    pub stats: PipelineStats,
}

/// Runs candidates, features, scoring and constraints for one image analysis
pub struct Recommender {
    catalog: Arc<CatalogStore>,
    provider: Arc<dyn MusicProvider>,
    suggester: Option<Arc<dyn SongSuggester>>,
    cache: Arc<FeatureCache>,
    scoring: ScoringEngine,
    constraints: ConstraintEngine,
    thresholds: PopularityThresholds,
    sources: SourceOptions,
    budget: Option<Duration>,
}

impl Recommender {
    pub fn new(
        catalog: Arc<CatalogStore>,
        provider: Arc<dyn MusicProvider>,
        cache: Arc<FeatureCache>,
    ) -> Self {
        Self {
            catalog,
            provider,
            suggester: None,
            cache,
            scoring: ScoringEngine::default(),
            constraints: ConstraintEngine::default(),
            thresholds: PopularityThresholds::default(),
            sources: SourceOptions::default(),
            budget: None,
        }
    }

    pub fn with_suggester(mut self, suggester: Arc<dyn SongSuggester>) -> Self {
        self.suggester = Some(suggester);
        self
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.scoring = ScoringEngine::new(weights).with_thresholds(self.thresholds);
        self
    }

    pub fn with_constraints(mut self, config: ConstraintConfig) -> Self {
        self.constraints = ConstraintEngine::new(config).with_thresholds(self.thresholds);
        self
    }

    /// Popularity tiers shared by scoring and constraint selection
    pub fn with_thresholds(mut self, thresholds: PopularityThresholds) -> Self {
        self.thresholds = thresholds;
        self.scoring = self.scoring.with_thresholds(thresholds);
        self.constraints = self.constraints.with_thresholds(thresholds);
        self
    }

    pub fn with_sources(mut self, sources: SourceOptions) -> Self {
        self.sources = sources;
        self
    }

    /// End-to-end budget per request
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    pub fn recommend(&self, analysis: &ImageAnalysis) -> Result<Recommendation, RecommendError> {
        let started = Instant::now();
        let deadline = self.budget.map_or_else(Deadline::none, Deadline::after);
        let analysis = analysis.clone().normalized();
        let mut timings = PhaseTimings::default();

        info!(
            mood = %analysis.mood.chars().take(50).collect::<String>(),
            energy = analysis.target_energy,
            valence = analysis.target_valence,
            languages = %analysis.language_bias.join(", "),
            vibe_tags = %analysis.vibe_tags.join(", "),
            "starting recommendation"
        );

        // Candidates
        let phase = Instant::now();
        let generator = CandidateGenerator::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.provider),
            self.suggester.clone(),
        );
        let candidate_set = generator.generate_candidates(&analysis, self.sources, deadline);
        timings.candidate_generation_ms = elapsed_ms(phase);

        let mut candidates = candidate_set.tracks;
        if candidates.is_empty() {
            return Err(RecommendError::InsufficientCandidates);
        }
        let track_ids: Vec<String> = candidates.iter().map(|c| c.spotify_id.clone()).collect();

        // Audio features
        let phase = Instant::now();
        let features =
            AudioFeatureProvider::new(Arc::clone(&self.provider), Arc::clone(&self.cache));
        let lookup = features.get_audio_features(&track_ids, deadline)?;
        timings.audio_features_ms = elapsed_ms(phase);

        // Popularity enrichment is optional
        let phase = Instant::now();
        if deadline.expired() {
            warn!("deadline reached, skipping popularity enrichment");
        } else {
            match features.get_track_popularity(&track_ids) {
                Ok(popularity) => {
                    for candidate in &mut candidates {
                        if let Some(p) = popularity.get(&candidate.spotify_id) {
                            candidate.popularity = Some(*p);
                        }
                    }
                    info!(
                        found = popularity.len(),
                        requested = track_ids.len(),
                        "enriched popularity"
                    );
                }
                Err(e) => warn!(
                    error = %e,
                    "popularity lookup failed, scoring with known popularity only"
                ),
            }
        }
        timings.popularity_ms = elapsed_ms(phase);

        // Scoring
        let phase = Instant::now();
        let ranked = self
            .scoring
            .rank_candidates(&candidates, &lookup.features, &analysis);
        timings.scoring_ms = elapsed_ms(phase);
        if ranked.is_empty() {
            return Err(RecommendError::InsufficientScoredTracks);
        }

        // Constraints
        let phase = Instant::now();
        let selection = self.constraints.apply_constraints(&ranked);
        timings.constraints_ms = elapsed_ms(phase);
        timings.total_ms = elapsed_ms(started);

        let stats = PipelineStats {
            total_candidates: candidates.len(),
            scored_tracks: ranked.len(),
            final_tracks: selection.tracks.len(),
            sources: candidate_set.counts,
            performance: timings,
            cache: CacheStats {
                audio_features_hit_rate: lookup.provenance.hit_ratio(),
                provenance: lookup.provenance,
            },
            relaxation_level: selection.level,
            unmet_constraints: selection.unmet,
        };

        info!(
            total_ms = stats.performance.total_ms,
            candidates = stats.total_candidates,
            scored = stats.scored_tracks,
            selected = stats.final_tracks,
            level = %stats.relaxation_level,
            "recommendation complete"
        );
        Ok(Recommendation {
            tracks: selection.tracks,
            stats,
        })
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
