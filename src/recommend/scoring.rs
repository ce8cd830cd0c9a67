use std::collections::HashMap;
use tracing::{debug, info};

use super::config::defaults::{
    ERA_ADJACENT_SCORE, ERA_ADJACENT_YEARS, ERA_DISTANT_SCORE, ERA_NEAR_YEARS,
    LANGUAGE_MISMATCH_SCORE, NEUTRAL_SCORE,
};
use super::{PopularityThresholds, ScoringWeights, TagMatching};
use crate::models::{
    AudioFeatures, CandidateTrack, Confidence, ImageAnalysis, ScoreBreakdown, ScoredTrack,
};

/// Scores candidates against the image traits and ranks them
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    weights: ScoringWeights,
    thresholds: PopularityThresholds,
}

impl ScoringEngine {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            thresholds: PopularityThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: PopularityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Linear falloff on the distance between a track value and its target
    pub fn distance_score(value: f64, target: f64) -> f64 {
        (1.0 - (value - target).abs()).clamp(0.0, 1.0)
    }

    pub fn popularity_score(popularity: Option<u8>, thresholds: &PopularityThresholds) -> f64 {
        let base = f64::from(thresholds.effective(popularity)) / 100.0;
        if thresholds.is_deep_cut(popularity) {
            (base + thresholds.deep_cut_bonus).min(1.0)
        } else if thresholds.is_mainstream(popularity) {
            (base - thresholds.mainstream_penalty).max(0.0)
        } else {
            base
        }
    }

    pub fn language_score(language: Option<&str>, language_bias: &[String]) -> f64 {
        match language {
            Some(language) if TagMatching::language_preferred(language, language_bias) => 1.0,
            Some(_) if !language_bias.is_empty() => LANGUAGE_MISMATCH_SCORE,
            _ => NEUTRAL_SCORE,
        }
    }

    pub fn era_score(year: Option<u32>, era_preference: &str) -> f64 {
        let (Some(year), Some(decade)) = (year, TagMatching::parse_decade(era_preference)) else {
            return NEUTRAL_SCORE;
        };

        match TagMatching::years_from(year, decade) {
            d if d <= ERA_NEAR_YEARS => 1.0,
            d if d <= ERA_ADJACENT_YEARS => ERA_ADJACENT_SCORE,
            _ => ERA_DISTANT_SCORE,
        }
    }

    pub fn vibe_score(track: &CandidateTrack, vibe_tags: &[String]) -> f64 {
        TagMatching::fuzzy_fraction(&track.all_tags(), vibe_tags).unwrap_or(NEUTRAL_SCORE)
    }

    /// Score one track. The rank stays 0 until `rank_candidates` sorts.
    pub fn score_track(
        &self,
        track: &CandidateTrack,
        features: &AudioFeatures,
        analysis: &ImageAnalysis,
    ) -> ScoredTrack {
        let w = &self.weights;
        let mut scores = ScoreBreakdown {
            energy: Self::distance_score(features.energy, analysis.target_energy),
            valence: Self::distance_score(features.valence, analysis.target_valence),
            popularity: Self::popularity_score(track.popularity, &self.thresholds),
            language: Self::language_score(track.language.as_deref(), &analysis.language_bias),
            era: Self::era_score(track.year, &analysis.era_preference),
            vibe: Self::vibe_score(track, &analysis.vibe_tags),
            total: 0.0,
        };
        scores.total = scores.energy * w.energy
            + scores.valence * w.valence
            + scores.popularity * w.popularity
            + scores.language * w.language
            + scores.era * w.era
            + scores.vibe * w.vibe;

        ScoredTrack {
            track: track.clone(),
            audio_features: *features,
            scores,
            rank: 0,
            confidence: Confidence::from_total(scores.total),
        }
    }

    /// Score every candidate that has features and sort by total, best first.
    ///
    /// Candidates without features are skipped. Ties keep input order.
    pub fn rank_candidates(
        &self,
        candidates: &[CandidateTrack],
        features: &HashMap<String, AudioFeatures>,
        analysis: &ImageAnalysis,
    ) -> Vec<ScoredTrack> {
        let mut skipped = 0;
        let mut ranked: Vec<ScoredTrack> = candidates
            .iter()
            .filter_map(|track| match features.get(&track.spotify_id) {
                Some(f) => Some(self.score_track(track, f, analysis)),
                None => {
                    skipped += 1;
                    debug!(
                        track_id = %track.spotify_id,
                        title = %track.title,
                        "no audio features, skipping"
                    );
                    None
                }
            })
            .collect();

        // sort_by is stable
        ranked.sort_by(|a, b| b.scores.total.total_cmp(&a.scores.total));
        for (index, scored) in ranked.iter_mut().enumerate() {
            scored.rank = index as u32 + 1;
        }

        let mut distribution: HashMap<Confidence, usize> = HashMap::new();
        for scored in &ranked {
            *distribution.entry(scored.confidence).or_default() += 1;
        }
        info!(
            scored = ranked.len(),
            skipped,
            perfect = distribution.get(&Confidence::Perfect).copied().unwrap_or(0),
            good = distribution.get(&Confidence::Good).copied().unwrap_or(0),
            partial = distribution.get(&Confidence::Partial).copied().unwrap_or(0),
            fallback = distribution.get(&Confidence::Fallback).copied().unwrap_or(0),
            "ranked candidates"
        );
        if let Some(top) = ranked.first() {
            debug!(
                title = %top.track.title,
                artist = %top.track.artist,
                total = top.scores.total,
                "top track"
            );
        }
        ranked
    }

    /// Human-readable breakdown of how a track's score came about
    pub fn explain_score(&self, scored: &ScoredTrack, analysis: &ImageAnalysis) -> String {
        let track = &scored.track;
        let s = &scored.scores;
        let w = &self.weights;
        let tags = track.all_tags();
        let matched_tags = analysis
            .vibe_tags
            .iter()
            .filter(|target| {
                TagMatching::fuzzy_fraction(&tags, std::slice::from_ref(*target)) == Some(1.0)
            })
            .count();

        let lines = [
            format!(
                "#{} \"{}\" by {} [{}]: total {:.2} ({})",
                scored.rank, track.title, track.artist, track.source, s.total, scored.confidence
            ),
            format!(
                "  energy     {:.2} x {:.2}  track {:.2}, target {:.2}",
                s.energy, w.energy, scored.audio_features.energy, analysis.target_energy
            ),
            format!(
                "  valence    {:.2} x {:.2}  track {:.2}, target {:.2}",
                s.valence, w.valence, scored.audio_features.valence, analysis.target_valence
            ),
            format!(
                "  popularity {:.2} x {:.2}  {}",
                s.popularity,
                w.popularity,
                match track.popularity {
                    Some(p) => format!("popularity {p}"),
                    None => format!(
                        "popularity unknown (treated as {})",
                        self.thresholds.missing_popularity
                    ),
                }
            ),
            format!(
                "  language   {:.2} x {:.2}  {} vs [{}]",
                s.language,
                w.language,
                track.language.as_deref().unwrap_or("unknown"),
                analysis.language_bias.join(", ")
            ),
            format!(
                "  era        {:.2} x {:.2}  {} vs {}",
                s.era,
                w.era,
                track.year.map_or_else(|| "unknown".to_string(), |y| y.to_string()),
                analysis.era_preference
            ),
            format!(
                "  vibe       {:.2} x {:.2}  {}/{} tags matched",
                s.vibe,
                w.vibe,
                matched_tags,
                analysis.vibe_tags.len()
            ),
        ];
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackSource;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn track(
        id: &str,
        language: Option<&str>,
        year: Option<u32>,
        popularity: Option<u8>,
    ) -> CandidateTrack {
        CandidateTrack {
            spotify_id: id.to_string(),
            title: format!("Title {id}"),
            artist: format!("Artist {id}"),
            year,
            language: language.map(str::to_string),
            genre_tags: None,
            vibe_tags: None,
            popularity,
            source: TrackSource::Curated,
        }
    }

    fn features(energy: f64, valence: f64) -> AudioFeatures {
        AudioFeatures {
            energy,
            valence,
            ..Default::default()
        }
    }

    fn city_night() -> ImageAnalysis {
        ImageAnalysis {
            mood: "neon-soaked restlessness".to_string(),
            target_energy: 0.8,
            target_valence: 0.7,
            era_preference: "2010s".to_string(),
            language_bias: vec!["Malayalam".to_string()],
            vibe_tags: vec!["energetic".to_string(), "urban".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_popularity_boundaries() {
        let t = PopularityThresholds::default();

        assert_relative_eq!(ScoringEngine::popularity_score(Some(39), &t), 0.69, epsilon = 1e-9);
        assert_relative_eq!(ScoringEngine::popularity_score(Some(40), &t), 0.40, epsilon = 1e-9);
        assert_relative_eq!(ScoringEngine::popularity_score(Some(80), &t), 0.80, epsilon = 1e-9);
        assert_relative_eq!(ScoringEngine::popularity_score(Some(81), &t), 0.61, epsilon = 1e-9);
        assert_relative_eq!(ScoringEngine::popularity_score(None, &t), 0.50, epsilon = 1e-9);
        // Clamped at both ends
        assert_relative_eq!(ScoringEngine::popularity_score(Some(0), &t), 0.30, epsilon = 1e-9);
        assert_relative_eq!(ScoringEngine::popularity_score(Some(100), &t), 0.80, epsilon = 1e-9);
    }

    #[test]
    fn test_custom_thresholds_move_the_tiers() {
        let engine = ScoringEngine::default().with_thresholds(PopularityThresholds {
            deep_cut_below: 20,
            mainstream_above: 60,
            ..Default::default()
        });
        let analysis = city_night();
        let scored = |popularity| {
            engine
                .score_track(
                    &track("a", None, None, Some(popularity)),
                    &features(0.8, 0.7),
                    &analysis,
                )
                .scores
                .popularity
        };

        assert_relative_eq!(scored(30), 0.30, epsilon = 1e-9);
        assert_relative_eq!(scored(19), 0.49, epsilon = 1e-9);
        assert_relative_eq!(scored(70), 0.50, epsilon = 1e-9);
    }

    #[test]
    fn test_distance_score_is_symmetric_and_linear() {
        let samples = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];
        for x in samples {
            for y in samples {
                assert_eq!(
                    ScoringEngine::distance_score(x, y),
                    ScoringEngine::distance_score(y, x)
                );
            }
        }
        assert_eq!(ScoringEngine::distance_score(0.4, 0.4), 1.0);
        assert_eq!(ScoringEngine::distance_score(0.0, 1.0), 0.0);
        assert_relative_eq!(ScoringEngine::distance_score(0.2, 0.8), 0.4, epsilon = 1e-9);
    }

    #[test]
    fn test_language_score() {
        let bias = vec!["Malayalam".to_string(), "Tamil".to_string()];

        assert_eq!(ScoringEngine::language_score(Some("TAMIL"), &bias), 1.0);
        assert_eq!(ScoringEngine::language_score(Some("Hindi"), &bias), 0.5);
        assert_eq!(ScoringEngine::language_score(None, &bias), 0.5);
        assert_eq!(ScoringEngine::language_score(Some("Tamil"), &[]), 0.5);
    }

    #[test]
    fn test_era_score_bands() {
        assert_eq!(ScoringEngine::era_score(Some(2015), "2010s"), 1.0);
        assert_eq!(ScoringEngine::era_score(Some(2005), "2010s"), 1.0);
        assert_eq!(ScoringEngine::era_score(Some(2004), "2010s"), 0.7);
        assert_eq!(ScoringEngine::era_score(Some(2020), "2010s"), 0.7);
        assert_eq!(ScoringEngine::era_score(Some(1995), "2010s"), 0.4);
        assert_eq!(ScoringEngine::era_score(None, "2010s"), 0.5);
        assert_eq!(ScoringEngine::era_score(Some(2015), "modern"), 0.5);
    }

    #[test]
    fn test_vibe_score_uses_vibe_and_genre_tags() {
        let mut candidate = track("a", None, None, None);
        candidate.vibe_tags = Some(vec!["Energetic".to_string()]);
        candidate.genre_tags = Some(vec!["urban-folk".to_string()]);

        let untagged = track("b", None, None, None);

        assert_eq!(ScoringEngine::vibe_score(&candidate, &city_night().vibe_tags), 1.0);
        assert_eq!(ScoringEngine::vibe_score(&candidate, &[]), 0.5);
        assert_eq!(ScoringEngine::vibe_score(&untagged, &city_night().vibe_tags), 0.0);
    }

    #[test]
    fn test_matching_deep_cut_outranks_low_energy_track() {
        let engine = ScoringEngine::default();
        let analysis = city_night();
        let candidates = vec![
            track("flat", Some("Malayalam"), Some(2015), Some(30)),
            track("match", Some("Malayalam"), Some(2015), Some(30)),
        ];
        let features = HashMap::from([
            ("flat".to_string(), features(0.2, 0.7)),
            ("match".to_string(), features(0.8, 0.7)),
        ]);

        let ranked = engine.rank_candidates(&candidates, &features, &analysis);
        let best = &ranked[0];

        assert_eq!(best.track.spotify_id, "match");
        assert_eq!(best.rank, 1);
        assert_eq!(best.scores.energy, 1.0);
        assert_eq!(best.scores.valence, 1.0);
        assert_eq!(best.scores.era, 1.0);
        assert_eq!(best.scores.language, 1.0);
        assert_relative_eq!(best.scores.popularity, 0.6, epsilon = 1e-9);
        assert!(ranked[1].scores.total < best.scores.total);
    }

    #[test]
    fn test_tracks_without_features_are_excluded() {
        let engine = ScoringEngine::default();
        let candidates = vec![track("a", None, None, None), track("b", None, None, None)];
        let features = HashMap::from([("b".to_string(), features(0.5, 0.5))]);

        let ranked = engine.rank_candidates(&candidates, &features, &city_night());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].track.spotify_id, "b");
    }

    #[test]
    fn test_ties_keep_input_order() {
        let engine = ScoringEngine::default();
        let candidates: Vec<CandidateTrack> = (0..6)
            .map(|i| track(&format!("t{i}"), Some("Malayalam"), Some(2012), Some(50)))
            .collect();
        let features: HashMap<String, AudioFeatures> = candidates
            .iter()
            .map(|c| (c.spotify_id.clone(), features(0.6, 0.6)))
            .collect();

        let ranked = engine.rank_candidates(&candidates, &features, &city_night());
        let order: Vec<&str> = ranked.iter().map(|s| s.track.spotify_id.as_str()).collect();
        assert_eq!(order, vec!["t0", "t1", "t2", "t3", "t4", "t5"]);
        assert_eq!(
            ranked.iter().map(|s| s.rank).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let engine = ScoringEngine::default();
        let mut rng = rand::thread_rng();
        let candidates: Vec<CandidateTrack> = (0..40)
            .map(|i| {
                let year = rng.gen_range(1970..2025);
                let popularity = rng.gen_range(0..=100);
                track(&format!("t{i}"), Some("Tamil"), Some(year), Some(popularity))
            })
            .collect();
        let features: HashMap<String, AudioFeatures> = candidates
            .iter()
            .map(|c| {
                let f = features(rng.gen_range(0.0..=1.0), rng.gen_range(0.0..=1.0));
                (c.spotify_id.clone(), f)
            })
            .collect();
        let analysis = city_night();

        let first = engine.rank_candidates(&candidates, &features, &analysis);
        let second = engine.rank_candidates(&candidates, &features, &analysis);
        assert_eq!(first, second);
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        let engine = ScoringEngine::default();
        let mut rng = rand::thread_rng();
        let edges = [0.0, 0.5, 1.0];

        for i in 0..500 {
            // Mix exact boundary values with random ones
            let pick = |rng: &mut rand::rngs::ThreadRng| {
                if i % 3 == 0 {
                    edges[rng.gen_range(0..edges.len())]
                } else {
                    rng.gen_range(0.0..=1.0)
                }
            };
            let analysis = ImageAnalysis {
                target_energy: pick(&mut rng),
                target_valence: pick(&mut rng),
                ..city_night()
            };
            let popularity = if rng.gen_bool(0.1) {
                None
            } else {
                Some(rng.gen_range(0..=100))
            };
            let year = rng.gen_range(1950..2030);
            let candidate = track("x", Some("Malayalam"), Some(year), popularity);
            let track_features = features(pick(&mut rng), pick(&mut rng));
            let scored = engine.score_track(&candidate, &track_features, &analysis);

            let s = scored.scores;
            let components = [
                s.energy,
                s.valence,
                s.popularity,
                s.language,
                s.era,
                s.vibe,
                s.total,
            ];
            for component in components {
                assert!(
                    (0.0..=1.0 + 1e-9).contains(&component),
                    "component out of range: {s:?}"
                );
            }
        }
    }

    #[test]
    fn test_explain_score_lists_every_component() {
        let engine = ScoringEngine::default();
        let analysis = city_night();
        let mut scored = engine.score_track(
            &track("a", Some("Malayalam"), Some(2015), None),
            &features(0.8, 0.7),
            &analysis,
        );
        scored.rank = 1;

        let text = engine.explain_score(&scored, &analysis);
        assert!(text.starts_with("#1 \"Title a\" by Artist a [curated]"));
        for label in [
            "energy",
            "valence",
            "popularity unknown (treated as 50)",
            "Malayalam vs [Malayalam]",
            "2015 vs 2010s",
            "0/2 tags",
        ] {
            assert!(text.contains(label), "missing {label} in:\n{text}");
        }
    }
}
