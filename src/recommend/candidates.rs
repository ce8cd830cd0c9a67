use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::ScopedJoinHandle;
use tracing::{debug, info, warn};

use super::{Deadline, SourceOptions, TagMatching};
use crate::catalog::CatalogStore;
use crate::client::MusicProvider;
use crate::models::{
    CandidateTrack, CuratedSong, ImageAnalysis, SearchHit, SongSuggestion, TrackSource,
};
use crate::vision::SongSuggester;

const CURATED_LIMIT: usize = 20;
const SEARCH_LIMIT: usize = 30;
const SUGGESTION_SEARCH_LIMIT: usize = 10;
const QUERY_LANGUAGES: usize = 2;
const QUERY_TAGS: usize = 3;

const CURATED_LANGUAGE_WEIGHT: f64 = 0.4;
const CURATED_ERA_WEIGHT: f64 = 0.2;
const CURATED_VIBE_WEIGHT: f64 = 0.4;
const CURATED_LANGUAGE_MISMATCH: f64 = 0.3;
const CURATED_ERA_MISMATCH: f64 = 0.5;
const CURATED_NO_VIBE_TARGETS: f64 = 0.5;

/// Candidates contributed by each source, before and after deduplication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub curated: usize,
    pub spotify_search: usize,
    pub gpt: usize,
    pub before_dedup: usize,
    pub after_dedup: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub tracks: Vec<CandidateTrack>,
    pub counts: SourceCounts,
}

/// Gathers candidate tracks from the curated catalog, live search and AI suggestions
pub struct CandidateGenerator {
    catalog: Arc<CatalogStore>,
    provider: Arc<dyn MusicProvider>,
    suggester: Option<Arc<dyn SongSuggester>>,
}

impl CandidateGenerator {
    pub fn new(
        catalog: Arc<CatalogStore>,
        provider: Arc<dyn MusicProvider>,
        suggester: Option<Arc<dyn SongSuggester>>,
    ) -> Self {
        Self {
            catalog,
            provider,
            suggester,
        }
    }

    /// Run every enabled source concurrently and merge the results.
    ///
    /// Sources are concatenated curated, search, then AI before deduplication,
    /// so the first occurrence of an id (and its metadata) wins. A failing
    /// source contributes nothing.
    pub fn generate_candidates(
        &self,
        analysis: &ImageAnalysis,
        options: SourceOptions,
        deadline: Deadline,
    ) -> CandidateSet {
        let (curated, search, gpt) = std::thread::scope(|scope| {
            let curated = options
                .use_curated
                .then(|| scope.spawn(|| self.curated_candidates(analysis)));
            let search = options
                .use_spotify_search
                .then(|| scope.spawn(|| self.search_candidates(analysis)));
            let gpt = options
                .use_gpt
                .then(|| scope.spawn(|| self.suggested_candidates(analysis, deadline)));

            (
                join_source(TrackSource::Curated, curated),
                join_source(TrackSource::SpotifySearch, search),
                join_source(TrackSource::Gpt, gpt),
            )
        });

        let mut counts = SourceCounts {
            curated: curated.len(),
            spotify_search: search.len(),
            gpt: gpt.len(),
            ..Default::default()
        };
        let combined: Vec<CandidateTrack> = curated.into_iter().chain(search).chain(gpt).collect();
        counts.before_dedup = combined.len();

        let tracks = dedupe(combined);
        counts.after_dedup = tracks.len();

        info!(
            curated = counts.curated,
            spotify_search = counts.spotify_search,
            gpt = counts.gpt,
            before_dedup = counts.before_dedup,
            after_dedup = counts.after_dedup,
            "generated candidates"
        );
        CandidateSet { tracks, counts }
    }

    fn curated_candidates(&self, analysis: &ImageAnalysis) -> Result<Vec<CandidateTrack>> {
        let songs = self.catalog.list()?;

        let mut scored: Vec<(f64, &CuratedSong)> = songs
            .iter()
            .map(|song| (curated_match_score(song, analysis), song))
            .collect();
        // Stable: equal scores keep catalog order
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        if let Some((best, song)) = scored.first() {
            debug!(
                score = best,
                title = %song.title,
                catalog = songs.len(),
                "best curated match"
            );
        }
        Ok(scored
            .into_iter()
            .take(CURATED_LIMIT)
            .map(|(_, song)| song.to_candidate())
            .collect())
    }

    fn search_candidates(&self, analysis: &ImageAnalysis) -> Result<Vec<CandidateTrack>> {
        let Some(query) = build_search_query(analysis) else {
            debug!("no languages or vibe tags to search with, skipping live search");
            return Ok(Vec::new());
        };

        debug!(%query, "live search");
        let hits = self.provider.search(&query, SEARCH_LIMIT)?;
        Ok(hits
            .into_iter()
            .map(|hit| hit_to_candidate(hit, TrackSource::SpotifySearch, None))
            .collect())
    }

    fn suggested_candidates(
        &self,
        analysis: &ImageAnalysis,
        deadline: Deadline,
    ) -> Result<Vec<CandidateTrack>> {
        let Some(suggester) = &self.suggester else {
            warn!("AI suggestions requested but no suggester is configured");
            return Ok(Vec::new());
        };

        let suggestions = suggester.suggest(analysis)?;
        debug!(count = suggestions.len(), "AI suggested songs");

        let mut resolved = Vec::with_capacity(suggestions.len());
        for (index, suggestion) in suggestions.iter().enumerate() {
            if deadline.expired() {
                warn!(
                    resolved = resolved.len(),
                    skipped = suggestions.len() - index,
                    "deadline reached while resolving suggestions"
                );
                break;
            }

            let query = format!("{} {}", suggestion.title, suggestion.artist);
            match self.provider.search(&query, SUGGESTION_SEARCH_LIMIT) {
                Ok(hits) => match pick_hit(hits, suggestion) {
                    Some(hit) => {
                        let language = suggestion.language.clone();
                        let mut track = hit_to_candidate(hit, TrackSource::Gpt, language);
                        track.year = track.year.or(suggestion.year);
                        resolved.push(track);
                    }
                    None => debug!(
                        title = %suggestion.title,
                        artist = %suggestion.artist,
                        "suggestion not found"
                    ),
                },
                Err(e) if e.is_rate_limit() => {
                    warn!(
                        error = %e,
                        resolved = resolved.len(),
                        "rate limited while resolving suggestions"
                    );
                    break;
                }
                Err(e) => {
                    debug!(title = %suggestion.title, error = %e, "suggestion lookup failed")
                }
            }
        }
        Ok(resolved)
    }
}

fn join_source(
    source: TrackSource,
    handle: Option<ScopedJoinHandle<'_, Result<Vec<CandidateTrack>>>>,
) -> Vec<CandidateTrack> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    match handle.join() {
        Ok(Ok(tracks)) => {
            debug!(%source, count = tracks.len(), "candidate source finished");
            tracks
        }
        Ok(Err(e)) => {
            warn!(%source, error = %e, "candidate source failed, continuing without it");
            Vec::new()
        }
        Err(_) => {
            warn!(%source, "candidate source panicked, continuing without it");
            Vec::new()
        }
    }
}

/// Keep the first occurrence of every spotify id
pub fn dedupe(tracks: Vec<CandidateTrack>) -> Vec<CandidateTrack> {
    let mut seen = HashSet::new();
    tracks
        .into_iter()
        .filter(|track| !track.spotify_id.is_empty() && seen.insert(track.spotify_id.clone()))
        .collect()
}

/// How well a catalog entry fits the image, used to pick the curated shortlist
pub fn curated_match_score(song: &CuratedSong, analysis: &ImageAnalysis) -> f64 {
    let language = if analysis.language_bias.is_empty()
        || TagMatching::language_preferred(&song.language, &analysis.language_bias)
    {
        1.0
    } else {
        CURATED_LANGUAGE_MISMATCH
    };

    let era = match TagMatching::parse_decade(&analysis.era_preference) {
        Some(decade)
            if TagMatching::years_from(song.year, decade) > 5
                && i64::from(TagMatching::decade_of(song.year)) != i64::from(decade) =>
        {
            CURATED_ERA_MISMATCH
        }
        _ => 1.0,
    };

    let vibe = TagMatching::fuzzy_fraction(&song.all_tags(), &analysis.vibe_tags)
        .unwrap_or(CURATED_NO_VIBE_TARGETS);

    CURATED_LANGUAGE_WEIGHT * language + CURATED_ERA_WEIGHT * era + CURATED_VIBE_WEIGHT * vibe
}

/// Up to two preferred languages and three vibe tags, space-joined
pub fn build_search_query(analysis: &ImageAnalysis) -> Option<String> {
    let terms: Vec<&str> = analysis
        .language_bias
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .take(QUERY_LANGUAGES)
        .chain(
            analysis
                .vibe_tags
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .take(QUERY_TAGS),
        )
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn hit_to_candidate(
    hit: SearchHit,
    source: TrackSource,
    language: Option<String>,
) -> CandidateTrack {
    CandidateTrack {
        spotify_id: hit.id,
        title: hit.title,
        artist: hit.artist,
        year: hit.year,
        language,
        genre_tags: None,
        vibe_tags: None,
        popularity: hit.popularity,
        source,
    }
}

/// Prefer the hit whose artist matches the suggestion, else the top hit
fn pick_hit(hits: Vec<SearchHit>, suggestion: &SongSuggestion) -> Option<SearchHit> {
    let wanted = suggestion.artist.to_lowercase();
    let position = hits.iter().position(|hit| {
        let artist = hit.artist.to_lowercase();
        !wanted.is_empty() && (artist.contains(&wanted) || wanted.contains(&artist))
    });
    hits.into_iter().nth(position.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockMusicProvider;
    use crate::error::UpstreamError;
    use crate::vision::MockSongSuggester;
    use std::time::Duration;

    fn song(spotify_id: &str, language: &str, year: u32, tags: &[&str]) -> CuratedSong {
        CuratedSong {
            id: format!("cat-{spotify_id}"),
            spotify_id: spotify_id.to_string(),
            title: format!("Song {spotify_id}"),
            artist: format!("Artist {spotify_id}"),
            composer: None,
            language: language.to_string(),
            year,
            album: None,
            category: "indie".to_string(),
            genre_tags: tags.iter().map(|t| t.to_string()).collect(),
            vibe_tags: Vec::new(),
            visual_moods: Vec::new(),
            popularity_tier: None,
            is_indie: true,
            emotional_keywords: Vec::new(),
        }
    }

    fn hit(id: &str, artist: &str) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            title: format!("Hit {id}"),
            artist: artist.to_string(),
            year: Some(2018),
            popularity: Some(55),
        }
    }

    fn analysis() -> ImageAnalysis {
        ImageAnalysis {
            mood: "rain on a tin roof".to_string(),
            era_preference: "2010s".to_string(),
            language_bias: vec![
                "Malayalam".to_string(),
                "Tamil".to_string(),
                "Hindi".to_string(),
            ],
            vibe_tags: vec![
                "monsoon".into(),
                "indie".into(),
                "nostalgic".into(),
                "folk".into(),
            ],
            ..Default::default()
        }
    }

    fn options(use_curated: bool, use_spotify_search: bool, use_gpt: bool) -> SourceOptions {
        SourceOptions {
            use_curated,
            use_spotify_search,
            use_gpt,
        }
    }

    #[test]
    fn test_curated_match_score_components() {
        let analysis = analysis();

        // Language, era and every vibe tag match
        let perfect = song(
            "a",
            "malayalam",
            2014,
            &["Monsoon", "indie-pop", "nostalgic", "folk"],
        );
        assert!((curated_match_score(&perfect, &analysis) - 1.0).abs() < 1e-9);

        // 2004 is six years off 2010 and in another decade
        let off = song("b", "English", 2004, &[]);
        let expected = 0.4 * 0.3 + 0.2 * 0.5 + 0.4 * 0.0;
        assert!((curated_match_score(&off, &analysis) - expected).abs() < 1e-9);

        // 2019 is nine years off but in the target decade
        let late = song("c", "English", 2019, &[]);
        assert!((curated_match_score(&late, &analysis) - (0.12 + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn test_curated_match_score_neutral_defaults() {
        let empty = ImageAnalysis {
            era_preference: "timeless".to_string(),
            ..Default::default()
        };
        let entry = song("a", "Hindi", 1975, &["disco"]);
        // No bias, unparseable era, no vibe targets
        assert!((curated_match_score(&entry, &empty) - (0.4 + 0.2 + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn test_search_query_uses_two_languages_and_three_tags() {
        assert_eq!(
            build_search_query(&analysis()).as_deref(),
            Some("Malayalam Tamil monsoon indie nostalgic")
        );
        assert_eq!(build_search_query(&ImageAnalysis::default()), None);
    }

    #[test]
    fn test_curated_entry_wins_duplicate_ids() {
        let catalog = Arc::new(CatalogStore::from_songs(vec![
            song("shared", "Malayalam", 2015, &["indie"]),
            song("only-curated", "Tamil", 2012, &["folk"]),
        ]));
        let mut provider = MockMusicProvider::new();
        provider
            .expect_search()
            .returning(|_, _| Ok(vec![hit("shared", "Someone"), hit("only-search", "Other")]));

        let generator = CandidateGenerator::new(catalog, Arc::new(provider), None);
        let set = generator.generate_candidates(
            &analysis(),
            options(true, true, false),
            Deadline::none(),
        );

        let ids: Vec<&str> = set.tracks.iter().map(|t| t.spotify_id.as_str()).collect();
        assert_eq!(ids, vec!["shared", "only-curated", "only-search"]);

        let shared = &set.tracks[0];
        assert_eq!(shared.source, TrackSource::Curated);
        assert_eq!(shared.genre_tags.as_deref(), Some(&["indie".to_string()][..]));
        assert_eq!(set.counts.before_dedup, 4);
        assert_eq!(set.counts.after_dedup, 3);
    }

    #[test]
    fn test_curated_shortlist_is_capped_at_twenty() {
        let songs = (0..35)
            .map(|i| song(&format!("s{i}"), "Malayalam", 2015, &["indie"]))
            .collect();
        let generator = CandidateGenerator::new(
            Arc::new(CatalogStore::from_songs(songs)),
            Arc::new(MockMusicProvider::new()),
            None,
        );

        let set = generator.generate_candidates(
            &analysis(),
            options(true, false, false),
            Deadline::none(),
        );
        assert_eq!(set.tracks.len(), 20);
        // Equal scores keep catalog order
        assert_eq!(set.tracks[0].spotify_id, "s0");
        assert_eq!(set.tracks[19].spotify_id, "s19");
    }

    #[test]
    fn test_failing_search_does_not_cancel_curated() {
        let catalog = Arc::new(CatalogStore::from_songs(vec![song("a", "Malayalam", 2015, &[])]));
        let mut provider = MockMusicProvider::new();
        provider
            .expect_search()
            .returning(|_, _| Err(UpstreamError::unavailable("spotify", "timed out")));

        let generator = CandidateGenerator::new(catalog, Arc::new(provider), None);
        let set = generator.generate_candidates(
            &analysis(),
            options(true, true, false),
            Deadline::none(),
        );

        assert_eq!(set.tracks.len(), 1);
        assert_eq!(set.counts.spotify_search, 0);
    }

    #[test]
    fn test_search_candidates_carry_popularity_but_no_tags() {
        let mut provider = MockMusicProvider::new();
        provider
            .expect_search()
            .withf(|_, limit| *limit == SEARCH_LIMIT)
            .returning(|_, _| Ok(vec![hit("x", "Artist")]));

        let generator = CandidateGenerator::new(
            Arc::new(CatalogStore::from_songs(Vec::new())),
            Arc::new(provider),
            None,
        );
        let set = generator.generate_candidates(
            &analysis(),
            options(false, true, false),
            Deadline::none(),
        );

        let track = &set.tracks[0];
        assert_eq!(track.source, TrackSource::SpotifySearch);
        assert_eq!(track.popularity, Some(55));
        assert!(track.language.is_none());
        assert!(track.vibe_tags.is_none() && track.genre_tags.is_none());
    }

    #[test]
    fn test_suggestions_resolve_preferring_matching_artist() {
        let mut suggester = MockSongSuggester::new();
        suggester.expect_suggest().returning(|_| {
            Ok(vec![
                SongSuggestion {
                    title: "Kanave".to_string(),
                    artist: "Sid Sriram".to_string(),
                    language: Some("Tamil".to_string()),
                    year: None,
                },
                SongSuggestion {
                    title: "Missing".to_string(),
                    artist: "Nobody".to_string(),
                    language: None,
                    year: None,
                },
            ])
        });

        let mut provider = MockMusicProvider::new();
        provider
            .expect_search()
            .withf(|query, limit| {
                query == "Kanave Sid Sriram" && *limit == SUGGESTION_SEARCH_LIMIT
            })
            .returning(|_, _| {
                Ok(vec![hit("cover", "Karaoke Band"), hit("real", "Sid Sriram")])
            });
        provider
            .expect_search()
            .withf(|query, _| query == "Missing Nobody")
            .returning(|_, _| Ok(Vec::new()));

        let generator = CandidateGenerator::new(
            Arc::new(CatalogStore::from_songs(Vec::new())),
            Arc::new(provider),
            Some(Arc::new(suggester)),
        );
        let set = generator.generate_candidates(
            &analysis(),
            options(false, false, true),
            Deadline::none(),
        );

        assert_eq!(set.tracks.len(), 1);
        assert_eq!(set.tracks[0].spotify_id, "real");
        assert_eq!(set.tracks[0].source, TrackSource::Gpt);
        assert_eq!(set.tracks[0].language.as_deref(), Some("Tamil"));
    }

    #[test]
    fn test_rate_limit_stops_suggestion_resolution() {
        let mut suggester = MockSongSuggester::new();
        suggester.expect_suggest().returning(|_| {
            Ok((0..5)
                .map(|i| SongSuggestion {
                    title: format!("Song {i}"),
                    artist: format!("Artist {i}"),
                    language: None,
                    year: Some(2010),
                })
                .collect())
        });

        let mut provider = MockMusicProvider::new();
        provider.expect_search().times(1).returning(|_, _| {
            Err(UpstreamError::RateLimited {
                service: "spotify",
                retry_after: Some(Duration::from_secs(5)),
            })
        });

        let generator = CandidateGenerator::new(
            Arc::new(CatalogStore::from_songs(Vec::new())),
            Arc::new(provider),
            Some(Arc::new(suggester)),
        );
        let set = generator.generate_candidates(
            &analysis(),
            options(false, false, true),
            Deadline::none(),
        );
        assert!(set.tracks.is_empty());
    }

    #[test]
    fn test_dedupe_drops_repeats_and_empty_ids() {
        let track = |id: &str| hit_to_candidate(hit(id, "A"), TrackSource::SpotifySearch, None);
        let deduped = dedupe(vec![track("a"), track(""), track("b"), track("a")]);

        let ids: Vec<&str> = deduped.iter().map(|t| t.spotify_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
