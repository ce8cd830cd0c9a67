use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

use super::config::defaults::{BACKFILL_EXTRA, BLACKLISTED_TITLES, MIN_COUNT, TARGET_COUNT};
use super::{ConstraintConfig, PopularityThresholds, TagMatching};
use crate::models::ScoredTrack;

/// How far the constraints had to be loosened to fill the selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaxationLevel {
    Strict,
    DuplicateArtists,
    FewerDeepCuts,
    Unconstrained,
}

impl fmt::Display for RelaxationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Strict => "strict",
            Self::DuplicateArtists => "duplicate artists allowed",
            Self::FewerDeepCuts => "one deep cut required",
            Self::Unconstrained => "unconstrained",
        };
        f.write_str(name)
    }
}

/// A constraint the final selection does not satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintViolation {
    Blacklisted { title: String },
    DuplicateArtist { artist: String },
    TooManyMainstream { count: usize, max: usize },
    TooFewDeepCuts { count: usize, min: usize },
    TooFewDecades { count: usize, min: usize },
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blacklisted { title } => write!(f, "blacklisted track: {title}"),
            Self::DuplicateArtist { artist } => write!(f, "duplicate artist: {artist}"),
            Self::TooManyMainstream { count, max } => {
                write!(f, "too many mainstream tracks: {count} (max {max})")
            }
            Self::TooFewDeepCuts { count, min } => {
                write!(f, "not enough deep cuts: {count} (min {min})")
            }
            Self::TooFewDecades { count, min } => {
                write!(f, "not enough decade diversity: {count} (min {min})")
            }
        }
    }
}

/// Outcome of constraint selection
#[derive(Debug, Clone)]
pub struct Selection {
    pub tracks: Vec<ScoredTrack>,
    pub level: RelaxationLevel,
    /// Requested constraints the returned tracks still violate
    pub unmet: Vec<ConstraintViolation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Blacklisted,
    DuplicateArtist,
    MainstreamLimit,
}

impl Rejection {
    fn reason(self) -> &'static str {
        match self {
            Self::Blacklisted => "blacklisted",
            Self::DuplicateArtist => "duplicate_artist",
            Self::MainstreamLimit => "mainstream_limit_reached",
        }
    }
}

/// Picks the final handful of tracks from a ranked list under diversity rules
#[derive(Debug, Clone, Default)]
pub struct ConstraintEngine {
    config: ConstraintConfig,
    thresholds: PopularityThresholds,
}

impl ConstraintEngine {
    pub fn new(config: ConstraintConfig) -> Self {
        Self {
            config,
            thresholds: PopularityThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: PopularityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Select from `ranked` (best first), loosening constraints until at least
    /// four tracks fit. Never fails.
    pub fn apply_constraints(&self, ranked: &[ScoredTrack]) -> Selection {
        info!(
            ranked = ranked.len(),
            max_mainstream = self.config.max_mainstream,
            min_deep_cuts = self.config.min_deep_cuts,
            min_decades = self.config.min_decades,
            allow_duplicate_artists = self.config.allow_duplicate_artists,
            blacklist = self.config.blacklist.len() + BLACKLISTED_TITLES.len(),
            "applying constraints"
        );

        let ladder = [
            RelaxationLevel::Strict,
            RelaxationLevel::DuplicateArtists,
            RelaxationLevel::FewerDeepCuts,
        ];
        for level in ladder {
            if !self.relaxation_applies(level) {
                continue;
            }
            if level != RelaxationLevel::Strict {
                info!(%level, "relaxing constraints");
            }

            let config = self.config_at(level);
            let mut selected = self.walk(ranked, level);
            if selected.len() >= MIN_COUNT {
                self.backfill(ranked, &mut selected, &config);
                selected.truncate(TARGET_COUNT);
                return self.finish(selected, level);
            }
            warn!(
                selected = selected.len(),
                needed = MIN_COUNT,
                %level,
                "not enough tracks fit"
            );
        }

        warn!("falling back to top ranked tracks without constraints");
        let selected = self.walk(ranked, RelaxationLevel::Unconstrained);
        self.finish(selected, RelaxationLevel::Unconstrained)
    }

    /// One greedy pass at the given strictness.
    ///
    /// `Unconstrained` takes the top five tracks, skipping only blacklisted
    /// ones.
    pub fn walk(&self, ranked: &[ScoredTrack], level: RelaxationLevel) -> Vec<ScoredTrack> {
        if level == RelaxationLevel::Unconstrained {
            return ranked
                .iter()
                .filter(|scored| !self.is_blacklisted(scored))
                .take(TARGET_COUNT)
                .cloned()
                .collect();
        }

        let config = self.config_at(level);
        let mut selected: Vec<ScoredTrack> = Vec::with_capacity(TARGET_COUNT);
        for scored in ranked {
            if selected.len() >= TARGET_COUNT {
                break;
            }
            match self.check(&selected, scored, &config) {
                Ok(()) => {
                    debug!(
                        position = selected.len() + 1,
                        title = %scored.track.title,
                        total = scored.scores.total,
                        "selected track"
                    );
                    selected.push(scored.clone());
                }
                Err(rejection) => {
                    debug!(
                        title = %scored.track.title,
                        reason = rejection.reason(),
                        "skipped track"
                    );
                }
            }
        }
        selected
    }

    /// Every constraint of this engine's configuration that `selected` violates
    pub fn validate_selection(&self, selected: &[ScoredTrack]) -> Vec<ConstraintViolation> {
        let config = &self.config;
        let mut violations = Vec::new();

        for scored in selected.iter().filter(|s| self.is_blacklisted(s)) {
            violations.push(ConstraintViolation::Blacklisted {
                title: scored.track.title.clone(),
            });
        }

        if !config.allow_duplicate_artists {
            let mut seen = HashSet::new();
            for scored in selected {
                let artist = scored.track.artist.to_lowercase();
                if !seen.insert(artist) {
                    violations.push(ConstraintViolation::DuplicateArtist {
                        artist: scored.track.artist.clone(),
                    });
                }
            }
        }

        let mainstream = self.mainstream_count(selected);
        if mainstream > config.max_mainstream {
            violations.push(ConstraintViolation::TooManyMainstream {
                count: mainstream,
                max: config.max_mainstream,
            });
        }
        violations.extend(self.minimum_violations(selected, config));
        violations
    }

    fn relaxation_applies(&self, level: RelaxationLevel) -> bool {
        match level {
            RelaxationLevel::Strict | RelaxationLevel::Unconstrained => true,
            RelaxationLevel::DuplicateArtists => !self.config.allow_duplicate_artists,
            RelaxationLevel::FewerDeepCuts => self.config.min_deep_cuts > 1,
        }
    }

    /// Effective configuration at a strictness level; each level keeps the
    /// relaxations of the levels before it
    fn config_at(&self, level: RelaxationLevel) -> ConstraintConfig {
        let mut config = self.config.clone();
        if level >= RelaxationLevel::DuplicateArtists {
            config.allow_duplicate_artists = true;
        }
        if level >= RelaxationLevel::FewerDeepCuts {
            config.min_deep_cuts = config.min_deep_cuts.min(1);
        }
        config
    }

    fn check(
        &self,
        selected: &[ScoredTrack],
        candidate: &ScoredTrack,
        config: &ConstraintConfig,
    ) -> Result<(), Rejection> {
        if self.is_blacklisted(candidate) {
            return Err(Rejection::Blacklisted);
        }

        if !config.allow_duplicate_artists {
            let artist = candidate.track.artist.to_lowercase();
            if selected.iter().any(|s| s.track.artist.to_lowercase() == artist) {
                return Err(Rejection::DuplicateArtist);
            }
        }

        if self.thresholds.is_mainstream(candidate.track.popularity)
            && self.mainstream_count(selected) >= config.max_mainstream
        {
            return Err(Rejection::MainstreamLimit);
        }
        Ok(())
    }

    fn is_blacklisted(&self, scored: &ScoredTrack) -> bool {
        if self.config.blacklist.iter().any(|id| *id == scored.track.spotify_id) {
            return true;
        }
        let title = scored.track.title.to_lowercase();
        BLACKLISTED_TITLES
            .iter()
            .any(|blacklisted| title.contains(&blacklisted.to_lowercase()))
    }

    fn mainstream_count(&self, tracks: &[ScoredTrack]) -> usize {
        tracks
            .iter()
            .filter(|s| self.thresholds.is_mainstream(s.track.popularity))
            .count()
    }

    fn deep_cut_count(&self, tracks: &[ScoredTrack]) -> usize {
        tracks
            .iter()
            .filter(|s| self.thresholds.is_deep_cut(s.track.popularity))
            .count()
    }

    /// Distinct decades over tracks with a known year
    fn decades(tracks: &[ScoredTrack]) -> HashSet<u32> {
        tracks
            .iter()
            .filter_map(|s| s.track.year.map(TagMatching::decade_of))
            .collect()
    }

    fn minimum_violations(
        &self,
        selected: &[ScoredTrack],
        config: &ConstraintConfig,
    ) -> Vec<ConstraintViolation> {
        let mut violations = Vec::new();
        let deep_cuts = self.deep_cut_count(selected);
        if deep_cuts < config.min_deep_cuts {
            violations.push(ConstraintViolation::TooFewDeepCuts {
                count: deep_cuts,
                min: config.min_deep_cuts,
            });
        }
        let decades = Self::decades(selected).len();
        if decades < config.min_decades {
            violations.push(ConstraintViolation::TooFewDecades {
                count: decades,
                min: config.min_decades,
            });
        }
        violations
    }

    /// Best effort: add remaining tracks (duplicate artists allowed) until the
    /// minimums hold or the selection reaches the backfill cap
    fn backfill(
        &self,
        ranked: &[ScoredTrack],
        selected: &mut Vec<ScoredTrack>,
        config: &ConstraintConfig,
    ) {
        let unmet = self.minimum_violations(selected, config);
        if unmet.is_empty() {
            return;
        }
        for violation in &unmet {
            warn!(%violation, "minimum constraint not met, backfilling");
        }

        let relaxed = ConstraintConfig {
            allow_duplicate_artists: true,
            ..config.clone()
        };
        let cap = TARGET_COUNT + BACKFILL_EXTRA;
        for scored in ranked {
            if selected.len() >= cap {
                break;
            }
            if selected.iter().any(|s| s.track.spotify_id == scored.track.spotify_id) {
                continue;
            }
            if self.check(selected, scored, &relaxed).is_ok() {
                debug!(title = %scored.track.title, "backfilled track");
                selected.push(scored.clone());
                if self.minimum_violations(selected, config).is_empty() {
                    break;
                }
            }
        }
    }

    fn finish(&self, tracks: Vec<ScoredTrack>, level: RelaxationLevel) -> Selection {
        let unmet = self.validate_selection(&tracks);
        for violation in &unmet {
            warn!(%violation, "constraint unmet in final selection");
        }

        let mut decade_list: Vec<u32> = Self::decades(&tracks).into_iter().collect();
        decade_list.sort_unstable();
        info!(
            total = tracks.len(),
            deep_cuts = self.deep_cut_count(&tracks),
            mainstream = self.mainstream_count(&tracks),
            decades = ?decade_list,
            %level,
            "final selection"
        );
        Selection { tracks, level, unmet }
    }
}
