use serde::{Deserialize, Serialize};

/// Named defaults of the scoring and constraint contract
pub mod defaults {
    pub const WEIGHT_ENERGY: f64 = 0.25;
    pub const WEIGHT_VALENCE: f64 = 0.25;
    pub const WEIGHT_POPULARITY: f64 = 0.20;
    pub const WEIGHT_LANGUAGE: f64 = 0.15;
    pub const WEIGHT_ERA: f64 = 0.10;
    pub const WEIGHT_VIBE: f64 = 0.05;

    /// Assumed popularity when the provider reports none
    pub const MISSING_POPULARITY: u8 = 50;
    pub const DEEP_CUT_BELOW: u8 = 40;
    pub const MAINSTREAM_ABOVE: u8 = 80;
    pub const DEEP_CUT_BONUS: f64 = 0.3;
    pub const MAINSTREAM_PENALTY: f64 = 0.2;

    /// Score for unknown or unmatched data on the language, era and vibe axes
    pub const NEUTRAL_SCORE: f64 = 0.5;
    pub const LANGUAGE_MISMATCH_SCORE: f64 = 0.5;
    pub const ERA_NEAR_YEARS: u32 = 5;
    pub const ERA_ADJACENT_YEARS: u32 = 10;
    pub const ERA_ADJACENT_SCORE: f64 = 0.7;
    pub const ERA_DISTANT_SCORE: f64 = 0.4;

    pub const MAX_MAINSTREAM: usize = 1;
    pub const MIN_DEEP_CUTS: usize = 2;
    pub const MIN_DECADES: usize = 2;
    pub const TARGET_COUNT: usize = 5;
    pub const MIN_COUNT: usize = 4;
    /// How far past the target count the minimum-backfill may grow the selection
    pub const BACKFILL_EXTRA: usize = 2;

    /// Well-known, overused titles never recommended (case-insensitive substring)
    pub const BLACKLISTED_TITLES: &[&str] = &[
        // English
        "Here Comes the Sun",
        "Riders on the Storm",
        "Happy",
        "Someone Like You",
        "Blinding Lights",
        "Bohemian Rhapsody",
        "Creep",
        "Photograph",
        "Shape of You",
        "Despacito",
        // Malayalam
        "Malare",
        "Appangal Embadum",
        "Jimmiki Kammal",
        // Tamil
        "Why This Kolaveri Di",
        "Rowdy Baby",
        "Ennodu Nee Irundhaal",
        // Hindi
        "Jai Ho",
        "Tujhe Dekha To",
        "Chaiyya Chaiyya",
    ];
}

/// Weights of the six scoring components. Should sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub energy: f64,
    pub valence: f64,
    pub popularity: f64,
    pub language: f64,
    pub era: f64,
    pub vibe: f64,
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.energy + self.valence + self.popularity + self.language + self.era + self.vibe
    }

    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() <= 0.001
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            energy: defaults::WEIGHT_ENERGY,
            valence: defaults::WEIGHT_VALENCE,
            popularity: defaults::WEIGHT_POPULARITY,
            language: defaults::WEIGHT_LANGUAGE,
            era: defaults::WEIGHT_ERA,
            vibe: defaults::WEIGHT_VIBE,
        }
    }
}

/// Popularity tier boundaries and the score adjustments tied to them
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopularityThresholds {
    pub deep_cut_below: u8,   // strictly below = deep cut
    pub mainstream_above: u8, // strictly above = mainstream
    pub deep_cut_bonus: f64,
    pub mainstream_penalty: f64,
    pub missing_popularity: u8,
}

impl PopularityThresholds {
    /// Popularity with the missing-value default applied, capped at 100
    pub fn effective(&self, popularity: Option<u8>) -> u8 {
        popularity.unwrap_or(self.missing_popularity).min(100)
    }

    pub fn is_deep_cut(&self, popularity: Option<u8>) -> bool {
        self.effective(popularity) < self.deep_cut_below
    }

    pub fn is_mainstream(&self, popularity: Option<u8>) -> bool {
        self.effective(popularity) > self.mainstream_above
    }
}

impl Default for PopularityThresholds {
    fn default() -> Self {
        Self {
            deep_cut_below: defaults::DEEP_CUT_BELOW,
            mainstream_above: defaults::MAINSTREAM_ABOVE,
            deep_cut_bonus: defaults::DEEP_CUT_BONUS,
            mainstream_penalty: defaults::MAINSTREAM_PENALTY,
            missing_popularity: defaults::MISSING_POPULARITY,
        }
    }
}

/// Diversity and quality constraints for the final selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintConfig {
    pub max_mainstream: usize,
    pub min_deep_cuts: usize,
    pub min_decades: usize,
    pub allow_duplicate_artists: bool,
    pub blacklist: Vec<String>, // spotify ids, on top of BLACKLISTED_TITLES
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            max_mainstream: defaults::MAX_MAINSTREAM,
            min_deep_cuts: defaults::MIN_DEEP_CUTS,
            min_decades: defaults::MIN_DECADES,
            allow_duplicate_artists: false,
            blacklist: Vec::new(),
        }
    }
}

/// Which candidate sources a request draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOptions {
    pub use_curated: bool,
    pub use_spotify_search: bool,
    pub use_gpt: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            use_curated: true,
            use_spotify_search: true,
            use_gpt: false,
        }
    }
}
