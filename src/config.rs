use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::recommend::{ConstraintConfig, PopularityThresholds, ScoringWeights, SourceOptions};

const DEFAULT_CATALOG_PATH: &str = "data/songs/curated-indian-music.json";

/// Spotify OAuth client, only needed by commands that talk to Spotify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub spotify: Option<SpotifyCredentials>,
    pub spotify_market: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub catalog_path: PathBuf,
    pub cache_path: Option<PathBuf>, // None = memory-only caching
    pub http_timeout: Duration,
    pub pipeline_deadline: Duration,
    pub weights: ScoringWeights,
    pub thresholds: PopularityThresholds,
    pub constraints: ConstraintConfig,
    pub sources: SourceOptions,
}

/// Load configuration from `.env` and environment
pub fn load_config() -> Result<Config> {
    // Load `.env` file if present
    dotenv::dotenv().ok();
    Config::from_lookup(|key| std::env::var(key).ok())
}

impl Config {
    /// Build the configuration from any key lookup (the process environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let spotify = match (get("SPOTIFY_CLIENT_ID"), get("SPOTIFY_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(SpotifyCredentials {
                client_id,
                client_secret,
                refresh_token: get("SPOTIFY_REFRESH_TOKEN"),
            }),
            (None, None) => None,
            (Some(_), None) => anyhow::bail!("SPOTIFY_CLIENT_SECRET is not set"),
            (None, Some(_)) => anyhow::bail!("SPOTIFY_CLIENT_ID is not set"),
        };

        let default_weights = ScoringWeights::default();
        let weights = ScoringWeights {
            energy: parse_or(&get, "SCORING_WEIGHT_ENERGY", default_weights.energy)?,
            valence: parse_or(&get, "SCORING_WEIGHT_VALENCE", default_weights.valence)?,
            popularity: parse_or(&get, "SCORING_WEIGHT_POPULARITY", default_weights.popularity)?,
            language: parse_or(&get, "SCORING_WEIGHT_LANGUAGE", default_weights.language)?,
            era: parse_or(&get, "SCORING_WEIGHT_ERA", default_weights.era)?,
            vibe: parse_or(&get, "SCORING_WEIGHT_VIBE", default_weights.vibe)?,
        };
        if !weights.is_normalized() {
            warn!(sum = weights.sum(), "scoring weights do not sum to 1.0");
        }

        let default_thresholds = PopularityThresholds::default();
        let thresholds = PopularityThresholds {
            deep_cut_below: parse_or(
                &get,
                "POPULARITY_DEEP_CUT_BELOW",
                default_thresholds.deep_cut_below,
            )?,
            mainstream_above: parse_or(
                &get,
                "POPULARITY_MAINSTREAM_ABOVE",
                default_thresholds.mainstream_above,
            )?,
            deep_cut_bonus: parse_or(
                &get,
                "POPULARITY_DEEP_CUT_BONUS",
                default_thresholds.deep_cut_bonus,
            )?,
            mainstream_penalty: parse_or(
                &get,
                "POPULARITY_MAINSTREAM_PENALTY",
                default_thresholds.mainstream_penalty,
            )?,
            missing_popularity: parse_or(
                &get,
                "POPULARITY_MISSING_DEFAULT",
                default_thresholds.missing_popularity,
            )?,
        };
        if thresholds.deep_cut_below > thresholds.mainstream_above {
            warn!(
                deep_cut_below = thresholds.deep_cut_below,
                mainstream_above = thresholds.mainstream_above,
                "popularity tiers overlap"
            );
        }

        let default_constraints = ConstraintConfig::default();
        let constraints = ConstraintConfig {
            max_mainstream: parse_or(
                &get,
                "CONSTRAINT_MAX_MAINSTREAM",
                default_constraints.max_mainstream,
            )?,
            min_deep_cuts: parse_or(
                &get,
                "CONSTRAINT_MIN_DEEP_CUTS",
                default_constraints.min_deep_cuts,
            )?,
            min_decades: parse_or(
                &get,
                "CONSTRAINT_MIN_DECADES",
                default_constraints.min_decades,
            )?,
            allow_duplicate_artists: parse_or(&get, "CONSTRAINT_ALLOW_DUPLICATE_ARTISTS", false)?,
            blacklist: get("CONSTRAINT_BLACKLIST")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        };

        let default_sources = SourceOptions::default();
        let sources = SourceOptions {
            use_curated: parse_or(&get, "RECOMMEND_USE_CURATED", default_sources.use_curated)?,
            use_spotify_search: parse_or(
                &get,
                "RECOMMEND_USE_SPOTIFY_SEARCH",
                default_sources.use_spotify_search,
            )?,
            use_gpt: parse_or(&get, "RECOMMEND_USE_GPT", default_sources.use_gpt)?,
        };

        Ok(Config {
            spotify,
            spotify_market: get("SPOTIFY_MARKET").unwrap_or_else(|| "IN".to_string()),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            catalog_path: get("CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH)),
            cache_path: get("CACHE_PATH").map(PathBuf::from),
            http_timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 10)?),
            pipeline_deadline: Duration::from_secs(parse_or(&get, "PIPELINE_DEADLINE_SECS", 25)?),
            weights,
            thresholds,
            constraints,
            sources,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} has an invalid value: '{raw}'")),
        None => Ok(default),
    }
}
