use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cache;
mod catalog;
mod client;
mod config;
mod error;
mod models;
mod recommend;
mod vision;


use crate::cache::{CacheStore, FeatureCache, SqliteStore};
use crate::catalog::CatalogStore;
use crate::client::{SpotifyAuth, SpotifyClient};
use crate::config::{Config, SpotifyCredentials, load_config};
use crate::error::{Remediation, UpstreamError};
use crate::models::ImageAnalysis;
use crate::recommend::{Recommendation, Recommender, SourceOptions};
use crate::vision::{OpenAiClient, VisionAnalyzer};

#[derive(Parser)]
#[command(name = "vibe-playlist")]
#[command(about = "Song recommendations that match the vibe of a photo")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    /// Quiet mode - only warnings and errors are logged
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Extract the mood, energy and style traits of an image as JSON
    Analyze {
        /// Image file (JPEG, PNG, WebP or GIF)
        image: PathBuf,
    },

    /// Recommend songs for an image or a saved analysis
    Recommend {
        /// Image file to analyze first
        #[arg(required_unless_present = "analysis")]
        image: Option<PathBuf>,

        /// Use a saved `analyze` output instead of an image
        #[arg(long, conflicts_with = "image")]
        analysis: Option<PathBuf>,

        /// Print the recommendation and stats as JSON
        #[arg(long)]
        json: bool,

        /// Show how each track's score was computed
        #[arg(long)]
        explain: bool,

        /// Skip the curated catalog
        #[arg(long)]
        no_curated: bool,

        /// Skip live Spotify search
        #[arg(long)]
        no_search: bool,

        /// Ask the AI model for specific song suggestions too
        #[arg(long)]
        gpt: bool,
    },

    /// Manage the persistent audio-feature cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop cached audio features
    Clear {
        /// Spotify track ids to drop; every cached feature when omitted
        ids: Vec<String>,
    },
}

fn init_tracing(debug: bool, quiet: bool) {
    let level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vibe_playlist={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.quiet);

    // Load configuration from .env
    let config = load_config()?;
    let agent = ureq::AgentBuilder::new().timeout(config.http_timeout).build();

    match args.command {
        Command::Analyze { image } => {
            let analysis = analyze_image(&config, agent, &image)?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Command::Recommend {
            image,
            analysis,
            json,
            explain,
            no_curated,
            no_search,
            gpt,
        } => {
            let analysis = match (analysis, image) {
                (Some(path), _) => load_analysis(&path)?,
                (None, Some(image)) => analyze_image(&config, agent.clone(), &image)?,
                (None, None) => anyhow::bail!("either an image or --analysis is required"),
            };

            let sources = SourceOptions {
                use_curated: config.sources.use_curated && !no_curated,
                use_spotify_search: config.sources.use_spotify_search && !no_search,
                use_gpt: config.sources.use_gpt || gpt,
            };
            let recommender = build_recommender(&config, agent, sources)?;

            let recommendation = match recommender.recommend(&analysis) {
                Ok(recommendation) => recommendation,
                Err(e) => return Err(failure(&e, e.remediation())),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&recommendation)?);
            } else {
                print_report(&recommender, &analysis, &recommendation, explain);
            }
        }
        Command::Cache {
            action: CacheAction::Clear { ids },
        } => {
            let Some(store) = open_store(&config)? else {
                println!("CACHE_PATH is not set, there is no persistent cache to clear");
                return Ok(());
            };
            let cache = FeatureCache::with_store(store);
            let removed = if ids.is_empty() {
                cache.clear(None)
            } else {
                cache.clear(Some(&ids))
            };
            println!("✓ Removed {removed} cached audio feature entries");
        }
    }

    Ok(())
}

fn openai_client(config: &Config, agent: ureq::Agent) -> Result<OpenAiClient> {
    let Some(api_key) = &config.openai_api_key else {
        let err = UpstreamError::unauthorized("openai", "OPENAI_API_KEY is not set");
        return Err(failure(&err, err.remediation()));
    };
    Ok(OpenAiClient::new(agent, api_key.clone(), config.openai_model.clone()))
}

fn analyze_image(config: &Config, agent: ureq::Agent, path: &Path) -> Result<ImageAnalysis> {
    let image = std::fs::read(path)
        .with_context(|| format!("Failed to read image {}", path.display()))?;
    let vision = openai_client(config, agent)?;

    info!(path = %path.display(), "analyzing image");
    vision.analyze(&image).map_err(|e| failure(&e, e.remediation()))
}

fn load_analysis(path: &Path) -> Result<ImageAnalysis> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read analysis {}", path.display()))?;
    let analysis: ImageAnalysis = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse analysis {}", path.display()))?;
    Ok(analysis.normalized())
}

/// The persistent cache at `CACHE_PATH`, if one is configured
fn open_store(config: &Config) -> Result<Option<Arc<dyn CacheStore>>> {
    let Some(path) = &config.cache_path else {
        return Ok(None);
    };
    let store = SqliteStore::open(path)
        .with_context(|| format!("Failed to open feature cache {}", path.display()))?;
    Ok(Some(Arc::new(store)))
}

fn spotify_credentials(config: &Config) -> Result<&SpotifyCredentials> {
    match &config.spotify {
        Some(credentials) => Ok(credentials),
        None => {
            let err = UpstreamError::unauthorized(
                "spotify",
                "SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET are not set",
            );
            Err(failure(&err, err.remediation()))
        }
    }
}

fn build_recommender(
    config: &Config,
    agent: ureq::Agent,
    sources: SourceOptions,
) -> Result<Recommender> {
    let credentials = spotify_credentials(config)?;
    let store = open_store(config).unwrap_or_else(|e| {
        warn!(error = %e, "persistent feature cache unavailable, caching in memory only");
        None
    });
    let cache = match &store {
        Some(store) => FeatureCache::with_store(Arc::clone(store)),
        None => FeatureCache::memory_only(),
    };

    let auth = SpotifyAuth::new(credentials, agent.clone(), store);
    let spotify = SpotifyClient::new(
        agent.clone(),
        Arc::new(auth),
        config.spotify_market.clone(),
    );

    let mut recommender = Recommender::new(
        Arc::new(CatalogStore::from_path(&config.catalog_path)),
        Arc::new(spotify),
        Arc::new(cache),
    )
    .with_thresholds(config.thresholds)
    .with_weights(config.weights)
    .with_constraints(config.constraints.clone())
    .with_sources(sources)
    .with_deadline(config.pipeline_deadline);

    if sources.use_gpt {
        recommender = recommender.with_suggester(Arc::new(openai_client(config, agent)?));
    }
    Ok(recommender)
}

/// Print the failure with its remediation and turn it into the exit error
fn failure(err: &dyn std::error::Error, remediation: Remediation) -> anyhow::Error {
    eprintln!("✗ {err}");
    eprintln!("  {remediation}");
    anyhow::anyhow!("{err}")
}

fn print_report(
    recommender: &Recommender,
    analysis: &ImageAnalysis,
    recommendation: &Recommendation,
    explain: bool,
) {
    println!("\n=== Songs for \"{}\" ===", analysis.mood);
    println!(
        "Energy: {:.2} | Valence: {:.2} | Era: {} | Languages: {}",
        analysis.target_energy,
        analysis.target_valence,
        analysis.era_preference,
        analysis.language_bias.join(", ")
    );
    println!();

    for scored in &recommendation.tracks {
        let track = &scored.track;
        let year = track.year.map_or_else(|| "?".to_string(), |y| y.to_string());
        println!(
            "{}. {} by {} ({year})",
            scored.rank, track.title, track.artist
        );
        println!(
            "   Score: {:.3} ({}) | Popularity: {} | Source: {}",
            scored.scores.total,
            scored.confidence,
            track
                .popularity
                .map_or_else(|| "?".to_string(), |p| p.to_string()),
            track.source
        );
        println!("   https://open.spotify.com/track/{}", track.spotify_id);
        if explain {
            println!("{}", recommender.scoring().explain_score(scored, analysis));
        }
        println!();
    }

    let stats = &recommendation.stats;
    println!("--- Stats ---");
    println!(
        "Candidates: {} (curated {}, search {}, gpt {}) | Scored: {} | Selected: {}",
        stats.total_candidates,
        stats.sources.curated,
        stats.sources.spotify_search,
        stats.sources.gpt,
        stats.scored_tracks,
        stats.final_tracks
    );
    println!(
        "Audio feature cache hit rate: {:.0}% | Constraints: {}",
        stats.cache.audio_features_hit_rate * 100.0,
        stats.relaxation_level
    );
    for violation in &stats.unmet_constraints {
        println!("  unmet: {violation}");
    }
    println!("Total time: {}ms", stats.performance.total_ms);
}
