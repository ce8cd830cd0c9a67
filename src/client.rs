use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use ureq::Agent;
use urlencoding::encode;

use crate::cache::{CacheStore, lock};
use crate::config::SpotifyCredentials;
use crate::error::UpstreamError;
use crate::models::{
    AudioFeatures, AudioFeaturesResponse, SearchHit, SearchResponse, TokenResponse, TracksResponse,
};
use crate::recommend::config::defaults::MISSING_POPULARITY;

const SERVICE: &str = "spotify";
const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const TOKEN_CACHE_KEY: &str = "spotify:access_token";
/// Tokens are refreshed this long before the provider says they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Per-call item cap of the audio-features endpoint
pub const AUDIO_FEATURES_BATCH_LIMIT: usize = 100;
/// Per-call item cap of the several-tracks endpoint
pub const POPULARITY_BATCH_LIMIT: usize = 50;

/// The music search / metadata operations the recommendation core consumes
#[cfg_attr(test, mockall::automock)]
pub trait MusicProvider: Send + Sync {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, UpstreamError>;

    /// At most `AUDIO_FEATURES_BATCH_LIMIT` ids per call; unknown ids are absent
    fn audio_features(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, AudioFeatures>, UpstreamError>;

    /// At most `POPULARITY_BATCH_LIMIT` ids per call; unknown ids are absent
    fn popularity(&self, ids: &[String]) -> Result<HashMap<String, u8>, UpstreamError>;
}

/// Anything that can hand out a valid bearer token
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Result<String, UpstreamError>;
}

/// Translate a ureq failure into the upstream taxonomy
pub(crate) fn upstream_error(service: &'static str, err: ureq::Error) -> UpstreamError {
    match err {
        ureq::Error::Status(429, response) => {
            let retry_after = response
                .header("Retry-After")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            UpstreamError::RateLimited {
                service,
                retry_after,
            }
        }
        ureq::Error::Status(code @ (401 | 403), response) => UpstreamError::unauthorized(
            service,
            format!("status {code}: {}", body_snippet(response)),
        ),
        ureq::Error::Status(code, response) => UpstreamError::unavailable(
            service,
            format!("status {code}: {}", body_snippet(response)),
        ),
        ureq::Error::Transport(transport) => {
            UpstreamError::unavailable(service, transport.to_string())
        }
    }
}

fn body_snippet(response: ureq::Response) -> String {
    let body = response.into_string().unwrap_or_default();
    body.chars().take(200).collect()
}

#[derive(Debug, Clone)]
enum Grant {
    ClientCredentials,
    RefreshToken(String),
}

impl Grant {
    fn name(&self) -> &'static str {
        match self {
            Grant::ClientCredentials => "client_credentials",
            Grant::RefreshToken(_) => "refresh_token",
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// OAuth token source for the Spotify Web API.
///
/// Uses the refresh-token grant when a refresh token is configured and the
/// client-credentials grant otherwise. Tokens are cached in memory and, when a
/// store is attached, in the shared cache store.
pub struct SpotifyAuth {
    agent: Agent,
    client_id: String,
    client_secret: String,
    grant: Grant,
    cached: Mutex<Option<CachedToken>>,
    store: Option<Arc<dyn CacheStore>>,
}

impl SpotifyAuth {
    pub fn new(
        credentials: &SpotifyCredentials,
        agent: Agent,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        let grant = match &credentials.refresh_token {
            Some(token) => Grant::RefreshToken(token.clone()),
            None => Grant::ClientCredentials,
        };

        SpotifyAuth {
            agent,
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            grant,
            cached: Mutex::new(None),
            store,
        }
    }

    fn request_token(&self) -> Result<TokenResponse, UpstreamError> {
        let credentials = BASE64.encode(format!("{}:{}", self.client_id, self.client_secret));
        let request = self
            .agent
            .post(TOKEN_URL)
            .set("Authorization", &format!("Basic {credentials}"));

        let response = match &self.grant {
            Grant::ClientCredentials => request.send_form(&[("grant_type", "client_credentials")]),
            Grant::RefreshToken(token) => request.send_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", token.as_str()),
            ]),
        }
        .map_err(|e| upstream_error(SERVICE, e))?;

        response
            .into_json::<TokenResponse>()
            .map_err(|e| UpstreamError::malformed(SERVICE, format!("token response: {e}")))
    }
}

impl TokenSource for SpotifyAuth {
    fn access_token(&self) -> Result<String, UpstreamError> {
        let mut cached = lock(&self.cached);
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.expires_at) {
            return Ok(token.value.clone());
        }

        if let Some(store) = &self.store {
            match store.get(TOKEN_CACHE_KEY) {
                Ok(Some(token)) => {
                    // Store TTL already carries the expiry margin; keep it briefly in memory
                    *cached = Some(CachedToken {
                        value: token.clone(),
                        expires_at: Instant::now() + TOKEN_EXPIRY_MARGIN,
                    });
                    return Ok(token);
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "token store read failed"),
            }
        }

        info!(grant = self.grant.name(), "requesting Spotify access token");
        let token = self.request_token()?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);

        if let Some(store) = &self.store {
            if let Err(e) = store.set_with_ttl(TOKEN_CACHE_KEY, &token.access_token, lifetime) {
                debug!(error = %e, "token store write failed");
            }
        }
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

/// Spotify Web API client for search, audio features and popularity
pub struct SpotifyClient {
    agent: Agent,
    tokens: Arc<dyn TokenSource>,
    market: String,
}

impl SpotifyClient {
    pub fn new(agent: Agent, tokens: Arc<dyn TokenSource>, market: impl Into<String>) -> Self {
        SpotifyClient {
            agent,
            tokens,
            market: market.into(),
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, UpstreamError> {
        let token = self.tokens.access_token()?;
        let response = self
            .agent
            .get(url)
            .set("Authorization", &format!("Bearer {token}"))
            .call()
            .map_err(|e| upstream_error(SERVICE, e))?;

        response
            .into_json::<T>()
            .map_err(|e| UpstreamError::malformed(SERVICE, e.to_string()))
    }

    fn capped<'a>(ids: &'a [String], limit: usize, what: &str) -> &'a [String] {
        if ids.len() > limit {
            warn!(requested = ids.len(), limit, "{what} request over the batch cap, truncating");
            &ids[..limit]
        } else {
            ids
        }
    }

    fn join_ids(ids: &[String]) -> String {
        encode(&ids.join(",")).into_owned()
    }
}

impl MusicProvider for SpotifyClient {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, UpstreamError> {
        let url = format!(
            "{API_BASE}/search?q={}&type=track&limit={limit}&market={}",
            encode(query),
            encode(&self.market)
        );
        debug!(query, limit, "searching Spotify");

        let parsed: SearchResponse = self.get_json(&url)?;
        let hits: Vec<SearchHit> = parsed
            .tracks
            .map(|page| page.items)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|track| track.into_hit())
            .collect();
        Ok(hits)
    }

    fn audio_features(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, AudioFeatures>, UpstreamError> {
        let ids = Self::capped(ids, AUDIO_FEATURES_BATCH_LIMIT, "audio features");
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{API_BASE}/audio-features?ids={}", Self::join_ids(ids));
        let parsed: AudioFeaturesResponse = self.get_json(&url)?;

        // Entries come back in request order, null for unknown ids
        let mut results = HashMap::new();
        for (id, entry) in ids.iter().zip(parsed.audio_features) {
            match entry {
                Some(raw) => {
                    results.insert(id.clone(), AudioFeatures::from(raw));
                }
                None => debug!(track_id = %id, "no audio features for track"),
            }
        }
        debug!(fetched = results.len(), requested = ids.len(), "fetched audio features");
        Ok(results)
    }

    fn popularity(&self, ids: &[String]) -> Result<HashMap<String, u8>, UpstreamError> {
        let ids = Self::capped(ids, POPULARITY_BATCH_LIMIT, "popularity");
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{API_BASE}/tracks?ids={}", Self::join_ids(ids));
        let parsed: TracksResponse = self.get_json(&url)?;

        let results: HashMap<String, u8> = parsed
            .tracks
            .into_iter()
            .flatten()
            .filter_map(|track| {
                let popularity = track.popularity.unwrap_or(MISSING_POPULARITY).min(100);
                track.id.map(|id| (id, popularity))
            })
            .collect();
        debug!(fetched = results.len(), requested = ids.len(), "fetched popularity");
        Ok(results)
    }
}
