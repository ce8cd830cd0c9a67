use serde::{Deserialize, Serialize};

/// Structured traits extracted from an uploaded image by the vision step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub mood: String,
    pub target_energy: f64,
    pub target_valence: f64,
    pub texture: String,
    pub color_temperature: String,
    pub era_preference: String, // e.g. "2010s"
    pub language_bias: Vec<String>, // most preferred first
    pub vibe_tags: Vec<String>,
}

impl ImageAnalysis {
    /// Clamp the target axes into [0, 1]
    pub fn normalized(mut self) -> Self {
        self.target_energy = clamp_unit(self.target_energy);
        self.target_valence = clamp_unit(self.target_valence);
        self
    }
}

impl Default for ImageAnalysis {
    fn default() -> Self {
        ImageAnalysis {
            mood: String::new(),
            target_energy: 0.5,
            target_valence: 0.5,
            texture: "neutral".to_string(),
            color_temperature: "neutral".to_string(),
            era_preference: "2010s".to_string(),
            language_bias: Vec::new(),
            vibe_tags: Vec::new(),
        }
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.5
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Curated,
    Gpt,
    SpotifySearch,
}

impl std::fmt::Display for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrackSource::Curated => "curated",
            TrackSource::Gpt => "gpt",
            TrackSource::SpotifySearch => "spotify_search",
        };
        f.write_str(name)
    }
}

/// A track under consideration for the final playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTrack {
    pub spotify_id: String,
    pub title: String,
    pub artist: String,
    pub year: Option<u32>,
    pub language: Option<String>,
    pub genre_tags: Option<Vec<String>>,
    pub vibe_tags: Option<Vec<String>>,
    pub popularity: Option<u8>, // 0-100
    pub source: TrackSource,
}

impl CandidateTrack {
    /// Union of vibe and genre tags, lowercased
    pub fn all_tags(&self) -> Vec<String> {
        self.vibe_tags
            .iter()
            .chain(self.genre_tags.iter())
            .flatten()
            .map(|tag| tag.to_lowercase())
            .collect()
    }
}

/// Per-track continuous signal vector. Immutable once fetched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub energy: f64,
    pub valence: f64,
    pub danceability: f64,
    pub acousticness: f64,
    pub instrumentalness: f64,
    pub tempo: f64,    // BPM
    pub loudness: f64, // dB
    pub mode: u8,      // 0 = minor, 1 = major
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speechiness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<f64>,
}

impl Default for AudioFeatures {
    fn default() -> Self {
        AudioFeatures {
            energy: 0.5,
            valence: 0.5,
            danceability: 0.5,
            acousticness: 0.5,
            instrumentalness: 0.5,
            tempo: 120.0,
            loudness: -5.0,
            mode: 1,
            speechiness: None,
            liveness: None,
        }
    }
}

/// Component scores of one candidate, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub energy: f64,
    pub valence: f64,
    pub popularity: f64,
    pub language: f64,
    pub era: f64,
    pub vibe: f64,
    pub total: f64,
}

/// Coarse label summarising the total match score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Perfect,
    Good,
    Partial,
    Fallback,
}

impl Confidence {
    pub fn from_total(total: f64) -> Self {
        if total >= 0.8 {
            Confidence::Perfect
        } else if total >= 0.6 {
            Confidence::Good
        } else if total >= 0.4 {
            Confidence::Partial
        } else {
            Confidence::Fallback
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Confidence::Perfect => "perfect",
            Confidence::Good => "good",
            Confidence::Partial => "partial",
            Confidence::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTrack {
    pub track: CandidateTrack,
    #[serde(rename = "audioFeatures")]
    pub audio_features: AudioFeatures,
    pub scores: ScoreBreakdown,
    pub rank: u32, // 1 = best, assigned after sorting
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopularityTier {
    DeepCut,
    Moderate,
    Mainstream,
}

/// Entry of the curated song catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedSong {
    #[serde(default)]
    pub id: String,
    pub spotify_id: String,
    pub title: String,
    pub artist: String,
    pub composer: Option<String>,
    pub language: String,
    pub year: u32,
    pub album: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub genre_tags: Vec<String>,
    #[serde(default)]
    pub vibe_tags: Vec<String>,
    #[serde(default)]
    pub visual_moods: Vec<String>,
    pub popularity_tier: Option<PopularityTier>,
    #[serde(default)]
    pub is_indie: bool,
    #[serde(default)]
    pub emotional_keywords: Vec<String>,
}

impl CuratedSong {
    /// Every descriptive tag on the entry, lowercased
    pub fn all_tags(&self) -> Vec<String> {
        self.genre_tags
            .iter()
            .chain(&self.vibe_tags)
            .chain(&self.visual_moods)
            .chain(&self.emotional_keywords)
            .map(|tag| tag.to_lowercase())
            .collect()
    }

    pub fn to_candidate(&self) -> CandidateTrack {
        CandidateTrack {
            spotify_id: self.spotify_id.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            year: Some(self.year),
            language: Some(self.language.clone()),
            genre_tags: Some(self.genre_tags.clone()),
            vibe_tags: Some(self.vibe_tags.clone()),
            popularity: None,
            source: TrackSource::Curated,
        }
    }
}

/// On-disk layout of the curated catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuratedDatabase {
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub songs: Vec<CuratedSong>,
}

/// A track as returned by the music search provider
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub year: Option<u32>,
    pub popularity: Option<u8>,
}

/// A specific song proposed by the AI suggestion source
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SongSuggestion {
    pub title: String,
    pub artist: String,
    pub language: Option<String>,
    pub year: Option<u32>,
}

/// Response structure for the Spotify search endpoint
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    pub tracks: Option<TrackPage>,
}

#[derive(Debug, Deserialize)]
pub struct TrackPage {
    #[serde(default)]
    pub items: Vec<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
pub struct SpotifyTrack {
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artists: Vec<SpotifyArtist>,
    pub album: Option<SpotifyAlbum>,
    pub popularity: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct SpotifyArtist {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SpotifyAlbum {
    pub release_date: Option<String>, // "2015-06-01", "2015-06" or "2015"
}

impl SpotifyTrack {
    pub fn into_hit(self) -> Option<SearchHit> {
        let id = self.id?;
        let artist = self
            .artists
            .into_iter()
            .next()
            .map(|a| a.name)
            .unwrap_or_else(|| "Unknown".to_string());
        let year = self
            .album
            .and_then(|album| album.release_date)
            .and_then(|date| date.split('-').next().and_then(|y| y.parse().ok()));

        Some(SearchHit {
            id,
            title: self.name,
            artist,
            year,
            popularity: self.popularity,
        })
    }
}

/// Response structure for the Spotify audio-features endpoint
#[derive(Debug, Deserialize)]
pub struct AudioFeaturesResponse {
    #[serde(default)]
    pub audio_features: Vec<Option<SpotifyAudioFeatures>>,
}

#[derive(Debug, Deserialize)]
pub struct SpotifyAudioFeatures {
    pub id: Option<String>,
    pub energy: Option<f64>,
    pub valence: Option<f64>,
    pub danceability: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub tempo: Option<f64>,
    pub loudness: Option<f64>,
    pub mode: Option<u8>,
    pub speechiness: Option<f64>,
    pub liveness: Option<f64>,
}

impl From<SpotifyAudioFeatures> for AudioFeatures {
    fn from(raw: SpotifyAudioFeatures) -> Self {
        let neutral = AudioFeatures::default();
        AudioFeatures {
            energy: raw.energy.unwrap_or(neutral.energy),
            valence: raw.valence.unwrap_or(neutral.valence),
            danceability: raw.danceability.unwrap_or(neutral.danceability),
            acousticness: raw.acousticness.unwrap_or(neutral.acousticness),
            instrumentalness: raw.instrumentalness.unwrap_or(neutral.instrumentalness),
            tempo: raw.tempo.unwrap_or(neutral.tempo),
            loudness: raw.loudness.unwrap_or(neutral.loudness),
            mode: raw.mode.unwrap_or(neutral.mode),
            speechiness: raw.speechiness,
            liveness: raw.liveness,
        }
    }
}

/// Response structure for the Spotify several-tracks endpoint
#[derive(Debug, Deserialize)]
pub struct TracksResponse {
    #[serde(default)]
    pub tracks: Vec<Option<SpotifyTrack>>,
}

/// Response structure for the OAuth token endpoint
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
}
