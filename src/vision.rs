use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use ureq::Agent;

use crate::client::upstream_error;
use crate::error::UpstreamError;
use crate::models::{ImageAnalysis, SongSuggestion, clamp_unit};

const SERVICE: &str = "openai";
const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const MAX_LANGUAGES: usize = 3;

const ANALYSIS_PROMPT: &str = r#"You analyze images and extract their emotional and visual characteristics.

Return JSON with these fields:
- mood (string): a hyper-specific emotion, never generic like "sad" or "happy"
- target_energy (number 0-1): 0-0.3 calm, 0.4-0.6 contemplative, 0.7-1 intense
- target_valence (number 0-1): 0-0.3 melancholic, 0.4-0.6 bittersweet, 0.7-1 joyful
- texture (string): visual grain, e.g. "warm-grainy-analog", "cold-digital-crisp", "hazy-dreamlike"
- color_temperature (string): e.g. "golden-amber", "cool-blue-grey", "high-contrast-dark"
- era_preference (string): decade matching the aesthetic, formatted like "1990s" or "2010s"
- language_bias (array of 1-3 strings, most preferred first): Malayalam for Kerala landscapes and backwaters, Tamil for Tamil Nadu and urban Chennai, Hindi for North Indian settings, English for international or modern urban settings
- vibe_tags (array of 5-8 strings): specific mood/genre keywords, e.g. ["indie", "nostalgic", "monsoon"]

Selfies follow expression and setting, scenery follows region, city nights lean moody electronic, nature leans folk or ambient.

Return ONLY valid JSON. No markdown, no code blocks, no explanation."#;

const ANALYSIS_REQUEST: &str =
    "Analyze this image and extract the structured emotional and visual traits.";

const SUGGESTION_PROMPT: &str = r#"You recommend specific, real songs that match a described mood.

Given the image traits, return JSON {"songs": [...]} with 5-8 entries, each
{"title": string, "artist": string, "language": string, "year": number}.
Prefer lesser-known tracks over obvious hits and respect the preferred languages.
Return ONLY valid JSON."#;

/// Turns an image into structured traits
#[cfg_attr(test, mockall::automock)]
pub trait VisionAnalyzer: Send + Sync {
    fn analyze(&self, image: &[u8]) -> Result<ImageAnalysis, UpstreamError>;
}

/// Proposes specific songs for a set of traits
#[cfg_attr(test, mockall::automock)]
pub trait SongSuggester: Send + Sync {
    fn suggest(&self, analysis: &ImageAnalysis) -> Result<Vec<SongSuggestion>, UpstreamError>;
}

/// OpenAI chat-completions client used for vision analysis and song suggestions
pub struct OpenAiClient {
    agent: Agent,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuggestionList {
    #[serde(default)]
    songs: Vec<SongSuggestion>,
}

impl OpenAiClient {
    pub fn new(agent: Agent, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        OpenAiClient {
            agent,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Run one JSON-mode completion and return the raw message content
    fn complete(&self, messages: Value, max_tokens: u32) -> Result<String, UpstreamError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "response_format": { "type": "json_object" },
        });

        let started = std::time::Instant::now();
        let response = self
            .agent
            .post(COMPLETIONS_URL)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(body)
            .map_err(|e| upstream_error(SERVICE, e))?;

        let parsed: CompletionResponse = response
            .into_json()
            .map_err(|e| UpstreamError::malformed(SERVICE, e.to_string()))?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            model = %self.model,
            "completion returned"
        );

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| UpstreamError::malformed(SERVICE, "completion had no content"))
    }
}

impl VisionAnalyzer for OpenAiClient {
    fn analyze(&self, image: &[u8]) -> Result<ImageAnalysis, UpstreamError> {
        info!(size_kb = image.len() / 1024, "analyzing image");
        let data_url = format!("data:{};base64,{}", image_mime(image), BASE64.encode(image));

        let messages = json!([
            { "role": "system", "content": ANALYSIS_PROMPT },
            { "role": "user", "content": [
                { "type": "text", "text": ANALYSIS_REQUEST },
                { "type": "image_url", "image_url": { "url": data_url } },
            ]},
        ]);

        let content = self.complete(messages, 500)?;
        debug!(content = %content.chars().take(200).collect::<String>(), "raw analysis");
        parse_analysis(&content)
    }
}

impl SongSuggester for OpenAiClient {
    fn suggest(&self, analysis: &ImageAnalysis) -> Result<Vec<SongSuggestion>, UpstreamError> {
        let traits = serde_json::to_string(analysis)
            .map_err(|e| UpstreamError::malformed(SERVICE, e.to_string()))?;
        let messages = json!([
            { "role": "system", "content": SUGGESTION_PROMPT },
            { "role": "user", "content": traits },
        ]);

        let content = self.complete(messages, 800)?;
        let list: SuggestionList = serde_json::from_str(&content)
            .map_err(|e| UpstreamError::malformed(SERVICE, format!("suggestions: {e}")))?;
        Ok(list.songs)
    }
}

fn image_mime(image: &[u8]) -> &'static str {
    match image {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'G', b'I', b'F', ..] => "image/gif",
        _ => "image/jpeg",
    }
}

/// Validate and normalize the model's JSON into an `ImageAnalysis`
pub fn parse_analysis(content: &str) -> Result<ImageAnalysis, UpstreamError> {
    let parsed: Value = serde_json::from_str(content)
        .map_err(|e| UpstreamError::malformed(SERVICE, format!("analysis is not JSON: {e}")))?;

    let mood = parsed
        .get("mood")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| UpstreamError::malformed(SERVICE, "analysis is missing 'mood'"))?;
    let target_energy = parsed
        .get("target_energy")
        .and_then(Value::as_f64)
        .ok_or_else(|| UpstreamError::malformed(SERVICE, "analysis is missing 'target_energy'"))?;
    let target_valence = parsed
        .get("target_valence")
        .and_then(Value::as_f64)
        .ok_or_else(|| UpstreamError::malformed(SERVICE, "analysis is missing 'target_valence'"))?;

    let text_or = |key: &str, default: &str| {
        parsed
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(default)
            .to_string()
    };
    let string_list = |key: &str| -> Option<Vec<String>> {
        parsed.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    };

    let mut language_bias = string_list("language_bias")
        .unwrap_or_else(|| vec!["Malayalam".to_string(), "Tamil".to_string()]);
    language_bias.truncate(MAX_LANGUAGES);

    Ok(ImageAnalysis {
        mood: mood.to_string(),
        target_energy: clamp_unit(target_energy),
        target_valence: clamp_unit(target_valence),
        texture: text_or("texture", "neutral"),
        color_temperature: text_or("color_temperature", "neutral"),
        era_preference: text_or("era_preference", "2010s"),
        language_bias,
        vibe_tags: string_list("vibe_tags").unwrap_or_default(),
    })
}
