use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Deadline;
use crate::cache::FeatureCache;
use crate::client::{AUDIO_FEATURES_BATCH_LIMIT, MusicProvider, POPULARITY_BATCH_LIMIT};
use crate::error::UpstreamError;
use crate::models::AudioFeatures;

/// Features for a set of ids plus where each one came from
#[derive(Debug, Clone, Default)]
pub struct FeatureLookup {
    pub features: HashMap<String, AudioFeatures>,
    pub provenance: FeatureProvenance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeatureProvenance {
    pub requested: usize,
    pub memory_hits: usize,
    pub store_hits: usize,
    pub fetched: usize,
}

impl FeatureProvenance {
    /// Features served from either cache tier over distinct ids requested
    pub fn hit_ratio(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        (self.memory_hits + self.store_hits) as f64 / self.requested as f64
    }
}

/// Audio features and live popularity, cache-first with batched upstream calls
pub struct AudioFeatureProvider {
    provider: Arc<dyn MusicProvider>,
    cache: Arc<FeatureCache>,
}

impl AudioFeatureProvider {
    pub fn new(provider: Arc<dyn MusicProvider>, cache: Arc<FeatureCache>) -> Self {
        Self { provider, cache }
    }

    /// Features for every id the provider knows; unknown ids are simply absent.
    ///
    /// Only upstream request failures are returned as errors. Batches run
    /// sequentially and stop early once `deadline` passes.
    pub fn get_audio_features(
        &self,
        track_ids: &[String],
        deadline: Deadline,
    ) -> Result<FeatureLookup, UpstreamError> {
        let ids = unique(track_ids);
        let cached = self.cache.lookup(&ids);

        let mut lookup = FeatureLookup {
            provenance: FeatureProvenance {
                requested: ids.len(),
                memory_hits: cached.memory_hits,
                store_hits: cached.store_hits,
                fetched: 0,
            },
            features: cached.found,
        };

        let missing: Vec<String> = ids
            .into_iter()
            .filter(|id| !lookup.features.contains_key(id))
            .collect();
        if missing.is_empty() {
            debug!(
                requested = lookup.provenance.requested,
                "all audio features served from cache"
            );
            return Ok(lookup);
        }

        let mut fetched = HashMap::new();
        let mut failure = None;
        for (batch_index, batch) in missing.chunks(AUDIO_FEATURES_BATCH_LIMIT).enumerate() {
            if deadline.expired() {
                warn!(
                    batch_index,
                    unfetched = missing.len() - batch_index * AUDIO_FEATURES_BATCH_LIMIT,
                    "deadline reached, returning partial audio features"
                );
                break;
            }
            match self.provider.audio_features(batch) {
                Ok(batch_features) => {
                    debug!(
                        batch_index,
                        size = batch.len(),
                        found = batch_features.len(),
                        budget_left = ?deadline.remaining(),
                        "audio feature batch"
                    );
                    fetched.extend(batch_features);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Earlier batches are cached even when a later one failed
        self.cache.insert_all(&fetched);
        if let Some(e) = failure {
            warn!(cached = fetched.len(), error = %e, "audio feature batch failed");
            return Err(e);
        }
        lookup.provenance.fetched = fetched.len();
        lookup.features.extend(fetched);

        info!(
            requested = lookup.provenance.requested,
            memory_hits = lookup.provenance.memory_hits,
            store_hits = lookup.provenance.store_hits,
            fetched = lookup.provenance.fetched,
            hit_ratio = lookup.provenance.hit_ratio(),
            "audio features resolved"
        );
        Ok(lookup)
    }

    /// Live popularity (0-100) per id. Never cached.
    pub fn get_track_popularity(
        &self,
        track_ids: &[String],
    ) -> Result<HashMap<String, u8>, UpstreamError> {
        let ids = unique(track_ids);
        let mut popularity = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(POPULARITY_BATCH_LIMIT) {
            popularity.extend(self.provider.popularity(batch)?);
        }
        debug!(requested = ids.len(), found = popularity.len(), "fetched track popularity");
        Ok(popularity)
    }
}

/// Distinct ids in first-seen order
fn unique(track_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    track_ids
        .iter()
        .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
        .cloned()
        .collect()
}
