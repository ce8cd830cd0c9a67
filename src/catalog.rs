use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::cache::lock;
use crate::models::{CuratedDatabase, CuratedSong};

struct Snapshot {
    songs: Arc<[CuratedSong]>,
    modified: Option<SystemTime>,
}

/// Read-only snapshot of the curated song catalog.
///
/// The catalog file is parsed on first use and shared process-wide. It is
/// parsed again only when the file's modification time changes.
pub struct CatalogStore {
    path: Option<PathBuf>,
    snapshot: Mutex<Option<Snapshot>>,
}

impl CatalogStore {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            snapshot: Mutex::new(None),
        }
    }

    /// A fixed in-memory catalog
    #[cfg(test)]
    pub fn from_songs(songs: Vec<CuratedSong>) -> Self {
        Self {
            path: None,
            snapshot: Mutex::new(Some(Snapshot {
                songs: songs.into(),
                modified: None,
            })),
        }
    }

    /// Current snapshot, reloading it when the catalog file changed on disk
    pub fn list(&self) -> Result<Arc<[CuratedSong]>> {
        let mut snapshot = lock(&self.snapshot);
        let Some(path) = &self.path else {
            return Ok(snapshot
                .as_ref()
                .map(|s| Arc::clone(&s.songs))
                .unwrap_or_else(|| Arc::from(Vec::new())));
        };

        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if let Some(current) = snapshot.as_ref().filter(|s| s.modified == modified) {
            return Ok(Arc::clone(&current.songs));
        }
        if snapshot.is_some() {
            info!(path = %path.display(), "curated catalog changed, reloading");
        }

        let songs: Arc<[CuratedSong]> = Self::load(path)?.into();
        *snapshot = Some(Snapshot {
            songs: Arc::clone(&songs),
            modified,
        });
        Ok(songs)
    }

    fn load(path: &Path) -> Result<Vec<CuratedSong>> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "curated catalog not found, curated source will be empty"
            );
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read curated catalog {}", path.display()))?;
        let database: CuratedDatabase = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse curated catalog {}", path.display()))?;

        let total = database.songs.len();
        let mut seen = HashSet::new();
        let songs: Vec<CuratedSong> = database
            .songs
            .into_iter()
            .filter(|song| {
                let fresh = song.id.is_empty() || seen.insert(song.id.clone());
                if !fresh {
                    warn!(
                        id = %song.id,
                        title = %song.title,
                        "duplicate catalog id, keeping the first"
                    );
                }
                fresh
            })
            .collect();

        info!(
            songs = songs.len(),
            duplicates = total - songs.len(),
            "loaded curated catalog"
        );
        Ok(songs)
    }
}
