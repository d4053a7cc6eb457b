//! On-disk session artifacts.
//!
//! Each session owns `<base>/<id>/`, holding numbered chunks
//! (`segment00000.ts`, `segment00001.ts`, ...) and a `playlist.m3u8` manifest.
//! Nothing else in the crate builds these paths.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Manifest file name inside a session directory.
pub const PLAYLIST_NAME: &str = "playlist.m3u8";
/// Chunk file name template understood by the segmenter (`segment%05d.ts`).
pub const SEGMENT_TEMPLATE: &str = "segment%05d.ts";

const SEGMENT_PREFIX: &str = "segment";
const SEGMENT_EXTENSION: &str = ".ts";
const END_MARKER: &str = "#EXT-X-ENDLIST";

/// Where a restarted pipeline picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePoint {
    /// Offset into the source, taken from the last progress snapshot.
    pub byte_offset: u64,
    /// Number of the first chunk the new pipeline writes.
    pub chunk_index: u32,
}

/// File name of chunk `index`.
pub fn segment_file_name(index: u32) -> String {
    format!("{SEGMENT_PREFIX}{index:05}{SEGMENT_EXTENSION}")
}

/// Chunk number encoded in a file name, if it is a chunk.
pub fn parse_segment_index(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_EXTENSION)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Chunk numbers referenced by a manifest, in manifest order.
pub fn playlist_segments(playlist: &str) -> Vec<u32> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let name = line.rsplit('/').next().unwrap_or(line);
            parse_segment_index(name)
        })
        .collect()
}

/// Index one past the contiguous run starting at the lowest chunk.
///
/// `[0, 1, 2, 5]` yields 3. An empty set yields 0.
pub fn next_contiguous_index(indices: &[u32]) -> u32 {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let Some((&first, rest)) = sorted.split_first() else {
        return 0;
    };
    let mut last = first;
    for &index in rest {
        if Some(index) != last.checked_add(1) {
            break;
        }
        last = index;
    }
    last.saturating_add(1)
}

/// Manifest text with the end-of-stream marker removed. `None` if there was none.
pub fn strip_end_marker(playlist: &str) -> Option<String> {
    if !playlist.lines().any(|l| l.trim() == END_MARKER) {
        return None;
    }
    let mut out = String::with_capacity(playlist.len());
    for line in playlist.lines().filter(|l| l.trim() != END_MARKER) {
        out.push_str(line);
        out.push('\n');
    }
    Some(out)
}

/// Owner of the per-session artifact directories under one base dir.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    pub fn playlist_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(PLAYLIST_NAME)
    }

    pub async fn ensure_base_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| Error::io_path("creating streams directory", &self.base_dir, e))
    }

    /// Create the session directory if needed and return its path.
    pub async fn ensure_session_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io_path("creating session directory", &dir, e))?;
        Ok(dir)
    }

    /// Remove the session directory. `Ok(false)` if it did not exist.
    pub async fn remove_session_dir(&self, id: &str) -> Result<bool> {
        let dir = self.session_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(session_id = %id, path = %dir.display(), "Removed session artifacts");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io_path("removing session directory", &dir, e)),
        }
    }

    /// Chunk numbers already written for a session.
    ///
    /// Read from the manifest when it lists any, otherwise from the directory.
    pub async fn completed_chunks(&self, id: &str) -> Result<Vec<u32>> {
        let playlist = self.playlist_path(id);
        match tokio::fs::read_to_string(&playlist).await {
            Ok(text) => {
                let listed = playlist_segments(&text);
                if !listed.is_empty() {
                    return Ok(listed);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io_path("reading playlist", &playlist, e)),
        }
        self.scan_chunks(id).await
    }

    async fn scan_chunks(&self, id: &str) -> Result<Vec<u32>> {
        let dir = self.session_dir(id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io_path("listing session directory", &dir, e)),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path("listing session directory", &dir, e))?
        {
            if let Some(index) = entry.file_name().to_str().and_then(parse_segment_index) {
                indices.push(index);
            }
        }
        Ok(indices)
    }

    /// Resume point for a session whose source has reached `byte_offset`.
    pub async fn resume_point(&self, id: &str, byte_offset: u64) -> Result<ResumePoint> {
        let chunks = self.completed_chunks(id).await?;
        Ok(ResumePoint {
            byte_offset,
            chunk_index: next_contiguous_index(&chunks),
        })
    }

    /// Remove the end-of-stream marker so an appending pipeline can extend the manifest.
    ///
    /// Returns whether the manifest was rewritten.
    pub async fn splice_end_marker(&self, id: &str) -> Result<bool> {
        let playlist = self.playlist_path(id);
        let text = match tokio::fs::read_to_string(&playlist).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io_path("reading playlist", &playlist, e)),
        };
        let Some(spliced) = strip_end_marker(&text) else {
            return Ok(false);
        };
        tokio::fs::write(&playlist, spliced)
            .await
            .map_err(|e| Error::io_path("rewriting playlist", &playlist, e))?;
        Ok(true)
    }
}
