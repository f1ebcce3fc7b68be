//! Texture cache: decoded ad images for the current session, with the raw
//! bytes mirrored to disk so the next session can skip the download.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use image::RgbaImage;
use log::warn;

use crate::error::{PromoError, PromoResult};
use crate::net::SERVER_ERROR_MARKER;

/// Session-local list of decoded images. Candidates hold indices into the
/// list; the indices are meaningless across restarts.
pub struct TextureCache {
    dir: PathBuf,
    textures: Vec<Arc<RgbaImage>>,
}

impl TextureCache {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            textures: Vec::new(),
        }
    }

    pub fn get(&self, handle: usize) -> Option<Arc<RgbaImage>> {
        self.textures.get(handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Deterministic on-disk location for one candidate's image.
    pub fn cache_path(&self, feed: usize, file_name: &str) -> PathBuf {
        self.dir.join(format!("promo_{feed}_{file_name}"))
    }

    /// Read a previously cached image back from disk and decode it.
    /// Returns the new texture handle.
    pub async fn load_cached(&mut self, feed: usize, file_name: &str) -> PromoResult<usize> {
        let path = self.cache_path(feed, file_name);
        let bytes = fs::read(&path)
            .map_err(|err| PromoError::Storage(format!("cached image {}: {err}", path.display())))?;
        self.decode_and_store(bytes).await
    }

    /// Decode freshly downloaded image bytes and mirror them to the cache
    /// dir. Returns the texture handle and whether the disk write stuck; a
    /// failed write is logged but the image is still usable this session.
    pub async fn store_fetched(
        &mut self,
        bytes: Vec<u8>,
        feed: usize,
        file_name: &str,
    ) -> PromoResult<(usize, bool)> {
        if bytes.is_empty() {
            return Err(PromoError::Transport("empty image body".into()));
        }
        if looks_like_error_page(&bytes) {
            return Err(PromoError::Transport(
                "server-side error marker in image body".into(),
            ));
        }

        let path = self.cache_path(feed, file_name);
        let handle = self.decode_and_store(bytes.clone()).await?;

        let disk_cached = match write_cache_file(&path, &bytes) {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to write image cache {}: {err}", path.display());
                false
            }
        };

        Ok((handle, disk_cached))
    }

    async fn decode_and_store(&mut self, bytes: Vec<u8>) -> PromoResult<usize> {
        // Decoding is CPU work; keep it off the cooperative thread
        let decoded = tokio::task::spawn_blocking(move || {
            image::load_from_memory(&bytes).map(|img| img.to_rgba8())
        })
        .await
        .map_err(|err| PromoError::Storage(format!("decode worker join: {err}")))?
        .map_err(|err| PromoError::Storage(format!("image decode: {err}")))?;

        self.textures.push(Arc::new(decoded));
        Ok(self.textures.len() - 1)
    }
}

fn looks_like_error_page(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes)
        .map(|text| text.contains(SERVER_ERROR_MARKER))
        .unwrap_or(false)
}

fn write_cache_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
}
