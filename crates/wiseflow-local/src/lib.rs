use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use wiseflow_core::{Error, ImageRecognizer, Result};

pub mod chunk;
pub mod focus;
pub mod links;
pub mod openai_compat;
pub mod preprocess;
pub mod prompts;
pub mod retry;
pub mod textprep;
pub mod vision;

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// Env vars are process-global; serialize tests that mutate them.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// `WISEFLOW_CACHE_DIR`, else `wiseflow-cache` under the per-user cache dir
/// (system temp dir when the platform has none).
pub fn default_cache_dir() -> PathBuf {
    env("WISEFLOW_CACHE_DIR").map(PathBuf::from).unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("wiseflow-cache")
    })
}

/// `WISEFLOW_IMAGE_CACHE_TTL_S`; unset or unparsable means records never expire.
pub fn image_cache_ttl_from_env() -> Option<Duration> {
    env("WISEFLOW_IMAGE_CACHE_TTL_S")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageRecord {
    schema_version: u32,
    recognized_at_epoch_s: u64,
    namespace: String,
    image_url: String,
    text: String,
}

/// On-disk memo of image recognition results.
///
/// Layout: `root/ab/cd/<sha256>.json`, one JSON record per (namespace, image URL).
/// The namespace keeps results from different vision models apart.
#[derive(Debug, Clone)]
pub struct FsImageCache {
    root: PathBuf,
    ttl: Option<Duration>,
}

impl FsImageCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root, ttl: None }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    fn key_for(namespace: &str, image_url: &str) -> String {
        let mut h = Sha256::new();
        h.update(b"ns:");
        h.update(namespace.as_bytes());
        h.update(b"\nurl:");
        h.update(image_url.as_bytes());
        hex::encode(h.finalize())
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root
            .join(&key[0..2])
            .join(&key[2..4])
            .join(format!("{key}.json"))
    }

    pub fn get(&self, namespace: &str, image_url: &str) -> Result<Option<String>> {
        let p = self.path(&Self::key_for(namespace, image_url));
        if !p.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&p).map_err(|e| Error::Cache(e.to_string()))?;
        let rec: ImageRecord =
            serde_json::from_slice(&bytes).map_err(|e| Error::Cache(e.to_string()))?;
        // Hash collisions are not a practical concern; a mismatch means a foreign file.
        if rec.image_url != image_url || rec.namespace != namespace {
            return Ok(None);
        }
        if let Some(ttl) = self.ttl {
            if now_epoch_s().saturating_sub(rec.recognized_at_epoch_s) > ttl.as_secs() {
                return Ok(None);
            }
        }
        Ok(Some(rec.text))
    }

    pub fn put(&self, namespace: &str, image_url: &str, text: &str) -> Result<()> {
        self.put_at(namespace, image_url, text, now_epoch_s())
    }

    fn put_at(&self, namespace: &str, image_url: &str, text: &str, at_epoch_s: u64) -> Result<()> {
        let p = self.path(&Self::key_for(namespace, image_url));
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Cache(e.to_string()))?;
        }
        let rec = ImageRecord {
            schema_version: 1,
            recognized_at_epoch_s: at_epoch_s,
            namespace: namespace.to_string(),
            image_url: image_url.to_string(),
            text: text.to_string(),
        };
        fs::write(
            &p,
            serde_json::to_vec(&rec).map_err(|e| Error::Cache(e.to_string()))?,
        )
        .map_err(|e| Error::Cache(e.to_string()))?;
        Ok(())
    }
}

/// Wraps a recognizer with an [`FsImageCache`].
///
/// Only successful recognitions are stored. Cache I/O errors are logged and
/// treated as misses.
pub struct CachedRecognizer<R> {
    inner: R,
    cache: FsImageCache,
    namespace: String,
}

impl<R: ImageRecognizer> CachedRecognizer<R> {
    pub fn new(inner: R, cache: FsImageCache, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            cache,
            namespace: namespace.into(),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<R: ImageRecognizer> ImageRecognizer for CachedRecognizer<R> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn recognize(&self, image_url: &str) -> Result<String> {
        let cache = self.cache.clone();
        let ns = self.namespace.clone();
        let url = image_url.to_string();
        let hit = tokio::task::spawn_blocking(move || cache.get(&ns, &url))
            .await
            .map_err(|e| Error::Cache(format!("cache get join failed: {e}")))?;
        match hit {
            Ok(Some(text)) => return Ok(text),
            Ok(None) => {}
            Err(e) => tracing::warn!(image = image_url, error = %e, "image cache read failed"),
        }

        let text = self.inner.recognize(image_url).await?;

        let cache = self.cache.clone();
        let ns = self.namespace.clone();
        let url = image_url.to_string();
        let text2 = text.clone();
        // The recognition already succeeded; a failed write only costs a future miss.
        match tokio::task::spawn_blocking(move || cache.put(&ns, &url, &text2)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(image = image_url, error = %e, "image cache write failed"),
            Err(e) => tracing::warn!(image = image_url, error = %e, "image cache write task failed"),
        }
        Ok(text)
    }
}
