//! Time-bounded cache of panel token-validation verdicts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

const ENTRY_TTL: Duration = Duration::from_secs(10 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Owner of the verdict map. Keys are hashes so raw tokens never sit in
/// memory longer than the request that carried them.
#[derive(Clone, Default)]
pub struct ValidationCache {
    entries: Arc<Mutex<HashMap<String, (bool, Instant)>>>,
}

fn cache_key(server_id: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_id.as_bytes());
    // Delimiter keeps ("ab", "c") and ("a", "bc") from colliding.
    hasher.update([0u8]);
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

impl ValidationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cached verdict, if present and not yet expired.
    pub async fn get(&self, server_id: &str, token: &str) -> Option<bool> {
        let entries = self.entries.lock().await;
        entries
            .get(&cache_key(server_id, token))
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(verdict, _)| *verdict)
    }

    pub async fn insert(&self, server_id: &str, token: &str, verdict: bool) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            cache_key(server_id, token),
            (verdict, Instant::now() + ENTRY_TTL),
        );
    }

    pub async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| now < *expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired validation cache entries.");
        }
    }

    /// Spawns the once-a-minute expiry sweeper.
    pub fn spawn_sweeper(&self) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                cache.sweep().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hit_after_insert() {
        let cache = ValidationCache::new();
        assert_eq!(cache.get("s1", "tok").await, None);
        cache.insert("s1", "tok", true).await;
        assert_eq!(cache.get("s1", "tok").await, Some(true));
        // Different token, different key.
        assert_eq!(cache.get("s1", "other").await, None);
        assert_eq!(cache.get("s2", "tok").await, None);
    }

    #[tokio::test]
    async fn test_negative_verdicts_are_cached_too() {
        let cache = ValidationCache::new();
        cache.insert("s1", "bad", false).await;
        assert_eq!(cache.get("s1", "bad").await, Some(false));
    }

    #[tokio::test]
    async fn test_expired_entries_miss_and_sweep() {
        let cache = ValidationCache::new();
        cache.insert("s1", "tok", true).await;
        {
            // Force immediate expiry.
            let mut entries = cache.entries.lock().await;
            for (_, expires_at) in entries.values_mut() {
                *expires_at = Instant::now();
            }
        }
        assert_eq!(cache.get("s1", "tok").await, None);
        cache.sweep().await;
        assert!(cache.entries.lock().await.is_empty());
    }

    #[test]
    fn test_key_separates_id_and_token() {
        assert_ne!(cache_key("ab", "c"), cache_key("a", "bc"));
    }
}
