//! Peer discovery: manifest type, TTL + LRU cache, well-known fetch.
//!
//! Manifests are fetched from `<base>/.well-known/asap/manifest.json` and
//! cached. The peer's `Cache-Control: max-age` is authoritative for the TTL
//! when present; otherwise the cache default applies.

use crate::error::TransportError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Well-known path a peer serves its manifest under.
pub const MANIFEST_PATH: &str = "/.well-known/asap/manifest.json";

/// A peer's self-description: identity, capabilities, endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    /// Opaque URN-like agent identifier.
    pub agent: String,
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Named endpoints, e.g. `rpc` -> `https://host/asap`.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Map<String, serde_json::Value>>,
}

impl AgentManifest {
    /// Shape check applied to every discovered manifest before caching.
    pub fn validate(&self) -> Result<(), String> {
        if self.agent.trim().is_empty() {
            return Err("manifest agent identifier is empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("manifest name is empty".to_string());
        }
        if self.protocol_version.trim().is_empty() {
            return Err("manifest protocol_version is empty".to_string());
        }
        Ok(())
    }
}

struct CacheEntry {
    manifest: AgentManifest,
    expires_at: Instant,
    /// Monotonic recency stamp; larger means more recently used.
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

/// TTL + LRU cache mapping a discovery URL to the peer's manifest.
///
/// Expiry is lazy (checked on `get`); LRU eviction happens only when
/// inserting a brand-new key at capacity. Safe for concurrent callers.
pub struct ManifestCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    default_ttl: Duration,
}

impl ManifestCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    /// Cached manifest for `url`, refreshing its LRU position. An expired
    /// entry is evicted as a side effect and `None` returned.
    pub fn get(&self, url: &str) -> Option<AgentManifest> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        match inner.entries.get_mut(url) {
            Some(entry) if Instant::now() >= entry.expires_at => {
                inner.entries.remove(url);
                tracing::debug!(url = url, "Manifest cache entry expired - evicting");
                None
            }
            Some(entry) => {
                entry.last_used = tick;
                Some(entry.manifest.clone())
            }
            None => None,
        }
    }

    /// Insert or replace. Inserting a brand-new key at capacity evicts the
    /// least-recently-used entry first.
    pub fn set(&self, url: &str, manifest: AgentManifest, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(url) && inner.entries.len() >= self.max_size {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
                tracing::debug!(url = %lru_key, "Manifest cache full - evicting LRU entry");
            }
        }

        inner.entries.insert(
            url.to_string(),
            CacheEntry {
                manifest,
                expires_at: Instant::now() + ttl,
                last_used: tick,
            },
        );
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, url: &str) -> bool {
        self.inner.lock().entries.remove(url).is_some()
    }

    pub fn clear_all(&self) {
        self.inner.lock().entries.clear();
    }

    /// Full sweep removing every expired entry; returns how many were
    /// removed. Meant for periodic background maintenance, not the hot path.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| now < entry.expires_at);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse `max-age` out of a `Cache-Control` header value.
fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control.split(',').find_map(|directive| {
        let directive = directive.trim();
        let value = directive.strip_prefix("max-age=")?;
        value.parse::<u64>().ok().map(Duration::from_secs)
    })
}

/// Fetch a peer's manifest from its well-known URL.
///
/// Returns the manifest and the TTL the peer advertised, if any.
pub async fn fetch_manifest(
    http: &reqwest::Client,
    base_url: &str,
) -> Result<(AgentManifest, Option<Duration>), TransportError> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), MANIFEST_PATH);

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| TransportError::Connection {
            target: base_url.to_string(),
            detail: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(TransportError::ManifestInvalid {
            url: url.clone(),
            reason: format!("discovery returned HTTP {}", response.status()),
        });
    }

    let ttl = response
        .headers()
        .get(reqwest::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_max_age);

    let manifest: AgentManifest =
        response
            .json()
            .await
            .map_err(|e| TransportError::ManifestInvalid {
                url: url.clone(),
                reason: format!("malformed manifest body: {e}"),
            })?;

    manifest
        .validate()
        .map_err(|reason| TransportError::ManifestInvalid { url, reason })?;

    Ok((manifest, ttl))
}
