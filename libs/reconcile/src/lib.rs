//! Convergence-loop primitives.
//!
//! The sync engine and the scheduler driver are both loops that re-read
//! remote state and push derived state until nothing changes. This library
//! holds the pieces they share:
//!
//! - **Bounded retry**: run an operation a fixed number of times with a fixed
//!   delay, surfacing the last error unchanged. Errors the caller marks as
//!   permanent end the loop early.
//! - **TTL cache**: read-through memo of remote queries; a zero TTL disables it.
//! - **Content hash**: canonical JSON + SHA-256, to skip rewriting unchanged
//!   output and to compare documents regardless of key order.
//!
//! # Invariants
//!
//! - A disabled cache never returns a value, so callers stay correct with it off
//! - Hashes depend only on content, never on map key order

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::warn;

// ============================================================================
// Bounded retry
// ============================================================================

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRetry {
    /// Total attempts, including the first one. Zero is treated as one.
    pub attempts: u32,

    /// Pause between attempts.
    pub delay: Duration,
}

impl FixedRetry {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for FixedRetry {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds, `policy.attempts` is exhausted, or it fails
/// with an error for which `retryable` is false.
///
/// `op` receives the 1-based attempt number. The final error is returned as is.
pub async fn retry_fixed<T, E, R, F, Fut>(
    policy: FixedRetry,
    retryable: R,
    mut op: F,
) -> Result<T, E>
where
    R: Fn(&E) -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) if !retryable(&err) => {
                warn!(attempt, attempts, error = %err, "permanent failure, not retrying");
                return Err(err);
            }
            Err(err) => {
                warn!(
                    attempt,
                    attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// TTL cache
// ============================================================================

/// In-memory map whose entries expire after a fixed TTL.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create a cache; `Duration::ZERO` disables it.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Fresh value for `key`, if any. Expired entries are evicted.
    pub fn get(&self, key: &K) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, (Instant::now(), value));
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Content hashing
// ============================================================================

/// A content hash for deterministic comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute a hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        Self::from_bytes(canonical_json(json).as_bytes())
    }

    /// Compute a hash from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(result)))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compact JSON with every object's keys sorted, at any depth.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut sorted = value.clone();
    sorted.sort_all_objects();
    sorted.to_string()
}

/// Default number of sync attempts.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;
