//! Origin verification: does app package X control web origin Y?
//!
//! The proof itself (Digital Asset Links, platform signature checks) comes
//! from an external [`AssetLinkVerifier`]. This module wraps it with the
//! policy that matters to the rest of the core:
//!
//! - Only `https` origins can ever be verified. Anything else fails before
//!   the collaborator or the cache is consulted.
//! - Positive results are cached for `freshness_secs` and then revalidated.
//! - [`OriginVerifier::is_verified`] is a synchronous cache-only query for
//!   paths that must not wait; unknown means `false`.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::VerificationConfig;
use crate::url_policy::Origin;

/// The trust relation being asserted between an app and an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// The app may act as this origin (postMessage source, referrer).
    UseAsOrigin,
    /// The app handles all URLs of this origin.
    HandleAllUrls,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UseAsOrigin => write!(f, "use_as_origin"),
            Self::HandleAllUrls => write!(f, "handle_all_urls"),
        }
    }
}

/// External proof that a package controls an origin.
#[async_trait]
pub trait AssetLinkVerifier: Send + Sync + fmt::Debug {
    async fn verify(&self, package_name: &str, origin: &Origin, relation: Relation) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    package_name: String,
    origin: Origin,
    relation: Relation,
}

impl CacheKey {
    fn new(package_name: &str, origin: &Origin, relation: Relation) -> Self {
        Self {
            package_name: package_name.to_string(),
            origin: origin.clone(),
            relation,
        }
    }
}

/// Cached, https-only gate over an [`AssetLinkVerifier`].
#[derive(Debug)]
pub struct OriginVerifier {
    verifier: Arc<dyn AssetLinkVerifier>,
    clock: Arc<dyn Clock>,
    freshness_ms: u64,
    // key -> time the origin was verified
    cache: Mutex<LruCache<CacheKey, u64>>,
}

impl OriginVerifier {
    #[must_use]
    pub fn new(
        verifier: Arc<dyn AssetLinkVerifier>,
        clock: Arc<dyn Clock>,
        config: &VerificationConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            verifier,
            clock,
            freshness_ms: config.freshness_secs.saturating_mul(1000),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Verify `origin` for `package_name`, consulting the collaborator when
    /// no fresh positive result is cached.
    pub async fn verify(&self, package_name: &str, origin: &Origin, relation: Relation) -> bool {
        if !origin.is_https() {
            debug!(package = package_name, %origin, "Rejecting non-https origin");
            return false;
        }
        if self.is_verified(package_name, origin, relation) {
            return true;
        }

        let verified = self.verifier.verify(package_name, origin, relation).await;
        if verified {
            self.store(package_name, origin, relation);
        }
        info!(
            package = package_name,
            %origin,
            %relation,
            verified,
            "Origin verification completed"
        );
        verified
    }

    /// Cache-only check. Never waits; fails closed.
    #[must_use]
    pub fn is_verified(&self, package_name: &str, origin: &Origin, relation: Relation) -> bool {
        if !origin.is_https() {
            return false;
        }
        let now = self.clock.now_ms();
        let key = CacheKey::new(package_name, origin, relation);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(&key) {
            Some(&verified_at) if now.saturating_sub(verified_at) < self.freshness_ms => true,
            Some(_) => {
                cache.pop(&key);
                false
            }
            None => false,
        }
    }

    /// Record a trusted verification without asking the collaborator.
    ///
    /// For first-party flows that already hold proof. Non-https origins are
    /// still refused by every query.
    pub fn add_verified_origin(&self, package_name: &str, origin: &Origin, relation: Relation) {
        self.store(package_name, origin, relation);
    }

    pub fn invalidate(&self, package_name: &str, origin: &Origin, relation: Relation) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.pop(&CacheKey::new(package_name, origin, relation));
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn store(&self, package_name: &str, origin: &Origin, relation: Relation) {
        let now = self.clock.now_ms();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(CacheKey::new(package_name, origin, relation), now);
    }
}
