//! Structured extras passed across the binding.
//!
//! Clients hand over loosely shaped key/value bundles. They are decoded into
//! [`Extras`] at the boundary and read through typed accessors that return
//! `None` for a missing key or a value of the wrong kind, so malformed input
//! is rejected explicitly instead of failing deep inside a handler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

/// Key of the URL inside a low-confidence candidate bundle.
pub const KEY_URL: &str = "android.support.customtabs.otherurls.URL";
/// Referrer supplied with a `mayLaunchUrl` call.
pub const EXTRA_REFERRER: &str = "android.intent.extra.REFERRER";
/// URL of a parallel request.
pub const PARALLEL_REQUEST_URL_KEY: &str = "android.support.customtabs.PARALLEL_REQUEST_URL";
/// Referrer of a parallel request.
pub const PARALLEL_REQUEST_REFERRER_KEY: &str =
    "android.support.customtabs.PARALLEL_REQUEST_REFERRER";

/// A single extras value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExtraValue {
    Uri(String),
    Str(String),
    Int(i64),
    Bool(bool),
    Bundle(Extras),
}

/// A key/value bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extras {
    entries: BTreeMap<String, ExtraValue>,
}

impl Extras {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: ExtraValue) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ExtraValue) {
        self.entries.insert(key.into(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ExtraValue> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The raw URI string under `key`, if the value is a URI.
    #[must_use]
    pub fn uri(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(ExtraValue::Uri(raw)) => Some(raw),
            _ => None,
        }
    }
}

/// One entry of a low-confidence candidate list.
///
/// Clients are expected to send bundles carrying a URI under [`KEY_URL`];
/// anything else is accepted on the wire and skipped during decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(pub ExtraValue);

impl Candidate {
    /// Convenience constructor for a well-formed candidate.
    #[must_use]
    pub fn url(raw: impl Into<String>) -> Self {
        Self(ExtraValue::Bundle(
            Extras::new().with(KEY_URL, ExtraValue::Uri(raw.into())),
        ))
    }

    /// The candidate URL, if this entry is a bundle holding a web URL.
    #[must_use]
    pub fn web_url(&self) -> Option<Url> {
        match &self.0 {
            ExtraValue::Bundle(bundle) => {
                crate::url_policy::parse_web_url(bundle.uri(KEY_URL)?)
            }
            _ => None,
        }
    }
}

/// Decode the usable URLs from a candidate list, skipping malformed entries.
#[must_use]
pub fn candidate_urls(candidates: &[Candidate]) -> Vec<Url> {
    let urls: Vec<Url> = candidates.iter().filter_map(Candidate::web_url).collect();
    if urls.len() < candidates.len() {
        tracing::debug!(
            skipped = candidates.len() - urls.len(),
            "Skipped malformed low-confidence candidates"
        );
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_reject_wrong_kinds() {
        let extras = Extras::new()
            .with("u", ExtraValue::Uri("https://a.test/".to_string()))
            .with("s", ExtraValue::Str("https://a.test/".to_string()))
            .with("b", ExtraValue::Bool(true));
        assert_eq!(extras.uri("u"), Some("https://a.test/"));
        assert_eq!(extras.uri("s"), None);
        assert_eq!(extras.uri("b"), None);
        assert_eq!(extras.uri("missing"), None);
    }

    #[test]
    fn malformed_candidates_are_skipped() {
        let candidates = vec![
            Candidate::url("https://good.test/1"),
            Candidate(ExtraValue::Str("https://bare-string.test/".to_string())),
            Candidate(ExtraValue::Int(42)),
            Candidate(ExtraValue::Bundle(
                Extras::new().with(KEY_URL, ExtraValue::Str("https://x.test".to_string())),
            )),
            Candidate(ExtraValue::Bundle(Extras::new())),
            Candidate::url("android-app://com.evil"),
            Candidate::url("http://good.test/2"),
        ];
        let urls = candidate_urls(&candidates);
        let urls: Vec<&str> = urls.iter().map(Url::as_str).collect();
        assert_eq!(urls, vec!["https://good.test/1", "http://good.test/2"]);
    }

    #[test]
    fn extras_json_shape() {
        let extras = Extras::new().with(KEY_URL, ExtraValue::Uri("https://a.test/".to_string()));
        let json = serde_json::to_value(&extras).unwrap();
        assert_eq!(json[KEY_URL]["type"], "uri");
        let back: Extras = serde_json::from_value(json).unwrap();
        assert_eq!(back, extras);
    }
}
