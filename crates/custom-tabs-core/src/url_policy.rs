//! URL and origin policy shared by every boundary check.
//!
//! Only `http`/`https` URLs may be speculated, preconnected or fetched in
//! parallel. Only `https` origins may ever be trusted for a relation.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Scheme used for app-identifying referrers (`android-app://<package>`).
pub const APP_REFERRER_SCHEME: &str = "android-app";

/// Parse `raw` and accept it only if it is an `http`/`https` URL.
pub fn parse_web_url(raw: &str) -> Option<Url> {
    if raw.trim().is_empty() {
        return None;
    }
    let url = Url::parse(raw).ok()?;
    is_http_or_https(&url).then_some(url)
}

#[must_use]
pub fn is_http_or_https(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Copy of `url` without its fragment.
#[must_use]
pub fn without_fragment(url: &Url) -> Url {
    let mut stripped = url.clone();
    stripped.set_fragment(None);
    stripped
}

/// Compare two URLs, optionally ignoring their fragments.
///
/// Unparseable inputs fall back to exact string comparison.
#[must_use]
pub fn urls_match(a: &str, b: &str, ignore_fragments: bool) -> bool {
    if a == b {
        return true;
    }
    if !ignore_fragments {
        return false;
    }
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => without_fragment(&a) == without_fragment(&b),
        _ => false,
    }
}

/// The referrer an app gets by default: `android-app://<package>`.
#[must_use]
pub fn app_referrer(package_name: &str) -> String {
    format!("{APP_REFERRER_SCHEME}://{package_name}")
}

/// A web origin: scheme, host and effective port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    /// Parse an origin from any URL string. Opaque origins (custom schemes,
    /// `data:` and friends) are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::from_url(&Url::parse(raw).ok()?)
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        match url.origin() {
            url::Origin::Tuple(scheme, host, port) => Some(Self {
                scheme,
                host: host.to_string(),
                port,
            }),
            url::Origin::Opaque(_) => None,
        }
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Only https origins are eligible for any trust relation.
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    fn default_port(&self) -> Option<u16> {
        match self.scheme.as_str() {
            "http" | "ws" => Some(80),
            "https" | "wss" => Some(443),
            "ftp" => Some(21),
            _ => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default_port() == Some(self.port) {
            write!(f, "{}://{}", self.scheme, self.host)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

impl TryFrom<String> for Origin {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("not a tuple origin: {value}"))
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.to_string()
    }
}
