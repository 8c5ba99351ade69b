//! Property-based tests for URL policy and structured extras.
//!
//! Verifies:
//! - Arbitrary strings never panic the boundary validators
//! - Only http/https URLs pass `parse_web_url`
//! - Fragment-insensitive matching ignores exactly the fragment
//! - Candidate decoding keeps only well-formed web URLs, in order
//! - Only https origins are https

use proptest::prelude::*;

use custom_tabs_core::extras::{Candidate, ExtraValue, Extras, KEY_URL, candidate_urls};
use custom_tabs_core::url_policy::{Origin, parse_web_url, urls_match};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_scheme() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["http", "https", "ftp", "android-app", "javascript", "data", "file"])
}

fn arb_host() -> impl Strategy<Value = String> {
    "[a-z]{1,10}(\\.[a-z]{2,5}){1,2}"
}

fn arb_path() -> impl Strategy<Value = String> {
    "(/[a-z0-9]{0,8}){0,3}"
}

fn arb_fragment() -> impl Strategy<Value = String> {
    "[a-z0-9]{0,8}"
}

fn arb_candidate() -> impl Strategy<Value = Candidate> {
    prop_oneof![
        (arb_scheme(), arb_host()).prop_map(|(s, h)| Candidate::url(format!("{s}://{h}/"))),
        any::<String>().prop_map(|s| Candidate(ExtraValue::Str(s))),
        any::<i64>().prop_map(|n| Candidate(ExtraValue::Int(n))),
        any::<String>().prop_map(|s| Candidate(ExtraValue::Bundle(
            Extras::new().with(KEY_URL, ExtraValue::Str(s))
        ))),
        Just(Candidate(ExtraValue::Bundle(Extras::new()))),
    ]
}

// ────────────────────────────────────────────────────────────────────
// Properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn prop_parse_web_url_accepts_only_web_schemes(raw in any::<String>()) {
        if let Some(url) = parse_web_url(&raw) {
            prop_assert!(matches!(url.scheme(), "http" | "https"));
        }
    }

    #[test]
    fn prop_scheme_decides_acceptance(scheme in arb_scheme(), host in arb_host(), path in arb_path()) {
        let raw = format!("{scheme}://{host}{path}");
        let accepted = parse_web_url(&raw).is_some();
        prop_assert_eq!(accepted, scheme == "http" || scheme == "https");
    }

    #[test]
    fn prop_fragments_only_matter_when_not_ignored(
        host in arb_host(),
        path in arb_path(),
        a in arb_fragment(),
        b in arb_fragment(),
    ) {
        let left = format!("https://{host}{path}#{a}");
        let right = format!("https://{host}{path}#{b}");
        prop_assert!(urls_match(&left, &right, true));
        prop_assert_eq!(urls_match(&left, &right, false), a == b);
        prop_assert!(urls_match(&left, &left, false));
    }

    #[test]
    fn prop_different_paths_never_match(host in arb_host(), a in "[a-z]{1,6}", b in "[a-z]{1,6}") {
        prop_assume!(a != b);
        let left = format!("https://{host}/{a}");
        let right = format!("https://{host}/{b}");
        prop_assert!(!urls_match(&left, &right, true));
    }

    #[test]
    fn prop_candidates_decode_to_web_urls(candidates in prop::collection::vec(arb_candidate(), 0..16)) {
        let urls = candidate_urls(&candidates);
        prop_assert!(urls.len() <= candidates.len());
        for url in &urls {
            prop_assert!(matches!(url.scheme(), "http" | "https"));
        }
        let expected: Vec<_> = candidates.iter().filter_map(Candidate::web_url).collect();
        prop_assert_eq!(urls, expected);
    }

    #[test]
    fn prop_only_https_origins_are_https(scheme in arb_scheme(), host in arb_host()) {
        if let Some(origin) = Origin::parse(&format!("{scheme}://{host}")) {
            prop_assert_eq!(origin.is_https(), scheme == "https");
        }
    }
}
