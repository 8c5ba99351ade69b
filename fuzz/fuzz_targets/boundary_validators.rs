#![no_main]

use custom_tabs_core::extras::{Candidate, Extras, candidate_urls};
use custom_tabs_core::url_policy::{Origin, parse_web_url, urls_match};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (left, right) = text.split_once('\n').unwrap_or((text, text));

    if let Some(url) = parse_web_url(left) {
        assert!(matches!(url.scheme(), "http" | "https"));
        assert!(urls_match(url.as_str(), url.as_str(), false));
    }

    assert_eq!(urls_match(left, right, true), urls_match(right, left, true));
    assert_eq!(urls_match(left, right, false), urls_match(right, left, false));
    if urls_match(left, right, false) {
        assert!(urls_match(left, right, true));
    }

    if let Some(origin) = Origin::parse(left) {
        assert_eq!(origin.is_https(), origin.scheme() == "https");
    }

    if let Ok(candidates) = serde_json::from_str::<Vec<Candidate>>(text) {
        let urls = candidate_urls(&candidates);
        assert!(urls.len() <= candidates.len());
        for url in urls {
            assert!(matches!(url.scheme(), "http" | "https"));
        }
    }

    if let Ok(extras) = serde_json::from_str::<Extras>(text) {
        let encoded = serde_json::to_string(&extras).unwrap();
        let decoded: Extras = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, extras);
    }
});
