#![no_main]

use custom_tabs_core::config::ThrottleConfig;
use custom_tabs_core::throttle::RequestThrottler;
use libfuzzer_sys::fuzz_target;

const MAX_OPS: usize = 512;

fuzz_target!(|data: &[u8]| {
    let config = ThrottleConfig {
        max_tracked_clients: 4,
        history_len: 3,
        ..ThrottleConfig::default()
    };
    let (min, max) = (config.min_delay_ms, config.max_delay_ms);
    let mut throttler = RequestThrottler::new(config);
    let mut now = 0u64;

    for chunk in data.chunks_exact(3).take(MAX_OPS) {
        let uid = u32::from(chunk[1] % 8);
        let url = format!("https://site.test/{}", chunk[2] % 16);
        match chunk[0] % 6 {
            0 | 1 => {
                throttler.register_request(uid, &url, now);
            }
            2 => {
                throttler.register_success(uid, &url);
            }
            3 => now = now.saturating_add(u64::from(chunk[2]) * 100),
            4 => throttler.ban(uid),
            _ => throttler.reset(uid),
        }

        assert!(throttler.tracked_clients() <= 4);
        if let Some(stats) = throttler.stats(uid) {
            let delay = stats.current_delay_ms;
            assert!(delay == 0 || (min..=max).contains(&delay));
            assert!((0.0..=1.0).contains(&stats.trust_score));
            assert!(stats.history.len() <= 3);
            if stats.banned {
                assert!(!throttler.is_allowed(uid, now));
            }
        }
    }
});
