//! Fuzz target for cluster settings parsing.
//!
//! This tests that `ClusterSetting::parse_list` never panics on arbitrary
//! input and that accepted settings are well formed.

#![no_main]

use libfuzzer_sys::fuzz_target;
use repdyno::cluster::ClusterSetting;

fuzz_target!(|data: &str| {
    // Should never panic
    if let Ok(settings) = ClusterSetting::parse_list(data) {
        for setting in &settings {
            assert!(!setting.section.is_empty());
            assert!(!setting.key.is_empty());
            assert!(!setting.section.contains('.'));
        }

        let merged = ClusterSetting::merge(&settings, &settings);
        assert!(merged.len() <= settings.len());
    }
});
