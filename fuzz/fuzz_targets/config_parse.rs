#![no_main]

use libfuzzer_sys::fuzz_target;
use publisher_config::Config;

fuzz_target!(|data: &str| {
    if let Ok(config) = toml::from_str::<Config>(data) {
        let _ = config.validate();
        let _ = config.validate_purge();
        let _ = config.lock_config();
    }
});
