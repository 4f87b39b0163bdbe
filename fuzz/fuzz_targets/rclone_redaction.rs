#![no_main]

use libfuzzer_sys::fuzz_target;
use scm::sources::redact_config;

fuzz_target!(|data: &[u8]| {
    let Ok(config) = std::str::from_utf8(data) else {
        return;
    };

    let redacted = redact_config(config);

    // Whatever followed a credential assignment is gone.
    for line in redacted.lines() {
        for key in ["access_key_id", "secret_access_key"] {
            if let Some(rest) = line.strip_prefix(key) {
                let rest = rest.trim_start_matches(' ');
                if let Some(value) = rest.strip_prefix("= ") {
                    assert_eq!(value, "•••");
                }
            }
        }
    }
});
