#![no_main]

use libfuzzer_sys::fuzz_target;
use scm_config::{MasterDocument, parse_master_document};

fuzz_target!(|data: &[u8]| {
    let Ok(yaml) = std::str::from_utf8(data) else {
        return;
    };

    // Parsing must never panic, and an accepted document must survive a
    // serialize/parse round trip.
    match parse_master_document(yaml) {
        Ok(MasterDocument::Inline(config)) => {
            let yaml = serde_yaml::to_string(&config).expect("serialize");
            if let Ok(MasterDocument::Inline(back)) = parse_master_document(&yaml) {
                assert_eq!(config.sources.len(), back.sources.len());
            }
        }
        Ok(MasterDocument::Declared(master)) => {
            let _ = serde_yaml::to_string(&master);
        }
        Err(_) => {}
    }
});
