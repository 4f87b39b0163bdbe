#![no_main]

use libfuzzer_sys::fuzz_target;
use scm_auth::{sign_body, verify_webhook_signature};

fuzz_target!(|data: (&[u8], &[u8], &[u8])| {
    let (secret, body, forged) = data;
    if secret.is_empty() {
        return;
    }

    // A self-signed body always verifies.
    let signature = sign_body(secret, body).expect("sign");
    assert!(verify_webhook_signature(Some(&signature), secret, body).is_ok());

    // Arbitrary header values never panic; a forged one only passes if it
    // happens to be the exact signature.
    if let Ok(header) = std::str::from_utf8(forged) {
        if header != signature {
            let _ = verify_webhook_signature(Some(header), secret, body);
        }
    }
});
