#![no_main]

use libfuzzer_sys::fuzz_target;
use scm_retry::{RetryConfig, RetryStrategy, calculate_delay};
use std::time::Duration;

fuzz_target!(|data: (u32, u8, u64, u64)| {
    let (attempt, strategy_byte, base_ms, max_ms) = data;

    let attempt = attempt % 100 + 1;
    let strategy = match strategy_byte % 4 {
        0 => RetryStrategy::Immediate,
        1 => RetryStrategy::Constant,
        2 => RetryStrategy::Linear,
        _ => RetryStrategy::Exponential,
    };
    let base_delay = Duration::from_millis(base_ms % 10_000 + 1);
    let max_delay = Duration::from_millis(max_ms % 300_000 + 100);

    let config = RetryConfig {
        strategy,
        max_attempts: 100,
        base_delay,
        max_delay,
    };

    let delay = calculate_delay(&config, attempt);

    // The cap always holds.
    assert!(delay <= max_delay);

    // Immediate never waits; constant always waits the same.
    if strategy == RetryStrategy::Immediate {
        assert_eq!(delay, Duration::ZERO);
    }
    if strategy == RetryStrategy::Constant {
        assert_eq!(delay, base_delay.min(max_delay));
    }
});
