//! Integration Test: Sleep Prohibition
//!
//! **Policy**: production code waits on I/O, deadlines or cancellation, never
//! on a fixed sleep.
//! **Acceptable**: `tokio::time::sleep_until(deadline)`,
//! `tokio::time::interval()`, and anything in test code.

use architectural_enforcement::{scan, sleep_call};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(sleep_call);
    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - tokio::time::sleep_until(deadline) inside select!");
        eprintln!("  - tokio::time::interval() for periodic work");
        eprintln!("  - CancellationToken::cancelled() to wait for shutdown");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
