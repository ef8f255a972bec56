//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async code in the relay crates must not block the runtime.
//! **Required**: `tokio::fs`, `tokio::process`, `tokio::io` inside `async fn`.
//!
//! Blocking calls are acceptable in plain functions that run before the
//! runtime does real work (config loading, argument parsing) and in tests.

use architectural_enforcement::{blocking_io, production_files, scan};

#[test]
fn test_no_blocking_io_in_async_code() {
    assert!(
        !production_files().is_empty(),
        "no production sources found, check PRODUCTION_DIRS"
    );

    let violations = scan(blocking_io);
    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O inside async functions:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::remove_dir_all().await");
        eprintln!("  - tokio::process::Command");
        eprintln!("  - tokio::io::stdin() / tokio::io::stdout()");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}
