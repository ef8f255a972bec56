//! Architectural Enforcement
//!
//! Source scanners behind the workspace's architectural tests:
//! - No blocking I/O inside async functions
//! - No `sleep()` in production code (deadlines use `sleep_until` or
//!   `tokio::time::interval`)
//!
//! The scan is line based. Everything from the first `#[cfg(test)]` (or
//! `#[cfg(all(test, ..))]`) in a file onward is treated as test code.

use std::fmt;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What rule was broken
    pub rule: &'static str,
    /// The offending source, trimmed
    pub source: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.source
        )
    }
}

/// Kind of function a line sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enclosing {
    /// `async fn`
    Async,
    /// Plain `fn`
    Sync,
    /// Module level, or unknown
    None,
}

/// Workspace root (two levels above this crate)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// All `.rs` files under the production directories
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        let dir = root.join(dir);
        if !dir.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files
}

fn starts_test_section(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("#[cfg(test)]") || line.starts_with("#[cfg(all(test")
}

/// Lines before the first `#[cfg(test)]`
#[must_use]
pub fn production_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .take_while(|line| !starts_test_section(line))
        .collect()
}

/// Code part of a line, without trailing `//` comments or doc comments
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

fn declares_fn(line: &str) -> bool {
    let code = code_part(line).trim_start();
    code.starts_with("fn ")
        || code.contains(" fn ")
        || code.starts_with("async fn ")
}

/// Kind of the nearest function declared above `idx`
#[must_use]
pub fn enclosing_fn(lines: &[&str], idx: usize) -> Enclosing {
    for line in lines[..=idx.min(lines.len().saturating_sub(1))].iter().rev() {
        if declares_fn(line) {
            return if code_part(line).contains("async fn ") {
                Enclosing::Async
            } else {
                Enclosing::Sync
            };
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("mod ") || trimmed.starts_with("impl") {
            return Enclosing::None;
        }
    }
    Enclosing::None
}

/// Scan every production file with `check`
///
/// `check` sees the file's production lines and the index of the current
/// line, and names the broken rule if any.
pub fn scan<F>(check: F) -> Vec<Violation>
where
    F: Fn(&[&str], usize) -> Option<&'static str>,
{
    let mut violations = Vec::new();
    for path in production_files() {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let lines = production_lines(&content);
        for idx in 0..lines.len() {
            if let Some(rule) = check(&lines, idx) {
                violations.push(Violation {
                    path: path.clone(),
                    line: idx + 1,
                    rule,
                    source: lines[idx].trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Blocking I/O rule for one line
#[must_use]
pub fn blocking_io(lines: &[&str], idx: usize) -> Option<&'static str> {
    let code = code_part(lines[idx]);
    let rule = if code.contains("std::fs::") || code.contains("use std::fs") {
        "Blocking file I/O"
    } else if code.contains("std::net::") || code.contains("use std::net") {
        "Blocking network I/O"
    } else if code.contains("std::process::Command") {
        "Blocking process I/O"
    } else if code.contains("std::io::stdin()") || code.contains("std::io::stdout()") {
        "Blocking stdin/stdout"
    } else if code.contains("std::thread::sleep") {
        "Blocking sleep"
    } else {
        return None;
    };
    (enclosing_fn(lines, idx) == Enclosing::Async).then_some(rule)
}

/// Sleep rule for one line
#[must_use]
pub fn sleep_call(lines: &[&str], idx: usize) -> Option<&'static str> {
    let code = code_part(lines[idx]);
    (code.contains("::sleep(") || code.contains(" sleep(") || code.contains("(sleep("))
        .then_some("Sleep in production code")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_fn_detection() {
        let code = [
            "pub async fn load(path: &Path) -> Result<String> {",
            "    let contents = std::fs::read_to_string(path)?;",
            "}",
        ];
        assert_eq!(enclosing_fn(&code, 1), Enclosing::Async);
        assert_eq!(blocking_io(&code, 1), Some("Blocking file I/O"));
    }

    #[test]
    fn test_sync_fn_is_allowed() {
        let code = [
            "pub fn load_config_from_path(path: Option<PathBuf>) -> Result<Config> {",
            "    let text = std::fs::read_to_string(path)?;",
            "}",
        ];
        assert_eq!(enclosing_fn(&code, 1), Enclosing::Sync);
        assert_eq!(blocking_io(&code, 1), None);
    }

    #[test]
    fn test_test_section_skipped() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { sleep(x); }\n}\n";
        assert_eq!(production_lines(content), vec!["fn a() {}"]);

        let content = "fn a() {}\n#[cfg(all(test, unix))]\nmod tests {}\n";
        assert_eq!(production_lines(content).len(), 1);
    }

    #[test]
    fn test_sleep_until_allowed() {
        let code = ["    tokio::time::sleep_until(deadline).await;"];
        assert_eq!(sleep_call(&code, 0), None);

        let code = ["    tokio::time::sleep(Duration::from_millis(5)).await;"];
        assert!(sleep_call(&code, 0).is_some());
    }

    #[test]
    fn test_comments_ignored() {
        let code = ["async fn f() {", "    // std::fs::read is blocking", "}"];
        assert_eq!(blocking_io(&code, 1), None);
    }
}
