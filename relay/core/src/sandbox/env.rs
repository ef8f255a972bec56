//! Subprocess environment sanitization
//!
//! The child gets a fully explicit environment (`env_clear()` followed by
//! these variables). Host path and identity hints are removed. `HOME` stays:
//! CLI tools resolve their stored credentials through it.

use std::collections::BTreeMap;

/// Variables removed from the child environment
const STRIPPED: &[&str] = &["PWD", "OLDPWD", "USER", "LOGNAME"];

/// Quiet-mode settings forced on the child
const QUIET_OVERRIDES: &[(&str, &str)] = &[
    ("NO_COLOR", "1"),
    ("DEBUG", "false"),
    ("DEBUG_MODE", "false"),
    ("VERBOSE", "false"),
];

/// A complete, sanitized child environment
pub type SanitizedEnv = BTreeMap<String, String>;

/// Rules for deriving a child environment from the host's
#[derive(Clone, Debug)]
pub struct EnvPolicy {
    strip: Vec<String>,
    /// Variables kept even if another rule would strip them
    preserve: Vec<String>,
    overrides: Vec<(String, String)>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            strip: STRIPPED.iter().map(|s| (*s).to_string()).collect(),
            preserve: vec!["HOME".to_string()],
            overrides: QUIET_OVERRIDES
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }
}

impl EnvPolicy {
    /// Keep an additional variable regardless of other rules
    #[must_use]
    pub fn preserve(mut self, name: impl Into<String>) -> Self {
        self.preserve.push(name.into());
        self
    }

    /// Strip an additional variable
    #[must_use]
    pub fn strip(mut self, name: impl Into<String>) -> Self {
        self.strip.push(name.into());
        self
    }

    /// Whether `name` is removed under this policy
    #[must_use]
    pub fn is_stripped(&self, name: &str) -> bool {
        if self.preserve.iter().any(|p| p == name) {
            return false;
        }
        self.strip.iter().any(|s| s == name) || (name.starts_with("CLAUDE_") && name.contains("DIR"))
    }

    /// Sanitize an arbitrary set of variables
    pub fn sanitize<I, K, V>(&self, vars: I) -> SanitizedEnv
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env: SanitizedEnv = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| !self.is_stripped(k))
            .collect();
        for (key, value) in &self.overrides {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Sanitize the current process environment without modifying it
    #[must_use]
    pub fn from_host(&self) -> SanitizedEnv {
        self.sanitize(std::env::vars_os().filter_map(|(k, v)| {
            Some((k.into_string().ok()?, v.into_string().ok()?))
        }))
    }
}
