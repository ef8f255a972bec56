//! Prepared invocations
//!
//! The fully constructed command line handed to the relay by the request
//! preparation layer. The relay executes it verbatim and never inspects the
//! arguments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An external tool invocation, ready to run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedInvocation {
    /// Executable name or path
    pub program: String,
    /// Argument list
    #[serde(default)]
    pub args: Vec<String>,
    /// Prompt delivered on stdin, for tools that read it there
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Extra variables layered over the sanitized environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl PreparedInvocation {
    /// Invocation of `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Deliver `prompt` on stdin
    #[must_use]
    pub fn with_stdin(mut self, prompt: impl Into<String>) -> Self {
        self.stdin = Some(prompt.into());
        self
    }

    /// Set an environment variable for the child
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
