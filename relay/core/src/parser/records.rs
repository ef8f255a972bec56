//! Per-format record decoding
//!
//! Turns one complete provider record (a line) into zero or more event kinds.
//! The buffering that produces complete records lives in the state machine;
//! everything here is stateless.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::ProviderEventKind;

/// Output format spoken by the external tool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Newline-delimited JSON records (`--output-format stream-json`)
    #[default]
    StreamJson,
    /// Raw assistant text on stdout
    PlainText,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "stream-json" | "json" | "ndjson" => Ok(Self::StreamJson),
            "plain" | "plain-text" | "text" => Ok(Self::PlainText),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Result of decoding one record
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// A well-formed record (possibly producing no events)
    Valid(Vec<ProviderEventKind>),
    /// The record could not be decoded
    Malformed(String),
}

/// Decode one stream-json record
pub(crate) fn decode_json_record(line: &str) -> Decoded {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Decoded::Malformed(e.to_string()),
    };

    let Some(record_type) = value.get("type").and_then(Value::as_str) else {
        return Decoded::Malformed("record has no `type` field".to_string());
    };

    let kinds = match record_type {
        "system" => session_started(&value).into_iter().collect(),
        "assistant" => assistant_blocks(&value),
        "result" => vec![result_record(&value)],
        "error" => vec![ProviderEventKind::ProviderError {
            message: error_message(&value).unwrap_or_else(|| "provider error".to_string()),
        }],
        // user echoes, stream deltas, rate-limit notices and the like
        _ => Vec::new(),
    };

    Decoded::Valid(kinds)
}

fn session_started(value: &Value) -> Option<ProviderEventKind> {
    if value.get("subtype").and_then(Value::as_str) != Some("init") {
        return None;
    }
    let session_id = value
        .get("session_id")
        .or_else(|| value.get("data").and_then(|d| d.get("session_id")))
        .and_then(Value::as_str)?;
    Some(ProviderEventKind::SessionStarted {
        session_id: session_id.to_string(),
    })
}

fn assistant_blocks(value: &Value) -> Vec<ProviderEventKind> {
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| value.get("content"));

    match content {
        Some(Value::String(text)) => vec![ProviderEventKind::PartialAssistantText {
            text: text.clone(),
        }],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block.get("text").and_then(Value::as_str).map(|text| {
                    ProviderEventKind::PartialAssistantText {
                        text: text.to_string(),
                    }
                }),
                Some("tool_use") => Some(ProviderEventKind::ToolInvocation {
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn result_record(value: &Value) -> ProviderEventKind {
    let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || subtype.starts_with("error");

    if is_error {
        let message = error_message(value)
            .or_else(|| {
                value
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("provider reported {subtype}"));
        return ProviderEventKind::ProviderError { message };
    }

    ProviderEventKind::FinalAssistantText {
        text: value
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn error_message(value: &Value) -> Option<String> {
    let field = value
        .get("error_message")
        .or_else(|| value.get("error"))
        .or_else(|| value.get("message"))?;
    match field {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Whether a plain-text line is authentication or diagnostic chatter that
/// some CLIs print before the answer starts
pub(crate) fn is_preamble_noise(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }
    if matches!(trimmed, "{" | "}" | ".") {
        return true;
    }
    if is_device_user_code(trimmed) {
        return true;
    }

    // device-flow JSON body, one key per line
    const JSON_KEYS: &[&str] = &[
        "\"device_code\"",
        "\"user_code\"",
        "\"verification_uri",
        "\"expires_in\"",
    ];
    if JSON_KEYS.iter().any(|key| trimmed.starts_with(key)) {
        return true;
    }

    let lower = trimmed.to_lowercase();
    const MARKERS: &[&str] = &[
        "[debug]",
        "[memorydiscovery]",
        "flushing log events",
        "cli: delegating",
        "device authorization result:",
        "device_code:",
        "user_code:",
        "expires_in:",
        "waiting for authorization",
        "polling for token",
        "enter code:",
        "authentication successful",
        "access token obtained",
        "authenticating with",
        "https://chat.qwen.ai/authorize",
    ];
    if MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }

    (lower.contains("credentials") && (lower.starts_with("loaded") || lower.starts_with("loading")))
        || (lower.contains("please visit") && lower.contains("authorize"))
}

/// `XXXXXXXX-XXXX` device codes shown during OAuth device flow
fn is_device_user_code(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 13
        && bytes[8] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_uppercase() || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_init_record() {
        let decoded =
            decode_json_record(r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#);
        assert_eq!(
            decoded,
            Decoded::Valid(vec![ProviderEventKind::SessionStarted {
                session_id: "abc-123".to_string()
            }])
        );

        let nested = decode_json_record(
            r#"{"type":"system","subtype":"init","data":{"session_id":"nested"}}"#,
        );
        assert_eq!(
            nested,
            Decoded::Valid(vec![ProviderEventKind::SessionStarted {
                session_id: "nested".to_string()
            }])
        );
    }

    #[test]
    fn test_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Let me look"},
            {"type":"tool_use","name":"WebSearch","input":{}}
        ]}}"#
            .replace('\n', "");
        assert_eq!(
            decode_json_record(&line),
            Decoded::Valid(vec![
                ProviderEventKind::PartialAssistantText {
                    text: "Let me look".to_string()
                },
                ProviderEventKind::ToolInvocation {
                    name: "WebSearch".to_string()
                },
            ])
        );
    }

    #[test]
    fn test_result_records() {
        assert_eq!(
            decode_json_record(r#"{"type":"result","subtype":"success","result":"Hello"}"#),
            Decoded::Valid(vec![ProviderEventKind::FinalAssistantText {
                text: "Hello".to_string()
            }])
        );
        assert_eq!(
            decode_json_record(
                r#"{"type":"result","subtype":"error_during_execution","is_error":true,"error_message":"boom"}"#
            ),
            Decoded::Valid(vec![ProviderEventKind::ProviderError {
                message: "boom".to_string()
            }])
        );
        assert_eq!(
            decode_json_record(r#"{"type":"result","subtype":"error_max_turns"}"#),
            Decoded::Valid(vec![ProviderEventKind::ProviderError {
                message: "provider reported error_max_turns".to_string()
            }])
        );
    }

    #[test]
    fn test_ignored_and_malformed() {
        assert_eq!(
            decode_json_record(r#"{"type":"user","message":{}}"#),
            Decoded::Valid(vec![])
        );
        assert!(matches!(
            decode_json_record(r#"{"type":"assis"#),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            decode_json_record(r#"{"no_type":true}"#),
            Decoded::Malformed(_)
        ));
    }

    #[test]
    fn test_preamble_noise() {
        assert!(is_preamble_noise("Loaded cached Qwen credentials."));
        assert!(is_preamble_noise("[DEBUG] starting"));
        assert!(is_preamble_noise("  \"device_code\": \"x\","));
        assert!(is_preamble_noise("Y59HWLGM-ABCD"));
        assert!(is_preamble_noise("}"));
        assert!(is_preamble_noise("."));
        assert!(is_preamble_noise("user_code: ABCD-1234"));
        assert!(!is_preamble_noise("...polling"));
        assert!(!is_preamble_noise(".NET 8 ships a faster JIT."));
        assert!(!is_preamble_noise("The user_code field is shown to the user."));
        assert!(!is_preamble_noise("Set verification_uri in the client config."));
        assert!(!is_preamble_noise("Hello there!"));
        assert!(!is_preamble_noise("The credentials you need are in the vault."));
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("stream-json".parse(), Ok(OutputFormat::StreamJson));
        assert_eq!("plain_text".parse(), Ok(OutputFormat::PlainText));
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
