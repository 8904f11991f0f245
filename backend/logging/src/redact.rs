//! Log redaction: scrubs credentials from strings and JSON payloads before logging.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static API_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(sk-[a-zA-Z0-9]{32,})|(Bearer\s+[a-zA-Z0-9\-\._~+/]+=*)").unwrap()
});
static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(api[_-]?key|token|secret|password)(\s*[:=]\s*)[^\s,;&]+").unwrap()
});
static SENSITIVE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(api[_-]?key|token|secret|password|authorization)").unwrap());

const REDACTED: &str = "[REDACTED]";

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    let redacted = API_KEY_RE.replace_all(input, "[REDACTED_TOKEN]");
    ASSIGNMENT_RE
        .replace_all(&redacted, format!("${{1}}${{2}}{REDACTED}").as_str())
        .into_owned()
}

/// Redacts every string leaf of a JSON value; values under credential-like keys are replaced whole.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_sensitive_data(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if SENSITIVE_KEY_RE.is_match(k) && !v.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redaction() {
        let raw = "calling upstream with Bearer eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9 and api_key=abc123";
        let clean = redact_sensitive_data(raw);
        assert!(!clean.contains("eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9"));
        assert!(!clean.contains("abc123"));
        assert!(clean.contains("api_key=[REDACTED]"));
    }

    #[test]
    fn test_value_redaction() {
        let payload = json!({
            "message": "probe failed: token: t0ps3cret",
            "config": {"apiKey": "k-1", "model": "small"},
            "count": 3
        });
        let clean = redact_value(&payload);
        assert_eq!(clean["config"]["apiKey"], "[REDACTED]");
        assert_eq!(clean["config"]["model"], "small");
        assert_eq!(clean["count"], 3);
        assert!(!clean["message"].as_str().unwrap().contains("t0ps3cret"));
    }
}
