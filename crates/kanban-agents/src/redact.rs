use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "<redacted>";

/// Compiled secret patterns. Each keeps its prefix in group 1 so only the
/// secret value is replaced.
static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Authorization: Bearer <token>, also bare "Bearer <token>"
        r"(?i)(\bbearer\s+)[A-Za-z0-9_.~+/=\-]+",
        // OPENAI_API_KEY=..., ANTHROPIC_API_KEY: ..., GITHUB_TOKEN="..."
        r#"(?i)(\b[A-Z0-9_]*(?:API_KEY|TOKEN|SECRET|PASSWORD)["']?\s*[=:]\s*["']?)[^\s"',;]+"#,
        // GitHub fine-grained and classic tokens
        r"()\bgithub_pat_[A-Za-z0-9_]+",
        r"()\bgh[pousr]_[A-Za-z0-9]+",
        // OpenAI / Anthropic style keys
        r"()\bsk-[A-Za-z0-9_\-]{8,}",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("secret pattern compiles"))
    .collect()
});

/// Replaces known secret values with [`REDACTED`], leaving surrounding text
/// intact.
pub fn redact_secrets(input: &str) -> String {
    let mut output = input.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        output = pattern
            .replace_all(&output, format!("${{1}}{REDACTED}").as_str())
            .into_owned();
    }
    output
}

/// Redacts every string inside a JSON value.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(redact_secrets(text)),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), redact_json(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}
