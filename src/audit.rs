//! Audit event emission and log redaction.
//!
//! One structured event per operation, counts only. Free text passes
//! through `redact` before it can reach a log line; no component logs raw
//! secret values.

use std::sync::OnceLock;

fn bearer_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)(authorization:\s*bearer\s+|bearer\s+)[A-Za-z0-9._~+/=-]+")
            .unwrap()
    })
}

fn api_key_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(admin_api_key|api_key|token)=[^\s&]+").unwrap()
    })
}

/// Mask credential material embedded in free text. Applied to every
/// message that originated outside this process (HTTP error bodies,
/// transport errors) before logging or display.
pub fn redact(text: &str) -> String {
    let masked = bearer_re().replace_all(text, "${1}***");
    api_key_re().replace_all(&masked, "${1}=***").into_owned()
}

/// Emit one audit event for a completed operation. `counts` carry only
/// aggregate numbers (keys encrypted, values injected), never names or
/// values; `note` is redacted free text.
pub fn emit(op: &str, counts: &[(&str, i64)], note: Option<&str>) {
    let mut fields = serde_json::Map::new();
    for (name, value) in counts {
        fields.insert((*name).to_string(), serde_json::Value::from(*value));
    }
    if let Some(note) = note {
        fields.insert("note".to_string(), serde_json::Value::from(redact(note)));
    }
    let detail = serde_json::Value::Object(fields);
    tracing::info!(target: "si::audit", op, %detail, "audit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_tokens() {
        let out = redact("Authorization: Bearer sk-live-abc123.def");
        assert!(!out.contains("sk-live-abc123"), "{out}");
        assert!(out.contains("***"));
    }

    #[test]
    fn redacts_bare_bearer() {
        let out = redact("request failed: bearer tok_4242 rejected");
        assert!(!out.contains("tok_4242"), "{out}");
    }

    #[test]
    fn redacts_api_key_params() {
        let out = redact("GET /v1/x?api_key=secret1&admin_api_key=secret2 failed");
        assert!(!out.contains("secret1"), "{out}");
        assert!(!out.contains("secret2"), "{out}");
        assert!(out.contains("api_key=***"));
    }

    #[test]
    fn leaves_ordinary_text_alone() {
        let text = "connection refused (os error 111)";
        assert_eq!(redact(text), text);
    }

    #[test]
    fn emit_does_not_panic() {
        emit(
            "encrypt",
            &[("encrypted", 3), ("skipped", 1)],
            Some("Bearer abc"),
        );
    }
}
