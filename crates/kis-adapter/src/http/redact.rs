/*
[INPUT]:  Diagnostic text (response bodies, request payloads) and known secrets
[OUTPUT]: Text safe to put into errors and logs
[POS]:    HTTP layer - secret masking for every surfaced diagnostic
[UPDATE]: When new credential-bearing fields appear on the wire
*/

const MASK: &str = "***";

/// JSON keys whose values are always masked (case-insensitive).
const SECRET_KEYS: &[&str] = &[
    "appkey",
    "appsecret",
    "secretkey",
    "authorization",
    "access_token",
    "approval_key",
    "token",
];

fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS
        .iter()
        .any(|secret| secret.eq_ignore_ascii_case(key))
}

/// Mask secret-bearing fields in a JSON value, recursively.
pub fn redact_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if is_secret_key(key) {
                    *item = serde_json::Value::String(MASK.to_string());
                } else {
                    redact_json(item);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_json),
        _ => {}
    }
}

/// Redact a diagnostic string.
///
/// JSON bodies get their secret fields masked; afterwards every literal
/// occurrence of a known secret is replaced.
pub fn redact_text(text: &str, secrets: &[&str]) -> String {
    let mut out = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(mut value) if value.is_object() || value.is_array() => {
            redact_json(&mut value);
            value.to_string()
        }
        _ => text.to_string(),
    };

    for secret in secrets.iter().filter(|s| s.len() >= 4) {
        if out.contains(*secret) {
            out = out.replace(*secret, MASK);
        }
    }

    out
}

/// Cut `value` to at most `max_len` bytes on a char boundary, marking the cut.
pub fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_json_masks_nested_keys() {
        let mut value = serde_json::json!({
            "appkey": "PSabc",
            "nested": {"AppSecret": "xyz", "keep": "visible"},
            "list": [{"authorization": "Bearer t"}],
        });
        redact_json(&mut value);

        assert_eq!(value["appkey"], "***");
        assert_eq!(value["nested"]["AppSecret"], "***");
        assert_eq!(value["nested"]["keep"], "visible");
        assert_eq!(value["list"][0]["authorization"], "***");
    }

    #[test]
    fn test_redact_text_replaces_known_secrets() {
        let text = "invalid appkey PSsecretvalue for Bearer tok3n-abcdef";
        let redacted = redact_text(text, &["PSsecretvalue", "tok3n-abcdef"]);
        assert_eq!(redacted, "invalid appkey *** for Bearer ***");
    }

    #[test]
    fn test_redact_text_json_body() {
        let body = r#"{"error_description":"bad key","appkey":"PSabcdef","msg":"echo PSabcdef"}"#;
        let redacted = redact_text(body, &["PSabcdef"]);
        assert!(!redacted.contains("PSabcdef"));
        assert!(redacted.contains("bad key"));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundaries() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("abcdef", 3), "abc...");
        // "가" is three bytes; cutting at 4 must back off to 3.
        assert_eq!(truncate_for_log("가나다", 4), "가...");
    }

    #[test]
    fn test_short_secrets_are_ignored() {
        assert_eq!(redact_text("a b c", &["b"]), "a b c");
    }
}
