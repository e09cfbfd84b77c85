use serde_json::{Map, Value};

/// Recursively mask PII in a debug payload, keyed by field name. Nested
/// objects and arrays are traversed; non-string leaves under a sensitive
/// key are replaced wholesale.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key.clone(), sanitize_entry(key, val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

fn sanitize_entry(key: &str, value: &Value) -> Value {
    let lower = key.to_ascii_lowercase();
    if is_phone_key(&lower) {
        return mask_with(value, mask_phone);
    }
    if is_email_key(&lower) {
        return mask_with(value, mask_email);
    }
    if is_address_key(&lower) {
        return Value::String("[REDACTED_ADDRESS]".into());
    }
    if is_name_key(&lower) {
        return Value::String("[REDACTED_NAME]".into());
    }
    if is_free_text_key(&lower) {
        return Value::String("[REDACTED_TEXT]".into());
    }
    sanitize(value)
}

fn mask_with(value: &Value, f: fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Null => Value::Null,
        other => Value::String(f(&other.to_string())),
    }
}

fn is_phone_key(key: &str) -> bool {
    key == "phone" || key.ends_with("_phone") || key.ends_with("phone_number")
}

fn is_email_key(key: &str) -> bool {
    key == "email" || key.ends_with("_email")
}

fn is_address_key(key: &str) -> bool {
    key == "address" || key.ends_with("_address")
}

fn is_name_key(key: &str) -> bool {
    key == "name" || key.ends_with("_name")
}

fn is_free_text_key(key: &str) -> bool {
    matches!(key, "notes" | "description" | "transcript" | "job_summary")
}

/// Keep the last two digits, star the rest: "+15550001111" → "*********11".
pub fn mask_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 2 {
        return "*".repeat(digits.len().max(1));
    }
    let stars = "*".repeat(digits.len() - 2);
    format!("{stars}{}", &digits[digits.len() - 2..])
}

/// First character survives, the rest of the local part is starred, the
/// domain stays: "jane@x.com" → "j***@x.com".
pub fn mask_email(raw: &str) -> String {
    match raw.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first = local.chars().next().unwrap();
            format!("{first}***@{domain}")
        }
        _ => "***".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_phone_keeping_last_two() {
        assert_eq!(mask_phone("+15550001111"), "*********11");
        assert_eq!(mask_phone("555-0199"), "*****99");
        assert_eq!(mask_phone("5"), "*");
    }

    #[test]
    fn masks_email_keeping_first_char_and_domain() {
        assert_eq!(mask_email("jane.doe@example.com"), "j***@example.com");
        assert_eq!(mask_email("not-an-email"), "***");
    }

    #[test]
    fn sanitizes_nested_objects_and_arrays() {
        let payload = json!({
            "booking": {
                "customer_name": "Jane Doe",
                "phone": "+15550001111",
                "customer_address": "12 Oak St",
                "notes": "gate code 1234",
            },
            "events": [
                { "email": "jane@example.com", "description": "AC down" },
            ],
            "count": 3,
        });
        let clean = sanitize(&payload);
        assert_eq!(clean["booking"]["customer_name"], "[REDACTED_NAME]");
        assert_eq!(clean["booking"]["phone"], "*********11");
        assert_eq!(clean["booking"]["customer_address"], "[REDACTED_ADDRESS]");
        assert_eq!(clean["booking"]["notes"], "[REDACTED_TEXT]");
        assert_eq!(clean["events"][0]["email"], "j***@example.com");
        assert_eq!(clean["events"][0]["description"], "[REDACTED_TEXT]");
        assert_eq!(clean["count"], 3);
    }

    #[test]
    fn transcript_key_is_redacted() {
        let clean = sanitize(&json!({ "transcript": "caller said ..." }));
        assert_eq!(clean["transcript"], "[REDACTED_TEXT]");
    }
}
