use serde_json::Value;

/// Longest string kept verbatim in a redacted body. Inline images are far longer.
const MAX_INLINE_CHARS: usize = 200;

/// Masks credentials and shortens inline image data so a request body can be
/// logged.
pub fn redact_value(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                let k_lower = k.to_lowercase();

                if k_lower.contains("key")
                    || k_lower.contains("auth")
                    || k_lower.contains("token")
                    || k_lower.contains("secret")
                    || k_lower == "cookie"
                {
                    *val = Value::String("[REDACTED]".to_string());
                    continue;
                }

                redact_value(val);
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val);
            }
        }
        Value::String(s) => {
            if s.starts_with("data:") || s.chars().count() > MAX_INLINE_CHARS {
                let head = match s.split_once(',') {
                    Some((head, _)) if s.starts_with("data:") => head.to_string(),
                    _ => crate::str_utils::prefix_chars(s, 32).to_string(),
                };
                *s = format!("{}...[{} bytes]", head, s.len());
            }
        }
        _ => {}
    }
}
