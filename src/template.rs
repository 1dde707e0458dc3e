//! Recursive `{key}` template substitution over JSON values.
//!
//! Payload templates and header maps in broker configs are arbitrary JSON
//! structures whose string leaves may contain `{key}` placeholders. Rendering
//! walks the structure and substitutes every placeholder from the supplied
//! value map. A placeholder with no matching value is an error — a payload
//! must never be partially rendered or silently filled with empty strings.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{BrokerError, BrokerResult};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Render a template value, substituting `{key}` placeholders in every string
/// leaf with `values[key]`.
///
/// Objects and arrays are walked recursively; non-string scalars pass through
/// unchanged. Fails with `BrokerError::Template` naming the first missing key.
pub fn render(template: &Value, values: &BTreeMap<String, String>) -> BrokerResult<Value> {
    match template {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render(v, values)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render(item, values)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => Ok(Value::String(render_str(s, values)?)),
        other => Ok(other.clone()),
    }
}

/// Render a single string template.
pub fn render_str(template: &str, values: &BTreeMap<String, String>) -> BrokerResult<String> {
    let re = placeholder_re();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let key = &caps[1];
        let value = values.get(key).ok_or_else(|| BrokerError::Template {
            key: key.to_string(),
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render a string-valued map (e.g. a header table).
pub fn render_map(
    map: &BTreeMap<String, String>,
    values: &BTreeMap<String, String>,
) -> BrokerResult<BTreeMap<String, String>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), render_str(v, values)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("first_name".to_string(), "Ada".to_string()),
            ("last_name".to_string(), "Lovelace".to_string()),
            ("email".to_string(), "ada@example.com".to_string()),
        ])
    }

    #[test]
    fn substitutes_nested_structures() {
        let template = json!({
            "requestor": {"name": "{first_name} {last_name}"},
            "contacts": [{"email": "{email}"}],
            "consent": true,
            "version": 2,
        });
        let rendered = render(&template, &values()).unwrap();
        assert_eq!(rendered["requestor"]["name"], "Ada Lovelace");
        assert_eq!(rendered["contacts"][0]["email"], "ada@example.com");
        assert_eq!(rendered["consent"], true);
        assert_eq!(rendered["version"], 2);
    }

    #[test]
    fn missing_key_names_the_key() {
        let template = json!({"dob": "{date_of_birth}"});
        let err = render(&template, &values()).unwrap_err();
        match err {
            BrokerError::Template { key } => assert_eq!(key, "date_of_birth"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn never_substitutes_empty_string_for_missing_key() {
        let err = render_str("{missing}", &values()).unwrap_err();
        assert!(matches!(err, BrokerError::Template { .. }));
    }

    #[test]
    fn rendering_is_idempotent_when_values_have_no_placeholders() {
        let template = json!({"who": "{first_name}", "note": "no braces here"});
        let once = render(&template, &values()).unwrap();
        let twice = render(&once, &values()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn literal_text_around_placeholders_is_preserved() {
        let out = render_str("Hello {first_name}, bye", &values()).unwrap();
        assert_eq!(out, "Hello Ada, bye");
    }

    #[test]
    fn unmatched_braces_pass_through() {
        // `{not a key}` does not match the placeholder grammar.
        let out = render_str("{not a key}", &values()).unwrap();
        assert_eq!(out, "{not a key}");
    }
}
