// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON writer.

use crate::CanonicalError;
use serde::Serialize;
use serde_json::Value;

/// Serialize a value to its canonical JSON string.
///
/// The value is first lifted into a [`serde_json::Value`]; objects become
/// `BTreeMap`s, which yields the recursive code-point key ordering the
/// canonical form requires. The writer then emits compact JSON with no
/// whitespace.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if the value cannot be represented
/// as JSON.
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&mut out, &value)?;
    Ok(out)
}

/// Serialize a value to its canonical JSON byte form.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if the value cannot be represented
/// as JSON.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    Ok(canonical_string(value)?.into_bytes())
}

/// Gate a float into the canonical number domain.
///
/// Every float that contributes to a hash must pass through this function.
/// Non-finite values are a serialization error, never a silent coercion.
///
/// # Errors
///
/// Returns [`CanonicalError::NonFiniteFloat`] for `NaN` and infinities.
///
/// # Examples
///
/// ```
/// assert!(reach_hash::fixed_float(1.5).is_ok());
/// assert!(reach_hash::fixed_float(f64::NAN).is_err());
/// ```
pub fn fixed_float(f: f64) -> Result<serde_json::Number, CanonicalError> {
    if !f.is_finite() {
        return Err(CanonicalError::NonFiniteFloat);
    }
    serde_json::Number::from_f64(f).ok_or(CanonicalError::NonFiniteFloat)
}

fn write_value(out: &mut String, value: &Value) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json's Display uses itoa/ryu shortest-roundtrip formatting,
        // which is locale-independent and stable across platforms.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Keys are sorted here rather than trusting Map iteration
            // order, so the canonical form survives a `preserve_order`
            // serde_json anywhere in the build graph. UTF-8 byte order is
            // Unicode code-point order.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(out, &map[key])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn compact_output_no_whitespace() {
        let s = canonical_string(&json!({"b": [1, true, null], "a": "x"})).unwrap();
        assert_eq!(s, r#"{"a":"x","b":[1,true,null]}"#);
    }

    #[test]
    fn keys_sort_by_code_point() {
        // "Z" (U+005A) sorts before "a" (U+0061).
        let s = canonical_string(&json!({"a": 1, "Z": 2})).unwrap();
        assert_eq!(s, r#"{"Z":2,"a":1}"#);
    }

    #[test]
    fn nested_keys_sort_recursively() {
        let s = canonical_string(&json!({"outer": {"z": 1, "a": 2}})).unwrap();
        assert_eq!(s, r#"{"outer":{"a":2,"z":1}}"#);
    }

    #[test]
    fn strings_escape_canonically() {
        let s = canonical_string(&json!({"k": "line\n\"quote\""})).unwrap();
        assert_eq!(s, r#"{"k":"line\n\"quote\""}"#);
    }

    #[test]
    fn unicode_strings_stay_utf8() {
        let s = canonical_string(&json!({"k": "héllo"})).unwrap();
        assert_eq!(s, "{\"k\":\"héllo\"}");
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert!(matches!(
            fixed_float(f64::INFINITY),
            Err(CanonicalError::NonFiniteFloat)
        ));
        assert!(matches!(
            fixed_float(f64::NEG_INFINITY),
            Err(CanonicalError::NonFiniteFloat)
        ));
        assert!(matches!(
            fixed_float(f64::NAN),
            Err(CanonicalError::NonFiniteFloat)
        ));
    }

    #[test]
    fn finite_floats_roundtrip() {
        let n = fixed_float(0.25).unwrap();
        assert_eq!(canonical_string(&json!({ "v": n })).unwrap(), r#"{"v":0.25}"#);
    }

    fn arb_json() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_form_is_idempotent(v in arb_json()) {
            let once = canonical_string(&v).unwrap();
            let reparsed: serde_json::Value = serde_json::from_str(&once).unwrap();
            let twice = canonical_string(&reparsed).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn canonical_form_parses_back(v in arb_json()) {
            let s = canonical_string(&v).unwrap();
            let back: serde_json::Value = serde_json::from_str(&s).unwrap();
            prop_assert_eq!(back, v);
        }
    }
}
