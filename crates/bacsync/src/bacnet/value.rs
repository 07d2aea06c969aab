//! Decoded property values and the sanitizer that turns them into model values

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ObjectIdentifier, ObjectType, PropertyIdentifier};

/// Decimal places kept for real values
const REAL_PRECISION: i32 = 4;

/// A decoded property value together with its declared type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum RawValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    CharacterString(String),
    OctetString(Vec<u8>),
    Enumerated {
        value: u32,
        #[serde(default)]
        name: Option<String>,
    },
    BitString(Vec<bool>),
    ObjectIdentifier(ObjectIdentifier),
    Array(Vec<RawValue>),
    Error {
        class: String,
        code: String,
    },
}

impl RawValue {
    pub fn enumerated(value: u32, name: &str) -> Self {
        RawValue::Enumerated {
            value,
            name: Some(name.to_string()),
        }
    }

    pub fn error(class: &str, code: &str) -> Self {
        RawValue::Error {
            class: class.to_string(),
            code: code.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RawValue::Error { .. })
    }

    /// Convert an application value into a raw value for writing
    ///
    /// Present values of analog objects are written as reals and of binary
    /// objects as `active`/`inactive`; everything else follows the JSON type.
    pub fn from_json(object_type: &ObjectType, property: &PropertyIdentifier, value: &Value) -> Self {
        if *property == PropertyIdentifier::PRESENT_VALUE {
            if object_type.is_analog() {
                if let Some(v) = value.as_f64() {
                    return RawValue::Real(v as f32);
                }
            }
            if object_type.is_binary() {
                let active = match value {
                    Value::Bool(b) => Some(*b),
                    Value::Number(n) => n.as_u64().map(|n| n != 0),
                    Value::String(s) => match s.as_str() {
                        "active" => Some(true),
                        "inactive" => Some(false),
                        _ => None,
                    },
                    _ => None,
                };
                if let Some(active) = active {
                    return if active {
                        RawValue::enumerated(1, "active")
                    } else {
                        RawValue::enumerated(0, "inactive")
                    };
                }
            }
        }

        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Boolean(*b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    RawValue::Unsigned(u)
                } else if let Some(i) = n.as_i64() {
                    RawValue::Signed(i)
                } else {
                    RawValue::Real(n.as_f64().unwrap_or_default() as f32)
                }
            }
            Value::String(s) => RawValue::CharacterString(s.clone()),
            Value::Array(items) => RawValue::Array(
                items
                    .iter()
                    .map(|item| RawValue::from_json(object_type, property, item))
                    .collect(),
            ),
            Value::Object(_) => RawValue::CharacterString(value.to_string()),
        }
    }
}

/// Round a finite real to the stored precision
pub fn round_real(value: f64) -> f64 {
    let factor = 10f64.powi(REAL_PRECISION);
    (value * factor).round() / factor
}

/// Normalize a raw value for the device dictionary
///
/// Returns `None` when the value must not be stored: error-typed values and
/// non-finite reals. Inside an array those become `null` so indices stay put.
pub fn sanitize(raw: &RawValue) -> Option<Value> {
    match raw {
        RawValue::Error { class, code } => {
            tracing::debug!(class, code, "Discarding error-typed value");
            None
        }
        RawValue::Real(v) => sanitize_real(f64::from(*v)),
        RawValue::Double(v) => sanitize_real(*v),
        RawValue::Array(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| sanitize(item).unwrap_or(Value::Null))
                .collect(),
        )),
        other => Some(scalar(other)),
    }
}

fn sanitize_real(v: f64) -> Option<Value> {
    if v.is_nan() {
        tracing::info!("NaN value discarded");
        return None;
    }
    if v.is_infinite() {
        tracing::info!(value = v, "Infinite value discarded");
        return None;
    }
    serde_json::Number::from_f64(round_real(v)).map(Value::Number)
}

fn scalar(raw: &RawValue) -> Value {
    match raw {
        RawValue::Null => Value::Null,
        RawValue::Boolean(b) => Value::Bool(*b),
        RawValue::Unsigned(u) => Value::from(*u),
        RawValue::Signed(i) => Value::from(*i),
        RawValue::CharacterString(s) => Value::String(s.clone()),
        RawValue::OctetString(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
        RawValue::Enumerated { value, name } => match name {
            Some(name) => Value::String(name.clone()),
            None => Value::from(*value),
        },
        RawValue::BitString(bits) => Value::Array(bits.iter().map(|b| Value::Bool(*b)).collect()),
        RawValue::ObjectIdentifier(id) => Value::Array(vec![
            Value::String(id.object_type.to_string()),
            Value::from(id.instance),
        ]),
        RawValue::Real(_) | RawValue::Double(_) | RawValue::Array(_) | RawValue::Error { .. } => {
            sanitize(raw).unwrap_or(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_finite_reals_are_discarded() {
        assert_eq!(sanitize(&RawValue::Real(f32::NAN)), None);
        assert_eq!(sanitize(&RawValue::Double(f64::INFINITY)), None);
        assert_eq!(sanitize(&RawValue::Double(f64::NEG_INFINITY)), None);
    }

    #[test]
    fn test_reals_are_rounded() {
        assert_eq!(sanitize(&RawValue::Double(3.14159265)), Some(json!(3.1416)));
        assert_eq!(sanitize(&RawValue::Real(21.5)), Some(json!(21.5)));
        assert_eq!(sanitize(&RawValue::Real(0.1)), Some(json!(0.1)));
    }

    #[test]
    fn test_error_values_are_discarded() {
        assert_eq!(sanitize(&RawValue::error("property", "unknownProperty")), None);
    }

    #[test]
    fn test_composites_flatten_to_scalars() {
        let list = RawValue::Array(vec![
            RawValue::ObjectIdentifier(ObjectIdentifier::device(10)),
            RawValue::ObjectIdentifier(ObjectIdentifier::new(ObjectType::ANALOG_INPUT, 0)),
        ]);
        assert_eq!(
            sanitize(&list),
            Some(json!([["device", 10], ["analogInput", 0]]))
        );

        assert_eq!(
            sanitize(&RawValue::enumerated(1, "active")),
            Some(json!("active"))
        );
        assert_eq!(
            sanitize(&RawValue::BitString(vec![false, true])),
            Some(json!([false, true]))
        );
        assert_eq!(
            sanitize(&RawValue::OctetString(vec![0x0a, 0xff])),
            Some(json!("0aff"))
        );
    }

    #[test]
    fn test_non_finite_inside_array_keeps_position() {
        let list = RawValue::Array(vec![
            RawValue::Real(1.0),
            RawValue::Real(f32::NAN),
            RawValue::Real(2.0),
        ]);
        assert_eq!(sanitize(&list), Some(json!([1.0, null, 2.0])));
    }

    #[test]
    fn test_from_json_coerces_present_value() {
        let pv = PropertyIdentifier::PRESENT_VALUE;
        assert_eq!(
            RawValue::from_json(&ObjectType::ANALOG_VALUE, &pv, &json!(22)),
            RawValue::Real(22.0)
        );
        assert_eq!(
            RawValue::from_json(&ObjectType::BINARY_VALUE, &pv, &json!("active")),
            RawValue::enumerated(1, "active")
        );
        assert_eq!(
            RawValue::from_json(&ObjectType::MULTI_STATE_VALUE, &pv, &json!(3)),
            RawValue::Unsigned(3)
        );
    }

    #[test]
    fn test_raw_value_wire_shape() {
        let raw: RawValue =
            serde_json::from_value(json!({"type": "enumerated", "value": {"value": 1, "name": "active"}}))
                .unwrap();
        assert_eq!(raw, RawValue::enumerated(1, "active"));

        let raw: RawValue =
            serde_json::from_value(json!({"type": "objectIdentifier", "value": "analogInput:3"})).unwrap();
        assert_eq!(
            raw,
            RawValue::ObjectIdentifier(ObjectIdentifier::new(ObjectType::ANALOG_INPUT, 3))
        );
    }
}
