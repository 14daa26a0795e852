//! Parameter validation against skill descriptors.
//!
//! Raw parameters come from the reasoning collaborator and are loosely typed:
//! numbers arrive as strings, booleans as `"true"`. Validation coerces where
//! the intent is unambiguous and rejects everything else with an error naming
//! the offending parameter.

use super::{ParamType, Params, SkillDescriptor};
use crate::error::{Error, Result};
use serde_json::{Number, Value};

/// Validate raw parameters and return the typed, defaulted set.
///
/// `null` is treated as an empty object. An explicit `null` for a parameter
/// counts as omitted. Parameters the descriptor does not declare are rejected.
///
/// # Example
///
/// ```
/// use synk_core::skills::{validate_params, ParamType, ParameterSpec, SkillDescriptor};
/// use serde_json::json;
///
/// let desc = SkillDescriptor::new("repeat", "Repeat a phrase")
///     .with_parameter(ParameterSpec::new("text", ParamType::String))
///     .with_parameter(ParameterSpec::new("times", ParamType::Integer).with_default(json!(1)));
///
/// let params = validate_params(&desc, &json!({"text": "hi", "times": "3"})).unwrap();
/// assert_eq!(params["times"], json!(3));
///
/// assert!(validate_params(&desc, &json!({"times": 2})).is_err());
/// ```
pub fn validate_params(descriptor: &SkillDescriptor, raw: &Value) -> Result<Params> {
    let empty = Params::new();
    let provided = match raw {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => {
            return Err(Error::parameter_validation(
                &descriptor.name,
                "*",
                format!("expected an object of parameters, got {}", value_type_name(other)),
            ));
        }
    };

    if let Some(unknown) = provided
        .keys()
        .find(|key| descriptor.parameter(key).is_none())
    {
        return Err(Error::parameter_validation(
            &descriptor.name,
            unknown,
            "unknown parameter",
        ));
    }

    let mut params = Params::new();
    for spec in &descriptor.parameters {
        match provided.get(&spec.name).filter(|v| !v.is_null()) {
            Some(value) => {
                let coerced = coerce_value(value, spec.param_type).ok_or_else(|| {
                    Error::parameter_validation(
                        &descriptor.name,
                        &spec.name,
                        format!(
                            "expected {}, got {} ({})",
                            spec.param_type,
                            value_type_name(value),
                            truncate_preview(&value.to_string(), 60)
                        ),
                    )
                })?;
                params.insert(spec.name.clone(), coerced);
            }
            None => {
                if let Some(default) = &spec.default {
                    params.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(Error::parameter_validation(
                        &descriptor.name,
                        &spec.name,
                        format!("missing required parameter (expected {})", spec.param_type),
                    ));
                }
            }
        }
    }

    Ok(params)
}

/// Coerce a value to a parameter type, `None` if it cannot be done losslessly.
pub fn coerce_value(value: &Value, param_type: ParamType) -> Option<Value> {
    match param_type {
        ParamType::Any => Some(value.clone()),
        ParamType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        ParamType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| Value::Number(Number::from(f as i64))),
            Value::String(s) => s.trim().parse::<i64>().ok().map(|i| Value::Number(i.into())),
            _ => None,
        },
        ParamType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            _ => None,
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ParamType::Array => value.is_array().then(|| value.clone()),
        ParamType::Object => value.is_object().then(|| value.clone()),
    }
}

/// Get a human-readable type name for a JSON value.
fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate_preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::skills::ParameterSpec;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn task_descriptor() -> SkillDescriptor {
        SkillDescriptor::new("create_task", "Create a task")
            .with_parameter(ParameterSpec::new("title", ParamType::String))
            .with_parameter(ParameterSpec::new("due", ParamType::String).optional())
            .with_parameter(
                ParameterSpec::new("priority", ParamType::Integer).with_default(json!(3)),
            )
            .with_parameter(ParameterSpec::new("urgent", ParamType::Boolean).optional())
    }

    #[test]
    fn test_defaults_and_optional() {
        let params = validate_params(&task_descriptor(), &json!({"title": "call John"})).unwrap();
        assert_eq!(
            Value::Object(params),
            json!({"title": "call John", "priority": 3})
        );
    }

    #[test]
    fn test_coercion() {
        let params = validate_params(
            &task_descriptor(),
            &json!({"title": 42, "priority": "5", "urgent": "TRUE"}),
        )
        .unwrap();
        assert_eq!(params["title"], json!("42"));
        assert_eq!(params["priority"], json!(5));
        assert_eq!(params["urgent"], json!(true));
    }

    #[test]
    fn test_missing_required_names_parameter() {
        let err = validate_params(&task_descriptor(), &json!({"due": "tomorrow"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterValidation);
        match err {
            Error::ParameterValidation { parameter, .. } => assert_eq!(parameter, "title"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = validate_params(&task_descriptor(), &json!({"title": "x", "colour": "red"}))
            .unwrap_err();
        match err {
            Error::ParameterValidation { parameter, message, .. } => {
                assert_eq!(parameter, "colour");
                assert_eq!(message, "unknown parameter");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_type_mismatch() {
        let err = validate_params(&task_descriptor(), &json!({"title": "x", "priority": "high"}))
            .unwrap_err();
        assert!(err.to_string().contains("priority"));
        assert!(err.to_string().contains("expected integer, got string"));
    }

    #[test]
    fn test_null_means_omitted() {
        assert!(validate_params(&task_descriptor(), &Value::Null).is_err());
        let params =
            validate_params(&task_descriptor(), &json!({"title": "x", "due": null})).unwrap();
        assert!(!params.contains_key("due"));
        assert!(validate_params(&task_descriptor(), &json!(["x"])).is_err());
    }

    #[test]
    fn test_coerce_value_table() {
        assert_eq!(coerce_value(&json!(2.0), ParamType::Integer), Some(json!(2)));
        assert_eq!(coerce_value(&json!(2.5), ParamType::Integer), None);
        assert_eq!(coerce_value(&json!(7), ParamType::Number), Some(json!(7)));
        assert_eq!(coerce_value(&json!("1.5"), ParamType::Number), Some(json!(1.5)));
        assert_eq!(coerce_value(&json!("yes"), ParamType::Boolean), None);
        assert_eq!(coerce_value(&json!({"a": 1}), ParamType::Array), None);
        assert_eq!(coerce_value(&json!(null), ParamType::Any), Some(json!(null)));
        assert_eq!(coerce_value(&json!([1]), ParamType::String), None);
    }
}
