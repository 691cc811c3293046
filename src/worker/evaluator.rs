//! The worker's expression evaluator.
//!
//! Sandboxed code execution belongs to a separate runtime; this evaluator
//! understands JSON literals, bound names and dotted property paths
//! (`powers.config.port`), which is enough to compose endowments.

use serde_json::Value;
use thiserror::Error;

use crate::daemon::session::ErrorPayload;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("{names} names but {values} values")]
    ArityMismatch { names: usize, values: usize },
    #[error("`{name}` is not bound")]
    Unbound { name: String },
    #[error("`{path}` has no property `{property}`")]
    NoProperty { path: String, property: String },
    #[error("unsupported expression `{expression}`")]
    Unsupported { expression: String },
}

impl EvalError {
    pub fn code(&self) -> &'static str {
        match self {
            EvalError::ArityMismatch { .. } => "arity_mismatch",
            EvalError::Unbound { .. } | EvalError::NoProperty { .. } => "reference_error",
            EvalError::Unsupported { .. } => "unsupported_expression",
        }
    }
}

impl From<EvalError> for ErrorPayload {
    fn from(err: EvalError) -> Self {
        ErrorPayload::new(err.code(), err.to_string())
    }
}

pub fn evaluate(source: &str, names: &[String], values: &[Value]) -> Result<Value, EvalError> {
    if names.len() != values.len() {
        return Err(EvalError::ArityMismatch {
            names: names.len(),
            values: values.len(),
        });
    }
    let expr = source.trim();
    if let Ok(literal) = serde_json::from_str::<Value>(expr) {
        return Ok(literal);
    }

    let mut segments = expr.split('.');
    let head = segments.next().unwrap_or_default();
    if !is_identifier(head) {
        return Err(EvalError::Unsupported {
            expression: source.to_string(),
        });
    }
    let Some(position) = names.iter().rposition(|name| name == head) else {
        return Err(EvalError::Unbound {
            name: head.to_string(),
        });
    };

    let mut current = &values[position];
    let mut path = head.to_string();
    for property in segments {
        if !is_identifier(property) && property.parse::<usize>().is_err() {
            return Err(EvalError::Unsupported {
                expression: source.to_string(),
            });
        }
        let next = match current {
            Value::Object(map) => map.get(property),
            Value::Array(items) => property.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| EvalError::NoProperty {
            path: path.clone(),
            property: property.to_string(),
        })?;
        path.push('.');
        path.push_str(property);
    }
    Ok(current.clone())
}

fn is_identifier(raw: &str) -> bool {
    let mut chars = raw.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn literals_evaluate_to_themselves() {
        assert_eq!(evaluate(" 10 ", &[], &[]).unwrap(), json!(10));
        assert_eq!(evaluate(r#"{"a":[1]}"#, &[], &[]).unwrap(), json!({"a": [1]}));
    }

    #[test]
    fn names_and_paths_resolve() {
        let values = vec![json!({"cfg": {"ports": [80, 443]}})];
        let bound = names(&["powers"]);
        assert_eq!(
            evaluate("powers.cfg.ports.1", &bound, &values).unwrap(),
            json!(443)
        );
        let err = evaluate("powers.missing", &bound, &values).unwrap_err();
        assert_eq!(err.code(), "reference_error");
        assert_eq!(
            evaluate("other", &bound, &values).unwrap_err(),
            EvalError::Unbound {
                name: "other".into()
            }
        );
    }

    #[test]
    fn arity_and_unsupported_syntax() {
        assert_eq!(
            evaluate("x", &names(&["x", "y"]), &[json!(1)]).unwrap_err().code(),
            "arity_mismatch"
        );
        assert_eq!(
            evaluate("x + 1", &names(&["x"]), &[json!(1)]).unwrap_err().code(),
            "unsupported_expression"
        );
    }
}
