//! Argument normalization for tool calls.
//!
//! Clients send integers as JSON numbers, floats such as `2.0`, or strings
//! such as `"2"`. Everything is normalized here, once, so the tools only ever
//! see `u64`.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ToolError;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PER_PAGE: u64 = 20;
pub const MAX_PER_PAGE: u64 = 100;

/// Converts a loosely typed JSON value into a non-negative integer.
pub fn to_u64(name: &str, value: &Value) -> Result<u64, ToolError> {
    let invalid = || ToolError::Validation(format!("{name} must be a non-negative integer, got {value}"));
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                return Ok(v);
            }
            match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
                _ => Err(invalid()),
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<u64>() {
                return Ok(v);
            }
            match s.parse::<f64>() {
                Ok(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 => Ok(f as u64),
                _ => Err(invalid()),
            }
        }
        _ => Err(invalid()),
    }
}

fn object(params: &Value) -> Result<Option<&Map<String, Value>>, ToolError> {
    match params {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(ToolError::Validation(format!(
            "params must be an object, got {other}"
        ))),
    }
}

/// Looks up `name`; a missing key or `null` is `None`.
pub fn optional_u64(params: &Value, name: &str) -> Result<Option<u64>, ToolError> {
    match object(params)?.and_then(|map| map.get(name)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => to_u64(name, value).map(Some),
    }
}

pub fn required_u64(params: &Value, name: &str) -> Result<u64, ToolError> {
    optional_u64(params, name)?
        .ok_or_else(|| ToolError::Validation(format!("missing required parameter: {name}")))
}

pub fn optional_str<'a>(params: &'a Value, name: &str) -> Result<Option<&'a str>, ToolError> {
    match object(params)?.and_then(|map| map.get(name)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(ToolError::Validation(format!(
            "{name} must be a string, got {other}"
        ))),
    }
}

/// 1-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: u64,
    pub per_page: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl Pagination {
    /// Reads `page` and `per_page`. Zero is rejected; `per_page` above the
    /// maximum is clamped.
    pub fn from_params(params: &Value) -> Result<Self, ToolError> {
        let page = optional_u64(params, "page")?.unwrap_or(DEFAULT_PAGE);
        let per_page = optional_u64(params, "per_page")?.unwrap_or(DEFAULT_PER_PAGE);
        if page == 0 {
            return Err(ToolError::Validation("page starts at 1".to_owned()));
        }
        if per_page == 0 {
            return Err(ToolError::Validation("per_page must be positive".to_owned()));
        }
        Ok(Self {
            page,
            per_page: per_page.min(MAX_PER_PAGE),
        })
    }

    /// Number of items before this page.
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.per_page)
    }

    pub fn page_count(&self, total: u64) -> u64 {
        total.div_ceil(self.per_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_integers_whole_floats_and_numeric_strings() {
        assert_eq!(to_u64("id", &json!(7)).unwrap(), 7);
        assert_eq!(to_u64("id", &json!(7.0)).unwrap(), 7);
        assert_eq!(to_u64("id", &json!("7")).unwrap(), 7);
        assert_eq!(to_u64("id", &json!(" 7 ")).unwrap(), 7);
        assert_eq!(to_u64("id", &json!("7.0")).unwrap(), 7);
    }

    #[test]
    fn rejects_fractions_negatives_and_garbage() {
        for bad in [json!(7.5), json!(-1), json!("-3"), json!("seven"), json!(true), json!([1])] {
            assert!(
                matches!(to_u64("id", &bad), Err(ToolError::Validation(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn missing_and_null_are_none() {
        let params = json!({ "a": null });
        assert_eq!(optional_u64(&params, "a").unwrap(), None);
        assert_eq!(optional_u64(&params, "b").unwrap(), None);
        assert_eq!(optional_u64(&Value::Null, "b").unwrap(), None);
        assert!(required_u64(&params, "a").is_err());
    }

    #[test]
    fn non_object_params_are_rejected() {
        assert!(optional_u64(&json!([1, 2]), "id").is_err());
        assert!(optional_str(&json!("x"), "status").is_err());
    }

    #[test]
    fn string_params() {
        let params = json!({ "status": "confirmed", "n": 1 });
        assert_eq!(optional_str(&params, "status").unwrap(), Some("confirmed"));
        assert!(optional_str(&params, "n").is_err());
    }

    #[test]
    fn pagination_defaults_and_clamps() {
        assert_eq!(Pagination::from_params(&Value::Null).unwrap(), Pagination::default());

        let p = Pagination::from_params(&json!({ "page": "3", "per_page": 500 })).unwrap();
        assert_eq!(p, Pagination { page: 3, per_page: 100 });
        assert_eq!(p.offset(), 200);

        assert!(Pagination::from_params(&json!({ "page": 0 })).is_err());
        assert!(Pagination::from_params(&json!({ "per_page": 0 })).is_err());
    }

    #[test]
    fn page_count_rounds_up() {
        let p = Pagination { page: 1, per_page: 20 };
        assert_eq!(p.page_count(0), 0);
        assert_eq!(p.page_count(20), 1);
        assert_eq!(p.page_count(21), 2);
    }
}
