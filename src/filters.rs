//! Filter Engine
//!
//! Include/exclude predicate evaluation over record fields. Filters are
//! validated and normalized once up front; evaluation assumes normalized
//! input.

use std::collections::HashMap;

use serde::Deserialize;

use crate::model::Filterable;

pub const WILDCARD: &str = "*";

/// Raw per-field include/exclude sets as they appear in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub include: HashMap<String, Vec<String>>,
    pub exclude: HashMap<String, Vec<String>>,
}

/// Normalized filters: every supported field has an include and exclude set.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub include: HashMap<String, Vec<String>>,
    pub exclude: HashMap<String, Vec<String>>,
}

/// Raised when the configured filters fail validation.
#[derive(Debug, Clone)]
pub struct InvalidFilterError(pub String);

impl std::fmt::Display for InvalidFilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid filter: {}", self.0)
    }
}

impl std::error::Error for InvalidFilterError {}

/// Validate filters and fill in defaults (include = `["*"]`, exclude = `[]`)
/// for every field the record type supports.
pub fn validate_and_normalize_filters<T: Filterable>(
    raw: &FilterConfig,
) -> Result<Filters, InvalidFilterError> {
    let supported = T::supported_filters();

    for key in raw.include.keys().chain(raw.exclude.keys()) {
        if !supported.contains(&key.as_str()) {
            return Err(InvalidFilterError(format!("unknown filter field: {key}")));
        }
    }

    let mut normalized = Filters::default();
    for &field in supported {
        let include = raw
            .include
            .get(field)
            .cloned()
            .unwrap_or_else(|| vec![WILDCARD.to_string()]);
        let exclude = raw.exclude.get(field).cloned().unwrap_or_default();

        if include.is_empty() {
            return Err(InvalidFilterError(format!(
                "include filter for {field} must not be empty"
            )));
        }

        for set in [&include, &exclude] {
            if set.len() > 1 && set.iter().any(|v| v == WILDCARD) {
                return Err(InvalidFilterError(format!(
                    "'*' can not be combined with other values for {field}"
                )));
            }
        }

        if let Some(overlap) = include.iter().find(|v| exclude.contains(v)) {
            return Err(InvalidFilterError(format!(
                "value {overlap:?} appears in both include and exclude for {field}"
            )));
        }

        normalized.include.insert(field.to_string(), include);
        normalized.exclude.insert(field.to_string(), exclude);
    }

    Ok(normalized)
}

/// Check whether a record passes the normalized filters. A value in any
/// field's exclude set rejects the record outright; otherwise the record
/// matches iff every field passes inclusion (wildcard or literal).
pub fn matches_filters<T: Filterable>(record: &T, filters: &Filters) -> bool {
    let supported = T::supported_filters();
    let mut included = 0;

    for &field in supported {
        let value = record.filter_value(field);
        let include = &filters.include[field];
        let exclude = &filters.exclude[field];

        if include.iter().any(|v| v == WILDCARD || v == value) {
            included += 1;
        }
        if exclude.iter().any(|v| v == value) {
            return false;
        }
    }

    included == supported.len()
}
