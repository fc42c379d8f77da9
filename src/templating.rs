//! Validation & templating (C2).
//!
//! Schema validation lives alongside the `{{var}}` placeholder extraction
//! and interpolation it supports — both are pure, stateless helpers called
//! from the project/task-type/task services at the boundaries where
//! `spec.md` requires them.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, EngineResult};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap());

static SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Extract distinct placeholder names from `template`, in order of first
/// appearance.
pub fn extract_placeholders(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in PLACEHOLDER.captures_iter(template) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Replace every `{{name}}` occurrence in `template` with the bound value.
/// Extra bindings not referenced by the template are ignored. Missing
/// bindings produce a `Validation` error listing every missing name.
pub fn interpolate(template: &str, variables: &BTreeMap<String, String>) -> EngineResult<String> {
    let missing: Vec<String> = extract_placeholders(template)
        .into_iter()
        .filter(|name| !variables.contains_key(name))
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::validation(
            "variables",
            format!("missing template variables: {}", missing.join(", ")),
        ));
    }

    Ok(PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_default()
        })
        .into_owned())
}

/// Reconcile an explicit `variables` list against the placeholders found in
/// `template`. If `explicit` is `Some`, it must be an exact set match
/// (order-insensitive) or a validation error is raised. If `None`, the
/// derived placeholder list (in first-appearance order) is returned.
pub fn reconcile_variables(
    template: Option<&str>,
    explicit: Option<Vec<String>>,
) -> EngineResult<Vec<String>> {
    let derived = template.map(extract_placeholders).unwrap_or_default();
    match explicit {
        None => Ok(derived),
        Some(explicit) => {
            let derived_set: std::collections::BTreeSet<_> = derived.iter().cloned().collect();
            let explicit_set: std::collections::BTreeSet<_> = explicit.iter().cloned().collect();
            if derived_set != explicit_set {
                return Err(EngineError::validation(
                    "variables",
                    format!(
                        "variables {:?} do not match template placeholders {:?}",
                        explicit_set, derived_set
                    ),
                ));
            }
            Ok(explicit)
        }
    }
}

/// Project/task-type name validation: slug-like, bounded length.
pub fn validate_name(field: &str, value: &str) -> EngineResult<()> {
    if value.is_empty() || value.len() > 100 {
        return Err(EngineError::validation(
            field,
            "must be 1-100 characters long",
        ));
    }
    if !SLUG.is_match(value) {
        return Err(EngineError::validation(
            field,
            "must contain only letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

pub fn validate_min(field: &str, value: i64, min: i64) -> EngineResult<()> {
    if value < min {
        return Err(EngineError::validation(
            field,
            format!("must be >= {min}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_distinct_placeholders_in_order() {
        let names = extract_placeholders("do {{x}} then {{y}} then {{x}} again");
        assert_eq!(names, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn interpolates_all_occurrences() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_string(), "A".to_string());
        let out = interpolate("do {{x}} and {{x}}", &vars).unwrap();
        assert_eq!(out, "do A and A");
    }

    #[test]
    fn interpolate_missing_variable_errors() {
        let vars = BTreeMap::new();
        let err = interpolate("do {{x}}", &vars).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn interpolate_allows_extra_bindings() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_string(), "A".to_string());
        vars.insert("unused".to_string(), "B".to_string());
        assert_eq!(interpolate("do {{x}}", &vars).unwrap(), "do A");
    }

    #[test]
    fn reconcile_rejects_mismatched_explicit_list() {
        let err = reconcile_variables(Some("{{a}}"), Some(vec!["b".to_string()])).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn reconcile_derives_when_absent() {
        let vars = reconcile_variables(Some("{{a}} {{b}}"), None).unwrap();
        assert_eq!(vars, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("name", "my-project_1").is_ok());
        assert!(validate_name("name", "bad name!").is_err());
        assert!(validate_name("name", "").is_err());
    }
}
