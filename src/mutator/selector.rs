//! Label selector evaluation

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::error::{Error, Result};

/// Check that a selector is well-formed and selects something
pub fn validate(selector: &LabelSelector) -> Result<()> {
    let has_labels = selector.match_labels.as_ref().is_some_and(|l| !l.is_empty());
    let expressions = selector.match_expressions.as_deref().unwrap_or_default();
    if !has_labels && expressions.is_empty() {
        return Err(Error::validation("selector must not be empty"));
    }
    for expr in expressions {
        validate_requirement(expr)?;
    }
    Ok(())
}

fn validate_requirement(req: &LabelSelectorRequirement) -> Result<()> {
    if req.key.is_empty() {
        return Err(Error::validation("selector requirement key must not be empty"));
    }
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => Err(Error::validation(format!(
            "selector operator {} on '{}' requires values",
            req.operator, req.key
        ))),
        "Exists" | "DoesNotExist" if !values.is_empty() => Err(Error::validation(format!(
            "selector operator {} on '{}' must not have values",
            req.operator, req.key
        ))),
        "In" | "NotIn" | "Exists" | "DoesNotExist" => Ok(()),
        other => Err(Error::validation(format!(
            "unsupported selector operator '{}'",
            other
        ))),
    }
}

/// Whether `labels` satisfy every term of the selector
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    validate(selector)?;

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    for req in selector.match_expressions.as_deref().unwrap_or_default() {
        let values = req.values.as_deref().unwrap_or_default();
        let actual = labels.get(&req.key);
        let ok = match req.operator.as_str() {
            "In" => actual.is_some_and(|v| values.contains(v)),
            "NotIn" => actual.map_or(true, |v| !values.contains(v)),
            "Exists" => actual.is_some(),
            _ => actual.is_none(),
        };
        if !ok {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Render as the `key=value,key in (a,b)` string the API accepts in list calls
pub fn to_query(selector: &LabelSelector) -> String {
    let mut terms: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    for req in selector.match_expressions.as_deref().unwrap_or_default() {
        let values = req.values.as_deref().unwrap_or_default().join(",");
        terms.push(match req.operator.as_str() {
            "In" => format!("{} in ({})", req.key, values),
            "NotIn" => format!("{} notin ({})", req.key, values),
            "Exists" => req.key.clone(),
            _ => format!("!{}", req.key),
        });
    }

    terms.join(",")
}
