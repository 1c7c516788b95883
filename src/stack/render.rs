//! Rendering of stack declarations into resolved specifications.
//!
//! Rendering substitutes `${imports.NAME}` placeholders in resource property
//! strings and export expressions with resolved import values. Nothing else in
//! a resource spec is interpreted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{Removal, ResourceSpec, StackConfig};
use crate::error::{ConfigError, Result};

const PLACEHOLDER_OPEN: &str = "${imports.";

/// A stack with its imports bound to concrete values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStack {
    /// Stack identifier.
    pub id: String,
    /// Resources with placeholders substituted.
    pub resources: Vec<ResourceSpec>,
    /// Export expressions with placeholders substituted.
    pub exports: BTreeMap<String, String>,
    /// Resolved import values by import name.
    pub imports: BTreeMap<String, String>,
    /// Effective removal directive.
    pub removal: Removal,
}

/// Renders a stack against resolved import values.
///
/// # Errors
///
/// Returns `UnresolvedImport` if a placeholder names an import with no value.
pub fn render_stack(
    stack: &StackConfig,
    imports: &BTreeMap<String, String>,
    removal: Removal,
) -> Result<ResolvedStack> {
    let unresolved = |name: String| ConfigError::UnresolvedImport {
        stack_id: stack.id.clone(),
        import: name,
        producer: None,
    };

    let mut resources = Vec::with_capacity(stack.resources.len());
    for resource in &stack.resources {
        let mut properties = BTreeMap::new();
        for (key, value) in &resource.properties {
            properties.insert(
                key.clone(),
                render_value(value, imports).map_err(unresolved)?,
            );
        }
        resources.push(ResourceSpec {
            name: resource.name.clone(),
            kind: resource.kind.clone(),
            properties,
        });
    }

    let mut exports = BTreeMap::new();
    for (name, expression) in &stack.exports {
        exports.insert(
            name.clone(),
            render_text(expression, imports).map_err(unresolved)?,
        );
    }

    Ok(ResolvedStack {
        id: stack.id.clone(),
        resources,
        exports,
        imports: imports.clone(),
        removal,
    })
}

/// Returns the import names referenced by `${imports.NAME}` placeholders.
#[must_use]
pub fn import_placeholders(text: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        let Some(end) = after.find('}') else {
            break;
        };
        names.push(&after[..end]);
        rest = &after[end + 1..];
    }

    names
}

fn render_value(
    value: &serde_json::Value,
    imports: &BTreeMap<String, String>,
) -> std::result::Result<serde_json::Value, String> {
    use serde_json::Value;

    Ok(match value {
        Value::String(s) => Value::String(render_text(s, imports)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, imports))
                .collect::<std::result::Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, imports)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

/// Substitutes placeholders in one string; the error is the missing name.
fn render_text(
    text: &str,
    imports: &BTreeMap<String, String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = &after[..end];
        let value = imports.get(name).ok_or_else(|| name.to_string())?;

        out.push_str(&rest[..start]);
        out.push_str(value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackyardError;
    use serde_json::json;

    fn imports() -> BTreeMap<String, String> {
        BTreeMap::from([(String::from("bucketArn"), String::from("arn:aws:s3:::plots"))])
    }

    #[test]
    fn test_placeholder_scan() {
        assert_eq!(
            import_placeholders("${imports.a}/${imports.b}-${bucket.arn}"),
            vec!["a", "b"]
        );
        assert!(import_placeholders("${imports.unterminated").is_empty());
    }

    #[test]
    fn test_render_nested_properties() {
        let stack = StackConfig::new("Compute")
            .with_resource(
                ResourceSpec::new("tracker", "function")
                    .with_property("env", json!({ "BUCKET": "${imports.bucketArn}" }))
                    .with_property("policies", json!(["read:${imports.bucketArn}/*"]))
                    .with_property("memory", json!(256)),
            )
            .with_export("functionArn", "${tracker.arn}");

        let resolved = render_stack(&stack, &imports(), Removal::Delete).expect("renders");
        let props = &resolved.resources[0].properties;

        assert_eq!(props["env"], json!({ "BUCKET": "arn:aws:s3:::plots" }));
        assert_eq!(props["policies"], json!(["read:arn:aws:s3:::plots/*"]));
        assert_eq!(props["memory"], json!(256));
        assert_eq!(resolved.exports["functionArn"], "${tracker.arn}");
    }

    #[test]
    fn test_missing_import_value() {
        let stack = StackConfig::new("Compute").with_export("x", "${imports.tableName}");

        let err = render_stack(&stack, &imports(), Removal::Delete).expect_err("missing");
        assert!(matches!(
            err,
            StackyardError::Config(ConfigError::UnresolvedImport { ref import, .. }) if import == "tableName"
        ));
    }
}
