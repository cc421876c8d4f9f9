use serde_json::{Map, Value};

use crate::error::{LlmError, LlmErrorCode};

/// Resolves every `$ref` against the schema's `$defs`/`definitions` map and
/// substitutes the referenced subschema inline. The definitions map itself
/// is dropped from the output. Reference cycles fail with an explicit error
/// instead of recursing unboundedly. Idempotent on ref-free schemas.
pub fn flatten_json_schema(schema: &Value) -> Result<Value, LlmError> {
    let defs = collect_definitions(schema);
    let mut active_refs = Vec::new();
    let flattened = resolve_refs(schema, &defs, &mut active_refs)?;

    Ok(match flattened {
        Value::Object(mut map) => {
            map.remove("$defs");
            map.remove("definitions");
            Value::Object(map)
        }
        other => other,
    })
}

/// Recursively removes `title` keys at every nesting level. The provider
/// treats `title` as a separate descriptive field that conflicts with
/// `description`, so it is stripped before schemas reach the wire.
pub fn remove_titles_from_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| key.as_str() != "title")
                .map(|(key, value)| (key.clone(), remove_titles_from_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(remove_titles_from_schema).collect()),
        other => other.clone(),
    }
}

fn collect_definitions(schema: &Value) -> Map<String, Value> {
    let mut defs = Map::new();
    for key in ["$defs", "definitions"] {
        if let Some(map) = schema.get(key).and_then(Value::as_object) {
            for (name, subschema) in map {
                defs.insert(name.clone(), subschema.clone());
            }
        }
    }
    defs
}

fn resolve_refs(
    node: &Value,
    defs: &Map<String, Value>,
    active_refs: &mut Vec<String>,
) -> Result<Value, LlmError> {
    match node {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                return resolve_reference(reference, defs, active_refs);
            }

            let mut resolved = Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_refs(value, defs, active_refs)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_refs(item, defs, active_refs)?);
            }
            Ok(Value::Array(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_reference(
    reference: &str,
    defs: &Map<String, Value>,
    active_refs: &mut Vec<String>,
) -> Result<Value, LlmError> {
    let name = reference
        .strip_prefix("#/$defs/")
        .or_else(|| reference.strip_prefix("#/definitions/"))
        .ok_or_else(|| {
            LlmError::new(
                LlmErrorCode::SchemaInvalid,
                format!("Unsupported $ref target: {reference}"),
            )
        })?;

    if active_refs.iter().any(|active| active == name) {
        return Err(LlmError::new(
            LlmErrorCode::SchemaCircularRef,
            format!("Circular $ref chain through '{name}'"),
        )
        .with_details(serde_json::json!({ "chain": active_refs, "at": name })));
    }

    let subschema = defs.get(name).ok_or_else(|| {
        LlmError::new(
            LlmErrorCode::SchemaInvalid,
            format!("Unresolved $ref: {reference}"),
        )
    })?;

    active_refs.push(name.to_string());
    let resolved = resolve_refs(subschema, defs, active_refs);
    active_refs.pop();
    resolved
}
