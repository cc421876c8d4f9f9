use jsonschema::JSONSchema;
use serde_json::{json, Value};

use crate::error::{LlmError, LlmErrorCode};
use crate::types::{FunctionDeclaration, ToolCall};

pub fn validate_tool_arguments(
    declaration: &FunctionDeclaration,
    tool_call: &ToolCall,
) -> Result<(), LlmError> {
    check_instance(
        &declaration.parameters,
        &tool_call.arguments,
        LlmErrorCode::ToolArgumentsInvalid,
        &declaration.name,
    )
    .map_err(|error| {
        error.with_details(json!({
            "toolName": tool_call.name,
            "toolCallId": tool_call.id,
            "arguments": tool_call.arguments,
        }))
    })
}

pub fn validate_structured_output(schema: &Value, output: &Value) -> Result<(), LlmError> {
    check_instance(
        schema,
        output,
        LlmErrorCode::StructuredOutputInvalid,
        "response schema",
    )
}

fn check_instance(
    schema: &Value,
    instance: &Value,
    failure_code: LlmErrorCode,
    subject: &str,
) -> Result<(), LlmError> {
    let compiled = JSONSchema::compile(schema).map_err(|error| {
        LlmError::new(
            LlmErrorCode::SchemaInvalid,
            format!("Invalid JSON schema for '{subject}': {error}"),
        )
    })?;

    if let Err(errors) = compiled.validate(instance) {
        let validation_errors = errors
            .map(|error| {
                json!({
                    "path": error.instance_path.to_string(),
                    "message": error.to_string(),
                })
            })
            .collect::<Vec<_>>();

        return Err(LlmError::new(
            failure_code,
            format!("Validation failed for '{subject}'"),
        )
        .with_details(json!({ "validationErrors": validation_errors })));
    }

    Ok(())
}
