//! Administrative tools exposed by the server itself.
//!
//! All names are non-qualified, so the dynamic refresh layer never touches
//! them. Parameters are plain serde structs with schemars-derived input
//! schemas, registered as builtin handlers on the tool registry.

pub mod env_admin;
pub mod env_inspect;
pub mod registry_admin;

use rmcp::schemars;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{ToolHostError, ToolHostResult};
use crate::plugins::loader::DynamicLoader;
use crate::plugins::ToolDescriptor;
use crate::registry::ToolRegistry;

/// Register the full admin surface on the registry.
pub fn register_builtin_tools(
    registry: &Arc<ToolRegistry>,
    loader: &Arc<DynamicLoader>,
) -> ToolHostResult<()> {
    env_admin::register(registry, loader)?;
    env_inspect::register(registry, loader)?;
    registry_admin::register(registry, loader)?;
    Ok(())
}

/// Build a builtin tool descriptor from a parameter type's derived schema.
pub(crate) fn builtin_descriptor<T: schemars::JsonSchema>(
    name: &str,
    description: &str,
) -> ToolDescriptor {
    let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
    let input_schema = serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));

    ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
        tags: Vec::new(),
        source_module: String::new(),
        function_name: String::new(),
        tool_name_prefix: String::new(),
    }
}

/// Deserialize tool-call arguments into a parameter struct.
pub(crate) fn parse_params<T: DeserializeOwned>(
    args: serde_json::Map<String, Value>,
) -> ToolHostResult<T> {
    serde_json::from_value(Value::Object(args))
        .map_err(|e| ToolHostError::invalid_argument(e.to_string()))
}

/// Serialize a report into the handler's JSON result form.
pub(crate) fn to_json<T: Serialize>(value: &T) -> ToolHostResult<Value> {
    serde_json::to_value(value).map_err(|e| ToolHostError::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
    struct DemoParams {
        #[schemars(description = "Plugin name")]
        name: String,
        #[serde(default)]
        force: bool,
    }

    #[test]
    fn test_builtin_descriptor_embeds_parameter_schema() {
        let descriptor = builtin_descriptor::<DemoParams>("demo", "Demo tool");
        assert_eq!(descriptor.name, "demo");
        let schema = descriptor.input_schema.as_object().unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert!(properties.contains_key("name"));
        assert!(properties.contains_key("force"));
    }

    #[test]
    fn test_parse_params_rejects_missing_required_fields() {
        let mut args = serde_json::Map::new();
        args.insert("force".to_string(), Value::Bool(true));
        let err = parse_params::<DemoParams>(args).unwrap_err();
        assert!(matches!(err, ToolHostError::InvalidArgument { .. }));

        let mut args = serde_json::Map::new();
        args.insert("name".to_string(), Value::String("calc".to_string()));
        let params = parse_params::<DemoParams>(args).unwrap();
        assert_eq!(params.name, "calc");
        assert!(!params.force);
    }
}
