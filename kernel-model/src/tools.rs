use serde_json::{json, Map, Value};
use tether_kernel_config::ChatSettings;
use tether_kernel_protocol::ToolDescriptor;
use tracing::warn;

use crate::protocol::ApiVariant;

pub const UNKNOWN_TOOL_NAME: &str = "unknown_tool";
const PROPERTY_KEYS: &[&str] = &["type", "description", "enum", "minimum", "maximum"];

/// Converts discovered tools into the provider shape for `variant`.
pub fn normalize_tools(tools: &[ToolDescriptor], variant: ApiVariant) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| normalize_tool(tool, variant))
        .collect()
}

fn normalize_tool(tool: &ToolDescriptor, variant: ApiVariant) -> Value {
    let name = match tool.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            warn!(
                server_label = tool.server_label.as_deref().unwrap_or_default(),
                "tool descriptor has no name; emitting placeholder"
            );
            UNKNOWN_TOOL_NAME.to_string()
        }
    };
    let description = tool
        .description
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("Execute tool {name}"));
    let parameters = sanitize_schema(tool.input_schema.as_ref());

    match variant {
        ApiVariant::ChatCompletions => json!({
            "type": "function",
            "function": {
                "name": name,
                "description": description,
                "parameters": parameters,
            },
        }),
        ApiVariant::Responses => json!({
            "type": "function",
            "name": name,
            "description": description,
            "parameters": parameters,
        }),
    }
}

/// Builds a fresh object schema. Only whitelisted property keys and a
/// non-empty `required` list survive; everything else is never copied.
pub fn sanitize_schema(schema: Option<&Value>) -> Value {
    let mut properties = Map::new();
    if let Some(declared) = schema
        .and_then(|schema| schema.get("properties"))
        .and_then(Value::as_object)
    {
        for (name, property) in declared {
            let mut clean = Map::new();
            for key in PROPERTY_KEYS {
                if let Some(value) = property.get(*key) {
                    clean.insert((*key).to_string(), value.clone());
                }
            }
            properties.insert(name.clone(), Value::Object(clean));
        }
    }

    let mut sanitized = Map::new();
    sanitized.insert("type".to_string(), Value::String("object".to_string()));
    sanitized.insert("properties".to_string(), Value::Object(properties));

    let required = schema
        .and_then(|schema| schema.get("required"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if !required.is_empty() {
        sanitized.insert("required".to_string(), Value::Array(required));
    }

    Value::Object(sanitized)
}

/// Remote MCP servers the provider calls directly (Responses API only).
pub fn connector_tools(settings: &ChatSettings) -> Vec<Value> {
    settings
        .active_connectors()
        .map(|connector| {
            let mut tool = json!({
                "type": "mcp",
                "server_label": connector.server_label,
                "server_url": connector.server_url,
                "require_approval": connector.require_approval.as_deref().unwrap_or("never"),
            });
            if !connector.headers.is_empty() {
                tool["headers"] = json!(connector.headers);
            }
            tool
        })
        .collect()
}
