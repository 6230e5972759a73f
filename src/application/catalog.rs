use super::naming::normalize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::warn;

/// Raw tool listing as a remote endpoint reports it (`tools/list`).
#[derive(Debug, Clone)]
pub struct RemoteToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// Decoded remote tool shape: the ordered parameter list extracted from the
/// endpoint's input schema. Immutable once fetched within a session.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub remote_name: String,
    pub description: Option<String>,
    pub parameters: Vec<ParameterDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub remote_name: String,
    pub schema: Value,
    pub required: bool,
}

/// A catalog entry after name normalization. `local_name` is unique within
/// one build pass; `param_names` maps local parameter names back to the
/// remote spelling for dispatch.
#[derive(Debug, Clone)]
pub struct NormalizedTool {
    pub local_name: String,
    pub remote_name: String,
    pub description: Option<String>,
    pub parameters: BTreeMap<String, Value>,
    pub required: BTreeSet<String>,
    pub param_names: BTreeMap<String, String>,
}

impl NormalizedTool {
    /// JSON-schema object advertised to the model for this tool.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for (name, schema) in &self.parameters {
            properties.insert(name.clone(), schema.clone());
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required.iter().collect::<Vec<_>>(),
        })
    }

    /// Translates model-supplied arguments (local parameter names) back to
    /// the remote spelling the endpoint expects. Unknown keys pass through
    /// untouched so permissive servers still receive them.
    pub fn remote_arguments(&self, args: &Value) -> Value {
        let Value::Object(map) = args else {
            return args.clone();
        };
        let mut remote = serde_json::Map::with_capacity(map.len());
        for (key, value) in map {
            let remote_key = self
                .param_names
                .get(key)
                .cloned()
                .unwrap_or_else(|| key.clone());
            remote.insert(remote_key, value.clone());
        }
        Value::Object(remote)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("tool '{tool}' has an unsupported schema: {reason}")]
    SchemaBuild { tool: String, reason: String },
}

/// Decodes an endpoint's raw tool listing into a descriptor. A missing
/// schema is treated as a parameterless tool; a schema that is not a JSON
/// object (or whose `properties` is not) cannot be represented.
pub fn descriptor_from_remote(info: &RemoteToolInfo) -> Result<ToolDescriptor, CatalogError> {
    let Some(schema) = &info.input_schema else {
        return Ok(ToolDescriptor {
            remote_name: info.name.clone(),
            description: info.description.clone(),
            parameters: Vec::new(),
        });
    };

    let Value::Object(schema_map) = schema else {
        return Err(CatalogError::SchemaBuild {
            tool: info.name.clone(),
            reason: "input schema is not an object".into(),
        });
    };

    let required: BTreeSet<String> = schema_map
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut parameters = Vec::new();
    match schema_map.get("properties") {
        None => {}
        Some(Value::Object(properties)) => {
            for (name, param_schema) in properties {
                if !param_schema.is_object() {
                    return Err(CatalogError::SchemaBuild {
                        tool: info.name.clone(),
                        reason: format!("parameter '{name}' schema is not an object"),
                    });
                }
                parameters.push(ParameterDescriptor {
                    remote_name: name.clone(),
                    schema: param_schema.clone(),
                    required: required.contains(name),
                });
            }
        }
        Some(_) => {
            return Err(CatalogError::SchemaBuild {
                tool: info.name.clone(),
                reason: "'properties' is not an object".into(),
            });
        }
    }

    Ok(ToolDescriptor {
        remote_name: info.name.clone(),
        description: info.description.clone(),
        parameters,
    })
}

/// Builds the normalized tool table for one endpoint. Name collisions get a
/// numeric disambiguator so no tool is silently dropped; a tool whose schema
/// cannot be decoded is skipped with a warning and the rest proceed.
pub fn build(infos: &[RemoteToolInfo]) -> BTreeMap<String, NormalizedTool> {
    let mut table: BTreeMap<String, NormalizedTool> = BTreeMap::new();
    for info in infos {
        let descriptor = match descriptor_from_remote(info) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(tool = %info.name, %err, "dropping tool with unrepresentable schema");
                continue;
            }
        };
        let tool = normalize_descriptor(&descriptor);
        insert_disambiguated(&mut table, tool);
    }
    table
}

/// Normalizes one descriptor without collision handling; the caller owns
/// uniqueness across whatever table it is merging into.
pub fn normalize_descriptor(descriptor: &ToolDescriptor) -> NormalizedTool {
    let mut parameters = BTreeMap::new();
    let mut required = BTreeSet::new();
    let mut param_names = BTreeMap::new();

    for param in &descriptor.parameters {
        let mut local = normalize(&param.remote_name);
        if param_names.contains_key(&local) {
            local = disambiguate(&local, |candidate| param_names.contains_key(candidate));
            warn!(
                tool = %descriptor.remote_name,
                param = %param.remote_name,
                local = %local,
                "parameter name collision resolved with suffix"
            );
        }
        parameters.insert(local.clone(), param.schema.clone());
        if param.required {
            required.insert(local.clone());
        }
        param_names.insert(local, param.remote_name.clone());
    }

    NormalizedTool {
        local_name: normalize(&descriptor.remote_name),
        remote_name: descriptor.remote_name.clone(),
        description: descriptor.description.clone(),
        parameters,
        required,
        param_names,
    }
}

/// Inserts a tool into `table`, appending a numeric suffix on collision.
pub fn insert_disambiguated(table: &mut BTreeMap<String, NormalizedTool>, mut tool: NormalizedTool) {
    if table.contains_key(&tool.local_name) {
        let unique = disambiguate(&tool.local_name, |candidate| table.contains_key(candidate));
        warn!(
            remote = %tool.remote_name,
            collided = %tool.local_name,
            renamed = %unique,
            "tool name collision resolved with suffix"
        );
        tool.local_name = unique;
    }
    table.insert(tool.local_name.clone(), tool);
}

pub(crate) fn disambiguate(base: &str, taken: impl Fn(&str) -> bool) -> String {
    let mut counter = 2usize;
    loop {
        let candidate = format!("{base}{counter}");
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
