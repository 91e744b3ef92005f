//! Declared output schema of a workflow's final result.
//!
//! Deliberately small: required top-level fields plus a type per property.
//! Properties may be written as `"boolean"` or `{"type": "boolean"}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
    Any,
}

impl SchemaType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "array" => Self::Array,
            "null" => Self::Null,
            "any" => Self::Any,
            _ => return None,
        })
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Null => value.is_null(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawProperty {
    Name(String),
    Typed {
        #[serde(rename = "type")]
        kind: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawSchema {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, RawProperty>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputSchema {
    pub required: Vec<String>,
    pub properties: BTreeMap<String, SchemaType>,
}

impl OutputSchema {
    pub(crate) fn from_raw(raw: RawSchema) -> Result<Self, String> {
        let properties = raw
            .properties
            .into_iter()
            .map(|(name, prop)| {
                let kind = match prop {
                    RawProperty::Name(k) | RawProperty::Typed { kind: k } => k,
                };
                SchemaType::parse(&kind)
                    .map(|t| (name.clone(), t))
                    .ok_or_else(|| format!("unknown schema type '{kind}' for property '{name}'"))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            required: raw.required,
            properties,
        })
    }

    /// Check a result against the schema, collecting every violation.
    pub fn validate(&self, result: &Value) -> Result<(), Vec<String>> {
        let Some(object) = result.as_object() else {
            return Err(vec!["result is not an object".into()]);
        };

        let mut violations: Vec<String> = self
            .required
            .iter()
            .filter(|field| object.get(field.as_str()).is_none_or(Value::is_null))
            .map(|field| format!("missing required field '{field}'"))
            .collect();

        for (name, kind) in &self.properties {
            if let Some(value) = object.get(name)
                && !value.is_null()
                && !kind.matches(value)
            {
                violations.push(format!("field '{name}' is not of type {kind:?}"));
            }
        }

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }
}
