//! Schema support.
//!
//! We generate JSON Schemas from our Rust types with [`schemars`], then
//! tighten them into the "strict" subset that OpenAI-style structured output
//! accepts.

use schemars::{JsonSchema, r#gen::SchemaSettings};
use serde_json::Map;

use crate::prelude::*;

/// Keywords that strict structured output rejects, and which we don't need
/// for validation anyway.
const UNSUPPORTED_KEYWORDS: &[&str] = &["format", "minimum", "default"];

/// Generate a strict JSON Schema for `T`, with all subschemas inlined.
pub fn strict_json_schema<T: JsonSchema>() -> Result<Value> {
    let settings = SchemaSettings::draft07().with(|settings| {
        settings.inline_subschemas = true;
    });
    let root = settings.into_generator().into_root_schema_for::<T>();
    let mut schema = serde_json::to_value(root).context("Failed to serialize schema")?;
    make_strict(&mut schema);
    Ok(schema)
}

/// Rewrite a schema in place so that every object has
/// `additionalProperties: false` and lists all its properties as required.
pub fn make_strict(schema: &mut Value) {
    match schema {
        Value::Object(obj) => {
            for keyword in UNSUPPORTED_KEYWORDS {
                obj.remove(*keyword);
            }
            if let Some(Value::Object(properties)) = obj.get("properties") {
                let required = properties.keys().cloned().map(Value::String).collect();
                // OpenAI requires all properties to be required.
                obj.insert("required".to_owned(), Value::Array(required));
                // OpenAI requires `additionalProperties` to be false.
                obj.insert("additionalProperties".to_owned(), Value::Bool(false));
            }
            for (key, value) in obj.iter_mut() {
                // Property names are data, not keywords.
                if key == "properties" {
                    if let Value::Object(properties) = value {
                        strict_properties(properties);
                    }
                } else {
                    make_strict(value);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(make_strict),
        _ => {}
    }
}

fn strict_properties(properties: &mut Map<String, Value>) {
    for value in properties.values_mut() {
        make_strict(value);
    }
}

#[cfg(test)]
mod tests {
    use schemars::JsonSchema;

    use super::*;

    /// A nested test type.
    #[derive(JsonSchema)]
    #[allow(dead_code)]
    struct Outer {
        /// Some text.
        format: String,
        count: u32,
        #[serde(default)]
        inner: Vec<Inner>,
    }

    #[derive(JsonSchema)]
    #[allow(dead_code)]
    struct Inner {
        value: f64,
    }

    #[test]
    fn test_strict_schema() {
        let schema = strict_json_schema::<Outer>().unwrap();
        assert_eq!(schema["title"], "Outer");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["required"], json!(["count", "format", "inner"]));
        // A property named like a keyword survives.
        assert_eq!(schema["properties"]["format"]["type"], "string");
        assert!(schema["properties"]["count"].get("format").is_none());
        assert!(schema["properties"]["count"].get("minimum").is_none());
        let inner = &schema["properties"]["inner"]["items"];
        assert_eq!(inner["additionalProperties"], false);
        assert_eq!(inner["required"], json!(["value"]));
        assert!(schema.get("definitions").is_none_or(|d| d == &json!({})));
    }
}
