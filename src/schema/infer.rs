// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Schemas inferred from a chart's default values.

use std::path::Path;

use serde_json::Value;

use super::{Error, Schema};

/// Read a values file and infer a schema from its contents.
pub fn from_values_file(path: &Path) -> Result<Schema, Error> {
    let data = std::fs::read(path).map_err(|e| Error::Io(path.to_path_buf(), e))?;
    let values: Value = serde_yml::from_slice(&data).map_err(Error::Yaml)?;
    Ok(infer(&values))
}

/// Describe the shape of `value`.
///
/// Objects become `object` schemas with one property per key, arrays take
/// the merged shape of their elements, and `null` says nothing about the type.
pub fn infer(value: &Value) -> Schema {
    match value {
        Value::Null => Schema::default(),
        Value::Bool(_) => Schema::of_type("boolean"),
        Value::Number(n) if n.is_i64() || n.is_u64() => Schema::of_type("integer"),
        Value::Number(_) => Schema::of_type("number"),
        Value::String(_) => Schema::of_type("string"),
        Value::Array(elements) => {
            let mut schema = Schema::of_type("array");
            let mut items = Schema::default();
            for element in elements {
                items.merge(&infer(element));
            }
            if items != Schema::default() {
                schema.items = Some(Box::new(items));
            }
            schema
        }
        Value::Object(map) => {
            let mut schema = Schema::of_type("object");
            schema.properties = map
                .iter()
                .map(|(key, value)| (key.clone(), infer(value)))
                .collect();
            schema
        }
    }
}
