// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! JSON Schema documents describing chart values.
//!
//! Schemas are read from files, URLs or charts, checked, dereferenced and
//! merged into a single self contained document.

pub mod chart;
pub mod infer;
pub mod reader;
mod refs;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use chart::{ChartSource, GeneratorKind};
pub use reader::SchemaReader;

const TYPE_NAMES: &[&str] = &[
    "array", "boolean", "integer", "null", "number", "object", "string",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("no paths provided")]
    NoPaths,
    #[error("could not read JSON Schema from any of the provided paths:\n{}", list_failures(.0))]
    NoValidSource(Vec<(String, Error)>),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("failed to parse path {0}: {1}")]
    InvalidPath(String, url::ParseError),
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("{0}")]
    Transport(#[from] crate::transport::Error),
    #[error("failed to unmarshal JSON Schema: {0}")]
    Yaml(serde_yml::Error),
    #[error("failed to convert JSON Schema: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid schema at {path}: {message}")]
    Invalid { path: String, message: String },
    #[error("remote $ref is not supported: {0}")]
    RemoteRef(String),
    #[error("$ref {0} cannot be resolved without a base directory")]
    NoBase(String),
    #[error("$ref {0} does not point into the document")]
    RefNotFound(String),
    #[error("empty schema")]
    EmptySchema,
    #[error("generator {0} needs a schema path")]
    MissingPath(GeneratorKind),
    #[error("path {0} is outside the chart")]
    OutsideChart(String),
    #[error("generator {0} needs a chart")]
    MissingChart(GeneratorKind),
    #[error("{0}")]
    Chart(#[from] crate::repos::Error),
}

fn list_failures(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(path, err)| format!("\t{path}: {err}\n"))
        .collect()
}

/// `type` may be a single name or a list of names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaType {
    Single(String),
    Multiple(Vec<String>),
}

impl SchemaType {
    fn names(&self) -> &[String] {
        match self {
            Self::Single(name) => std::slice::from_ref(name),
            Self::Multiple(names) => names,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdditionalProperties {
    Allowed(bool),
    Schema(Box<Schema>),
}

/// The subset of JSON Schema that values schemas use.
///
/// Keywords without a field are kept verbatim in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "$id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "$ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pattern_properties: BTreeMap<String, Schema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<AdditionalProperties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_of: Vec<Schema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub definitions: BTreeMap<String, Schema>,
    #[serde(rename = "$defs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defs: BTreeMap<String, Schema>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Schema {
    /// A schema of a single type.
    pub fn of_type(name: &str) -> Self {
        Self {
            schema_type: Some(SchemaType::Single(name.to_string())),
            ..Self::default()
        }
    }

    /// Check type names throughout the tree.
    pub fn validate(&self) -> Result<(), Error> {
        self.validate_at("#")
    }

    fn validate_at(&self, path: &str) -> Result<(), Error> {
        if let Some(schema_type) = &self.schema_type {
            if schema_type.names().is_empty() {
                return Err(Error::Invalid {
                    path: path.to_string(),
                    message: "empty type list".to_string(),
                });
            }
            for name in schema_type.names() {
                if !TYPE_NAMES.contains(&name.as_str()) {
                    return Err(Error::Invalid {
                        path: path.to_string(),
                        message: format!("unknown type {name:?}"),
                    });
                }
            }
        }

        for (keyword, child) in self.children() {
            child.validate_at(&format!("{path}/{keyword}"))?;
        }
        Ok(())
    }

    /// Every directly nested schema with its JSON pointer suffix.
    fn children(&self) -> Vec<(String, &Self)> {
        let mut children: Vec<(String, &Self)> = Vec::new();
        let maps = [
            ("properties", &self.properties),
            ("patternProperties", &self.pattern_properties),
            ("definitions", &self.definitions),
            ("$defs", &self.defs),
        ];
        for (keyword, map) in maps {
            for (name, child) in map {
                children.push((format!("{keyword}/{name}"), child));
            }
        }
        let lists = [
            ("anyOf", &self.any_of),
            ("oneOf", &self.one_of),
            ("allOf", &self.all_of),
        ];
        for (keyword, list) in lists {
            for (i, child) in list.iter().enumerate() {
                children.push((format!("{keyword}/{i}"), child));
            }
        }
        if let Some(AdditionalProperties::Schema(child)) = &self.additional_properties {
            children.push(("additionalProperties".to_string(), child));
        }
        if let Some(child) = &self.items {
            children.push(("items".to_string(), child));
        }
        if let Some(child) = &self.not {
            children.push(("not".to_string(), child));
        }
        children
    }

    /// Mutable access to every directly nested schema.
    fn children_mut(&mut self) -> Vec<&mut Self> {
        let mut children: Vec<&mut Self> = Vec::new();
        children.extend(self.properties.values_mut());
        children.extend(self.pattern_properties.values_mut());
        children.extend(self.definitions.values_mut());
        children.extend(self.defs.values_mut());
        children.extend(self.any_of.iter_mut());
        children.extend(self.one_of.iter_mut());
        children.extend(self.all_of.iter_mut());
        if let Some(AdditionalProperties::Schema(child)) = &mut self.additional_properties {
            children.push(child);
        }
        if let Some(child) = &mut self.items {
            children.push(child);
        }
        if let Some(child) = &mut self.not {
            children.push(child);
        }
        children
    }

    /// Fold `other` into `self`. Whatever `self` already defines wins.
    ///
    /// Nested schemas are merged recursively and `required` becomes the union
    /// of both lists. Merging the same document twice is the same as merging
    /// it once.
    pub fn merge(&mut self, other: &Self) {
        fill(&mut self.schema, &other.schema);
        fill(&mut self.id, &other.id);
        fill(&mut self.reference, &other.reference);
        fill(&mut self.schema_type, &other.schema_type);
        fill(&mut self.title, &other.title);
        fill(&mut self.description, &other.description);
        fill(&mut self.default, &other.default);
        fill(&mut self.enum_values, &other.enum_values);

        merge_maps(&mut self.properties, &other.properties);
        merge_maps(&mut self.pattern_properties, &other.pattern_properties);
        merge_maps(&mut self.definitions, &other.definitions);
        merge_maps(&mut self.defs, &other.defs);

        if let Some(AdditionalProperties::Schema(mine)) = self.additional_properties.as_mut()
            && let Some(AdditionalProperties::Schema(theirs)) = &other.additional_properties
        {
            mine.merge(theirs);
        } else {
            fill(&mut self.additional_properties, &other.additional_properties);
        }
        merge_boxed(&mut self.items, other.items.as_deref());
        merge_boxed(&mut self.not, other.not.as_deref());

        for name in &other.required {
            if !self.required.contains(name) {
                self.required.push(name.clone());
            }
        }
        for list in [
            (&mut self.any_of, &other.any_of),
            (&mut self.one_of, &other.one_of),
            (&mut self.all_of, &other.all_of),
        ] {
            if list.0.is_empty() {
                list.0.clone_from(list.1);
            }
        }

        for (key, value) in &other.extra {
            self.extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

fn fill<T: Clone>(mine: &mut Option<T>, theirs: &Option<T>) {
    if mine.is_none() {
        mine.clone_from(theirs);
    }
}

fn merge_boxed(mine: &mut Option<Box<Schema>>, theirs: Option<&Schema>) {
    let Some(theirs) = theirs else {
        return;
    };
    if let Some(mine) = mine.as_mut() {
        mine.merge(theirs);
    } else {
        *mine = Some(Box::new(theirs.clone()));
    }
}

fn merge_maps(mine: &mut BTreeMap<String, Schema>, theirs: &BTreeMap<String, Schema>) {
    for (name, schema) in theirs {
        match mine.get_mut(name) {
            Some(existing) => existing.merge(schema),
            None => {
                let mut merged = Schema::default();
                merged.merge(schema);
                mine.insert(name.clone(), merged);
            }
        }
    }
}
