// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! `$ref` dereferencing.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::{Error, Schema};

/// The document a schema node was read from.
struct Document<'a> {
    /// Identity used to detect cycles. Empty for the root document.
    name: String,
    root: &'a Value,
    /// Directory that relative file references resolve against.
    base: Option<&'a Path>,
}

/// Replace every `$ref` below `schema` with the schema it points to.
///
/// Pointers into the same document (`#/...`) and relative files, with an
/// optional fragment, are inlined. The referring node's own keywords take
/// precedence over the inlined ones. A reference that leads back to a schema
/// already being inlined is left in place.
pub fn resolve(schema: &mut Schema, root: &Value, base: Option<&Path>) -> Result<(), Error> {
    let doc = Document {
        name: String::new(),
        root,
        base,
    };
    resolve_node(schema, &doc, &mut Vec::new())
}

fn resolve_node(schema: &mut Schema, doc: &Document, stack: &mut Vec<String>) -> Result<(), Error> {
    for child in schema.children_mut() {
        resolve_node(child, doc, stack)?;
    }

    let Some(reference) = schema.reference.clone() else {
        return Ok(());
    };

    let (file, fragment) = reference.split_once('#').unwrap_or((reference.as_str(), ""));
    if file.starts_with("http://") || file.starts_with("https://") {
        return Err(Error::RemoteRef(reference));
    }

    if file.is_empty() {
        let key = format!("{}#{fragment}", doc.name);
        if stack.contains(&key) {
            debug!(reference, "leaving recursive reference in place");
            return Ok(());
        }
        let target = lookup(doc.root, fragment, &reference)?;
        stack.push(key);
        let result = inline(schema, target, doc, stack);
        stack.pop();
        return result;
    }

    let Some(base) = doc.base else {
        return Err(Error::NoBase(reference));
    };
    let path = base.join(file);
    let key = format!("{}#{fragment}", path.display());
    if stack.contains(&key) {
        debug!(reference, "leaving recursive reference in place");
        return Ok(());
    }

    let data = std::fs::read(&path).map_err(|e| Error::Io(path.clone(), e))?;
    let root: Value = serde_yml::from_slice(&data).map_err(Error::Yaml)?;
    let target = lookup(&root, fragment, &reference)?;
    let parent = path.parent().map(PathBuf::from);
    let external = Document {
        name: path.display().to_string(),
        root: &root,
        base: parent.as_deref(),
    };

    stack.push(key);
    let result = inline(schema, target, &external, stack);
    stack.pop();
    result
}

fn inline(
    schema: &mut Schema,
    target: &Value,
    doc: &Document,
    stack: &mut Vec<String>,
) -> Result<(), Error> {
    let mut target: Schema = serde_json::from_value(target.clone())?;
    resolve_node(&mut target, doc, stack)?;

    schema.reference = None;
    schema.merge(&target);
    Ok(())
}

fn lookup<'a>(root: &'a Value, fragment: &str, reference: &str) -> Result<&'a Value, Error> {
    if fragment.is_empty() {
        return Ok(root);
    }
    root.pointer(fragment)
        .ok_or_else(|| Error::RefNotFound(reference.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    fn resolved(doc: &Value, base: Option<&Path>) -> Result<Schema, Error> {
        let mut schema: Schema = serde_json::from_value(doc.clone()).unwrap();
        resolve(&mut schema, doc, base)?;
        Ok(schema)
    }

    #[test]
    fn test_internal_pointer() {
        let doc = json!({
            "type": "object",
            "properties": {
                "image": {"$ref": "#/definitions/image", "description": "main image"}
            },
            "definitions": {
                "image": {
                    "type": "object",
                    "description": "an image",
                    "properties": {"tag": {"type": "string"}}
                }
            }
        });
        let schema = resolved(&doc, None).unwrap();
        let image = &schema.properties["image"];
        assert_eq!(image.reference, None);
        assert_eq!(image.description.as_deref(), Some("main image"));
        assert_eq!(image.properties["tag"], Schema::of_type("string"));
    }

    #[test]
    fn test_external_file_with_fragment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("common")).unwrap();
        std::fs::write(
            dir.path().join("common/defs.yaml"),
            "definitions:\n  port:\n    $ref: '#/definitions/number'\n  number:\n    type: integer\n",
        )
        .unwrap();

        let doc = json!({
            "type": "object",
            "properties": {"port": {"$ref": "common/defs.yaml#/definitions/port"}}
        });
        let schema = resolved(&doc, Some(dir.path())).unwrap();
        assert_eq!(schema.properties["port"], Schema::of_type("integer"));
    }

    #[test]
    fn test_recursive_reference_is_kept() {
        let doc = json!({
            "type": "object",
            "properties": {"node": {"$ref": "#/definitions/node"}},
            "definitions": {
                "node": {
                    "type": "object",
                    "properties": {"next": {"$ref": "#/definitions/node"}}
                }
            }
        });
        let schema = resolved(&doc, None).unwrap();
        let node = &schema.properties["node"];
        assert_eq!(node.reference, None);
        assert_eq!(
            node.properties["next"].reference.as_deref(),
            Some("#/definitions/node")
        );
    }

    #[test]
    fn test_rejected_references() {
        let remote = json!({"properties": {"a": {"$ref": "https://example.com/s.json"}}});
        assert!(matches!(resolved(&remote, None), Err(Error::RemoteRef(_))));

        let dangling = json!({"properties": {"a": {"$ref": "#/definitions/missing"}}});
        assert!(matches!(resolved(&dangling, None), Err(Error::RefNotFound(_))));

        let file = json!({"properties": {"a": {"$ref": "other.json"}}});
        assert!(matches!(resolved(&file, None), Err(Error::NoBase(_))));
    }
}
