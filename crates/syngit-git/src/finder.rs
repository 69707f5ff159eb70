//! ResourceFinder: locate an existing manifest for an object
//!
//! Repositories that predate syngit keep manifests wherever their authors put
//! them, often several per file. When the finder is enabled the engine edits
//! the document that already describes the object instead of creating a second
//! copy at the constructed path.

use git2::{ObjectType, Repository, Tree, TreeWalkMode, TreeWalkResult};
use serde_json::Value;
use syngit_common::kube_utils::pluralize_kind;
use syngit_common::yaml::parse_yaml;
use tracing::debug;

use crate::ResourceRef;

/// An existing document describing the object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundDocument {
    /// Path of the file inside the repository
    pub path: String,
    /// Every document of the file, in order
    pub documents: Vec<String>,
    /// Index of the matching document
    pub index: usize,
}

impl FoundDocument {
    /// File content with the matching document replaced by `yaml`, or dropped when `yaml` is empty
    ///
    /// Returns `None` when no document would remain.
    pub fn replace(&self, yaml: &str) -> Option<String> {
        let mut documents = self.documents.clone();
        if yaml.is_empty() {
            documents.remove(self.index);
        } else {
            documents[self.index] = yaml.to_string();
        }
        if documents.is_empty() {
            return None;
        }
        Some(join_documents(&documents))
    }
}

/// Search `root` for a YAML document describing `resource`
///
/// Files are visited in path order; the first match wins. Unparseable files
/// are skipped.
pub fn find_document(
    repo: &Repository,
    root: &Tree<'_>,
    resource: &ResourceRef,
) -> Result<Option<FoundDocument>, git2::Error> {
    let mut candidates = Vec::new();
    root.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                if name.ends_with(".yaml") || name.ends_with(".yml") {
                    candidates.push((format!("{}{}", dir, name), entry.id()));
                }
            }
        }
        TreeWalkResult::Ok
    })?;
    candidates.sort();

    let api_version = resource.api_version();
    for (path, oid) in candidates {
        let blob = repo.find_blob(oid)?;
        let Ok(text) = std::str::from_utf8(blob.content()) else {
            continue;
        };
        let documents = split_documents(text);
        for (index, doc) in documents.iter().enumerate() {
            let Ok(value) = parse_yaml(doc) else {
                continue;
            };
            if describes(&value, &api_version, resource) {
                debug!(path = %path, index, "found existing manifest");
                return Ok(Some(FoundDocument {
                    path,
                    documents,
                    index,
                }));
            }
        }
    }
    Ok(None)
}

fn describes(doc: &Value, api_version: &str, resource: &ResourceRef) -> bool {
    let field = |pointer: &str| doc.pointer(pointer).and_then(Value::as_str);

    if field("/apiVersion") != Some(api_version) {
        return false;
    }
    match field("/kind") {
        Some(kind) if pluralize_kind(kind) == resource.resource => {}
        _ => return false,
    }
    if field("/metadata/name") != Some(resource.name.as_str()) {
        return false;
    }
    match (field("/metadata/namespace"), resource.namespace.as_deref()) {
        (Some(found), Some(expected)) => found == expected,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

/// Split a multi-document YAML file on `---` separator lines
///
/// Blank documents are dropped.
pub fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            push_document(&mut documents, &mut current);
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    push_document(&mut documents, &mut current);
    documents
}

fn push_document(documents: &mut Vec<String>, current: &mut String) {
    let doc = std::mem::take(current);
    if !doc.trim().is_empty() {
        documents.push(doc);
    }
}

fn join_documents(documents: &[String]) -> String {
    let mut out = String::new();
    for (i, doc) in documents.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(doc);
        if !doc.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
