//! Repository path of a manifest
//!
//! `[<rootPath>/]<namespace>/<group>/<version>/<resource>/<name>.yaml`, empty
//! segments skipped (core group, cluster-scoped objects, no root path).

use crate::ResourceRef;

const FORBIDDEN: &[char] = &[':', '*', '?', '"', '<', '>', '|', '\\'];

/// Build and validate the path of `resource` under `root_path`
pub fn resource_path(root_path: Option<&str>, resource: &ResourceRef) -> Result<String, String> {
    let file_name = format!("{}.yaml", resource.name);
    let mut raw: Vec<&str> = Vec::new();
    if let Some(root) = root_path {
        raw.extend(root.split('/'));
    }
    if let Some(ns) = resource.namespace.as_deref() {
        raw.push(ns);
    }
    raw.extend([
        resource.group.as_str(),
        resource.version.as_str(),
        resource.resource.as_str(),
        file_name.as_str(),
    ]);
    clean(&raw)
}

/// Validate an already formed repository path, as reported by the ResourceFinder
pub fn validate_path(path: &str) -> Result<String, String> {
    let segments: Vec<&str> = path.split('/').collect();
    clean(&segments)
}

fn clean(segments: &[&str]) -> Result<String, String> {
    let mut out: Vec<&str> = Vec::with_capacity(segments.len());
    for segment in segments {
        match *segment {
            "" | "." => continue,
            ".." => return Err("path must not contain '..'".to_string()),
            s if s.contains(FORBIDDEN) => {
                return Err(format!(
                    "path segment {:?} contains one of the forbidden characters : * ? \" < > | \\",
                    s
                ))
            }
            s => out.push(s),
        }
    }
    if out.is_empty() {
        return Err("empty path".to_string());
    }
    Ok(out.join("/"))
}
