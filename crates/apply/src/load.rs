//! Loading manifests from YAML/JSON template files.

use std::fs;
use std::path::{Path, PathBuf};

use rudder_core::{Error, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::{Manifest, Resource};

fn max_yaml_bytes() -> usize {
    std::env::var("RUDDER_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("RUDDER_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

fn collect_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| Error::manifest(format!("reading {}: {}", dir.display(), e)))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            if recursive {
                collect_files(&path, recursive, out)?;
            }
        } else if is_manifest_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Parse every document of a multi-document YAML (or JSON) text.
/// Empty documents are skipped; `source` only labels errors.
pub fn parse_documents(text: &str, source: &str) -> Result<Vec<Resource>> {
    if text.len() > max_yaml_bytes() {
        return Err(Error::manifest(format!(
            "{}: YAML payload too large (>{} bytes)",
            source,
            max_yaml_bytes()
        )));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(doc)
            .map_err(|e| Error::manifest(format!("{} (document {}): parsing YAML: {}", source, i, e)))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val)
            .map_err(|e| Error::manifest(format!("{} (document {}): converting YAML to JSON: {}", source, i, e)))?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(Error::manifest(format!(
                "{} (document {}): YAML document too complex (>{} nodes)",
                source,
                i,
                max_yaml_nodes()
            )));
        }
        let res = Resource::new(json)
            .map_err(|e| Error::manifest(format!("{} (document {}): {}", source, i, e)))?;
        out.push(res);
    }
    Ok(out)
}

impl Manifest {
    /// Load all manifest files under `path` in lexical order. Subdirectories
    /// are only visited when `recursive` is set. A single file is accepted too.
    pub fn from_path(path: impl AsRef<Path>, recursive: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut files = Vec::new();
        if path.is_dir() {
            collect_files(path, recursive, &mut files)?;
        } else {
            files.push(path.to_path_buf());
        }
        let mut resources = Vec::new();
        for file in files {
            let text = fs::read_to_string(&file)
                .map_err(|e| Error::manifest(format!("reading {}: {}", file.display(), e)))?;
            let docs = parse_documents(&text, &file.display().to_string())?;
            debug!(file = %file.display(), resources = docs.len(), "loaded manifest file");
            resources.extend(docs);
        }
        Ok(Self::new(resources))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(Self::new(parse_documents(text, "<inline>")?))
    }
}
