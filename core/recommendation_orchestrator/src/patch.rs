//! Deterministic patch rendering. Everything here is a pure function of
//! `(target, resources)`, so two recommendations built from identical inputs
//! produce byte-equal patches for the life of the recommendation.

use serde_json::{json, Map, Value};
use shared_types::{ResourceSpec, TargetRef};

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;

/// CPU quantities are always rendered in millicores.
pub fn format_cpu_millicores(millicores: i64) -> String {
    format!("{millicores}m")
}

/// Memory quantities use the largest binary suffix that divides evenly,
/// falling back to raw bytes.
pub fn format_memory_bytes(bytes: i64) -> String {
    if bytes != 0 && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes != 0 && bytes % MIB == 0 {
        format!("{}Mi", bytes / MIB)
    } else if bytes != 0 && bytes % KIB == 0 {
        format!("{}Ki", bytes / KIB)
    } else {
        bytes.to_string()
    }
}

/// The three renderings of one patch. They are built from the same
/// requests/limits maps and therefore always agree on the fields they set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBundle {
    /// Strategic-merge patch, YAML.
    pub yaml: String,
    /// The same strategic-merge patch as compact JSON, for inline apply
    /// commands.
    pub inline_json: String,
    /// RFC 6902 JSON-Patch targeting the container by ordinal.
    pub json_patch: String,
}

fn requests_map(resources: &ResourceSpec) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(mc) = resources.cpu_request_millicores {
        map.insert("cpu".to_string(), Value::String(format_cpu_millicores(mc)));
    }
    if let Some(bytes) = resources.memory_request_bytes {
        map.insert("memory".to_string(), Value::String(format_memory_bytes(bytes)));
    }
    map
}

fn limits_map(resources: &ResourceSpec) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(mc) = resources.cpu_limit_millicores {
        map.insert("cpu".to_string(), Value::String(format_cpu_millicores(mc)));
    }
    if let Some(bytes) = resources.memory_limit_bytes {
        map.insert("memory".to_string(), Value::String(format_memory_bytes(bytes)));
    }
    map
}

fn resources_value(resources: &ResourceSpec) -> Value {
    let mut body = Map::new();
    let requests = requests_map(resources);
    if !requests.is_empty() {
        body.insert("requests".to_string(), Value::Object(requests));
    }
    let limits = limits_map(resources);
    if !limits.is_empty() {
        body.insert("limits".to_string(), Value::Object(limits));
    }
    Value::Object(body)
}

/// Strategic-merge patch setting the container's resources by name. Fields
/// absent from the recommendation are omitted, never emitted empty.
pub fn strategic_merge_value(target: &TargetRef, resources: &ResourceSpec) -> Value {
    json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [
                        {
                            "name": target.container(),
                            "resources": resources_value(resources),
                        }
                    ]
                }
            }
        }
    })
}

/// RFC 6902 operations addressed by container ordinal. `add` upserts, so a
/// workload without an existing `resources` stanza still patches cleanly.
pub fn json_patch_value(container_index: usize, resources: &ResourceSpec) -> Value {
    let mut ops = Vec::new();
    let base = format!("/spec/template/spec/containers/{container_index}/resources");

    let requests = requests_map(resources);
    if !requests.is_empty() {
        ops.push(json!({
            "op": "add",
            "path": format!("{base}/requests"),
            "value": Value::Object(requests),
        }));
    }
    let limits = limits_map(resources);
    if !limits.is_empty() {
        ops.push(json!({
            "op": "add",
            "path": format!("{base}/limits"),
            "value": Value::Object(limits),
        }));
    }

    Value::Array(ops)
}

/// Render the strategic-merge patch as YAML. This is the form stored on the
/// recommendation as `generated_patch`.
pub fn strategic_merge_yaml(target: &TargetRef, resources: &ResourceSpec) -> String {
    // serde_json maps keep sorted keys, so the rendering is stable for
    // identical inputs.
    serde_yaml::to_string(&strategic_merge_value(target, resources))
        .unwrap_or_else(|_| String::new())
}

/// Build all three renderings for one target.
pub fn build_patch_bundle(target: &TargetRef, resources: &ResourceSpec) -> PatchBundle {
    let merge = strategic_merge_value(target, resources);
    PatchBundle {
        yaml: serde_yaml::to_string(&merge).unwrap_or_else(|_| String::new()),
        inline_json: merge.to_string(),
        json_patch: json_patch_value(0, resources).to_string(),
    }
}
