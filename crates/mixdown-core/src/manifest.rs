//! Service manifests: what each worker service can run, and how its
//! parameters are typed and bounded.
//!
//! Manifests are authored by the operators of the worker fleet and loaded
//! at orchestrator startup. The validator checks every submitted step
//! against them; the dispatcher reads the deterministic/TTL/timeout hints.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Float,
    Boolean,
}

/// Descriptor for one command flag of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}

/// One executable program a service exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamSpec>,
    /// Deterministic operations are eligible for result caching.
    #[serde(default)]
    pub deterministic: bool,
    /// Cache entry lifetime for deterministic operations.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Per-step execution timeout; clamped by the orchestrator's global
    /// ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// The operation's outputs are indexed collections; a consumer bound
    /// to such an output is fanned out, one instance per element. Fan-out
    /// never happens without this flag.
    #[serde(default)]
    pub emits_collection: bool,
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub service: String,
    pub operations: BTreeMap<String, OperationSpec>,
}

/// All manifests known to this orchestrator, keyed by service name.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    services: BTreeMap<String, ServiceManifest>,
}

impl ManifestSet {
    pub fn new(manifests: Vec<ServiceManifest>) -> Self {
        let services = manifests
            .into_iter()
            .map(|m| (m.service.clone(), m))
            .collect();
        Self { services }
    }

    /// Load manifests from a YAML file (a list) or a directory of YAML
    /// files (one service each).
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut manifests = Vec::new();
        if path.is_dir() {
            let mut entries: Vec<_> = fs::read_dir(path)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yml") | Some("yaml")
                    )
                })
                .collect();
            entries.sort();
            for entry in entries {
                let content = fs::read_to_string(&entry)?;
                let manifest: ServiceManifest = serde_yaml::from_str(&content)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                manifests.push(manifest);
            }
        } else {
            let content = fs::read_to_string(path)?;
            let list: Vec<ServiceManifest> = serde_yaml::from_str(&content)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            manifests = list;
        }
        Ok(Self::new(manifests))
    }

    pub fn service(&self, name: &str) -> Option<&ServiceManifest> {
        self.services.get(name)
    }

    pub fn operation(&self, service: &str, program: &str) -> Option<&OperationSpec> {
        self.services.get(service)?.operations.get(program)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(|s| s.as_str())
    }
}
