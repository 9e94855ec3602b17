//! Component specification reader.
//!
//! A specification document declares how a component's image is run:
//!
//! ```json
//! {
//!   "run": {
//!     "mountpoints": [{ "mountpoint": "/kiln/outputs/outputs.txt" }],
//!     "env": { "MY_ENV": "hello" }
//!   }
//! }
//! ```
//!
//! Documents are JSON by default; files ending in `.toml` are read as TOML.
//! Sections other than `run` are ignored.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type SpecResult<T> = Result<T, SpecError>;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read specification {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed specification: {0}")]
    Malformed(String),

    #[error("duplicate mountpoint in specification: {0}")]
    DuplicateMountpoint(String),

    #[error("invalid mountpoint {0:?}: must be a non-empty absolute container path")]
    InvalidMountpoint(String),
}

/// A container-side path that may be bound to a host source at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mountpoint {
    pub mountpoint: String,
}

/// Parsed run contract of a component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Specification {
    /// Declared mountpoints, in document order. Container paths are unique.
    pub mountpoints: Vec<Mountpoint>,
    /// Environment passed to every execution.
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct Document {
    run: RunSection,
}

#[derive(Deserialize)]
struct RunSection {
    #[serde(default)]
    mountpoints: Vec<Mountpoint>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl Specification {
    /// Read a specification file, choosing the format from its extension.
    pub fn from_file(path: &Path) -> SpecResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("yaml" | "yml") => Err(SpecError::Malformed(format!(
                "{}: YAML specifications are not supported, use JSON or TOML",
                path.display()
            ))),
            _ => Self::from_json_str(&content),
        }
    }

    /// Read a JSON specification from an open stream.
    pub fn from_reader<R: Read>(reader: R) -> SpecResult<Self> {
        let doc: Document =
            serde_json::from_reader(reader).map_err(|e| SpecError::Malformed(e.to_string()))?;
        Self::from_document(doc)
    }

    pub fn from_json_str(s: &str) -> SpecResult<Self> {
        let doc: Document =
            serde_json::from_str(s).map_err(|e| SpecError::Malformed(e.to_string()))?;
        Self::from_document(doc)
    }

    pub fn from_toml_str(s: &str) -> SpecResult<Self> {
        let doc: Document = toml::from_str(s).map_err(|e| SpecError::Malformed(e.to_string()))?;
        Self::from_document(doc)
    }

    fn from_document(doc: Document) -> SpecResult<Self> {
        let mut seen = HashSet::new();
        for mp in &doc.run.mountpoints {
            if !mp.mountpoint.starts_with('/') {
                return Err(SpecError::InvalidMountpoint(mp.mountpoint.clone()));
            }
            if !seen.insert(mp.mountpoint.as_str()) {
                return Err(SpecError::DuplicateMountpoint(mp.mountpoint.clone()));
            }
        }
        Ok(Self {
            mountpoints: doc.run.mountpoints,
            env: doc.run.env,
        })
    }

    /// Whether `target` is a declared mountpoint.
    pub fn declares(&self, target: &str) -> bool {
        self.mountpoints.iter().any(|m| m.mountpoint == target)
    }
}
