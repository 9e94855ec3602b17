//! Persisted record types.
//!
//! Records reference each other by ID only (`Execution` → `Build` →
//! `Component`); relations are resolved through the store on demand.

use kiln_core::ComponentType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller-chosen, globally unique component identifier.
pub type ComponentId = String;

/// Image tag assigned to a build; primary key of the builds table.
pub type BuildId = String;

/// Container ID assigned by the runtime; primary key of the executions table.
pub type ExecutionId = String;

// ── Component ─────────────────────────────────────────────────────

/// A registered unit of work. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Component {
    pub id: ComponentId,
    pub component_type: ComponentType,
    /// Build context handed to the image builder.
    pub component_path: String,
    /// Location of the run specification document.
    pub specification_path: String,
    /// Unix timestamp (seconds) of registration.
    pub created_at: u64,
}

// ── Build ─────────────────────────────────────────────────────────

/// An image materialized from a component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Build {
    /// Image tag, e.g. `kiln/etl:3`.
    pub id: BuildId,
    pub component_id: ComponentId,
    /// Build number within the component (the tag suffix).
    pub sequence: u64,
    /// Image identity the tag resolved to when the row was written.
    pub image_id: String,
    /// Unix timestamp (seconds) when the row was written.
    pub created_at: u64,
}

// ── Execution ─────────────────────────────────────────────────────

/// One started container created from a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Execution {
    /// Container ID.
    pub id: ExecutionId,
    pub build_id: BuildId,
    /// Command override; empty means the image's default command.
    pub command: Vec<String>,
    /// Host path → container path.
    pub mounts: BTreeMap<String, String>,
    /// Unix timestamp (seconds) when the container was started.
    pub created_at: u64,
}
