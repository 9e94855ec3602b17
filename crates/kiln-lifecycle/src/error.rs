//! Lifecycle error types.

use std::fmt;

use kiln_core::{InvalidComponentId, SpecError, UnknownComponentType};
use kiln_runtime::RuntimeError;
use kiln_state::StateError;
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Coarse classification of a [`LifecycleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: bad type or ID, bad specification, bad mount map.
    Validation,
    /// A referenced component, build or execution does not exist.
    NotFound,
    /// Duplicate component ID, or a build already running under fail-fast.
    Conflict,
    /// A container runtime call failed.
    Runtime,
    /// A state store read or write failed.
    Persistence,
    /// A mount names a container path the specification does not declare.
    UnknownMountTarget,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Persistence => "persistence",
            ErrorKind::UnknownMountTarget => "unknown_mount_target",
        };
        f.write_str(s)
    }
}

/// Errors returned by the registry and the build and execution managers.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    InvalidType(#[from] UnknownComponentType),

    #[error(transparent)]
    InvalidId(#[from] InvalidComponentId),

    #[error("{0}")]
    Validation(String),

    #[error("component {component_id}: {source}")]
    Specification {
        component_id: String,
        #[source]
        source: SpecError,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("component already exists: {0}")]
    DuplicateId(String),

    #[error("a build of component {0} is already in progress")]
    BuildInProgress(String),

    #[error("build {tag} of component {component_id} failed: {source}")]
    BuildFailed {
        component_id: String,
        tag: String,
        #[source]
        source: RuntimeError,
    },

    #[error("mount target {target} is not declared by component {component_id}")]
    UnknownMountTarget { component_id: String, target: String },

    #[error("runtime error{}: {source}", fmt_resource(.resource))]
    Runtime {
        resource: Option<String>,
        #[source]
        source: RuntimeError,
    },

    #[error("state store error{}: {source}", fmt_resource(.resource))]
    Persistence {
        resource: Option<String>,
        #[source]
        source: StateError,
    },
}

fn fmt_resource(resource: &Option<String>) -> String {
    match resource {
        Some(r) => format!(" (left behind: {r})"),
        None => String::new(),
    }
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::InvalidType(_)
            | LifecycleError::InvalidId(_)
            | LifecycleError::Validation(_)
            | LifecycleError::Specification { .. } => ErrorKind::Validation,
            LifecycleError::NotFound { .. } => ErrorKind::NotFound,
            LifecycleError::DuplicateId(_) | LifecycleError::BuildInProgress(_) => {
                ErrorKind::Conflict
            }
            LifecycleError::BuildFailed { .. } | LifecycleError::Runtime { .. } => {
                ErrorKind::Runtime
            }
            LifecycleError::Persistence { .. } => ErrorKind::Persistence,
            LifecycleError::UnknownMountTarget { .. } => ErrorKind::UnknownMountTarget,
        }
    }

    /// Image tag or container ID the failed operation may have left in the
    /// runtime, for manual cleanup or retry.
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            LifecycleError::BuildFailed { tag, .. } => Some(tag),
            LifecycleError::Runtime { resource, .. }
            | LifecycleError::Persistence { resource, .. } => resource.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        LifecycleError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn runtime(resource: Option<&str>, source: RuntimeError) -> Self {
        LifecycleError::Runtime {
            resource: resource.map(str::to_string),
            source,
        }
    }

    pub(crate) fn persistence(resource: Option<&str>, source: StateError) -> Self {
        LifecycleError::Persistence {
            resource: resource.map(str::to_string),
            source,
        }
    }
}

impl From<StateError> for LifecycleError {
    fn from(source: StateError) -> Self {
        LifecycleError::Persistence {
            resource: None,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            LifecycleError::DuplicateId("etl".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            LifecycleError::from(UnknownComponentType("job".into())).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            LifecycleError::not_found("build", "kiln/etl:9").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            LifecycleError::from(StateError::Write("disk full".into())).kind(),
            ErrorKind::Persistence
        );
    }

    #[test]
    fn resource_id_and_message() {
        let err = LifecycleError::persistence(
            Some("kiln/etl:3"),
            StateError::Write("disk full".into()),
        );
        assert_eq!(err.resource_id(), Some("kiln/etl:3"));
        assert_eq!(
            err.to_string(),
            "state store error (left behind: kiln/etl:3): write error: disk full"
        );

        let err = LifecycleError::runtime(None, RuntimeError::Rejected("no".into()));
        assert_eq!(err.resource_id(), None);
        assert_eq!(err.to_string(), "runtime error: request rejected by runtime: no");
    }
}
