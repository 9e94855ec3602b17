//! Component registry.
//!
//! Registration only checks the shape of its input. Whether the build
//! context and specification exist is found out when they are first used.

use std::path::Path;

use kiln_core::{ComponentType, Specification, validate_component_id};
use kiln_state::{Component, StateError, StateStore};
use tracing::info;

use crate::epoch_secs;
use crate::error::{LifecycleError, LifecycleResult};

#[derive(Clone)]
pub struct ComponentRegistry {
    state: StateStore,
}

impl ComponentRegistry {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Register a component. IDs are unique; an existing registration is
    /// never replaced.
    pub fn add_component(
        &self,
        id: &str,
        component_type: &str,
        component_path: &str,
        specification_path: &str,
    ) -> LifecycleResult<Component> {
        let component_type: ComponentType = component_type.parse()?;
        validate_component_id(id)?;
        for (name, value) in [
            ("component path", component_path),
            ("specification path", specification_path),
        ] {
            if value.trim().is_empty() {
                return Err(LifecycleError::Validation(format!("{name} must not be empty")));
            }
            if value.contains('\0') {
                return Err(LifecycleError::Validation(format!(
                    "{name} contains a NUL byte"
                )));
            }
        }

        let component = Component {
            id: id.to_string(),
            component_type,
            component_path: component_path.to_string(),
            specification_path: specification_path.to_string(),
            created_at: epoch_secs(),
        };
        match self.state.insert_component(&component) {
            Ok(()) => {}
            Err(StateError::AlreadyExists { .. }) => {
                return Err(LifecycleError::DuplicateId(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        info!(component_id = %id, %component_type, "component registered");
        Ok(component)
    }

    pub fn get_component(&self, id: &str) -> LifecycleResult<Component> {
        self.state
            .get_component(id)?
            .ok_or_else(|| LifecycleError::not_found("component", id))
    }

    pub fn list_components(&self) -> LifecycleResult<Vec<Component>> {
        Ok(self.state.list_components()?)
    }

    /// Read and parse the component's specification document.
    pub fn specification(&self, id: &str) -> LifecycleResult<Specification> {
        let component = self.get_component(id)?;
        read_specification(&component)
    }
}

pub(crate) fn read_specification(component: &Component) -> LifecycleResult<Specification> {
    Specification::from_file(Path::new(&component.specification_path)).map_err(|source| {
        LifecycleError::Specification {
            component_id: component.id.clone(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn registry() -> ComponentRegistry {
        ComponentRegistry::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn add_and_get() {
        let registry = registry();
        let added = registry
            .add_component("etl", "task", "/src/etl", "/src/etl/component.json")
            .unwrap();
        assert_eq!(added.component_type, ComponentType::Task);

        let fetched = registry.get_component("etl").unwrap();
        assert_eq!(fetched, added);
        assert_eq!(registry.list_components().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_id_is_a_conflict_and_keeps_original() {
        let registry = registry();
        registry
            .add_component("etl", "task", "/src/etl", "/src/etl/component.json")
            .unwrap();

        let err = registry
            .add_component("etl", "service", "/other", "/other/component.json")
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateId(ref id) if id == "etl"));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let kept = registry.get_component("etl").unwrap();
        assert_eq!(kept.component_type, ComponentType::Task);
        assert_eq!(kept.component_path, "/src/etl");
    }

    #[test]
    fn rejects_unknown_type() {
        let registry = registry();
        let err = registry
            .add_component("etl", "cronjob", "/src", "/src/c.json")
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidType(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(registry.list_components().unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_ids_and_paths() {
        let registry = registry();
        for id in ["", "ETL", "-etl", "has space"] {
            let err = registry
                .add_component(id, "task", "/src", "/src/c.json")
                .unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidId(_)), "{id:?}");
        }
        let err = registry.add_component("etl", "task", "  ", "/src/c.json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = registry.add_component("etl", "task", "/src", "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn paths_are_not_checked_at_registration() {
        let registry = registry();
        registry
            .add_component("etl", "task", "/nonexistent/src", "/nonexistent/c.json")
            .unwrap();

        let err = registry.specification("etl").unwrap_err();
        assert!(matches!(err, LifecycleError::Specification { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn reads_specification() {
        let dir = tempfile::tempdir().unwrap();
        let spec_path = dir.path().join("component.json");
        std::fs::write(
            &spec_path,
            r#"{"run": {"mountpoints": [{"mountpoint": "/out"}], "env": {"A": "1"}}}"#,
        )
        .unwrap();

        let registry = registry();
        registry
            .add_component(
                "etl",
                "task",
                dir.path().to_str().unwrap(),
                spec_path.to_str().unwrap(),
            )
            .unwrap();

        let spec = registry.specification("etl").unwrap();
        assert!(spec.declares("/out"));
        assert_eq!(spec.env["A"], "1");
    }

    #[test]
    fn missing_component() {
        let err = registry().get_component("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
