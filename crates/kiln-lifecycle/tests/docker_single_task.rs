//! End-to-end run of the single-task fixture against a real docker engine.
//!
//! Needs a working `docker` client and daemon.
//! Run with: cargo test -p kiln-lifecycle -- --ignored

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_lifecycle::{BuildManager, ComponentRegistry, ExecutionManager};
use kiln_runtime::{ContainerRuntime, DockerCli};
use kiln_state::StateStore;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests")
        .join("fixtures")
        .join("single-task")
}

#[tokio::test]
#[ignore]
async fn single_task_writes_env_to_mounted_file() {
    let fixture = fixture_dir();
    if !fixture.exists() {
        eprintln!("Test fixture not found at {}", fixture.display());
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let state = StateStore::init(&dir.path().join("state")).unwrap();
    let runtime = Arc::new(DockerCli::default());
    let namespace = format!("kiln-test-{}", std::process::id());

    let registry = ComponentRegistry::new(state.clone());
    let builds = BuildManager::new(state.clone(), runtime.clone()).with_namespace(namespace.as_str());
    let executions = ExecutionManager::new(state.clone(), runtime.clone());

    registry
        .add_component(
            "single-task",
            "task",
            fixture.to_str().unwrap(),
            fixture.join("component.json").to_str().unwrap(),
        )
        .unwrap();

    let mut log: Vec<u8> = Vec::new();
    let build = builds.create_build("single-task", &mut log).await.unwrap();
    let latest = runtime
        .inspect_image(&builds.latest_tag("single-task"))
        .await
        .unwrap();
    assert_eq!(latest.id, build.image_id);

    let outputs = dir.path().join("outputs.txt");
    std::fs::write(&outputs, "").unwrap();
    let mounts = BTreeMap::from([(
        outputs.to_str().unwrap().to_string(),
        "/simplex/outputs/outputs.txt".to_string(),
    )]);

    let execution = executions.execute(&build.id, &[], &mounts).await.unwrap();
    let exit_code = runtime.wait_container(&execution.id).await.unwrap();
    assert_eq!(exit_code, 0);

    let content = std::fs::read_to_string(&outputs).unwrap();
    let mut lines = content.split('\n');
    assert_eq!(lines.next(), Some("hello"));
    let rest: Vec<&str> = lines.collect();
    assert!(rest.iter().all(|l| l.is_empty()));
    assert!(rest.len() <= 1);

    runtime.remove_container(&execution.id, true).await.unwrap();
    runtime.remove_image(&builds.latest_tag("single-task"), true).await.unwrap();
}
