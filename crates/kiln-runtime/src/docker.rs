//! Docker engine driver built on the `docker` command-line client.
//!
//! Each operation runs one `docker` child process:
//!
//! | operation           | command                                            |
//! |---------------------|----------------------------------------------------|
//! | `build_image`       | `docker build --tag <tag> <context>`               |
//! | `tag_image`         | `docker image tag <source> <target>`               |
//! | `inspect_image`     | `docker image inspect <ref>`                       |
//! | `remove_image`      | `docker image rm [--force] <ref>`                  |
//! | `create_container`  | `docker container create [--env …] [--mount …] …`  |
//! | `start_container`   | `docker container start <id>`                      |
//! | `wait_container`    | `docker container wait <id>`                       |
//! | `inspect_container` | `docker container inspect <id>`                    |
//! | `remove_container`  | `docker container rm [--force] <id>`               |
//!
//! Children are spawned with `kill_on_drop`, so dropping an operation's
//! future stops the client. Any compatible client (e.g. `podman`) can be
//! used via [`DockerCli::new`].

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};
use crate::log::LineSink;
use crate::{BindMount, ContainerConfig, ContainerInfo, ContainerRuntime, ContainerStatus, ImageInfo};

/// Lines of build output kept for the error message of a failed build.
const BUILD_ERROR_TAIL: usize = 20;

/// Runtime backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run a command to completion and return its trimmed stdout.
    async fn run<I, S>(&self, args: I) -> RuntimeResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let rendered = render_command(&self.bin, &args);
        debug!(command = %rendered, "running");

        let output = self
            .command(&args)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: self.bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: rendered,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ContainerRuntime for DockerCli {
    async fn build_image<W>(&self, context: &Path, tag: &str, log: &mut W) -> RuntimeResult<String>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let args = build_args(context, tag);
        let rendered = render_command(&self.bin, &args);
        debug!(command = %rendered, "running");

        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                program: self.bin.clone(),
                source,
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        } else {
            drop(tx);
        }

        let mut sink = LineSink::new(log);
        let mut tail = VecDeque::with_capacity(BUILD_ERROR_TAIL);
        while let Some(line) = rx.recv().await {
            sink.write_line(&line).await;
            if tail.len() == BUILD_ERROR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await.map_err(|source| RuntimeError::Spawn {
            program: self.bin.clone(),
            source,
        })?;
        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: rendered,
                code: status.code(),
                stderr: Vec::from(tail).join("\n"),
            });
        }

        let image = self.inspect_image(tag).await?;
        Ok(image.id)
    }

    async fn tag_image(&self, source: &str, target: &str) -> RuntimeResult<()> {
        self.run(["image", "tag", source, target])
            .await
            .map_err(|e| not_found(e, "image", source))?;
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> RuntimeResult<ImageInfo> {
        let command = format!("{} image inspect {reference}", self.bin);
        let stdout = self
            .run(["image", "inspect", reference])
            .await
            .map_err(|e| not_found(e, "image", reference))?;
        parse_image_inspect(&command, &stdout)
    }

    async fn remove_image(&self, reference: &str, force: bool) -> RuntimeResult<()> {
        let mut args = vec!["image", "rm"];
        if force {
            args.push("--force");
        }
        args.push(reference);
        self.run(args)
            .await
            .map_err(|e| not_found(e, "image", reference))?;
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> RuntimeResult<String> {
        let command = format!("{} container create", self.bin);
        let stdout = self
            .run(create_args(config))
            .await
            .map_err(|e| not_found(e, "image", &config.image))?;
        // Pull progress may precede the ID; the ID is always the last line.
        stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::Output {
                command,
                message: "no container ID printed".to_string(),
            })
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.run(["container", "start", id])
            .await
            .map_err(|e| not_found(e, "container", id))?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        let stdout = self
            .run(["container", "wait", id])
            .await
            .map_err(|e| not_found(e, "container", id))?;
        stdout.trim().parse::<i64>().map_err(|e| RuntimeError::Output {
            command: format!("{} container wait {id}", self.bin),
            message: format!("exit code {stdout:?}: {e}"),
        })
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInfo> {
        let command = format!("{} container inspect {id}", self.bin);
        let stdout = self
            .run(["container", "inspect", id])
            .await
            .map_err(|e| not_found(e, "container", id))?;
        parse_container_inspect(&command, &stdout)
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let mut args = vec!["container", "rm"];
        if force {
            args.push("--force");
        }
        args.push(id);
        self.run(args)
            .await
            .map_err(|e| not_found(e, "container", id))?;
        Ok(())
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

/// Turn "No such image/container" failures into `NotFound`.
fn not_found(err: RuntimeError, kind: &'static str, reference: &str) -> RuntimeError {
    match err {
        RuntimeError::CommandFailed { ref stderr, .. }
            if stderr.contains("No such") || stderr.contains("not found") =>
        {
            RuntimeError::NotFound {
                kind,
                reference: reference.to_string(),
            }
        }
        other => other,
    }
}

fn render_command(bin: &str, args: &[OsString]) -> String {
    let mut rendered = bin.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

pub(crate) fn build_args(context: &Path, tag: &str) -> Vec<OsString> {
    vec![
        "build".into(),
        "--tag".into(),
        tag.into(),
        context.as_os_str().to_os_string(),
    ]
}

pub(crate) fn create_args(config: &ContainerConfig) -> Vec<String> {
    let mut args = vec!["container".to_string(), "create".to_string()];
    for (key, value) in &config.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for mount in &config.mounts {
        args.push("--mount".to_string());
        args.push(mount_spec(mount));
    }
    for (key, value) in &config.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(config.image.clone());
    args.extend(config.command.iter().cloned());
    args
}

/// Render a `--mount` value. The flag takes CSV, so fields holding a comma
/// or quote are quoted.
fn mount_spec(mount: &BindMount) -> String {
    let mut fields = vec![
        "type=bind".to_string(),
        csv_field(&format!("source={}", mount.source)),
        csv_field(&format!("target={}", mount.target)),
    ];
    if mount.read_only {
        fields.push("readonly".to_string());
    }
    fields.join(",")
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainer {
    id: String,
    image: String,
    state: RawContainerState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainerState {
    status: String,
    exit_code: i64,
}

fn parse_image_inspect(command: &str, stdout: &str) -> RuntimeResult<ImageInfo> {
    let raw: Vec<RawImage> = serde_json::from_str(stdout).map_err(|e| RuntimeError::Output {
        command: command.to_string(),
        message: e.to_string(),
    })?;
    let image = raw.into_iter().next().ok_or_else(|| RuntimeError::Output {
        command: command.to_string(),
        message: "empty inspect result".to_string(),
    })?;
    Ok(ImageInfo {
        id: image.id,
        repo_tags: image.repo_tags.unwrap_or_default(),
    })
}

fn parse_container_inspect(command: &str, stdout: &str) -> RuntimeResult<ContainerInfo> {
    let raw: Vec<RawContainer> =
        serde_json::from_str(stdout).map_err(|e| RuntimeError::Output {
            command: command.to_string(),
            message: e.to_string(),
        })?;
    let container = raw.into_iter().next().ok_or_else(|| RuntimeError::Output {
        command: command.to_string(),
        message: "empty inspect result".to_string(),
    })?;
    let status = ContainerStatus::parse(&container.state.status);
    let exit_code = (status == ContainerStatus::Exited).then_some(container.state.exit_code);
    Ok(ContainerInfo {
        id: container.id,
        image: container.image,
        status,
        exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn build_args_tag_then_context() {
        let args = build_args(Path::new("components/etl"), "kiln/etl:1");
        assert_eq!(args, ["build", "--tag", "kiln/etl:1", "components/etl"]);
    }

    #[test]
    fn create_args_full() {
        let config = ContainerConfig {
            image: "kiln/etl:1".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            env: BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string()),
            ]),
            mounts: vec![BindMount {
                source: "/tmp/out.txt".to_string(),
                target: "/kiln/out.txt".to_string(),
                read_only: true,
            }],
            labels: BTreeMap::from([("io.kiln.build".to_string(), "kiln/etl:1".to_string())]),
        };
        let args = create_args(&config);
        assert_eq!(
            args,
            [
                "container",
                "create",
                "--env",
                "A=1",
                "--env",
                "B=x=y",
                "--mount",
                "type=bind,source=/tmp/out.txt,target=/kiln/out.txt,readonly",
                "--label",
                "io.kiln.build=kiln/etl:1",
                "kiln/etl:1",
                "sh",
                "-c",
                "echo hi",
            ]
        );
    }

    #[test]
    fn create_args_without_command_ends_with_image() {
        let config = ContainerConfig {
            image: "kiln/etl:1".to_string(),
            ..ContainerConfig::default()
        };
        assert_eq!(create_args(&config), ["container", "create", "kiln/etl:1"]);
    }

    #[test]
    fn mount_spec_quotes_commas() {
        let mount = BindMount {
            source: "/tmp/a,b".to_string(),
            target: "/data".to_string(),
            read_only: false,
        };
        assert_eq!(mount_spec(&mount), "type=bind,\"source=/tmp/a,b\",target=/data");
    }

    #[test]
    fn parse_image_inspect_output() {
        let stdout = r#"[{"Id":"sha256:abc","RepoTags":["kiln/etl:1","kiln/etl:latest"],"Size":42}]"#;
        let info = parse_image_inspect("docker image inspect", stdout).unwrap();
        assert_eq!(info.id, "sha256:abc");
        assert_eq!(info.repo_tags, ["kiln/etl:1", "kiln/etl:latest"]);
    }

    #[test]
    fn parse_image_inspect_null_tags() {
        let stdout = r#"[{"Id":"sha256:abc","RepoTags":null}]"#;
        let info = parse_image_inspect("docker image inspect", stdout).unwrap();
        assert!(info.repo_tags.is_empty());
    }

    #[test]
    fn parse_image_inspect_rejects_garbage() {
        assert!(matches!(
            parse_image_inspect("docker image inspect", "[]"),
            Err(RuntimeError::Output { .. })
        ));
        assert!(matches!(
            parse_image_inspect("docker image inspect", "oops"),
            Err(RuntimeError::Output { .. })
        ));
    }

    #[test]
    fn parse_container_inspect_exited() {
        let stdout = r#"[{"Id":"c0ffee","Image":"sha256:abc",
            "State":{"Status":"exited","Running":false,"ExitCode":3}}]"#;
        let info = parse_container_inspect("docker container inspect", stdout).unwrap();
        assert_eq!(info.id, "c0ffee");
        assert_eq!(info.status, ContainerStatus::Exited);
        assert_eq!(info.exit_code, Some(3));
    }

    #[test]
    fn parse_container_inspect_running_has_no_exit_code() {
        let stdout = r#"[{"Id":"c0ffee","Image":"sha256:abc",
            "State":{"Status":"running","Running":true,"ExitCode":0}}]"#;
        let info = parse_container_inspect("docker container inspect", stdout).unwrap();
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(info.exit_code, None);
    }

    #[test]
    fn no_such_becomes_not_found() {
        let err = RuntimeError::CommandFailed {
            command: "docker image inspect x".to_string(),
            code: Some(1),
            stderr: "Error: No such image: x".to_string(),
        };
        assert!(matches!(
            not_found(err, "image", "x"),
            RuntimeError::NotFound { kind: "image", .. }
        ));

        let err = RuntimeError::CommandFailed {
            command: "docker image inspect x".to_string(),
            code: Some(1),
            stderr: "Cannot connect to the Docker daemon".to_string(),
        };
        assert!(matches!(not_found(err, "image", "x"), RuntimeError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let docker = DockerCli::new("/nonexistent/kiln-test-docker");
        let err = docker.inspect_image("kiln/etl:1").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }
}
