use std::collections::BTreeMap;

use anyhow::Context as _;
use kiln_runtime::ContainerRuntime;
use tracing::info;

use super::Context;

pub enum Target {
    Build(String),
    /// Most recent recorded build of a component.
    LatestOf(String),
}

pub struct RunOptions {
    pub mounts: Vec<String>,
    pub wait: bool,
    pub rm: bool,
    pub command: Vec<String>,
}

pub async fn run(ctx: &Context, target: Target, options: RunOptions) -> anyhow::Result<()> {
    let mounts = parse_mounts(&options.mounts)?;
    let runtime = ctx.runtime();

    let execution = {
        let state = ctx.open_state()?;
        let build_id = match target {
            Target::Build(id) => id,
            Target::LatestOf(component_id) => {
                ctx.build_manager(state.clone(), runtime.clone())
                    .latest_build(&component_id)?
                    .id
            }
        };
        let executions = ctx.execution_manager(state, runtime.clone());
        ctx.with_timeout("run", executions.execute(&build_id, &options.command, &mounts))
            .await?
    };
    println!("{}", execution.id);

    if !options.wait {
        return Ok(());
    }

    // Run time is up to the container; no timeout here, and no store
    // handle held while waiting.
    let exit_code = runtime
        .wait_container(&execution.id)
        .await
        .with_context(|| format!("waiting for container {}", execution.id))?;
    info!(container_id = %execution.id, exit_code, "container exited");

    if options.rm {
        runtime
            .remove_container(&execution.id, false)
            .await
            .with_context(|| format!("removing container {}", execution.id))?;
    }
    if exit_code != 0 {
        anyhow::bail!("container {} exited with code {exit_code}", execution.id);
    }
    Ok(())
}

/// Parse `HOST:CONTAINER` pairs into a host → container map. Relative host
/// paths are resolved against the current directory.
fn parse_mounts(raw: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut mounts = BTreeMap::new();
    for entry in raw {
        let (host, container) = entry
            .split_once(':')
            .filter(|(h, c)| !h.is_empty() && !c.is_empty())
            .with_context(|| format!("invalid mount {entry:?}, expected HOST:CONTAINER"))?;
        let host = std::path::absolute(host)
            .with_context(|| format!("invalid host path {host:?}"))?
            .to_string_lossy()
            .into_owned();
        if mounts.insert(host.clone(), container.to_string()).is_some() {
            anyhow::bail!("host path {host} is mounted more than once");
        }
    }
    Ok(mounts)
}
