use kiln_runtime::{ContainerInfo, ContainerRuntime};
use kiln_state::Execution;
use serde::Serialize;

use super::{Context, print_json};

pub fn list(ctx: &Context, build_id: Option<&str>) -> anyhow::Result<()> {
    let state = ctx.open_state()?;
    let executions = ctx
        .execution_manager(state, ctx.runtime())
        .list_executions(build_id)?;
    if executions.is_empty() {
        println!("No executions.");
        return Ok(());
    }
    println!("{:<16} {:<48} COMMAND", "CONTAINER", "BUILD");
    for e in executions {
        let short: String = e.id.chars().take(12).collect();
        println!("{:<16} {:<48} {}", short, e.build_id, e.command.join(" "));
    }
    Ok(())
}

#[derive(Serialize)]
struct ExecutionView {
    #[serde(flatten)]
    execution: Execution,
    container: Option<ContainerInfo>,
}

/// Print the recorded execution plus what the runtime currently reports for
/// its container. A container removed since is shown as `null`.
pub async fn show(ctx: &Context, id: &str) -> anyhow::Result<()> {
    let state = ctx.open_state()?;
    let runtime = ctx.runtime();
    let execution = ctx.execution_manager(state, runtime.clone()).get_execution(id)?;

    let container = match tokio::time::timeout(ctx.timeout, runtime.inspect_container(id)).await {
        Ok(Ok(info)) => Some(info),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "container not inspectable");
            None
        }
        Err(_) => anyhow::bail!("inspecting container {id} timed out after {:?}", ctx.timeout),
    };
    print_json(&ExecutionView {
        execution,
        container,
    })
}
