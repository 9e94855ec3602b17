use super::{Context, print_json};

pub async fn create(ctx: &Context, component_id: &str) -> anyhow::Result<()> {
    let state = ctx.open_state()?;
    let builds = ctx.build_manager(state, ctx.runtime());
    let mut stdout = tokio::io::stdout();

    let build = ctx
        .with_timeout("build", builds.create_build(component_id, &mut stdout))
        .await?;
    println!("✓ Built {}", build.id);
    println!("  Image: {}", build.image_id);
    println!("  Latest: {}", builds.latest_tag(component_id));
    Ok(())
}

pub fn list(ctx: &Context, component_id: Option<&str>) -> anyhow::Result<()> {
    let state = ctx.open_state()?;
    let builds = ctx.build_manager(state, ctx.runtime()).list_builds(component_id)?;
    if builds.is_empty() {
        println!("No builds.");
        return Ok(());
    }
    println!("{:<48} {:<32} IMAGE", "ID", "COMPONENT");
    for b in builds {
        println!("{:<48} {:<32} {}", b.id, b.component_id, b.image_id);
    }
    Ok(())
}

pub fn show(ctx: &Context, id: &str) -> anyhow::Result<()> {
    let state = ctx.open_state()?;
    print_json(&ctx.build_manager(state, ctx.runtime()).get_build(id)?)
}
