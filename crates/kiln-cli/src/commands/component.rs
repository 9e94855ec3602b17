use std::path::Path;

use anyhow::Context as _;

use super::{Context, print_json};

pub fn add(ctx: &Context, id: &str, kind: &str, path: &Path, spec: &Path) -> anyhow::Result<()> {
    // Stored absolute so later commands work from any directory.
    let path = std::path::absolute(path)
        .with_context(|| format!("invalid component path {}", path.display()))?;
    let spec = std::path::absolute(spec)
        .with_context(|| format!("invalid specification path {}", spec.display()))?;
    let component = ctx.registry()?.add_component(
        id,
        kind,
        &path.to_string_lossy(),
        &spec.to_string_lossy(),
    )?;
    println!("✓ Registered {} component {}", component.component_type, component.id);
    Ok(())
}

pub fn show(ctx: &Context, id: &str) -> anyhow::Result<()> {
    print_json(&ctx.registry()?.get_component(id)?)
}

pub fn list(ctx: &Context) -> anyhow::Result<()> {
    let components = ctx.registry()?.list_components()?;
    if components.is_empty() {
        println!("No components registered.");
        return Ok(());
    }
    println!("{:<32} {:<8} PATH", "ID", "TYPE");
    for c in components {
        println!("{:<32} {:<8} {}", c.id, c.component_type.as_str(), c.component_path);
    }
    Ok(())
}

pub fn spec(ctx: &Context, id: &str) -> anyhow::Result<()> {
    print_json(&ctx.registry()?.specification(id)?)
}
