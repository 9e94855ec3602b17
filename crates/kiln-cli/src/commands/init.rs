use kiln_state::StateStore;

use super::Context;

pub fn init(ctx: &Context) -> anyhow::Result<()> {
    StateStore::init(&ctx.state_dir)?;
    println!(
        "✓ Initialized kiln state at {}",
        StateStore::db_path(&ctx.state_dir).display()
    );
    Ok(())
}
