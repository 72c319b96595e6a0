//! `strata delete`, grounded on the original `commands/delete.go`.

use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Id of the image to delete
    pub id: String,
}

pub fn execute(args: &DeleteArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout();
    let driver = global.build_driver();
    let unpacker = global.build_unpacker();
    let locksmith = global.build_locksmith()?;

    let store = strata::StrataStore::new(layout, driver.as_ref(), unpacker.as_ref(), None, &locksmith);

    store.destroy(&args.id)?;
    tracing::info!(id = %args.id, "image destroyed");
    Ok(())
}
