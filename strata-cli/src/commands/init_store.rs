//! `strata init-store`, grounded on the original `commands/init_store.go`.

use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct InitStoreArgs {
    /// uid that should own the store once created
    #[arg(long, default_value_t = 0)]
    pub owner_uid: u32,

    /// gid that should own the store once created
    #[arg(long, default_value_t = 0)]
    pub owner_gid: u32,
}

pub fn execute(args: &InitStoreArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout();
    let driver = global.build_driver();
    let locksmith = global.build_locksmith()?;
    let manager = strata::Manager::new(layout, driver.as_ref(), &locksmith);

    manager.init_store(args.owner_uid, args.owner_gid)?;
    tracing::info!(store = %global.store.display(), "store initialized");
    Ok(())
}
