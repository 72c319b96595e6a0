//! `strata clean`, grounded on the original `commands/clean.go`.

use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Skip collection if the cache is already at or under this many bytes
    #[arg(long, default_value_t = 0)]
    pub threshold_bytes: u64,
}

pub fn execute(args: &CleanArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout();
    let driver = global.build_driver();
    let unpacker = global.build_unpacker();
    let locksmith = global.build_locksmith()?;

    let store = strata::StrataStore::new(layout, driver.as_ref(), unpacker.as_ref(), None, &locksmith);

    let no_op = store.clean(args.threshold_bytes)?;
    if no_op {
        println!("cache already under threshold, nothing collected");
    } else {
        println!("unused volumes collected");
    }
    Ok(())
}
