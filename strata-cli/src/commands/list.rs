//! `strata list`: enumerates image ids currently in the store.

use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ListArgs {}

pub fn execute(_args: &ListArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout();
    let driver = global.build_driver();
    let unpacker = global.build_unpacker();
    let locksmith = global.build_locksmith()?;

    let store = strata::StrataStore::new(layout, driver.as_ref(), unpacker.as_ref(), None, &locksmith);

    for id in store.image_ids()? {
        println!("{}", id);
    }
    Ok(())
}
