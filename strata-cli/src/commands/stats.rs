//! `strata stats`: reports disk usage for a single image.

use clap::Args;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Id of the image to report on
    pub id: String,
}

pub fn execute(args: &StatsArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout();
    let driver = global.build_driver();
    let unpacker = global.build_unpacker();
    let locksmith = global.build_locksmith()?;

    let store = strata::StrataStore::new(layout, driver.as_ref(), unpacker.as_ref(), None, &locksmith);

    let stats = store.stats(&args.id)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "total_bytes_used": stats.total_bytes,
            "exclusive_bytes_used": stats.exclusive_bytes,
        }))?
    );
    Ok(())
}
