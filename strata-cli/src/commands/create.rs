//! `strata create`, grounded on the original `commands/create.go`.

use clap::Args;
use strata_shared::IdMappingSpec;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// OCI image reference (`docker://...`) or path to a local tarball
    pub base_image: String,

    /// Id the created rootfs will be addressed by
    pub id: String,

    /// Disk quota for the image's writable layer, in bytes (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub disk_limit_size_bytes: u64,

    /// Exclude the base image's own size from the disk quota
    #[arg(long)]
    pub exclude_image_from_quota: bool,

    /// Mount the rootfs and print the mount instructions instead of mounting directly
    #[arg(long)]
    pub mount: bool,

    /// Run `clean` before creating, bounded by `--clean-threshold-bytes`
    #[arg(long)]
    pub with_clean: bool,

    /// Cache budget `--with-clean` should leave in place, in bytes
    #[arg(long, default_value_t = 0)]
    pub clean_threshold_bytes: u64,

    /// Repeatable `<namespace-id>:<host-id>:<size>` uid mapping
    #[arg(long = "uid-mapping", value_parser = IdMappingSpec::parse)]
    pub uid_mappings: Vec<IdMappingSpec>,

    /// Repeatable `<namespace-id>:<host-id>:<size>` gid mapping
    #[arg(long = "gid-mapping", value_parser = IdMappingSpec::parse)]
    pub gid_mappings: Vec<IdMappingSpec>,
}

pub fn execute(args: &CreateArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = global.layout();
    let driver = global.build_driver();
    let unpacker = global.build_unpacker();
    let locksmith = global.build_locksmith()?;
    let remote_fetcher = strata::RemoteFetcher::new()?;

    let store = strata::StrataStore::new(
        layout,
        driver.as_ref(),
        unpacker.as_ref(),
        Some(&remote_fetcher),
        &locksmith,
    );

    let spec = strata::CreateSpec {
        id: args.id.clone(),
        base_image_src: args.base_image.clone(),
        disk_limit: args.disk_limit_size_bytes,
        mount: args.mount,
        exclude_base_image_from_quota: args.exclude_image_from_quota,
        clean_on_create: args.with_clean,
        clean_on_create_threshold_bytes: args.clean_threshold_bytes,
        uid_mappings: args.uid_mappings.clone(),
        gid_mappings: args.gid_mappings.clone(),
    };

    let image_info = store.create(spec)?;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "path": image_info.path,
        "rootfs": image_info.rootfs,
    }))?);
    Ok(())
}
