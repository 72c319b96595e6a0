//! CLI definition and argument parsing for strata-cli.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "strata", author, version, about = "Layered container rootfs store")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a store directory (requires root)
    InitStore(crate::commands::init_store::InitStoreArgs),

    /// Create a root filesystem for an image
    Create(crate::commands::create::CreateArgs),

    /// Delete a container image
    Delete(crate::commands::delete::DeleteArgs),

    /// Clean up unused layer volumes
    Clean(crate::commands::clean::CleanArgs),

    /// List image ids in the store
    #[command(visible_alias = "ls")]
    List(crate::commands::list::ListArgs),

    /// Show disk usage for an image
    Stats(crate::commands::stats::StatsArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum FsDriver {
    OverlayXfs,
    Btrfs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Path to the store directory
    #[arg(long, global = true, env = "STRATA_STORE", default_value = "/var/lib/strata")]
    pub store: PathBuf,

    /// Filesystem driver backing the store
    #[arg(long, global = true, value_enum, default_value_t = FsDriver::OverlayXfs)]
    pub driver: FsDriver,

    /// Path to the `newuidmap` binary, used by the namespaced unpacker
    #[arg(long, global = true, default_value = "newuidmap")]
    pub newuidmap_bin: String,

    /// Path to the `newgidmap` binary, used by the namespaced unpacker
    #[arg(long, global = true, default_value = "newgidmap")]
    pub newgidmap_bin: String,
}

impl GlobalFlags {
    pub fn layout(&self) -> strata::StoreLayout {
        strata::StoreLayout::new(self.store.clone())
    }

    pub fn build_driver(&self) -> Box<dyn strata::FilesystemDriver> {
        let layout = self.layout();
        match self.driver {
            FsDriver::OverlayXfs => Box::new(strata::OverlayXfsDriver::new(layout)),
            FsDriver::Btrfs => Box::new(strata::BtrfsDriver::new(layout)),
        }
    }

    pub fn build_unpacker(&self) -> Box<dyn strata::Unpacker> {
        let whiteout_dev_path = self.layout().whiteout_dev_path();
        if nix::unistd::getuid().is_root() {
            Box::new(strata::PrivilegedUnpacker::new(Some(whiteout_dev_path)))
        } else {
            let id_mapper = crate::idmapper::ExternalIdMapper::new(
                self.newuidmap_bin.clone(),
                self.newgidmap_bin.clone(),
            );
            Box::new(strata::NamespacedUnpacker::new(
                Box::new(id_mapper),
                Some(whiteout_dev_path),
            ))
        }
    }

    pub fn build_locksmith(&self) -> anyhow::Result<strata::FileLocksmith> {
        Ok(strata::FileLocksmith::new(self.layout().locks_dir())?)
    }
}
