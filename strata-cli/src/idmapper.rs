//! Shells out to `newuidmap`/`newgidmap` to write a child's id maps, the
//! same external-tool boundary the original CLI used
//! (`unpackerpkg.NewIDMapper`), since writing `/proc/<pid>/{u,g}id_map`
//! directly requires a setuid helper this crate does not ship.

use std::process::Command;

use strata::unpacker::IdMapper;
use strata_shared::{IdMappingSpec, StrataError, StrataResult};

pub struct ExternalIdMapper {
    newuidmap_bin: String,
    newgidmap_bin: String,
}

impl ExternalIdMapper {
    pub fn new(newuidmap_bin: String, newgidmap_bin: String) -> Self {
        Self {
            newuidmap_bin,
            newgidmap_bin,
        }
    }

    fn run(&self, bin: &str, pid: i32, mappings: &[IdMappingSpec]) -> StrataResult<()> {
        let mut args = vec![pid.to_string()];
        for mapping in mappings {
            args.push(mapping.namespace_id.to_string());
            args.push(mapping.host_id.to_string());
            args.push(mapping.size.to_string());
        }

        let output = Command::new(bin)
            .args(&args)
            .output()
            .map_err(|e| StrataError::DriverFailure(format!("running `{}`: {}", bin, e)))?;

        if !output.status.success() {
            return Err(StrataError::DriverFailure(format!(
                "`{}` failed: {}",
                bin,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

impl IdMapper for ExternalIdMapper {
    fn map_uids(&self, pid: i32, mappings: &[IdMappingSpec]) -> StrataResult<()> {
        self.run(&self.newuidmap_bin, pid, mappings)
    }

    fn map_gids(&self, pid: i32, mappings: &[IdMappingSpec]) -> StrataResult<()> {
        self.run(&self.newgidmap_bin, pid, mappings)
    }
}
