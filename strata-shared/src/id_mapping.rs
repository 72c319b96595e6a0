//! uid/gid mapping specs passed from the CLI down into the unpacker.

use serde::{Deserialize, Serialize};

/// One entry of a uid or gid mapping, in the same shape the kernel's
/// `/proc/<pid>/{uid,gid}_map` expects: `namespace_id host_id size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappingSpec {
    pub namespace_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMappingSpec {
    pub fn new(namespace_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            namespace_id,
            host_id,
            size,
        }
    }

    /// Parse the `ns:host:size` form accepted by CLI flags.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parts = raw.splitn(3, ':');
        let namespace_id = parts
            .next()
            .ok_or_else(|| format!("malformed id mapping `{}`", raw))?
            .parse()
            .map_err(|_| format!("malformed namespace id in `{}`", raw))?;
        let host_id = parts
            .next()
            .ok_or_else(|| format!("malformed id mapping `{}`", raw))?
            .parse()
            .map_err(|_| format!("malformed host id in `{}`", raw))?;
        let size = parts
            .next()
            .ok_or_else(|| format!("malformed id mapping `{}`", raw))?
            .parse()
            .map_err(|_| format!("malformed size in `{}`", raw))?;

        Ok(Self {
            namespace_id,
            host_id,
            size,
        })
    }

    /// Translate a tar header uid/gid through this set of mappings, per the
    /// external contract documented in §4.3: root (id 0) maps through the
    /// size == 1 entry; any other id maps through `HostID + id - 1` for the
    /// entry whose namespace range contains it.
    pub fn translate(mappings: &[IdMappingSpec], id: u32) -> u32 {
        if id == 0 {
            return mappings
                .iter()
                .find(|m| m.size == 1)
                .map(|m| m.host_id)
                .unwrap_or(0);
        }

        for mapping in mappings {
            if mapping.size > 1
                && id >= mapping.namespace_id
                && id < mapping.namespace_id + mapping.size
            {
                return mapping.host_id + id - 1;
            }
        }

        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_mapping_size_one() {
        let mappings = vec![IdMappingSpec::new(0, 1000, 1)];
        assert_eq!(IdMappingSpec::translate(&mappings, 0), 1000);
    }

    #[test]
    fn non_root_off_by_one() {
        let mappings = vec![
            IdMappingSpec::new(0, 1000, 1),
            IdMappingSpec::new(1, 100000, 65000),
        ];
        assert_eq!(IdMappingSpec::translate(&mappings, 5), 100004);
    }

    #[test]
    fn unmapped_id_passes_through() {
        let mappings = vec![IdMappingSpec::new(0, 1000, 1)];
        assert_eq!(IdMappingSpec::translate(&mappings, 42), 42);
    }

    #[test]
    fn parse_roundtrip() {
        let spec = IdMappingSpec::parse("0:1000:1").unwrap();
        assert_eq!(spec, IdMappingSpec::new(0, 1000, 1));
        assert!(IdMappingSpec::parse("bogus").is_err());
    }
}
