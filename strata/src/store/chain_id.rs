//! Deterministic chain-ID derivation (§3, §6).

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// A deterministic identifier of an ordered stack of layers. Two stacks
/// with the same ordered DiffIds always produce the same ChainId.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(String);

impl ChainId {
    /// `ChainId(0) = DiffId(0)` with any `sha256:` prefix stripped.
    pub fn root(diff_id: &str) -> Self {
        ChainId(strip_digest_prefix(diff_id).to_string())
    }

    /// `ChainId(i) = SHA256_hex("{parent} {diff_id}")` for i >= 1.
    pub fn chained(parent: &ChainId, diff_id: &str) -> Self {
        let diff_id = strip_digest_prefix(diff_id);
        let mut hasher = Sha256::new();
        hasher.update(parent.0.as_bytes());
        hasher.update(b" ");
        hasher.update(diff_id.as_bytes());
        ChainId(hex::encode(hasher.finalize()))
    }

    /// Build the full chain of ChainIds for an ordered list of DiffIds,
    /// parent-to-child.
    pub fn chain_for(diff_ids: &[String]) -> Vec<ChainId> {
        let mut chain = Vec::with_capacity(diff_ids.len());
        for diff_id in diff_ids {
            let next = match chain.last() {
                None => ChainId::root(diff_id),
                Some(parent) => ChainId::chained(parent, diff_id),
            };
            chain.push(next);
        }
        chain
    }

    /// A deterministic id for a single local tarball source, encoding the
    /// source path and its mtime so a changed file gets a fresh volume.
    pub fn local_tar(path: &std::path::Path, mtime: SystemTime) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());

        let nanos = mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        ChainId(format!("{}-{:019}", digest, nanos))
    }

    /// True for ids produced by [`ChainId::local_tar`]: a 64-hex-digit hash,
    /// a dash, and a 19-digit nanosecond timestamp.
    pub fn is_local_tar(&self) -> bool {
        is_local_tar_id(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChainId {
    fn from(s: String) -> Self {
        ChainId(s)
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        ChainId(s.to_string())
    }
}

impl AsRef<str> for ChainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn strip_digest_prefix(id: &str) -> &str {
    id.strip_prefix("sha256:").unwrap_or(id)
}

fn is_local_tar_id(s: &str) -> bool {
    let bytes = s.as_bytes();
    // 64 lowercase-hex chars, '-', 19 digits.
    if bytes.len() != 64 + 1 + 19 {
        return false;
    }
    let (hash_part, rest) = s.split_at(64);
    if !hash_part.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return false;
    }
    let mut rest_chars = rest.chars();
    if rest_chars.next() != Some('-') {
        return false;
    }
    rest_chars.as_str().bytes().all(|b| b.is_ascii_digit())
}

/// The volume temp-name format used by the puller while materializing a
/// layer: never to be mistaken for a finalized ChainId.
pub fn temp_volume_name(chain_id: &ChainId, unix_seconds: u64, random: u64) -> String {
    format!("{}-{}-{}", chain_id, unix_seconds, random)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_two_layer_pull() {
        let d0 = "sha256:afe200c63655576eaa5cabe036a2c09920d6aee67653ae75a9d35e0ec27205a5";
        let d1 = "sha256:d7c6a5f0d9a15779521094fa5eaf026b719984fb4bfe8e0012bd1da1b62615b0";

        let chain = ChainId::chain_for(&[d0.to_string(), d1.to_string()]);
        assert_eq!(
            chain[0].as_str(),
            "afe200c63655576eaa5cabe036a2c09920d6aee67653ae75a9d35e0ec27205a5"
        );

        let expected_input =
            "afe200c63655576eaa5cabe036a2c09920d6aee67653ae75a9d35e0ec27205a5 d7c6a5f0d9a15779521094fa5eaf026b719984fb4bfe8e0012bd1da1b62615b0";
        let mut hasher = Sha256::new();
        hasher.update(expected_input.as_bytes());
        let expected = hex::encode(hasher.finalize());

        assert_eq!(chain[1].as_str(), expected);
    }

    #[test]
    fn chain_id_depends_only_on_diff_ids() {
        let diffs = vec![
            "sha256:aaaa".to_string(),
            "sha256:bbbb".to_string(),
            "sha256:cccc".to_string(),
        ];
        let chain1 = ChainId::chain_for(&diffs);
        let chain2 = ChainId::chain_for(&diffs);
        assert_eq!(chain1, chain2);
    }

    #[test]
    fn shared_bottom_layer_produces_identical_chain_id() {
        let a = ChainId::chain_for(&["sha256:shared".to_string(), "sha256:a-top".to_string()]);
        let b = ChainId::chain_for(&["sha256:shared".to_string(), "sha256:b-top".to_string()]);
        assert_eq!(a[0], b[0]);
        assert_ne!(a[1], b[1]);
    }

    #[test]
    fn local_tar_id_format_and_uniqueness() {
        let path = std::path::Path::new("/tmp/image.tar");
        let t1 = UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let t2 = UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_001);

        let id1 = ChainId::local_tar(path, t1);
        let id2 = ChainId::local_tar(path, t2);

        assert!(id1.is_local_tar());
        assert!(id2.is_local_tar());
        assert_ne!(id1, id2);

        let other_path = std::path::Path::new("/tmp/other.tar");
        let id3 = ChainId::local_tar(other_path, t1);
        assert_ne!(id1, id3);
    }

    #[test]
    fn registry_chain_id_is_not_a_local_tar_id() {
        let chain = ChainId::chain_for(&["sha256:deadbeef".to_string()]);
        assert!(!chain[0].is_local_tar());
    }

    #[test]
    fn temp_volume_name_is_never_mistaken_for_a_chain_id() {
        let id = ChainId::chain_for(&["sha256:deadbeef".to_string()])
            .pop()
            .unwrap();
        let temp = temp_volume_name(&id, 1_700_000_000, 42);
        assert!(!is_local_tar_id(&temp));
    }
}
