//! # The bootloader ADV area.
//!
//! A 512-byte key/value block in the syslinux auxiliary data vector, used to
//! pass markers (notably `upgrade`) across reboots. Layout:
//!
//! ```text
//! offset 0..4     magic 0x5a2d2fa5 (LE)
//! offset 4..508   TLV entries: tag u8, len u8, data; tag 0 terminates
//! offset 508..512 magic 0xa3041767 (LE)
//! ```
//!
//! A block with bad magics is treated as empty rather than rejected: a
//! freshly-imaged disk carries zeroes there.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::TaskError;

const BLOCK_LEN: usize = 512;
const MAGIC_HEAD: u32 = 0x5a2d_2fa5;
const MAGIC_TAIL: u32 = 0xa304_1767;

const TAG_END: u8 = 0;

/// Tag carrying the upgrade-in-progress marker.
pub const TAG_UPGRADE: u8 = 3;

/// Parsed ADV block.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Adv {
    entries: BTreeMap<u8, Vec<u8>>,
}

impl Adv {
    /// Parses a raw block; bad magics yield an empty ADV.
    pub fn parse(block: &[u8]) -> Self {
        if block.len() < BLOCK_LEN {
            return Self::default();
        }

        let head = u32::from_le_bytes(block[0..4].try_into().expect("sized"));
        let tail = u32::from_le_bytes(block[BLOCK_LEN - 4..BLOCK_LEN].try_into().expect("sized"));

        if head != MAGIC_HEAD || tail != MAGIC_TAIL {
            return Self::default();
        }

        let mut entries = BTreeMap::new();
        let mut off = 4;

        while off + 2 <= BLOCK_LEN - 4 {
            let tag = block[off];
            if tag == TAG_END {
                break;
            }

            let len = block[off + 1] as usize;
            if off + 2 + len > BLOCK_LEN - 4 {
                break;
            }

            entries.insert(tag, block[off + 2..off + 2 + len].to_vec());
            off += 2 + len;
        }

        Self { entries }
    }

    /// Serializes into a raw block.
    pub fn to_block(&self) -> [u8; BLOCK_LEN] {
        let mut block = [0u8; BLOCK_LEN];

        block[0..4].copy_from_slice(&MAGIC_HEAD.to_le_bytes());
        block[BLOCK_LEN - 4..].copy_from_slice(&MAGIC_TAIL.to_le_bytes());

        let mut off = 4;
        for (tag, value) in &self.entries {
            if off + 2 + value.len() > BLOCK_LEN - 4 {
                break;
            }

            block[off] = *tag;
            block[off + 1] = value.len() as u8;
            block[off + 2..off + 2 + value.len()].copy_from_slice(value);
            off += 2 + value.len();
        }

        block
    }

    /// Reads the ADV from `path`; a missing file yields an empty ADV.
    pub async fn load(path: &Path) -> Result<Self, TaskError> {
        match tokio::fs::read(path).await {
            Ok(block) => Ok(Self::parse(&block)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(TaskError::fatal(format!("reading ADV {path:?}: {e}"))),
        }
    }

    /// Writes the ADV block to `path`.
    pub async fn save(&self, path: &Path) -> Result<(), TaskError> {
        tokio::fs::write(path, self.to_block())
            .await
            .map_err(|e| TaskError::fatal(format!("writing ADV {path:?}: {e}")))
    }

    /// Returns a tag's value.
    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.entries.get(&tag).map(Vec::as_slice)
    }

    /// Sets a tag's value, replacing any previous one.
    pub fn set(&mut self, tag: u8, value: impl Into<Vec<u8>>) {
        self.entries.insert(tag, value.into());
    }

    /// Removes a tag.
    pub fn delete(&mut self, tag: u8) {
        self.entries.remove(&tag);
    }

    /// Whether the upgrade marker is set.
    pub fn upgrade(&self) -> bool {
        self.get(TAG_UPGRADE) == Some(b"true")
    }

    /// Sets or clears the upgrade marker.
    pub fn set_upgrade(&mut self, upgrading: bool) {
        if upgrading {
            self.set(TAG_UPGRADE, &b"true"[..]);
        } else {
            self.delete(TAG_UPGRADE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_entries() {
        let mut adv = Adv::default();
        adv.set(TAG_UPGRADE, &b"true"[..]);
        adv.set(7, &b"abc"[..]);

        let parsed = Adv::parse(&adv.to_block());
        assert_eq!(parsed, adv);
        assert!(parsed.upgrade());
        assert_eq!(parsed.get(7), Some(&b"abc"[..]));
    }

    #[test]
    fn zeroed_block_is_empty() {
        let adv = Adv::parse(&[0u8; 512]);
        assert!(!adv.upgrade());
        assert_eq!(adv, Adv::default());
    }

    #[test]
    fn clearing_the_marker() {
        let mut adv = Adv::default();
        adv.set_upgrade(true);
        assert!(adv.upgrade());

        adv.set_upgrade(false);
        assert!(!adv.upgrade());
        assert!(Adv::parse(&adv.to_block()).get(TAG_UPGRADE).is_none());
    }

    #[tokio::test]
    async fn loads_missing_file_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adv");

        let adv = Adv::load(&path).await.unwrap();
        assert_eq!(adv, Adv::default());

        let mut adv = adv;
        adv.set_upgrade(true);
        adv.save(&path).await.unwrap();

        let reloaded = Adv::load(&path).await.unwrap();
        assert!(reloaded.upgrade());
    }
}
