// Copyright 2020 Red Hat, Inc.
// Copyright 2024 The DSI authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `PartitionTableCodec`: serializes/deserializes the `lp_metadata` blob
//! that describes the device layout, named partitions, and their linear
//! extents, so the bootloader's first-stage code can reconstruct the
//! mapped device before the daemon is available. Framing is lifted
//! directly from `coreos-installer`'s `osmet` binary format: an 8-byte
//! magic, a version, an informational app-version string, then a
//! `bincode`-serialized payload. We do not attempt backward compatibility
//! across format versions, matching the policy `osmet::file` documents for
//! itself.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::extents::Extent;
use crate::io::BUFFER_SIZE;

/// Magic header value for the lp_metadata blob.
const LP_METADATA_MAGIC: [u8; 8] = *b"DSILPMD\0";

/// Bump when the on-disk format changes incompatibly.
const LP_METADATA_VERSION: u32 = 1;

/// Extent count bound: keeps the metadata blob small and caps the device-
/// mapper linear target table at a sane size.
pub const MAX_EXTENTS: usize = 512;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct PartitionFlags {
    pub readonly: bool,
    pub zeroed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PartitionEntry {
    pub name: String,
    pub size: u64,
    pub flags: PartitionFlags,
    pub extents: Vec<Extent>,
}

#[derive(Serialize, Deserialize, Debug)]
struct LpMetadataHeader {
    magic: [u8; 8],
    version: u32,
    app_version: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct LpMetadata {
    pub partitions: Vec<PartitionEntry>,
}

impl LpMetadata {
    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut PartitionEntry> {
        self.partitions.iter_mut().find(|p| p.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PartitionEntry> {
        let idx = self.partitions.iter().position(|p| p.name == name)?;
        Some(self.partitions.remove(idx))
    }

    pub fn upsert(&mut self, entry: PartitionEntry) {
        if let Some(existing) = self.find_mut(&entry.name) {
            *existing = entry;
        } else {
            self.partitions.push(entry);
        }
    }
}

/// Codec boundary, kept as a trait so tests can swap in an in-memory
/// implementation without touching the filesystem.
pub trait PartitionTableCodec: Send + Sync {
    fn read(&self, path: &Path) -> Result<LpMetadata>;
    fn write(&self, path: &Path, metadata: &LpMetadata) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct BincodePartitionTableCodec;

impl PartitionTableCodec for BincodePartitionTableCodec {
    fn read(&self, path: &Path) -> Result<LpMetadata> {
        let mut f = BufReader::with_capacity(
            BUFFER_SIZE,
            OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("opening {:?}", path))?,
        );
        let header: LpMetadataHeader = bincoder()
            .deserialize_from(&mut f)
            .context("deserializing lp_metadata header")?;
        if header.magic != LP_METADATA_MAGIC {
            bail!("{:?} is not an lp_metadata blob", path);
        }
        if header.version != LP_METADATA_VERSION {
            bail!(
                "{:?} has incompatible lp_metadata version {}",
                path,
                header.version
            );
        }
        bincoder()
            .deserialize_from(&mut f)
            .context("deserializing lp_metadata payload")
    }

    fn write(&self, path: &Path, metadata: &LpMetadata) -> Result<()> {
        for p in &metadata.partitions {
            if p.extents.len() > MAX_EXTENTS {
                bail!(
                    "partition {} has {} extents, exceeding the {} bound",
                    p.name,
                    p.extents.len(),
                    MAX_EXTENTS
                );
            }
            for e in &p.extents {
                if !e.is_aligned() {
                    bail!("partition {} has a misaligned extent {:?}", p.name, e);
                }
            }
        }

        let header = LpMetadataHeader {
            magic: LP_METADATA_MAGIC,
            version: LP_METADATA_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let tmp_path = path.with_extension("partial");
        {
            let file = File::create(&tmp_path)
                .with_context(|| format!("creating {:?}", tmp_path))?;
            let mut f = BufWriter::with_capacity(BUFFER_SIZE, file);
            bincoder()
                .serialize_into(&mut f, &header)
                .context("serializing lp_metadata header")?;
            bincoder()
                .serialize_into(&mut f, metadata)
                .context("serializing lp_metadata payload")?;
            f.into_inner()
                .context("flushing lp_metadata")?
                .sync_all()
                .context("fsyncing lp_metadata")?;
        }
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {:?} to {:?}", tmp_path, path))?;
        Ok(())
    }
}

/// Uniform bincode options for all on-disk serialization.
fn bincoder() -> impl bincode::Options {
    bincode::options()
        .allow_trailing_bytes()
        .with_no_limit()
        .with_little_endian()
        .with_varint_encoding()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dsu.lp");
        let codec = BincodePartitionTableCodec;

        let mut meta = LpMetadata::default();
        meta.upsert(PartitionEntry {
            name: "system_gsi".into(),
            size: 10 * 1024 * 1024,
            flags: PartitionFlags {
                readonly: true,
                zeroed: false,
            },
            extents: vec![Extent {
                physical_sector: 0,
                sector_count: 20480,
            }],
        });
        codec.write(&path, &meta).unwrap();

        let read_back = codec.read(&path).unwrap();
        assert_eq!(read_back.partitions.len(), 1);
        let p = read_back.find("system_gsi").unwrap();
        assert_eq!(p.size, 10 * 1024 * 1024);
        assert!(p.flags.readonly);
    }

    #[test]
    fn rejects_too_many_extents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dsu.lp");
        let codec = BincodePartitionTableCodec;
        let mut meta = LpMetadata::default();
        meta.upsert(PartitionEntry {
            name: "fragmented".into(),
            size: 1,
            flags: PartitionFlags::default(),
            extents: (0..(MAX_EXTENTS + 1) as u64)
                .map(|i| Extent {
                    physical_sector: i * 8,
                    sector_count: 8,
                })
                .collect(),
        });
        assert!(codec.write(&path, &meta).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, b"not an lp metadata file at all").unwrap();
        let codec = BincodePartitionTableCodec;
        assert!(codec.read(&path).is_err());
    }
}
