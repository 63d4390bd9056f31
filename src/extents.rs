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

//! `BlockExtentBackend`: allocates backing-image files pinned to contiguous
//! physical extents on the host filesystem, and extracts/verifies those
//! extents via `FIEMAP`. Grounded in the extent-extraction approach of
//! `coreos-installer`'s `osmet::fiemap` module, extended with allocation
//! (osmet only ever reads extents of preexisting files; we also need to
//! create and pin new ones) and re-verification for `ImageStore::validate`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Alignment unit for extents in the partition-table format.
pub const LP_SECTOR_SIZE: u64 = 512;

/// A contiguous run of sectors on the underlying block device.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub physical_sector: u64,
    pub sector_count: u64,
}

impl Extent {
    pub fn is_aligned(&self) -> bool {
        self.physical_sector % LP_SECTOR_SIZE == 0 && self.sector_count % LP_SECTOR_SIZE == 0
    }

    pub fn byte_len(&self) -> u64 {
        self.sector_count * LP_SECTOR_SIZE
    }
}

/// Capability the daemon needs from the host filesystem: pin a new file to
/// contiguous-ish physical extents, read back the extents of an existing
/// file, and confirm they haven't moved.
pub trait BlockExtentBackend: Send + Sync {
    /// Create `path` with the given logical `size` in bytes, pin its blocks
    /// so they won't move under background filesystem activity (so far as
    /// the filesystem allows), and return the sorted physical extent list.
    fn allocate_pinned_file(&self, path: &Path, size: u64) -> Result<Vec<Extent>>;

    /// Return the extents currently backing `path`, without allocating
    /// anything.
    fn extents_for_file(&self, path: &Path) -> Result<Vec<Extent>>;

    /// Re-read `path`'s extents and confirm they're unchanged from
    /// `expected`. Used by `ImageStore::validate` to catch defragmentation
    /// or filesystem GC moving blocks out from under a mapped device.
    fn verify_pinned(&self, path: &Path, expected: &[Extent]) -> Result<bool> {
        Ok(self.extents_for_file(path)? == expected)
    }
}

/// Production backend: real `fallocate(2)` + `FIEMAP` against whatever
/// filesystem `data_dir` lives on.
#[derive(Debug, Default)]
pub struct FiemapBackend;

impl BlockExtentBackend for FiemapBackend {
    fn allocate_pinned_file(&self, path: &Path, size: u64) -> Result<Vec<Extent>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("creating {:?}", path))?;

        fallocate(&file, size).with_context(|| format!("fallocating {:?} to {} bytes", path, size))?;
        file.sync_all()
            .with_context(|| format!("fsyncing {:?}", path))?;
        if let Some(parent) = path.parent() {
            fsync_dir(parent).with_context(|| format!("fsyncing directory {:?}", parent))?;
        }

        extent_list(file.as_raw_fd()).with_context(|| format!("mapping {:?}", path))
    }

    fn extents_for_file(&self, path: &Path) -> Result<Vec<Extent>> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("opening {:?}", path))?;
        extent_list(file.as_raw_fd()).with_context(|| format!("mapping {:?}", path))
    }
}

fn fallocate(file: &File, size: u64) -> Result<()> {
    use nix::fcntl::{fallocate, FallocateFlags};
    fallocate(file.as_raw_fd(), FallocateFlags::empty(), 0, size as i64)
        .context("fallocate(2)")?;
    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let f = File::open(dir).with_context(|| format!("opening {:?}", dir))?;
    f.sync_all().context("fsync")?;
    Ok(())
}

/// Extract byte-granularity extents via `FIEMAP`, convert to sectors, and
/// reject anything that isn't a plain, already-allocated, block-aligned
/// mapping.
fn extent_list(fd: RawFd) -> Result<Vec<Extent>> {
    let raw = fiemap(fd)?;
    let mut extents = Vec::with_capacity(raw.len());
    for e in raw {
        if e.physical % LP_SECTOR_SIZE != 0 || e.length % LP_SECTOR_SIZE != 0 {
            bail!(
                "extent at physical offset {} length {} is not {}-byte aligned",
                e.physical,
                e.length,
                LP_SECTOR_SIZE
            );
        }
        extents.push(Extent {
            physical_sector: e.physical / LP_SECTOR_SIZE,
            sector_count: e.length / LP_SECTOR_SIZE,
        });
    }
    Ok(extents)
}

#[derive(Debug, PartialEq, Eq)]
struct RawExtent {
    logical: u64,
    physical: u64,
    length: u64,
}

/// Returns the raw byte-granularity extents associated with the given fd.
/// Physical offsets are relative to the partition start on which the file
/// resides.
fn fiemap(fd: RawFd) -> Result<Vec<RawExtent>> {
    let mut m = ffi::fiemap::new();
    let mut extents: Vec<RawExtent> = Vec::new();

    loop {
        m.fm_start = match extents.iter().last() {
            Some(extent) => extent.logical + extent.length,
            None => 0,
        };

        unsafe { ffi::ioctl::fs_ioc_fiemap(fd, &mut m).context("ioctl(FS_IOC_FIEMAP)")? };
        if m.fm_mapped_extents == 0 {
            break;
        }

        let mut found_last = false;
        for extent in m.fm_extents.iter().take(m.fm_mapped_extents as usize) {
            // These are not strictly errors, but we want to know if they
            // ever occur rather than silently building an unusable extent
            // map: a mapped device built on bad extents will corrupt data.
            if extent.fe_flags & ffi::FIEMAP_EXTENT_NOT_ALIGNED > 0 {
                bail!("extent not aligned");
            } else if extent.fe_flags & ffi::FIEMAP_EXTENT_MERGED > 0 {
                bail!("file does not support extents");
            } else if extent.fe_flags & ffi::FIEMAP_EXTENT_ENCODED > 0 {
                bail!("extent encoded");
            } else if extent.fe_flags & ffi::FIEMAP_EXTENT_DELALLOC > 0 {
                bail!("extent not allocated yet");
            } else if extent.fe_flags & ffi::FIEMAP_EXTENT_UNWRITTEN > 0 {
                bail!("extent preallocated but sparse");
            } else if extent.fe_flags & ffi::FIEMAP_EXTENT_UNKNOWN > 0 {
                bail!("extent inaccessible");
            }

            extents.push(RawExtent {
                logical: extent.fe_logical,
                physical: extent.fe_physical,
                length: extent.fe_length,
            });

            if extent.fe_flags & ffi::FIEMAP_EXTENT_LAST > 0 {
                found_last = true;
            }
        }

        if found_last {
            break;
        }
    }

    Ok(extents)
}

// nest it so it's private to us (ioctl! always declares as `pub`)
mod ffi {
    use std::mem::{size_of, zeroed};

    // filefrag uses 16k on the stack, e4defrag uses ~220k on the heap, but
    // we don't expect to run against heavily fragmented filesystems, so we
    // can comfortably stay on the stack with a much smaller buffer.
    const EXTENT_COUNT: usize = 32;

    const FIEMAP_SIZE: u32 =
        (size_of::<fiemap>() as u32) - (size_of::<[fiemap_extent; EXTENT_COUNT]>() as u32);

    #[allow(clippy::missing_safety_doc)]
    pub mod ioctl {
        use nix::{ioctl_readwrite_bad, request_code_readwrite};
        ioctl_readwrite_bad!(
            fs_ioc_fiemap,
            request_code_readwrite!(b'f', 11, super::FIEMAP_SIZE),
            super::fiemap
        );
    }

    #[allow(dead_code)]
    #[allow(clippy::unreadable_literal)]
    pub mod fiemap_extent_flags {
        pub const FIEMAP_EXTENT_LAST: u32 = 0x00000001;
        pub const FIEMAP_EXTENT_UNKNOWN: u32 = 0x00000002;
        pub const FIEMAP_EXTENT_DELALLOC: u32 = 0x00000004;
        pub const FIEMAP_EXTENT_ENCODED: u32 = 0x00000008;
        pub const FIEMAP_EXTENT_DATA_ENCRYPTED: u32 = 0x00000080;
        pub const FIEMAP_EXTENT_NOT_ALIGNED: u32 = 0x00000100;
        pub const FIEMAP_EXTENT_DATA_INLINE: u32 = 0x00000200;
        pub const FIEMAP_EXTENT_DATA_TAIL: u32 = 0x00000400;
        pub const FIEMAP_EXTENT_UNWRITTEN: u32 = 0x00000800;
        pub const FIEMAP_EXTENT_MERGED: u32 = 0x00001000;
        pub const FIEMAP_EXTENT_SHARED: u32 = 0x00002000;
    }
    pub use fiemap_extent_flags::*;

    #[repr(C)]
    #[derive(Debug)]
    pub struct fiemap {
        pub fm_start: u64,
        pub fm_length: u64,
        pub fm_flags: u32,
        pub fm_mapped_extents: u32,
        pub fm_extent_count: u32,
        pub fm_reserved: u32,
        pub fm_extents: [fiemap_extent; EXTENT_COUNT],
    }

    #[repr(C)]
    #[derive(Debug)]
    pub struct fiemap_extent {
        pub fe_logical: u64,
        pub fe_physical: u64,
        pub fe_length: u64,
        pub fe_reserved64: [u64; 2],
        pub fe_flags: u32,
        pub fe_reserved: [u32; 3],
    }

    impl fiemap {
        pub fn new() -> Self {
            let mut r: Self = unsafe { zeroed() };
            r.fm_extent_count = EXTENT_COUNT as u32;
            r.fm_length = std::u64::MAX;
            r
        }
    }
}

/// Zero-fill the first `bytes` of `file`, invoking `on_progress(done, bytes)`
/// periodically; returning `Ok(false)` from the callback aborts the fill
/// early and the function returns `Ok(false)`.
pub fn zero_fill(
    file: &File,
    bytes: u64,
    mut on_progress: impl FnMut(u64, u64) -> bool,
) -> Result<bool> {
    const BLOCK: u64 = 1024 * 1024;
    let zeroes = vec![0u8; BLOCK as usize];
    let mut done = 0u64;
    while done < bytes {
        let this_block = BLOCK.min(bytes - done);
        file.write_all_at(&zeroes[..this_block as usize], done)
            .context("writing zeroes")?;
        done += this_block;
        if !on_progress(done, bytes) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
pub mod test_backend {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// In-memory backend for unit tests: doesn't call FIEMAP at all, just
    /// hands out a synthetic, monotonically increasing extent per file so
    /// ImageStore/InstallSession logic can be exercised without root or a
    /// real filesystem capable of FIEMAP.
    #[derive(Default)]
    pub struct FakeExtentBackend {
        next_sector: RefCell<u64>,
        allocated: RefCell<HashMap<PathBuf, Vec<Extent>>>,
    }

    impl BlockExtentBackend for FakeExtentBackend {
        fn allocate_pinned_file(&self, path: &Path, size: u64) -> Result<Vec<Extent>> {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("creating {:?}", path))?;
            f.set_len(size).context("setting length")?;
            let sectors = (size + LP_SECTOR_SIZE - 1) / LP_SECTOR_SIZE;
            let mut next = self.next_sector.borrow_mut();
            let extent = Extent {
                physical_sector: *next,
                sector_count: sectors,
            };
            *next += sectors;
            self.allocated
                .borrow_mut()
                .insert(path.to_path_buf(), vec![extent]);
            Ok(vec![extent])
        }

        fn extents_for_file(&self, path: &Path) -> Result<Vec<Extent>> {
            self.allocated
                .borrow()
                .get(path)
                .cloned()
                .with_context(|| format!("no extents recorded for {:?}", path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_backend::FakeExtentBackend;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fake_backend_allocates_aligned_extents() {
        let dir = tempdir().unwrap();
        let backend = FakeExtentBackend::default();
        let path = dir.path().join("system_gsi.img");
        let extents = backend.allocate_pinned_file(&path, 10 * 1024 * 1024).unwrap();
        assert!(!extents.is_empty());
        for e in &extents {
            assert!(e.is_aligned());
        }
        assert!(backend.verify_pinned(&path, &extents).unwrap());
    }

    #[test]
    fn zero_fill_respects_abort() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("userdata_gsi.img");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(4 * 1024 * 1024).unwrap();
        let mut calls = 0;
        let completed = zero_fill(&file, 4 * 1024 * 1024, |_done, _total| {
            calls += 1;
            calls < 2
        })
        .unwrap();
        assert!(!completed);
        assert!(calls >= 2);
    }
}
