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

//! `ImageStore`: the per-(metadata-dir, data-dir) catalog of backing
//! images (spec §4.1). Allocates block-extent-pinned files via
//! `BlockExtentBackend`, persists their extent maps via
//! `PartitionTableCodec`, and publishes them as block devices via
//! `DeviceMapper`.
//!
//! Images are named with a `_gsi` suffix (`system_gsi`, `userdata_gsi`):
//! every operation that sweeps "all images" (`remove_all_images`,
//! startup reclamation) only ever touches files matching that suffix,
//! per spec §4.2's unwind rule.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{info, warn};

use crate::codec::{LpMetadata, PartitionEntry, PartitionFlags, PartitionTableCodec, MAX_EXTENTS};
use crate::devmapper::{DeviceMapper, MapBackend};
use crate::extents::{self, BlockExtentBackend};
use crate::util::check_free_space;

pub use crate::error::ImageStoreError as Error;

const GSI_SUFFIX: &str = "_gsi";
const DM_NAME_PREFIX: &str = "dsu-";
const MIN_FREE_FRACTION: f64 = 0.40;

/// An image currently published as a block device.
#[derive(Debug, Clone)]
struct MappedImage {
    device_path: PathBuf,
    backend: MapBackend,
}

pub struct ImageStore {
    metadata_dir: PathBuf,
    data_dir: PathBuf,
    lp_path: PathBuf,
    extent_backend: Box<dyn BlockExtentBackend>,
    device_mapper: Box<dyn DeviceMapper>,
    codec: Box<dyn PartitionTableCodec>,
    metadata: Mutex<LpMetadata>,
    mapped: Mutex<HashMap<String, MappedImage>>,
}

impl ImageStore {
    /// `open(metadata_dir, data_dir)`: both directories must already
    /// exist; both are retained.
    pub fn open(
        metadata_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        extent_backend: Box<dyn BlockExtentBackend>,
        device_mapper: Box<dyn DeviceMapper>,
        codec: Box<dyn PartitionTableCodec>,
    ) -> anyhow::Result<Self> {
        let metadata_dir = metadata_dir.into();
        let data_dir = data_dir.into();
        for dir in [&metadata_dir, &data_dir] {
            if !dir.is_dir() {
                anyhow::bail!("{:?} does not exist or is not a directory", dir);
            }
        }
        let lp_path = metadata_dir.join("lp_metadata");
        let metadata = if lp_path.exists() {
            codec.read(&lp_path).context("reading lp_metadata")?
        } else {
            LpMetadata::default()
        };

        Ok(ImageStore {
            metadata_dir,
            data_dir,
            lp_path,
            extent_backend,
            device_mapper,
            codec,
            metadata: Mutex::new(metadata),
            mapped: Mutex::new(HashMap::new()),
        })
    }

    fn gsi_name(name: &str) -> String {
        if name.ends_with(GSI_SUFFIX) {
            name.to_string()
        } else {
            format!("{}{}", name, GSI_SUFFIX)
        }
    }

    fn data_path(&self, gsi_name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.img", gsi_name))
    }

    fn dm_name(&self, gsi_name: &str) -> String {
        format!("{}{}", DM_NAME_PREFIX, gsi_name)
    }

    fn persist(&self, metadata: &LpMetadata) -> Result<(), Error> {
        self.codec
            .write(&self.lp_path, metadata)
            .map_err(|e| classify_write_error(e))
    }

    pub fn backing_image_exists(&self, name: &str) -> bool {
        self.data_path(&Self::gsi_name(name)).exists()
    }

    pub fn partition_exists(&self, name: &str) -> bool {
        let gsi_name = Self::gsi_name(name);
        self.metadata
            .lock()
            .expect("metadata mutex poisoned")
            .find(&gsi_name)
            .is_some()
    }

    pub fn partition_size(&self, name: &str) -> Option<u64> {
        let gsi_name = Self::gsi_name(name);
        self.metadata
            .lock()
            .expect("metadata mutex poisoned")
            .find(&gsi_name)
            .map(|p| p.size)
    }

    pub fn data_file_path(&self, name: &str) -> PathBuf {
        self.data_path(&Self::gsi_name(name))
    }

    /// `create_backing_image(name, size, flags, on_progress)`.
    pub fn create_backing_image(
        &self,
        name: &str,
        size: u64,
        flags: PartitionFlags,
        mut on_progress: impl FnMut(u64, u64) -> bool,
    ) -> Result<(), Error> {
        let gsi_name = Self::gsi_name(name);
        if self.backing_image_exists(name) {
            return Err(Error::AlreadyExists(gsi_name));
        }

        check_free_space(&self.data_dir, size, MIN_FREE_FRACTION).map_err(|e| match e {
            crate::util::SpaceCheckError::Insufficient => Error::NoSpace,
            crate::util::SpaceCheckError::BelowMinFraction => Error::FileSystemCluttered,
        })?;

        let path = self.data_path(&gsi_name);
        let extents = self
            .extent_backend
            .allocate_pinned_file(&path, size)
            .map_err(Error::Io)?;

        if extents.len() > MAX_EXTENTS {
            let _ = fs::remove_file(&path);
            return Err(Error::FileSystemCluttered);
        }

        if flags.zeroed {
            let file = match OpenOptions::new().write(true).open(&path) {
                Ok(f) => f,
                Err(e) => {
                    let _ = fs::remove_file(&path);
                    return Err(Error::Io(anyhow::Error::new(e)));
                }
            };
            match extents::zero_fill(&file, size, &mut on_progress) {
                Ok(true) => {}
                Ok(false) => {
                    let _ = fs::remove_file(&path);
                    return Err(Error::Aborted(gsi_name));
                }
                Err(e) => {
                    let _ = fs::remove_file(&path);
                    return Err(Error::Io(e));
                }
            }
        }

        let entry = PartitionEntry {
            name: gsi_name.clone(),
            size,
            flags,
            extents,
        };

        let mut metadata = self.metadata.lock().expect("metadata mutex poisoned");
        metadata.upsert(entry);
        if let Err(e) = self.persist(&metadata) {
            metadata.remove(&gsi_name);
            drop(metadata);
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        info!("created backing image {} ({} bytes)", gsi_name, size);
        Ok(())
    }

    /// `delete_backing_image(name)`: unmaps first if mapped, then removes
    /// data file and metadata entry. Idempotent.
    pub fn delete_backing_image(&self, name: &str) -> Result<(), Error> {
        let gsi_name = Self::gsi_name(name);
        if self.is_image_mapped(name) {
            self.unmap_image_device(name, true)?;
        }
        let _ = fs::remove_file(self.data_path(&gsi_name));

        let mut metadata = self.metadata.lock().expect("metadata mutex poisoned");
        if metadata.remove(&gsi_name).is_some() {
            self.persist(&metadata)?;
        }
        Ok(())
    }

    /// `map_image_device(name, timeout)`: device-mapper first, loop-device
    /// fallback. `timeout = ZERO` is a best-effort immediate return.
    pub fn map_image_device(&self, name: &str, timeout: Duration) -> Result<PathBuf, Error> {
        let gsi_name = Self::gsi_name(name);
        if let Some(mapped) = self.mapped.lock().expect("mapped mutex poisoned").get(&gsi_name) {
            return Ok(mapped.device_path.clone());
        }

        let entry = {
            let metadata = self.metadata.lock().expect("metadata mutex poisoned");
            metadata
                .find(&gsi_name)
                .cloned()
                .ok_or_else(|| Error::NotFound(gsi_name.clone()))?
        };
        let path = self.data_path(&gsi_name);
        let dm_name = self.dm_name(&gsi_name);

        let underlying = crate::blockdev::underlying_device_for_path(&self.data_dir);
        let (device_path, backend) = match underlying {
            Ok(dev) => {
                match self.device_mapper.map_linear(
                    &dm_name,
                    &dev,
                    &entry.extents,
                    extents::LP_SECTOR_SIZE,
                ) {
                    Ok(p) => (p, MapBackend::DeviceMapper),
                    Err(e) => {
                        warn!("device-mapper unavailable for {}: {:#}; falling back to loop", gsi_name, e);
                        let p = self.device_mapper.map_loop(&path).map_err(Error::Io)?;
                        (p, MapBackend::Loop)
                    }
                }
            }
            Err(e) => {
                warn!("no underlying device for {}: {:#}; using loop device", self.data_dir.display(), e);
                let p = self.device_mapper.map_loop(&path).map_err(Error::Io)?;
                (p, MapBackend::Loop)
            }
        };

        wait_for_device_node(&device_path, timeout).map_err(Error::Io)?;

        self.mapped.lock().expect("mapped mutex poisoned").insert(
            gsi_name,
            MappedImage {
                device_path: device_path.clone(),
                backend,
            },
        );
        Ok(device_path)
    }

    /// `unmap_image_device(name)`, with a `force` flavor for teardown
    /// paths that must not fail.
    pub fn unmap_image_device(&self, name: &str, force: bool) -> Result<(), Error> {
        let gsi_name = Self::gsi_name(name);
        let mapped = self.mapped.lock().expect("mapped mutex poisoned").remove(&gsi_name);
        let Some(mapped) = mapped else {
            return Ok(());
        };
        let result = match mapped.backend {
            MapBackend::DeviceMapper => {
                self.device_mapper
                    .unmap_dm(&self.dm_name(&gsi_name), force, Duration::from_secs(5))
            }
            MapBackend::Loop => self.device_mapper.unmap_loop(&mapped.device_path),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if force => {
                warn!("forced unmap of {} ignoring error: {:#}", gsi_name, e);
                Ok(())
            }
            Err(e) => Err(Error::Busy(format!("{:#}", e))),
        }
    }

    pub fn is_image_mapped(&self, name: &str) -> bool {
        self.mapped
            .lock()
            .expect("mapped mutex poisoned")
            .contains_key(&Self::gsi_name(name))
    }

    pub fn get_mapped_image_device(&self, name: &str) -> Option<PathBuf> {
        self.mapped
            .lock()
            .expect("mapped mutex poisoned")
            .get(&Self::gsi_name(name))
            .map(|m| m.device_path.clone())
    }

    /// `zero_fill_new_image(name, bytes)`: zero the head of a freshly
    /// created image, directly on the data file.
    pub fn zero_fill_new_image(&self, name: &str, bytes: u64) -> Result<(), Error> {
        let gsi_name = Self::gsi_name(name);
        let path = self.data_path(&gsi_name);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| Error::Io(anyhow::Error::new(e)))?;
        extents::zero_fill(&file, bytes, |_, _| true)
            .map(|_| ())
            .map_err(Error::Io)
    }

    /// Standalone `zero_partition(name)` RPC: re-zero an existing image's
    /// first megabyte without recreating it.
    pub fn zero_partition(&self, name: &str) -> Result<(), Error> {
        const HEAD: u64 = 1024 * 1024;
        if !self.backing_image_exists(name) {
            return Err(Error::NotFound(Self::gsi_name(name)));
        }
        self.zero_fill_new_image(name, HEAD)
    }

    pub fn remove_all_images(&self) -> Result<(), Error> {
        let names: Vec<String> = self
            .metadata
            .lock()
            .expect("metadata mutex poisoned")
            .partitions
            .iter()
            .map(|p| p.name.clone())
            .collect();
        for gsi_name in names {
            self.delete_backing_image(&gsi_name)?;
        }
        // Sweep any data files FIEMAP/metadata lost track of (e.g. left
        // over from an interrupted create) so `remove()`/`wipe()` are
        // truly idempotent per spec §8 law 6.
        if let Ok(dir) = fs::read_dir(&self.data_dir) {
            for ent in dir.flatten() {
                let fname = ent.file_name().to_string_lossy().into_owned();
                if fname.contains(GSI_SUFFIX) {
                    let _ = fs::remove_file(ent.path());
                }
            }
        }
        Ok(())
    }

    /// Remove images belonging to a disabled install (no separate
    /// "disabled" flag on images themselves; driven by `BootStatus`, which
    /// calls `remove_all_images` when the install as a whole is removed).
    pub fn remove_disabled_images(&self) -> Result<(), Error> {
        self.remove_all_images()
    }

    /// `validate()`: for every image, re-read extents and confirm they
    /// still match the persisted metadata.
    pub fn validate(&self) -> bool {
        let metadata = self.metadata.lock().expect("metadata mutex poisoned");
        for p in &metadata.partitions {
            let path = self.data_path(&p.name);
            match self.extent_backend.verify_pinned(&path, &p.extents) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("extent mismatch for {}: host filesystem moved blocks", p.name);
                    return false;
                }
                Err(e) => {
                    warn!("failed verifying extents for {}: {:#}", p.name, e);
                    return false;
                }
            }
        }
        true
    }

    pub fn dump_device_mapper_devices(&self) -> anyhow::Result<String> {
        let devices = self.device_mapper.list(DM_NAME_PREFIX)?;
        let mut out = String::new();
        for d in devices {
            out.push_str(&format!("{}\t{:?}\t{:?}\n", d.name, d.device_path, d.backend));
        }
        Ok(out)
    }
}

fn classify_write_error(e: anyhow::Error) -> Error {
    if e.to_string().contains("exceeding") {
        Error::FileSystemCluttered
    } else {
        Error::Io(e)
    }
}

fn wait_for_device_node(path: &Path, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            if timeout.is_zero() {
                return Ok(());
            }
            anyhow::bail!("timed out waiting for {:?} to appear", path);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodePartitionTableCodec;
    use crate::devmapper::test_backend::FakeDeviceMapper;
    use crate::extents::test_backend::FakeExtentBackend;
    use tempfile::tempdir;

    fn make_store(meta: &Path, data: &Path) -> ImageStore {
        ImageStore::open(
            meta,
            data,
            Box::new(FakeExtentBackend::default()),
            Box::new(FakeDeviceMapper::default()),
            Box::new(BincodePartitionTableCodec),
        )
        .unwrap()
    }

    #[test]
    fn create_map_unmap_delete_roundtrip() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());

        store
            .create_backing_image("system", 10 * 1024 * 1024, PartitionFlags::default(), |_, _| true)
            .unwrap();
        assert!(store.backing_image_exists("system"));
        assert!(store.partition_exists("system"));

        let dev = store.map_image_device("system", Duration::from_secs(1)).unwrap();
        assert!(store.is_image_mapped("system"));
        assert_eq!(store.get_mapped_image_device("system"), Some(dev));

        store.unmap_image_device("system", false).unwrap();
        assert!(!store.is_image_mapped("system"));

        store.delete_backing_image("system").unwrap();
        assert!(!store.backing_image_exists("system"));
        assert!(!store.partition_exists("system"));
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());
        store
            .create_backing_image("system", 1024, PartitionFlags::default(), |_, _| true)
            .unwrap();
        let err = store
            .create_backing_image("system", 1024, PartitionFlags::default(), |_, _| true)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn zeroed_flag_aborts_on_progress_false_and_cleans_up() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());
        let flags = PartitionFlags {
            readonly: false,
            zeroed: true,
        };
        let err = store
            .create_backing_image("userdata", 4 * 1024 * 1024, flags, |_, _| false)
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));
        assert!(!store.backing_image_exists("userdata"));
    }

    #[test]
    fn validate_passes_right_after_create() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());
        store
            .create_backing_image("system", 1024 * 1024, PartitionFlags::default(), |_, _| true)
            .unwrap();
        assert!(store.validate());
    }

    #[test]
    fn remove_all_images_is_idempotent() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());
        store
            .create_backing_image("system", 1024, PartitionFlags::default(), |_, _| true)
            .unwrap();
        store
            .create_backing_image("userdata", 1024, PartitionFlags::default(), |_, _| true)
            .unwrap();
        store.remove_all_images().unwrap();
        assert!(!store.backing_image_exists("system"));
        assert!(!store.backing_image_exists("userdata"));
        // second call: no error, nothing left to remove
        store.remove_all_images().unwrap();
    }
}
