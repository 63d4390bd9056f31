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

//! The on-disk boot-status protocol (spec §4.3): a handful of small files
//! under `metadata_dir` that tell the bootloader and the daemon itself
//! whether to boot the original image, the installed image (possibly just
//! once), or to reclaim a failed/wiped installation on the next startup.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::image_store::ImageStore;

const INSTALLING: &str = "0";
const OK: &str = "ok";
const DISABLED: &str = "disabled";
const WIPE: &str = "wipe";

/// Whether the device is currently running the installed image. Modeled as
/// an injectable capability (rather than a direct `/proc/cmdline` read) so
/// `run_startup_tasks`'s logic is testable without a real kernel cmdline.
pub trait BootOrigin: Send + Sync {
    fn is_booted_into_installed_image(&self) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct KernelCmdlineBootOrigin;

impl BootOrigin for KernelCmdlineBootOrigin {
    fn is_booted_into_installed_image(&self) -> Result<bool> {
        let cmdline = fs::read_to_string("/proc/cmdline").context("reading /proc/cmdline")?;
        Ok(cmdline.split_whitespace().any(|tok| tok == "dsu.slot=gsi"))
    }
}

pub struct BootStatus {
    metadata_dir: PathBuf,
    boot_origin: Box<dyn BootOrigin>,
}

impl BootStatus {
    pub fn new(metadata_dir: impl Into<PathBuf>, boot_origin: Box<dyn BootOrigin>) -> Self {
        BootStatus {
            metadata_dir: metadata_dir.into(),
            boot_origin,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.metadata_dir.join(name)
    }

    fn read_status(&self) -> Option<String> {
        fs::read_to_string(self.path("install_status"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn write_status(&self, value: &str) -> Result<()> {
        atomic_write(&self.path("install_status"), value.as_bytes())
    }

    pub fn is_installed(&self) -> bool {
        self.read_status().is_some()
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.read_status().as_deref(), Some(INSTALLING) | Some(OK))
    }

    pub fn is_running(&self) -> Result<bool> {
        self.boot_origin.is_booted_into_installed_image()
    }

    pub fn install_dir(&self) -> Option<String> {
        fs::read_to_string(self.path("install_dir"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// `finalize` (spec §4.2/§4.3): write `install_dir`, optionally arm
    /// `one_shot`, then write `install_status` last — ordering is the
    /// correctness property that makes the install "bootable" only once
    /// every preceding write has landed.
    pub fn finalize(&self, install_dir: &str, one_shot: bool) -> Result<()> {
        atomic_write(&self.path("install_dir"), install_dir.as_bytes())?;
        if one_shot {
            File::create(self.path("one_shot")).context("creating one_shot marker")?;
        }
        self.write_status(INSTALLING)?;
        info!("finalized install at {} (one_shot={})", install_dir, one_shot);
        Ok(())
    }

    pub fn mark_complete(&self, install_dir: &str) -> Result<()> {
        let slot_dir = Path::new(install_dir);
        atomic_write(&slot_dir.join("complete"), b"OK")
    }

    /// `enable(one_shot)` on a `"disabled"` install.
    pub fn enable(&self, one_shot: bool) -> Result<()> {
        if !self.is_installed() {
            anyhow::bail!("no install exists to enable");
        }
        if one_shot {
            File::create(self.path("one_shot")).context("creating one_shot marker")?;
        } else {
            let _ = fs::remove_file(self.path("one_shot"));
        }
        self.write_status(INSTALLING)
    }

    pub fn disable(&self, session_in_progress: bool) -> Result<()> {
        if session_in_progress {
            anyhow::bail!("cannot disable while an install is in progress");
        }
        self.write_status(DISABLED)
    }

    /// `remove()`: delete everything, including backing images, right now.
    pub fn remove(&self, images: &ImageStore) -> Result<()> {
        if let Some(dir) = self.install_dir() {
            let _ = fs::remove_file(Path::new(&dir).join("complete"));
        }
        images.remove_all_images().context("removing images")?;
        self.remove_status_files()
    }

    /// `wipe()`: like `remove()` but safe to call while currently booted
    /// into the installed image — defers image deletion by writing
    /// `"wipe"`, which `run_startup_tasks` picks up on the next
    /// non-installed boot.
    pub fn wipe(&self) -> Result<()> {
        self.write_status(WIPE)
    }

    fn remove_status_files(&self) -> Result<()> {
        for name in ["install_status", "one_shot", "install_dir"] {
            let _ = fs::remove_file(self.path(name));
        }
        Ok(())
    }

    /// `run_startup_tasks` (spec §4.3/§4.4). Runs with the service's coarse
    /// lock already held.
    pub fn run_startup_tasks(&self, images: &ImageStore) -> Result<()> {
        let booted_into_installed = self.boot_origin.is_booted_into_installed_image()?;
        let status = self.read_status();

        match status.as_deref() {
            Some(WIPE) if !booted_into_installed => {
                info!("reclaiming install pending wipe");
                images.remove_all_images().context("removing images")?;
                self.remove_status_files()?;
            }
            Some(INSTALLING) if booted_into_installed => {
                let had_one_shot = self.path("one_shot").exists();
                let _ = fs::remove_file(self.path("one_shot"));
                self.write_status(OK)?;
                info!(
                    "confirmed first boot into installed image (one_shot was {})",
                    had_one_shot
                );
            }
            _ => {}
        }

        if let Some(dir) = self.install_dir() {
            let slot_complete = Path::new(&dir).join("complete");
            if self.is_installed() && !slot_complete.exists() {
                warn!(
                    "install at {} has no complete marker; reclaiming stale install",
                    dir
                );
                images.remove_all_images().context("removing images")?;
                self.remove_status_files()?;
            }
        }

        Ok(())
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("partial");
    fs::write(&tmp, data).with_context(|| format!("writing {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {:?} to {:?}", tmp, path))?;
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    pub struct FakeBootOrigin(pub Cell<bool>);

    impl BootOrigin for FakeBootOrigin {
        fn is_booted_into_installed_image(&self) -> Result<bool> {
            Ok(self.0.get())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeBootOrigin;
    use super::*;
    use crate::devmapper::test_backend::FakeDeviceMapper;
    use crate::extents::test_backend::FakeExtentBackend;
    use crate::codec::BincodePartitionTableCodec;
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
    fn finalize_then_enable_ok_writes_expected_status() {
        let meta = tempdir().unwrap();
        let origin = FakeBootOrigin::default();
        let status = BootStatus::new(meta.path(), Box::new(origin));

        status.finalize("/data/gsi/dsu/", false).unwrap();
        assert!(status.is_installed());
        assert_eq!(status.read_status().as_deref(), Some(INSTALLING));
        assert!(!status.path("one_shot").exists());
        assert_eq!(status.install_dir().as_deref(), Some("/data/gsi/dsu/"));
    }

    #[test]
    fn one_shot_flow_reverts_to_ok_after_first_boot() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let install_dir = tempdir().unwrap();
        let install_dir_str = format!("{}/", install_dir.path().display());
        let origin = FakeBootOrigin::default();
        let cell = &origin.0;
        let status = BootStatus::new(meta.path(), Box::new(origin));
        let store = make_store(meta.path(), data.path());

        status.finalize(&install_dir_str, true).unwrap();
        status.mark_complete(&install_dir_str).unwrap();
        assert!(status.path("one_shot").exists());

        cell.set(true);
        status.run_startup_tasks(&store).unwrap();
        assert!(!status.path("one_shot").exists());
        assert_eq!(status.read_status().as_deref(), Some(OK));

        // Second simulated boot into the installed image shouldn't loop
        // back to "0" or recreate one_shot.
        status.run_startup_tasks(&store).unwrap();
        assert_eq!(status.read_status().as_deref(), Some(OK));
    }

    #[test]
    fn startup_reclaims_install_missing_complete_marker() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let origin = FakeBootOrigin::default();
        let status = BootStatus::new(meta.path(), Box::new(origin));
        let store = make_store(meta.path(), data.path());

        status.finalize("/data/gsi/dsu/", false).unwrap();
        // no `complete` marker was ever written for this install dir
        status.run_startup_tasks(&store).unwrap();
        assert!(!status.is_installed());
    }

    #[test]
    fn disable_fails_while_session_in_progress() {
        let meta = tempdir().unwrap();
        let origin = FakeBootOrigin::default();
        let status = BootStatus::new(meta.path(), Box::new(origin));
        status.finalize("/data/gsi/dsu/", false).unwrap();
        assert!(status.disable(true).is_err());
        assert!(status.disable(false).is_ok());
        assert_eq!(status.read_status().as_deref(), Some(DISABLED));
    }
}
