// Copyright 2019 CoreOS, Inc.
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

//! Block device introspection: the host block device underlying the
//! directory backing images live in has to be queried for its sector size
//! and total size before `BlockExtentBackend`/`DeviceMapper` can trust the
//! extents they compute. No GPT or filesystem manipulation happens here:
//! this daemon never partitions or mounts anything, it only inspects.

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::convert::TryInto;
use std::fs::{read_to_string, File, OpenOptions};
use std::num::{NonZeroU32, NonZeroU64};
use std::os::raw::c_int;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use crate::util::cmd_output;

pub fn lsblk_single(dev: &Path) -> Result<HashMap<String, String>> {
    let mut devinfos = lsblk(dev, false)?;
    if devinfos.is_empty() {
        // this should never happen because `lsblk` itself would've failed
        bail!("no lsblk results for {}", dev.display());
    }
    Ok(devinfos.remove(0))
}

pub fn lsblk(dev: &Path, with_deps: bool) -> Result<Vec<HashMap<String, String>>> {
    let mut cmd = Command::new("lsblk");
    // Older lsblk, e.g. in CentOS 7.6, doesn't support PATH, but --paths option
    cmd.arg("--pairs")
        .arg("--paths")
        .arg("--output")
        .arg("NAME,TYPE,MOUNTPOINT")
        .arg(dev);
    if !with_deps {
        cmd.arg("--nodeps");
    }
    let output = cmd_output(&mut cmd)?;
    let mut result: Vec<HashMap<String, String>> = Vec::new();
    for line in output.lines() {
        result.push(split_lsblk_line(line));
    }
    Ok(result)
}

/// Parse key-value pairs from lsblk --pairs.
/// Newer versions of lsblk support JSON but the one in CentOS 7 doesn't.
fn split_lsblk_line(line: &str) -> HashMap<String, String> {
    let re = Regex::new(r#"([A-Z-]+)="([^"]+)""#).unwrap();
    let mut fields: HashMap<String, String> = HashMap::new();
    for cap in re.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

/// Get the sector size of the block device at a given path.
pub fn get_sector_size_for_path(device: &Path) -> Result<NonZeroU32> {
    let dev = OpenOptions::new()
        .read(true)
        .open(device)
        .with_context(|| format!("opening {:?}", device))?;

    if !dev
        .metadata()
        .with_context(|| format!("getting metadata for {:?}", device))?
        .file_type()
        .is_block_device()
    {
        bail!("{:?} is not a block device", device);
    }

    get_sector_size(&dev)
}

/// Get the logical sector size of a block device.
pub fn get_sector_size(file: &File) -> Result<NonZeroU32> {
    let fd = file.as_raw_fd();
    let mut size: c_int = 0;
    match unsafe { ioctl::blksszget(fd, &mut size) } {
        Ok(_) => {
            let size_u32: u32 = size
                .try_into()
                .with_context(|| format!("sector size {} doesn't fit in u32", size))?;
            NonZeroU32::new(size_u32).ok_or_else(|| anyhow!("found sector size of zero"))
        }
        Err(e) => Err(anyhow!(e).context("getting sector size")),
    }
}

/// Get the size of a block device.
pub fn get_block_device_size(file: &File) -> Result<NonZeroU64> {
    let fd = file.as_raw_fd();
    let mut size: libc::size_t = 0;
    match unsafe { ioctl::blkgetsize64(fd, &mut size) } {
        // just cast using `as`: there is no platform we care about today where size_t > 64bits
        Ok(_) => NonZeroU64::new(size as u64).ok_or_else(|| anyhow!("found block size of zero")),
        Err(e) => Err(anyhow!(e).context("getting block size")),
    }
}

pub fn udev_settle() -> Result<()> {
    // "udevadm settle" silently no-ops if the udev socket is missing.
    if !Path::new("/run/udev/control").exists() {
        bail!("udevd socket missing; are we running in a container without /run/udev mounted?");
    }

    // There's a potential window after device-mapper table changes where
    // udevd hasn't yet processed the uevent. Sleep our way out of it.
    sleep(Duration::from_millis(200));

    crate::runcmd!("udevadm", "settle")?;
    Ok(())
}

/// Reread the kernel's cached partition table for a whole-disk device.
/// Only meaningful for partitionable devices; device-mapper nodes don't
/// support this ioctl.
pub fn reread_partition_table(file: &mut File) -> Result<()> {
    let fd = file.as_raw_fd();
    for retries in (0..20).rev() {
        let result = unsafe { ioctl::blkrrpart(fd) };
        match result {
            Ok(_) => break,
            Err(err) => {
                if retries == 0 {
                    return Err(err).context("couldn't reread partition table");
                }
                sleep(Duration::from_millis(100));
            }
        }
    }
    Ok(())
}

/// Resolve the whole-disk device node backing an arbitrary path (typically
/// the directory DSI stores its backing images in), by walking up to the
/// mountpoint and asking lsblk for its parent kernel name.
pub fn underlying_device_for_path(path: &Path) -> Result<PathBuf> {
    let canon = path
        .canonicalize()
        .with_context(|| format!("canonicalizing {:?}", path))?;
    let mounts = read_to_string("/proc/self/mountinfo").context("reading mount table")?;
    let mut best: Option<(usize, PathBuf)> = None;
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let mountpoint = Path::new(fields[4]);
        if canon.starts_with(mountpoint) {
            let hyphen = match fields.iter().position(|f| *f == "-") {
                Some(i) => i,
                None => continue,
            };
            if hyphen + 2 >= fields.len() {
                continue;
            }
            let source = fields[hyphen + 2];
            let len = mountpoint.as_os_str().len();
            if best.as_ref().map(|(l, _)| len > *l).unwrap_or(true) {
                best = Some((len, PathBuf::from(source)));
            }
        }
    }
    let (_, source) = best.with_context(|| format!("no mount found containing {:?}", canon))?;
    Ok(source)
}

// create unsafe ioctl wrappers
#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use super::c_int;
    use nix::{ioctl_none, ioctl_read, ioctl_read_bad, request_code_none};
    ioctl_none!(blkrrpart, 0x12, 95);
    ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    #[test]
    fn lsblk_split() {
        assert_eq!(
            split_lsblk_line(r#"NAME="sda" TYPE="disk" MOUNTPOINT="""#),
            hashmap! {
                String::from("NAME") => String::from("sda"),
                String::from("TYPE") => String::from("disk"),
            }
        );
        assert_eq!(
            split_lsblk_line(r#"NAME="sda1" TYPE="part" MOUNTPOINT="/data""#),
            hashmap! {
                String::from("NAME") => String::from("sda1"),
                String::from("TYPE") => String::from("part"),
                String::from("MOUNTPOINT") => String::from("/data"),
            }
        );
    }
}
