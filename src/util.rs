// Copyright 2020 CoreOS, Inc.
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

use anyhow::{anyhow, bail, Context, Result};
use nix::sys::statvfs::statvfs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs the provided command. The first macro argument is the executable, and following arguments
/// are passed to the command. Returns a Result<()> describing whether the command failed. Errors
/// are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd {
    ($cmd:expr) => (runcmd!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = Command::new($cmd);
        $( cmd.arg($args); )*
        let status = cmd.status().with_context(|| format!("running {:#?}", cmd))?;
        if !status.success() {
            Result::Err(anyhow!("{:#?} failed with {}", cmd, status))
        } else {
            Result::Ok(())
        }
    }}
}

/// Runs the provided command, captures its stdout, and swallows its stderr except on failure.
/// The first macro argument is the executable, and following arguments are passed to the command.
/// Returns a Result<String> describing whether the command failed, and if not, its standard
/// output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd_output {
    ($cmd:expr) => (runcmd_output!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = Command::new($cmd);
        $( cmd.arg($args); )*
        // NB: cmd_output already prefixes with cmd in all error paths
        cmd_output(&mut cmd)
    }}
}

/// Runs the provided Command object, captures its stdout, and swallows its stderr except on
/// failure. Returns a Result<String> describing whether the command failed, and if not, its
/// standard output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full
/// command.
pub fn cmd_output(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{:#?}`", cmd))
}

/// Resolve `candidate` and confirm it's inside `allowed_root`, rejecting
/// `..` escapes and symlink trickery. RPC callers supply install
/// directories by name; we never trust a path outside the configured root
/// even when the caller's tier would otherwise be privileged enough to ask
/// for it.
pub fn validate_install_path(candidate: &Path, allowed_root: &Path) -> Result<PathBuf> {
    let root = allowed_root
        .canonicalize()
        .with_context(|| format!("canonicalizing {:?}", allowed_root))?;
    let full = root.join(candidate);
    // The target may not exist yet (e.g. before create_backing_image), so
    // canonicalize the parent and re-append the file name instead of
    // requiring the whole path to pre-exist.
    let parent = full
        .parent()
        .ok_or_else(|| anyhow!("{:?} has no parent", full))?;
    let resolved_parent = parent
        .canonicalize()
        .with_context(|| format!("canonicalizing {:?}", parent))?;
    if !resolved_parent.starts_with(&root) {
        bail!("{:?} escapes the allowed root {:?}", candidate, root);
    }
    let name = full
        .file_name()
        .ok_or_else(|| anyhow!("{:?} has no file name", full))?;
    Ok(resolved_parent.join(name))
}

/// The two distinct ways a space check can fail (spec §7 "Capacity" / §8
/// scenario S3): running out of raw bytes maps to `NoSpace` at the call
/// site, while dropping below the 40% free-space floor maps to
/// `FileSystemCluttered` — the reference daemon surfaces the same status
/// code for "not enough headroom" as it does for "too fragmented to pin",
/// since both mean "this filesystem isn't in a state to take more images".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheckError {
    Insufficient,
    BelowMinFraction,
}

impl std::fmt::Display for SpaceCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpaceCheckError::Insufficient => write!(f, "not enough free space"),
            SpaceCheckError::BelowMinFraction => {
                write!(f, "allocation would drop free space below the required minimum fraction")
            }
        }
    }
}

impl std::error::Error for SpaceCheckError {}

/// Bail unless at least `min_free_fraction` of the filesystem containing
/// `path` would remain free after allocating `additional_bytes`. Backs the
/// 40%-headroom rule images are provisioned under.
pub fn check_free_space(
    path: &Path,
    additional_bytes: u64,
    min_free_fraction: f64,
) -> Result<(), SpaceCheckError> {
    let stat = statvfs(path).map_err(|_| SpaceCheckError::Insufficient)?;
    let block_size = stat.fragment_size().max(1) as u64;
    let total = stat.blocks() as u64 * block_size;
    let free = stat.blocks_available() as u64 * block_size;
    if additional_bytes > free {
        return Err(SpaceCheckError::Insufficient);
    }
    let free_after = free - additional_bytes;
    let min_free = (total as f64 * min_free_fraction) as u64;
    if free_after < min_free {
        return Err(SpaceCheckError::BelowMinFraction);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validate_install_path_rejects_escape() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("dsu")).unwrap();
        let ok = validate_install_path(Path::new("dsu/system_gsi.img"), dir.path());
        assert!(ok.is_ok());

        let escape = validate_install_path(Path::new("../../etc/passwd"), dir.path());
        assert!(escape.is_err());
    }

    #[test]
    fn check_free_space_rejects_oversized_request() {
        let dir = tempdir().unwrap();
        let err = check_free_space(dir.path(), u64::MAX / 2, 0.4).unwrap_err();
        assert_eq!(err, SpaceCheckError::Insufficient);
    }
}
