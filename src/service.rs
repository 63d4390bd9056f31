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

//! `Service`: the daemon's single in-process state machine (spec §4.4).
//!
//! Holds the `ImageStore` and `BootStatus` that make up its durable state,
//! plus at most one open install directory at a time (one `InstallSession`
//! per partition name within it). A single coarse `lock` mutex serializes
//! every state-changing call; `get_install_progress` deliberately bypasses
//! it and reads straight from each session's own `ProgressRecord`, so a
//! client polling progress is never blocked behind a long-running write.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;

use crate::boot_status::BootStatus;
use crate::codec::PartitionTableCodec;
use crate::devmapper::DeviceMapper;
use crate::error::{RpcError, SessionError};
use crate::extents::BlockExtentBackend;
use crate::image_store::ImageStore;
use crate::progress::Progress;
use crate::session::{AtomicAbortSignal, InstallSession};

/// Where `begin_install` (spec §3/§4.4) is allowed to open an install
/// directory: either exactly `default_install_dir`, or anywhere under one of
/// `allowed_external_roots`. Both are resolved with `util::validate_install_path`
/// so a client-supplied path can never escape either root via `..` or a
/// symlink, and must already be absolute and normalized (realpath).
pub struct InstallPathPolicy {
    pub default_install_dir: PathBuf,
    pub allowed_external_roots: Vec<PathBuf>,
}

impl InstallPathPolicy {
    pub fn new(default_install_dir: PathBuf, allowed_external_roots: Vec<PathBuf>) -> Self {
        InstallPathPolicy {
            default_install_dir,
            allowed_external_roots,
        }
    }

    /// Validates a client-supplied `install_dir` and returns it normalized
    /// with a trailing `/`. Rejects anything not absolute, not ending in
    /// `/`, or resolving outside every allowed root.
    fn validate(&self, install_dir: &str) -> anyhow::Result<String> {
        if !install_dir.ends_with('/') {
            anyhow::bail!("install_dir {:?} must end with '/'", install_dir);
        }
        let candidate = Path::new(install_dir);
        if !candidate.is_absolute() {
            anyhow::bail!("install_dir {:?} must be an absolute path", install_dir);
        }

        if let Some(default_parent) = self.default_install_dir.parent() {
            if let Ok(resolved) = crate::util::validate_install_path(candidate, default_parent) {
                if resolved == self.default_install_dir {
                    return Ok(format!("{}/", resolved.display()));
                }
            }
        }
        for root in &self.allowed_external_roots {
            if let Ok(resolved) = crate::util::validate_install_path(candidate, root) {
                return Ok(format!("{}/", resolved.display()));
            }
        }
        anyhow::bail!(
            "install_dir {:?} must be {:?} or reside under an allowed external storage root",
            install_dir,
            self.default_install_dir
        )
    }
}

/// Builds the trio of backend capabilities a freshly opened `ImageStore`
/// needs. Stored on `Service` so `open_image_service` (spec §6, Root-only)
/// can stand up an `ImageStore` under an arbitrary prefix without the
/// daemon's main image store and any side-loaded ones needing the same
/// concrete backend types baked in at compile time.
pub type BackendFactory = dyn Fn() -> (
        Box<dyn BlockExtentBackend>,
        Box<dyn DeviceMapper>,
        Box<dyn PartitionTableCodec>,
    ) + Send
    + Sync;

/// Caller privilege tier, derived from `SO_PEERCRED` by the RPC transport
/// (spec §6). Ordered loosest-to-strictest so a `>=` comparison expresses
/// "at least this privileged".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallerTier {
    Shell,
    System,
    Root,
}

struct OpenInstall {
    install_dir: String,
    sessions: HashMap<String, InstallSession>,
    abort: Arc<AtomicAbortSignal>,
}

pub struct Service {
    images: Arc<ImageStore>,
    boot_status: Arc<BootStatus>,
    install: Mutex<Option<OpenInstall>>,
    shared_buffer: Mutex<Option<(File, u64)>>,
    side_roots: (PathBuf, PathBuf),
    side_stores: Mutex<HashMap<String, Arc<ImageStore>>>,
    backend_factory: Box<BackendFactory>,
    install_paths: InstallPathPolicy,
}

fn require_tier(caller: CallerTier, minimum: CallerTier) -> Result<(), RpcError> {
    if caller >= minimum {
        Ok(())
    } else {
        Err(RpcError::Unauthorized)
    }
}

impl Service {
    pub fn new(
        images: Arc<ImageStore>,
        boot_status: Arc<BootStatus>,
        install_paths: InstallPathPolicy,
    ) -> Self {
        Self::with_side_store_support(
            images,
            boot_status,
            PathBuf::from("/metadata/gsi"),
            PathBuf::from("/data/gsi"),
            install_paths,
            Box::new(|| {
                (
                    Box::new(crate::extents::FiemapBackend) as Box<dyn BlockExtentBackend>,
                    Box::new(crate::devmapper::LinuxDeviceMapper) as Box<dyn DeviceMapper>,
                    Box::new(crate::codec::BincodePartitionTableCodec) as Box<dyn PartitionTableCodec>,
                )
            }),
        )
    }

    /// Like `new`, but also configures where `open_image_service` should
    /// look for (and create, if absent) a side-loaded prefix's metadata/data
    /// directories, and which backend implementations to build its
    /// `ImageStore` from. Exposed separately so tests can inject fakes.
    pub fn with_side_store_support(
        images: Arc<ImageStore>,
        boot_status: Arc<BootStatus>,
        side_metadata_root: PathBuf,
        side_data_root: PathBuf,
        install_paths: InstallPathPolicy,
        backend_factory: Box<BackendFactory>,
    ) -> Self {
        Service {
            images,
            boot_status,
            install: Mutex::new(None),
            shared_buffer: Mutex::new(None),
            side_roots: (side_metadata_root, side_data_root),
            side_stores: Mutex::new(HashMap::new()),
            backend_factory,
            install_paths,
        }
    }

    /// Run once at daemon startup, before accepting any RPC connections.
    pub fn run_startup_tasks(&self) -> anyhow::Result<()> {
        self.boot_status.run_startup_tasks(&self.images)
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    /// `begin_install(install_dir, caller)`: opens (or reopens) the single
    /// install directory this daemon instance will track sessions for.
    /// Requires `System` or above, matching every other state-mutating
    /// call.
    pub fn begin_install(&self, install_dir: &str, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        let install_dir = self
            .install_paths
            .validate(install_dir)
            .map_err(RpcError::Other)?;
        let mut guard = self.install.lock().expect("service lock poisoned");
        if let Some(open) = guard.as_ref() {
            if open.sessions.values().any(|s| matches!(
                s.state(),
                crate::session::SessionState::Streaming
            )) {
                return Err(RpcError::Other(anyhow::anyhow!(
                    "an install is already in progress at {}",
                    open.install_dir
                )));
            }
        }
        *guard = Some(OpenInstall {
            install_dir: install_dir.clone(),
            sessions: HashMap::new(),
            abort: Arc::new(AtomicAbortSignal::default()),
        });
        info!("opened install at {}", install_dir);
        Ok(())
    }

    /// `cancel_install(caller)`: raises the cooperative abort flag shared by
    /// every session of the currently open install (spec §5/§8 law 7). Not
    /// preemptive — the next `write_chunk` call to observe it at a chunk
    /// boundary aborts and unwinds; a read already in flight still completes.
    pub fn cancel_install(&self, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        let guard = self.install.lock().expect("service lock poisoned");
        if let Some(open) = guard.as_ref() {
            open.abort.raise();
        }
        Ok(())
    }

    /// `close_install(caller)`: the symmetric counterpart of
    /// `begin_install` — releases this daemon's bookkeeping of the RPC-level
    /// install session without tearing anything down. Every partition must
    /// already be `Finalized` or never have been created; a partition still
    /// `Streaming` must be finished or cancelled first. Unlike `enable`,
    /// this never touches boot-status: the install stays exactly as bootable
    /// (or not) as it was before the call.
    pub fn close_install(&self, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        let mut guard = self.install.lock().expect("service lock poisoned");
        if let Some(open) = guard.as_ref() {
            if open
                .sessions
                .values()
                .any(|s| s.state() == crate::session::SessionState::Streaming)
            {
                return Err(RpcError::Other(anyhow::anyhow!(
                    "cannot close install at {} while a partition is still streaming",
                    open.install_dir
                )));
            }
        }
        *guard = None;
        Ok(())
    }

    /// `create_partition(name, size, read_only, wipe, caller)`: creates
    /// and preallocates the named partition's session within the
    /// currently open install.
    pub fn create_partition(
        &self,
        name: &str,
        size: u64,
        read_only: bool,
        wipe: bool,
        caller: CallerTier,
    ) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        if self
            .boot_status
            .is_running()
            .map_err(RpcError::Other)?
        {
            return Err(RpcError::Other(anyhow::anyhow!(
                "cannot preallocate partition {}: device is currently booted into the installed image",
                name
            )));
        }
        let mut guard = self.install.lock().expect("service lock poisoned");
        let open = guard
            .as_mut()
            .ok_or_else(|| RpcError::Other(anyhow::anyhow!("no install is open")))?;

        let mut session = InstallSession::new(
            open.install_dir.clone(),
            name,
            size,
            read_only,
            wipe,
            Arc::clone(&self.images),
            Arc::clone(&open.abort) as Arc<dyn crate::session::AbortSignal>,
            Arc::new(crate::progress::ProgressRecord::new()),
        );
        session.preallocate().map_err(RpcError::Session)?;
        session.open_writer().map_err(RpcError::Session)?;
        open.sessions.insert(name.to_string(), session);
        Ok(())
    }

    /// `commit_chunk_from_stream(name, data, len, caller)` (spec §6: System
    /// tier, same as every other state-mutating call).
    pub fn write_chunk(
        &self,
        name: &str,
        source: &mut dyn std::io::Read,
        len: u64,
        caller: CallerTier,
    ) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        let mut guard = self.install.lock().expect("service lock poisoned");
        let open = guard
            .as_mut()
            .ok_or_else(|| RpcError::Other(anyhow::anyhow!("no install is open")))?;
        let session = open
            .sessions
            .get_mut(name)
            .ok_or_else(|| RpcError::Other(anyhow::anyhow!("no session for partition {}", name)))?;
        session.write_chunk(source, len).map_err(RpcError::Session)
    }

    /// `commit_chunk_from_memory(name, bytes, caller)`: the bytes arrive
    /// inline in the RPC frame rather than over a passed fd; reduces to
    /// `write_chunk` over an in-memory cursor.
    pub fn commit_chunk_from_memory(
        &self,
        name: &str,
        data: Vec<u8>,
        caller: CallerTier,
    ) -> Result<(), RpcError> {
        let len = data.len() as u64;
        self.write_chunk(name, &mut Cursor::new(data), len, caller)
    }

    /// `set_shared_buffer(fd, size, caller)`: records the shared-memory
    /// handoff fd a later `commit_chunk_from_shared` reads from. Replaces
    /// any previously set buffer.
    pub fn set_shared_buffer(&self, fd: File, size: u64, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        *self.shared_buffer.lock().expect("shared buffer mutex poisoned") = Some((fd, size));
        Ok(())
    }

    /// `commit_chunk_from_shared(name, size, caller)`: reads `size` bytes
    /// from the start of the fd previously installed by `set_shared_buffer`.
    pub fn commit_chunk_from_shared(
        &self,
        name: &str,
        size: u64,
        caller: CallerTier,
    ) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        let mut guard = self.shared_buffer.lock().expect("shared buffer mutex poisoned");
        let (file, buf_size) = guard
            .as_mut()
            .ok_or_else(|| RpcError::Other(anyhow::anyhow!("no shared buffer has been set")))?;
        if size > *buf_size {
            return Err(RpcError::Malformed(format!(
                "requested {} bytes but shared buffer is only {} bytes",
                size, buf_size
            )));
        }
        file.seek(SeekFrom::Start(0))
            .map_err(|e| RpcError::Other(anyhow::Error::new(e)))?;
        let mut reader = file.try_clone().map_err(|e| RpcError::Other(anyhow::Error::new(e)))?;
        drop(guard);
        self.write_chunk(name, &mut reader, size, caller)
    }

    pub fn finalize_partition(&self, name: &str, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        let mut guard = self.install.lock().expect("service lock poisoned");
        let open = guard
            .as_mut()
            .ok_or_else(|| RpcError::Other(anyhow::anyhow!("no install is open")))?;
        let session = open
            .sessions
            .get_mut(name)
            .ok_or_else(|| RpcError::Other(anyhow::anyhow!("no session for partition {}", name)))?;
        match session.state() {
            crate::session::SessionState::Finalized => Ok(()),
            _ => session.finalize().map_err(RpcError::Session),
        }
    }

    /// `enable(one_shot, caller)`: finalizes the install as a whole once
    /// every open partition session has reached `Finalized`, then writes
    /// the boot-status files.
    pub fn enable(&self, one_shot: bool, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        let mut guard = self.install.lock().expect("service lock poisoned");
        let open = guard
            .as_ref()
            .ok_or_else(|| RpcError::Other(anyhow::anyhow!("no install is open")))?;

        for session in open.sessions.values() {
            if session.state() != crate::session::SessionState::Finalized {
                return Err(SessionError::WrongState {
                    state: "not all partitions finalized",
                }
                .into());
            }
        }

        self.boot_status
            .finalize(&open.install_dir, one_shot)
            .map_err(RpcError::Other)?;
        self.boot_status
            .mark_complete(&open.install_dir)
            .map_err(RpcError::Other)?;
        let install_dir = open.install_dir.clone();
        drop(guard);
        *self.install.lock().expect("service lock poisoned") = None;
        info!("install at {} enabled", install_dir);
        Ok(())
    }

    pub fn disable(&self, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        let in_progress = self.is_in_progress(caller)?;
        self.boot_status
            .disable(in_progress)
            .map_err(RpcError::Other)
    }

    pub fn wipe(&self, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        self.boot_status.wipe().map_err(RpcError::Other)
    }

    pub fn remove(&self, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        self.boot_status
            .remove(&self.images)
            .map_err(RpcError::Other)
    }

    /// `abort_install(caller)`: abandons every session in the currently
    /// open install and discards it.
    pub fn abort_install(&self, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::System)?;
        let mut guard = self.install.lock().expect("service lock poisoned");
        if let Some(mut open) = guard.take() {
            for (_, mut session) in open.sessions.drain() {
                session.abort();
            }
        }
        Ok(())
    }

    pub fn is_installed(&self, caller: CallerTier) -> Result<bool, RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        Ok(self.boot_status.is_installed())
    }

    pub fn is_running(&self, caller: CallerTier) -> Result<bool, RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        self.boot_status.is_running().map_err(RpcError::Other)
    }

    pub fn is_in_progress(&self, caller: CallerTier) -> Result<bool, RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        Ok(self.is_in_progress_unchecked())
    }

    fn is_in_progress_unchecked(&self) -> bool {
        let guard = self.install.lock().expect("service lock poisoned");
        guard
            .as_ref()
            .map(|open| {
                open.sessions
                    .values()
                    .any(|s| s.state() == crate::session::SessionState::Streaming)
            })
            .unwrap_or(false)
    }

    /// `get_install_progress(name)`: briefly takes the coarse lock only to
    /// clone the session's own `Arc<ProgressRecord>`, then reads the
    /// snapshot after releasing it — so a client polling progress never
    /// blocks behind a concurrent `write_chunk` call, which holds the
    /// coarse lock for the duration of its I/O.
    pub fn get_install_progress(&self, name: &str) -> Option<Progress> {
        let record = {
            let guard = self.install.lock().expect("service lock poisoned");
            guard
                .as_ref()
                .and_then(|open| open.sessions.get(name).map(|s| s.progress()))
        }?;
        Some(record.snapshot())
    }

    pub fn dump_device_mapper_devices(&self, caller: CallerTier) -> Result<String, RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        self.images
            .dump_device_mapper_devices()
            .map_err(RpcError::Other)
    }

    pub fn zero_partition(&self, name: &str, caller: CallerTier) -> Result<(), RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        self.images.zero_partition(name).map_err(|e| {
            RpcError::Session(SessionError::ImageStore(e))
        })
    }

    pub fn get_installed_image_dir(&self, caller: CallerTier) -> Result<Option<String>, RpcError> {
        require_tier(caller, CallerTier::System)?;
        Ok(self.boot_status.install_dir())
    }

    pub fn is_enabled(&self, caller: CallerTier) -> Result<bool, RpcError> {
        require_tier(caller, CallerTier::Shell)?;
        Ok(self.boot_status.is_enabled())
    }

    /// `open_image_service(prefix, caller)`: root-only entry point that
    /// stands up (or reuses) an `ImageStore` bound to a metadata/data
    /// directory pair scoped under `prefix`, distinct from the daemon's
    /// default `dsu`-prefixed store. Used for side-loading or test prefixes;
    /// the returned store is cached by prefix for the life of the daemon.
    pub fn open_image_service(&self, prefix: &str, caller: CallerTier) -> Result<Arc<ImageStore>, RpcError> {
        require_tier(caller, CallerTier::Root)?;
        let mut stores = self.side_stores.lock().expect("side store mutex poisoned");
        if let Some(store) = stores.get(prefix) {
            return Ok(Arc::clone(store));
        }
        let (metadata_root, data_root) = &self.side_roots;
        let metadata_dir = metadata_root.join(prefix);
        let data_dir = data_root.join(prefix);
        std::fs::create_dir_all(&metadata_dir).map_err(|e| RpcError::Other(anyhow::Error::new(e)))?;
        std::fs::create_dir_all(&data_dir).map_err(|e| RpcError::Other(anyhow::Error::new(e)))?;
        let (extents, devmapper, codec) = (self.backend_factory)();
        let store = ImageStore::open(&metadata_dir, &data_dir, extents, devmapper, codec)
            .map_err(RpcError::Other)?;
        let store = Arc::new(store);
        stores.insert(prefix.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Whether it is safe to shut down: no session anywhere is mid-stream.
    /// Used by the RPC accept loop's last-client-disconnect check (spec
    /// expansion: defer shutdown while an install is `Streaming`).
    pub fn shutdown_is_safe(&self) -> bool {
        !self.is_in_progress_unchecked()
    }

    pub const IDLE_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_status::test_support::FakeBootOrigin;
    use crate::codec::BincodePartitionTableCodec;
    use crate::devmapper::test_backend::FakeDeviceMapper;
    use crate::extents::test_backend::FakeExtentBackend;
    use tempfile::tempdir;

    fn make_service(meta: &std::path::Path, data: &std::path::Path) -> Service {
        let images = Arc::new(
            ImageStore::open(
                meta,
                data,
                Box::new(FakeExtentBackend::default()),
                Box::new(FakeDeviceMapper::default()),
                Box::new(BincodePartitionTableCodec),
            )
            .unwrap(),
        );
        let boot_status = Arc::new(BootStatus::new(meta, Box::new(FakeBootOrigin::default())));
        let install_paths = InstallPathPolicy::new(
            PathBuf::from("/data/gsi/dsu"),
            vec![std::env::temp_dir()],
        );
        Service::new(images, boot_status, install_paths)
    }

    fn make_service_with_origin(
        meta: &std::path::Path,
        data: &std::path::Path,
        origin: FakeBootOrigin,
    ) -> Service {
        let images = Arc::new(
            ImageStore::open(
                meta,
                data,
                Box::new(FakeExtentBackend::default()),
                Box::new(FakeDeviceMapper::default()),
                Box::new(BincodePartitionTableCodec),
            )
            .unwrap(),
        );
        let boot_status = Arc::new(BootStatus::new(meta, Box::new(origin)));
        let install_paths = InstallPathPolicy::new(
            PathBuf::from("/data/gsi/dsu"),
            vec![std::env::temp_dir()],
        );
        Service::new(images, boot_status, install_paths)
    }

    #[test]
    fn shell_caller_rejected_for_system_only_op() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let service = make_service(meta.path(), data.path());

        let err = service
            .begin_install("/data/gsi/dsu/", CallerTier::Shell)
            .unwrap_err();
        assert!(matches!(err, RpcError::Unauthorized));
    }

    #[test]
    fn begin_create_finalize_enable_round_trip() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let install_dir = tempdir().unwrap();
        let install_dir_str = format!("{}/", install_dir.path().display());
        let service = make_service(meta.path(), data.path());

        service
            .begin_install(&install_dir_str, CallerTier::System)
            .unwrap();
        service
            .create_partition("system", 1024 * 1024, true, false, CallerTier::System)
            .unwrap();
        let payload = vec![0xABu8; 1024 * 1024];
        service
            .write_chunk(
                "system",
                &mut Cursor::new(payload),
                1024 * 1024,
                CallerTier::System,
            )
            .unwrap();
        service
            .finalize_partition("system", CallerTier::System)
            .unwrap();

        service.enable(false, CallerTier::Shell).unwrap();
        assert!(service.is_installed(CallerTier::Shell).unwrap());
        assert!(!service.is_in_progress(CallerTier::Shell).unwrap());
    }

    #[test]
    fn enable_refuses_unless_all_partitions_finalized() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let install_dir = tempdir().unwrap();
        let install_dir_str = format!("{}/", install_dir.path().display());
        let service = make_service(meta.path(), data.path());

        service
            .begin_install(&install_dir_str, CallerTier::System)
            .unwrap();
        service
            .create_partition("system", 1024, true, false, CallerTier::System)
            .unwrap();

        let err = service.enable(false, CallerTier::Shell).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Session(SessionError::WrongState { .. })
        ));
    }

    #[test]
    fn close_install_refuses_while_partition_still_streaming() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let install_dir = tempdir().unwrap();
        let install_dir_str = format!("{}/", install_dir.path().display());
        let service = make_service(meta.path(), data.path());

        service
            .begin_install(&install_dir_str, CallerTier::System)
            .unwrap();
        service
            .create_partition("system", 1024, true, false, CallerTier::System)
            .unwrap();

        assert!(service.close_install(CallerTier::System).is_err());

        service
            .write_chunk(
                "system",
                &mut Cursor::new(vec![0u8; 1024]),
                1024,
                CallerTier::System,
            )
            .unwrap();
        service
            .finalize_partition("system", CallerTier::System)
            .unwrap();
        assert!(service.close_install(CallerTier::System).is_ok());
    }

    #[test]
    fn commit_chunk_from_memory_matches_stream_path() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let install_dir = tempdir().unwrap();
        let install_dir_str = format!("{}/", install_dir.path().display());
        let service = make_service(meta.path(), data.path());

        service
            .begin_install(&install_dir_str, CallerTier::System)
            .unwrap();
        service
            .create_partition("system", 4096, true, false, CallerTier::System)
            .unwrap();
        service
            .commit_chunk_from_memory("system", vec![0x11u8; 4096], CallerTier::System)
            .unwrap();
        service
            .finalize_partition("system", CallerTier::System)
            .unwrap();
    }

    #[test]
    fn cancel_install_fails_next_chunk_for_every_partition() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let install_dir = tempdir().unwrap();
        let install_dir_str = format!("{}/", install_dir.path().display());
        let service = make_service(meta.path(), data.path());

        service
            .begin_install(&install_dir_str, CallerTier::System)
            .unwrap();
        service
            .create_partition("system", 1024 * 1024, true, false, CallerTier::System)
            .unwrap();

        service.cancel_install(CallerTier::System).unwrap();

        let payload = vec![0u8; 512 * 1024];
        let err = service
            .write_chunk(
                "system",
                &mut Cursor::new(payload),
                512 * 1024,
                CallerTier::System,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Session(SessionError::Cancelled)
        ));
    }

    #[test]
    fn begin_install_rejects_path_without_trailing_slash() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let install_dir = tempdir().unwrap();
        let service = make_service(meta.path(), data.path());

        let err = service
            .begin_install(&install_dir.path().display().to_string(), CallerTier::System)
            .unwrap_err();
        assert!(matches!(err, RpcError::Other(_)));
    }

    #[test]
    fn begin_install_rejects_path_outside_allowed_roots() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let service = make_service(meta.path(), data.path());

        let err = service
            .begin_install("/etc/dsu/", CallerTier::System)
            .unwrap_err();
        assert!(matches!(err, RpcError::Other(_)));
    }

    #[test]
    fn create_partition_refuses_self_install() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let install_dir = tempdir().unwrap();
        let install_dir_str = format!("{}/", install_dir.path().display());
        let origin = FakeBootOrigin::default();
        origin.0.set(true);
        let service = make_service_with_origin(meta.path(), data.path(), origin);

        service
            .begin_install(&install_dir_str, CallerTier::System)
            .unwrap();
        let err = service
            .create_partition("system", 1024, true, false, CallerTier::System)
            .unwrap_err();
        assert!(matches!(err, RpcError::Other(_)));
    }

    #[test]
    fn open_image_service_requires_root() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let service = make_service(meta.path(), data.path());

        let err = service
            .open_image_service("side", CallerTier::System)
            .unwrap_err();
        assert!(matches!(err, RpcError::Unauthorized));
    }
}
