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

//! `InstallSession`: the per-partition installation object (spec §4.2).
//! Carries the state machine `Open -> Preallocated -> Streaming ->
//! Finalized | Aborted`, the exclusively-owned mapped-device writer, and
//! a handle to the shared progress record.
//!
//! One `InstallSession` exists per named partition (`system`, `userdata`)
//! within a single open install directory; `service::Service` is
//! responsible for holding at most one *install* open at a time and for
//! writing the install-wide boot-status files once every partition's
//! session has reached `Finalized`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::codec::PartitionFlags;
use crate::error::SessionError;
use crate::image_store::ImageStore;
use crate::io::{copy_exactly_n, CHUNK_READ_BLOCK};
use crate::progress::ProgressRecord;

const DEFAULT_USERDATA_SIZE: u64 = 2 * 1024 * 1024 * 1024;
const MAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Preallocated,
    Streaming,
    Finalized,
    Aborted,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Open => "Open",
            SessionState::Preallocated => "Preallocated",
            SessionState::Streaming => "Streaming",
            SessionState::Finalized => "Finalized",
            SessionState::Aborted => "Aborted",
        }
    }
}

/// Narrow capability for cooperative cancellation (spec §5/§9): the
/// session consults this at chunk boundaries rather than owning the
/// service's lock.
pub trait AbortSignal: Send + Sync {
    fn should_abort(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct AtomicAbortSignal(AtomicBool);

impl AtomicAbortSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AbortSignal for AtomicAbortSignal {
    fn should_abort(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The streaming sink: a direct file descriptor over a mapped block
/// device, or (when no device node could be obtained at all) a
/// user-space writer straight into the backing data file.
enum Writer {
    Fd(File),
    SplitFile(File),
}

impl Writer {
    fn file_mut(&mut self) -> &mut File {
        match self {
            Writer::Fd(f) => f,
            Writer::SplitFile(f) => f,
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file_mut().sync_all()
    }
}

pub struct InstallSession {
    install_dir: String,
    partition_name: String,
    size: u64,
    read_only: bool,
    wipe_existing: bool,
    state: SessionState,
    bytes_written: u64,
    writer: Option<Writer>,
    image_store: Arc<ImageStore>,
    abort: Arc<dyn AbortSignal>,
    progress: Arc<ProgressRecord>,
}

impl InstallSession {
    pub fn new(
        install_dir: impl Into<String>,
        partition_name: impl Into<String>,
        size: u64,
        read_only: bool,
        wipe_existing: bool,
        image_store: Arc<ImageStore>,
        abort: Arc<dyn AbortSignal>,
        progress: Arc<ProgressRecord>,
    ) -> Self {
        InstallSession {
            install_dir: install_dir.into(),
            partition_name: partition_name.into(),
            size,
            read_only,
            wipe_existing,
            state: SessionState::Open,
            bytes_written: 0,
            writer: None,
            image_store,
            abort,
            progress,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn partition_name(&self) -> &str {
        &self.partition_name
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn is_userdata(&self) -> bool {
        self.partition_name == "userdata"
    }

    fn require_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state != expected {
            return Err(SessionError::WrongState {
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// `preallocate()` (spec §4.2).
    pub fn preallocate(&mut self) -> Result<(), SessionError> {
        self.require_state(SessionState::Open)?;

        let effective_size = if self.is_userdata() && self.size == 0 {
            DEFAULT_USERDATA_SIZE
        } else {
            self.size
        };

        if self.wipe_existing && self.is_userdata() {
            self.image_store.delete_backing_image(&self.partition_name)?;
        }

        let existing = self.image_store.backing_image_exists(&self.partition_name);
        if existing && !self.wipe_existing {
            // Reuse an existing compatible image. Resizing an existing
            // userdata image is an explicitly undecided area upstream
            // (spec §9 open question 1); this implementation refuses
            // rather than silently resizing, so a caller who needs a
            // different size must pass `wipe=true`.
            let current_size = self.image_store.partition_size(&self.partition_name);
            if current_size != Some(effective_size) {
                return Err(SessionError::Other(anyhow::anyhow!(
                    "existing image {} has size {:?}, requested {}; pass wipe=true to resize",
                    self.partition_name,
                    current_size,
                    effective_size
                )));
            }
        } else {
            if existing {
                self.image_store.delete_backing_image(&self.partition_name)?;
            }
            let abort = Arc::clone(&self.abort);
            let flags = PartitionFlags {
                readonly: self.read_only,
                zeroed: self.is_userdata(),
            };
            self.image_store.create_backing_image(
                &self.partition_name,
                effective_size,
                flags,
                move |_done, _total| !abort.should_abort(),
            )?;
        }

        self.size = effective_size;
        self.state = SessionState::Preallocated;
        Ok(())
    }

    /// `open_writer()`. A session constructed with `read_only == false`
    /// (the userdata path: already zero-filled at preallocate time, no
    /// bytes to stream) transitions straight to `Finalized`; a session
    /// with `read_only == true` (the system-image path) maps the device
    /// and enters `Streaming` to receive bytes.
    pub fn open_writer(&mut self) -> Result<(), SessionError> {
        self.require_state(SessionState::Preallocated)?;

        if !self.read_only {
            self.bytes_written = self.size;
            self.finalize_partition()?;
            return Ok(());
        }

        let device_path = self
            .image_store
            .map_image_device(&self.partition_name, MAP_TIMEOUT)?;
        let file = match OpenOptions::new().write(true).open(&device_path) {
            Ok(f) => Writer::Fd(f),
            Err(e) => {
                warn!(
                    "opening mapped device {:?} failed ({}), falling back to split-file writer",
                    device_path, e
                );
                let data_path = self.image_store.data_file_path(&self.partition_name);
                Writer::SplitFile(
                    OpenOptions::new()
                        .write(true)
                        .open(&data_path)
                        .map_err(|e| SessionError::Other(anyhow::Error::new(e)))?,
                )
            }
        };
        self.writer = Some(file);
        self.progress.start("write gsi", self.size);
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// `write_chunk(bytes)`: read exactly `len` bytes from `source` into
    /// the mapped device, in fixed `CHUNK_READ_BLOCK`-sized reads.
    pub fn write_chunk(&mut self, source: &mut dyn Read, len: u64) -> Result<(), SessionError> {
        self.require_state(SessionState::Streaming)?;

        if self.abort.should_abort() {
            self.state = SessionState::Aborted;
            self.unwind();
            return Err(SessionError::Cancelled);
        }

        if self.bytes_written + len > self.size {
            return Err(SessionError::WouldOverflow { size: self.size });
        }

        let mut buf = vec![0u8; CHUNK_READ_BLOCK];
        let writer = self
            .writer
            .as_mut()
            .ok_or(SessionError::WrongState { state: "Streaming" })?
            .file_mut();
        copy_exactly_n(source, writer, len, &mut buf).map_err(SessionError::Other)?;

        self.bytes_written += len;
        self.progress.update(self.bytes_written);
        Ok(())
    }

    /// `finalize()`: requires `bytes_written == size`; flushes, unmaps,
    /// and re-validates pinning. Callable only from `Streaming` — the
    /// `read_only == false` path already reached `Finalized` via
    /// `open_writer`.
    pub fn finalize(&mut self) -> Result<(), SessionError> {
        self.require_state(SessionState::Streaming)?;
        if self.bytes_written != self.size {
            return Err(SessionError::Other(anyhow::anyhow!(
                "finalize called with {} of {} bytes written",
                self.bytes_written,
                self.size
            )));
        }
        self.finalize_partition()
    }

    fn finalize_partition(&mut self) -> Result<(), SessionError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| SessionError::Other(anyhow::Error::new(e)))?;
            drop(writer);
            self.image_store
                .unmap_image_device(&self.partition_name, false)?;
        }
        if !self.image_store.validate() {
            return Err(SessionError::Other(anyhow::anyhow!(
                "extent validation failed after writing {}",
                self.partition_name
            )));
        }
        self.progress.complete();
        self.state = SessionState::Finalized;
        info!(
            "finalized partition {} in {}",
            self.partition_name, self.install_dir
        );
        Ok(())
    }

    /// `abort()`: unmaps and, unless this is a preserved userdata image,
    /// deletes the backing file.
    pub fn abort(&mut self) {
        if self.state == SessionState::Finalized {
            return;
        }
        self.state = SessionState::Aborted;
        self.unwind();
    }

    fn unwind(&mut self) {
        self.writer = None;
        let _ = self
            .image_store
            .unmap_image_device(&self.partition_name, true);
        let preserve_userdata = self.is_userdata() && !self.wipe_existing;
        if !preserve_userdata {
            let _ = self.image_store.delete_backing_image(&self.partition_name);
        }
    }

    pub fn install_dir(&self) -> &str {
        &self.install_dir
    }

    pub fn progress(&self) -> Arc<ProgressRecord> {
        Arc::clone(&self.progress)
    }
}

impl Drop for InstallSession {
    fn drop(&mut self) {
        if self.state != SessionState::Finalized {
            self.unwind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodePartitionTableCodec;
    use crate::devmapper::test_backend::FakeDeviceMapper;
    use crate::extents::test_backend::FakeExtentBackend;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn make_store(meta: &std::path::Path, data: &std::path::Path) -> Arc<ImageStore> {
        Arc::new(
            ImageStore::open(
                meta,
                data,
                Box::new(FakeExtentBackend::default()),
                Box::new(FakeDeviceMapper::default()),
                Box::new(BincodePartitionTableCodec),
            )
            .unwrap(),
        )
    }

    #[test]
    fn happy_path_system_partition_streams_and_finalizes() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());
        let abort = Arc::new(AtomicAbortSignal::default());
        let progress = Arc::new(ProgressRecord::new());

        let mut session = InstallSession::new(
            "/data/gsi/dsu/",
            "system",
            1024 * 1024,
            true,
            false,
            Arc::clone(&store),
            abort,
            progress,
        );
        session.preallocate().unwrap();
        assert_eq!(session.state(), SessionState::Preallocated);
        session.open_writer().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        let payload = vec![0xABu8; 1024 * 1024];
        session
            .write_chunk(&mut Cursor::new(&payload), payload.len() as u64)
            .unwrap();
        assert_eq!(session.bytes_written(), 1024 * 1024);

        session.finalize().unwrap();
        assert_eq!(session.state(), SessionState::Finalized);
    }

    #[test]
    fn userdata_partition_finalizes_without_streaming() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());
        let abort = Arc::new(AtomicAbortSignal::default());
        let progress = Arc::new(ProgressRecord::new());

        let mut session = InstallSession::new(
            "/data/gsi/dsu/",
            "userdata",
            0,
            false,
            false,
            store,
            abort,
            progress,
        );
        session.preallocate().unwrap();
        session.open_writer().unwrap();
        assert_eq!(session.state(), SessionState::Finalized);
        assert_eq!(session.bytes_written(), DEFAULT_USERDATA_SIZE);
    }

    #[test]
    fn write_chunk_rejects_overflow() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());
        let abort = Arc::new(AtomicAbortSignal::default());
        let progress = Arc::new(ProgressRecord::new());

        let mut session = InstallSession::new(
            "/data/gsi/dsu/",
            "system",
            1024,
            true,
            false,
            store,
            abort,
            progress,
        );
        session.preallocate().unwrap();
        session.open_writer().unwrap();

        let payload = vec![0u8; 2048];
        let err = session
            .write_chunk(&mut Cursor::new(&payload), 2048)
            .unwrap_err();
        assert!(matches!(err, SessionError::WouldOverflow { .. }));
    }

    #[test]
    fn cancel_aborts_session_and_cleans_up_non_userdata_image() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());
        let abort = Arc::new(AtomicAbortSignal::default());
        let progress = Arc::new(ProgressRecord::new());

        let mut session = InstallSession::new(
            "/data/gsi/dsu/",
            "system",
            1024 * 1024,
            true,
            false,
            Arc::clone(&store),
            Arc::clone(&abort) as Arc<dyn AbortSignal>,
            progress,
        );
        session.preallocate().unwrap();
        session.open_writer().unwrap();

        abort.raise();
        let payload = vec![0u8; 512 * 1024];
        let err = session
            .write_chunk(&mut Cursor::new(&payload), 512 * 1024)
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(!store.backing_image_exists("system"));
    }

    #[test]
    fn size_mismatch_on_reuse_is_refused() {
        let meta = tempdir().unwrap();
        let data = tempdir().unwrap();
        let store = make_store(meta.path(), data.path());

        let mut first = InstallSession::new(
            "/data/gsi/dsu/",
            "userdata",
            1024 * 1024,
            false,
            false,
            Arc::clone(&store),
            Arc::new(AtomicAbortSignal::default()),
            Arc::new(ProgressRecord::new()),
        );
        first.preallocate().unwrap();
        first.open_writer().unwrap();

        let mut second = InstallSession::new(
            "/data/gsi/dsu/",
            "userdata",
            2 * 1024 * 1024,
            false,
            false,
            store,
            Arc::new(AtomicAbortSignal::default()),
            Arc::new(ProgressRecord::new()),
        );
        assert!(second.preallocate().is_err());
    }
}
