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

//! The wire protocol: one `Request` per RPC operation in spec §6's table,
//! and the `Response` every request gets back. Framed as newline-free JSON
//! behind a `u32` length prefix (`transport::read_frame`/`write_frame`);
//! `commit_chunk_from_stream` additionally expects an `SCM_RIGHTS`-passed
//! file descriptor alongside its request frame.

use serde::{Deserialize, Serialize};

use crate::error::StatusCode;
use crate::progress::Progress;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    BeginInstall { install_dir: String },
    CreatePartition {
        name: String,
        size: u64,
        read_only: bool,
        wipe: bool,
    },
    /// The streamed bytes themselves arrive as an `SCM_RIGHTS` fd alongside
    /// this frame; `len` is how many bytes the daemon should read from it.
    CommitChunkFromStream { name: String, len: u64 },
    /// The chunk is carried inline in this frame rather than over a fd.
    CommitChunkFromMemory { name: String, data: Vec<u8> },
    /// A shared-memory fd arrives alongside this frame via `SCM_RIGHTS`;
    /// `size` is the usable length of the buffer it backs.
    SetSharedBuffer { size: u64 },
    /// Reads `size` bytes from the fd a prior `SetSharedBuffer` installed.
    CommitChunkFromShared { name: String, size: u64 },
    FinalizePartition { name: String },
    CloseInstall,
    AbortInstall,
    CancelInstall,
    Enable { one_shot: bool },
    Disable,
    Wipe,
    Remove,
    IsInstalled,
    IsRunning,
    IsInProgress,
    IsEnabled,
    GetInstallProgress { name: String },
    GetInstalledImageDir,
    ZeroPartition { name: String },
    DumpDeviceMapperDevices,
    OpenImageService { prefix: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Bool(bool),
    Progress(Progress),
    Text(String),
    OptionalText(Option<String>),
    Err { status: StatusCode, message: String },
}

impl Response {
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Response::Err {
            status,
            message: message.into(),
        }
    }
}
