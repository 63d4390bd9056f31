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

//! Typed errors at the three boundaries that need one: `ImageStore`'s
//! operation surface, `InstallSession`'s public API, and the RPC wire
//! protocol. Everything below these boundaries stays `anyhow::Result` with
//! `.context(...)`, same as the rest of the crate.

use thiserror::Error;

/// Errors surfaced by `ImageStore` operations (spec §4.1's error table).
#[derive(Error, Debug)]
pub enum ImageStoreError {
    #[error("not enough free space to allocate image")]
    NoSpace,
    #[error("host filesystem is too fragmented to pin a contiguous extent map")]
    FileSystemCluttered,
    #[error("image {0:?} already exists")]
    AlreadyExists(String),
    #[error("image {0:?} not found")]
    NotFound(String),
    #[error("image {0:?} is busy")]
    Busy(String),
    #[error("image creation for {0:?} was aborted by the progress callback")]
    Aborted(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Errors surfaced by `InstallSession`'s public API.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is in state {state}, which does not permit this operation")]
    WrongState { state: &'static str },
    #[error("write would exceed the partition size ({size} bytes)")]
    WouldOverflow { size: u64 },
    #[error("install was cancelled")]
    Cancelled,
    #[error(transparent)]
    ImageStore(#[from] ImageStoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Wire-level status codes from spec §6, returned to RPC clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    GenericError = 1,
    NoSpace = 2,
    FileSystemCluttered = 3,
}

impl StatusCode {
    pub fn from_session_error(e: &SessionError) -> Self {
        match e {
            SessionError::ImageStore(ImageStoreError::NoSpace) => StatusCode::NoSpace,
            SessionError::ImageStore(ImageStoreError::FileSystemCluttered) => {
                StatusCode::FileSystemCluttered
            }
            _ => StatusCode::GenericError,
        }
    }
}

/// Caller-tier / RPC framing errors (spec §4.4's "typed Security error").
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("caller does not have the required privilege tier")]
    Unauthorized,
    #[error("malformed request frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
