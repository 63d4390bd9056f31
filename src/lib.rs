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

//! Dynamic System Installer daemon library: installs a Generic System
//! Image onto spare block-device extents without touching the primary
//! system partition, and tracks whether the device should boot into it.
//!
//! See `service::Service` for the daemon's central state machine and
//! `rpc` for the wire protocol it's driven over.

#[macro_use]
pub mod util;

pub mod blockdev;
pub mod boot_status;
pub mod codec;
pub mod config;
pub mod devmapper;
pub mod error;
pub mod extents;
pub mod image_store;
pub mod io;
pub mod progress;
pub mod rpc;
pub mod service;
pub mod session;
