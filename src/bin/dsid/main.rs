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

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::error;

use libdsi::boot_status::{BootStatus, KernelCmdlineBootOrigin};
use libdsi::codec::BincodePartitionTableCodec;
use libdsi::config::Config;
use libdsi::devmapper::LinuxDeviceMapper;
use libdsi::extents::FiemapBackend;
use libdsi::image_store::ImageStore;
use libdsi::rpc;
use libdsi::service::{InstallPathPolicy, Service};

fn main() {
    let config = Config::parse();
    env_logger::Builder::new()
        .filter_level(config.log_level_filter())
        .init();

    if let Err(e) = run(config) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run(config: Config) -> Result<()> {
    let metadata_dir = config.metadata_dir.join(&config.prefix);
    std::fs::create_dir_all(&metadata_dir)
        .with_context(|| format!("creating {:?}", metadata_dir))?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {:?}", config.data_dir))?;

    let images = Arc::new(ImageStore::open(
        metadata_dir.clone(),
        config.data_dir.clone(),
        Box::new(FiemapBackend),
        Box::new(LinuxDeviceMapper),
        Box::new(BincodePartitionTableCodec),
    )?);
    let boot_status = Arc::new(BootStatus::new(
        metadata_dir,
        Box::new(KernelCmdlineBootOrigin),
    ));
    let install_paths = InstallPathPolicy::new(
        config.data_dir.join(&config.prefix),
        config.allowed_external_root.clone(),
    );
    let service = Arc::new(Service::new(images, boot_status, install_paths));
    service.run_startup_tasks().context("running startup tasks")?;

    rpc::serve(&config.socket, service)
}
