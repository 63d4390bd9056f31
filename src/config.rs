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

//! Daemon command-line configuration, parsed with `clap::Parser` the same
//! way the original `coreos-installer` subcommands were.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[clap(name = "dsid", about = "Dynamic System Installer daemon")]
pub struct Config {
    /// Unix domain socket to listen on for RPC connections.
    #[clap(long, default_value = "/dev/socket/dsid")]
    pub socket: PathBuf,

    /// Directory holding lp_metadata and boot-status files.
    #[clap(long, default_value = "/metadata/gsi")]
    pub metadata_dir: PathBuf,

    /// Directory holding backing image files.
    #[clap(long, default_value = "/data/gsi")]
    pub data_dir: PathBuf,

    /// Prefix used for device-mapper device names and metadata subdirectory.
    #[clap(long, default_value = "dsu")]
    pub prefix: String,

    /// Additional root under which `begin_install` may open an install
    /// directory, besides the default `data_dir`/`prefix` directory (spec
    /// §3/§4.4: "resides on an allowed external storage mount"). Repeatable.
    #[clap(long)]
    pub allowed_external_root: Vec<PathBuf>,

    /// Stay attached to the controlling terminal instead of daemonizing.
    #[clap(long)]
    pub foreground: bool,

    /// Increase logging verbosity (-v, -vv).
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: u8,

    /// Decrease logging verbosity.
    #[clap(short, long)]
    pub quiet: bool,
}

impl Config {
    pub fn log_level_filter(&self) -> log::LevelFilter {
        if self.quiet {
            log::LevelFilter::Warn
        } else {
            match self.verbose {
                0 => log::LevelFilter::Info,
                1 => log::LevelFilter::Debug,
                _ => log::LevelFilter::Trace,
            }
        }
    }
}
