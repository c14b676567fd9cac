// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! disko-install: partition, format and install a NixOS flake configuration
//! onto a machine's disks in one step.

#[cfg(not(target_os = "linux"))]
compile_error!("only Linux targets are supported");

pub mod app;
pub mod config;
pub mod deactivate;
pub mod error;
pub mod install;
pub mod logging;
pub mod lsblk;
pub mod mountpoint;
pub mod nix_expr;
pub mod runner;
pub mod ui;
pub mod util;
