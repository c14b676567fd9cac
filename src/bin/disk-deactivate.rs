// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! disk-deactivate: release everything that keeps a disk busy so it can be
//! repartitioned.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{error::ErrorKind, Parser};
use colored::Colorize;
use disko_install::{
    deactivate::DeactivateScript, error::command_exit_code, logging, lsblk,
    runner, ui::SilentUi,
};

/// Unmounts, closes and wipes a block device and everything stacked on it.
#[derive(Parser, Debug)]
#[command(name = "disk-deactivate")]
struct Args {
    /// The disk or partition to deactivate, e.g. `/dev/disk/by-id/...`.
    device: Utf8PathBuf,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    logging::init_tracing(false);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".bold().red(), e);
            ExitCode::from(command_exit_code(&e).unwrap_or(1))
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let target = lsblk::canonical_device_path(&args.device);
    let devices = lsblk::list(&SilentUi)?;
    let device = lsblk::find_device(&devices, &target)?.clone();

    let interactive = atty::is(atty::Stream::Stdout);
    runner::run_script(&DeactivateScript::new(device), interactive)
}
