// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! disko-install: format a machine's disks from its flake and install NixOS
//! onto them.

use std::process::ExitCode;

use clap::{error::ErrorKind, Parser};
use colored::Colorize;
use disko_install::{
    app::App, error::command_exit_code, install::InstallScript, logging,
    mountpoint::{self, TempMountpoint},
    runner,
};

fn main() -> ExitCode {
    let app = match App::try_parse() {
        Ok(app) => app,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::FAILURE,
            };
        }
    };

    logging::init_tracing(app.debug);
    if let Err(e) = mountpoint::install_signal_handlers() {
        tracing::warn!(error = %e, "couldn't watch for signals; an interrupted run may leave its mountpoint behind");
    }

    match run(&app) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".bold().red(), e);
            ExitCode::from(command_exit_code(&e).unwrap_or(1))
        }
    }
}

fn run(app: &App) -> anyhow::Result<()> {
    let mountpoint = TempMountpoint::create()?;
    let script = InstallScript::new(app.install_config(), &mountpoint);
    runner::run_script(&script, app.is_interactive())
}
