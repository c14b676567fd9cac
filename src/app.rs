// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser};
use itertools::Itertools;

use crate::config::{FlakeRef, InstallConfig, Mode};

/// Formats the disks described by a flake's NixOS configuration and installs
/// that configuration onto them.
#[derive(Parser, Debug)]
#[command(name = "disko-install", version, arg_required_else_help = true)]
pub struct App {
    /// The flake and NixOS configuration to install, e.g. `.#mymachine`.
    #[arg(short, long, value_name = "URI#ATTR")]
    pub flake: FlakeRef,

    /// Logs every external command before running it, along with other
    /// diagnostic output.
    #[arg(short, long)]
    pub debug: bool,

    /// Builds the installation artifacts and prints the commands that would
    /// format the disks and install the system, without running them.
    #[arg(long)]
    pub dry_run: bool,

    /// Asks nix to print a full stack trace when evaluation fails.
    #[arg(long)]
    pub show_trace: bool,

    /// Whether to format the disks before mounting them (`format`) or to only
    /// mount disks that have already been formatted (`mount`).
    #[arg(long, value_name = "format|mount", default_value_t = Mode::Format)]
    pub mode: Mode,

    /// Sets a nix option for both the build and the installer. May be given
    /// more than once.
    #[arg(
        long = "option",
        num_args = 2,
        value_names = ["NAME", "VALUE"],
        action = ArgAction::Append,
    )]
    pub nix_options: Vec<String>,

    /// Installs the disk named NAME in the disko configuration onto the block
    /// device at PATH. May be given more than once.
    #[arg(
        long = "disk",
        num_args = 2,
        value_names = ["NAME", "PATH"],
        action = ArgAction::Append,
    )]
    pub disks: Vec<String>,

    /// Lets the installed bootloader write EFI boot entries. Off by default
    /// because the disk being installed is usually booted on another machine.
    #[arg(long)]
    pub write_efi_boot_entries: bool,

    /// Forces the tool to run in an interactive or non-interactive mode. If not
    /// set, the tool infers whether to run interactively from whether it is
    /// running in an interactive terminal.
    #[arg(long, default_value = Option::None)]
    pub interactive: Option<bool>,
}

impl App {
    pub fn install_config(&self) -> InstallConfig {
        // clap guarantees both lists hold complete NAME/VALUE pairs.
        let disks = self
            .disks
            .iter()
            .cloned()
            .tuples::<(String, String)>()
            .map(|(name, path)| (name, Utf8PathBuf::from(path)))
            .collect();

        let nix_options = self
            .nix_options
            .iter()
            .cloned()
            .tuples::<(String, String)>()
            .collect();

        InstallConfig {
            flake: self.flake.clone(),
            mode: self.mode,
            disks,
            dry_run: self.dry_run,
            show_trace: self.show_trace,
            write_efi_boot_entries: self.write_efi_boot_entries,
            nix_options,
        }
    }

    pub fn is_interactive(&self) -> bool {
        match self.interactive {
            Some(val) => val,
            None => atty::is(atty::Stream::Stdout),
        }
    }
}
