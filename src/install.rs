// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Defines the script that formats a machine's disks and installs a NixOS
//! configuration onto them.
//!
//! The script builds the configuration's system closure and its disko script
//! in one `nix build`, runs the disko script against the temporary
//! mountpoint, and then hands the mounted tree to `nixos-install`.

use std::{collections::HashMap, io::Write, process::Command, rc::Rc};

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use colored::Colorize;
use itertools::Itertools;

use crate::{
    config::{InstallConfig, Mode},
    mountpoint::TempMountpoint,
    nix_expr::{build_args, BuildOutputs},
    runner::{Context, MissingPrerequisites, Script, ScriptStep},
    ui::Ui,
    util::{
        check_executable_prerequisites, check_file_prerequisites,
        run_command_capture_stdout, run_command_in_foreground,
    },
};

const TOPLEVEL_VAR: &str = "toplevel";
const DISK_SCRIPT_VAR: &str = "disk_script";
const MOUNTPOINT_VAR: &str = "mountpoint";

pub struct InstallScript {
    config: Rc<InstallConfig>,
    mountpoint: Utf8PathBuf,
    steps: Vec<ScriptStep>,
}

impl InstallScript {
    /// Creates the script for `config`. The target system is assembled under
    /// `mountpoint`, which must outlive the script's run.
    pub fn new(config: InstallConfig, mountpoint: &TempMountpoint) -> Self {
        let config = Rc::new(config);
        Self {
            steps: get_script(&config),
            mountpoint: mountpoint.path().to_owned(),
            config,
        }
    }
}

impl Script for InstallScript {
    fn steps(&self) -> &[ScriptStep] {
        self.steps.as_slice()
    }

    fn print_configuration(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let config = &self.config;
        if config.dry_run {
            writeln!(w, "Planning a NixOS installation (dry run):\n")?;
        } else {
            writeln!(w, "Installing NixOS with these options:\n")?;
        }

        writeln!(w, "  {}: {}", "Flake".bold(), config.flake.location)?;
        writeln!(w, "  {}: {}", "Configuration".bold(), config.flake.attribute)?;
        writeln!(w, "  {}: {}", "Mode".bold(), config.mode)?;
        writeln!(w, "  {}: {}", "Installation root".bold(), self.mountpoint)?;

        if config.disks.is_empty() {
            writeln!(w, "  Disk devices as declared in the configuration")?;
        } else {
            writeln!(w, "  {}:", "Disks".bold())?;
            for (name, device) in &config.disks {
                writeln!(w, "    {name} -> {device}")?;
            }
        }

        if !config.nix_options.is_empty() {
            let options = config
                .nix_options
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .join(", ");
            writeln!(w, "  {}: {}", "Nix options".bold(), options)?;
        }

        if config.write_efi_boot_entries {
            writeln!(w, "  Will write EFI boot entries")?;
        }

        Ok(())
    }

    fn check_prerequisites(&self) -> MissingPrerequisites {
        let devices: Vec<Utf8PathBuf> =
            self.config.disks.values().cloned().collect();
        let missing_devices = check_file_prerequisites(&devices);
        let mut errors = check_executable_prerequisites(self.steps());

        // A dry run is commonly used to check a configuration on a machine
        // other than the one being installed.
        if self.config.dry_run {
            MissingPrerequisites::from_messages(errors, missing_devices)
        } else {
            errors.extend(missing_devices);
            MissingPrerequisites::from_messages(errors, Vec::new())
        }
    }

    fn initial_context(&self) -> HashMap<String, String> {
        [(MOUNTPOINT_VAR.to_string(), self.mountpoint.to_string())]
            .into_iter()
            .collect()
    }
}

/// The `nixos-install` invocation that installs `toplevel` under `root`.
pub fn installer_command(
    config: &InstallConfig,
    toplevel: &Utf8Path,
    root: &Utf8Path,
) -> Command {
    let mut cmd = Command::new("nixos-install");
    cmd.args(["--no-channel-copy", "--no-root-password"])
        .args(config.nix_option_args())
        .args(["--system", toplevel.as_str(), "--root", root.as_str()]);
    cmd
}

/// Renders `cmd` the way a user would type it.
pub fn describe_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| arg.to_string_lossy())
        .join(" ")
}

fn build_artifacts(
    config: &InstallConfig,
    ctx: &mut Context,
    ui: &dyn Ui,
) -> Result<()> {
    let mountpoint = Utf8PathBuf::from(ctx.var(MOUNTPOINT_VAR)?);
    let stdout = run_command_capture_stdout(
        Command::new("nix").args(build_args(config, &mountpoint)),
        ui,
    )
    .with_context(|| format!("building {}", config.flake))?;

    let outputs = BuildOutputs::parse(&stdout)?;
    tracing::info!(
        toplevel = %outputs.toplevel,
        disk_script = %outputs.disk_script,
        "built installation artifacts"
    );

    ctx.set_var(TOPLEVEL_VAR, outputs.toplevel.into_string());
    ctx.set_var(DISK_SCRIPT_VAR, outputs.disk_script.into_string());
    Ok(())
}

fn run_disk_script(ctx: &mut Context, ui: &dyn Ui) -> Result<()> {
    let script = ctx.var(DISK_SCRIPT_VAR)?;
    run_command_in_foreground(&mut Command::new(script), ui)
        .context("running disk script")
}

fn install_system(
    config: &InstallConfig,
    ctx: &mut Context,
    ui: &dyn Ui,
) -> Result<()> {
    let toplevel = Utf8Path::new(ctx.var(TOPLEVEL_VAR)?);
    let root = Utf8Path::new(ctx.var(MOUNTPOINT_VAR)?);
    run_command_in_foreground(&mut installer_command(config, toplevel, root), ui)
        .context("installing system")
}

/// The lines a dry run prints in place of running the disk script and the
/// installer.
fn planned_commands(config: &InstallConfig, ctx: &Context) -> Result<[String; 2]> {
    let script = ctx.var(DISK_SCRIPT_VAR)?;
    let toplevel = Utf8Path::new(ctx.var(TOPLEVEL_VAR)?);
    let root = Utf8Path::new(ctx.var(MOUNTPOINT_VAR)?);
    let installer = installer_command(config, toplevel, root);

    Ok([
        format!("Would run: {script}"),
        format!("Would run: {}", describe_command(&installer)),
    ])
}

fn describe_install(
    config: &InstallConfig,
    ctx: &mut Context,
    ui: &dyn Ui,
) -> Result<()> {
    let lines = planned_commands(config, ctx)?;
    ui.suspend(&mut || {
        for line in &lines {
            println!("{line}");
        }
    });
    Ok(())
}

fn get_script(config: &Rc<InstallConfig>) -> Vec<ScriptStep> {
    let build_config = config.clone();
    let mut steps = vec![ScriptStep::with_prereqs(
        "build install artifacts",
        move |ctx, ui| build_artifacts(&build_config, ctx, ui),
        &["nix"],
    )];

    if config.dry_run {
        let dry_config = config.clone();
        steps.push(ScriptStep::new(
            "describe disk script and installer commands",
            move |ctx, ui| describe_install(&dry_config, ctx, ui),
        ));
        return steps;
    }

    let disk_label = match config.mode {
        Mode::Format => "format and mount disks",
        Mode::Mount => "mount disks",
    };
    steps.push(ScriptStep::new(disk_label, run_disk_script));

    let install_config = config.clone();
    steps.push(ScriptStep::with_prereqs(
        "install system",
        move |ctx, ui| install_system(&install_config, ctx, ui),
        &["nixos-install"],
    ));

    steps
}
