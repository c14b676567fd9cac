// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tearing down everything that keeps a disk busy so that it can be
//! repartitioned.
//!
//! The device tree reported by lsblk is turned into a flat, ordered list of
//! [`Operation`]s. For every device the plan first unmounts it, then tears
//! down the devices stacked on top of it (children before parents), then
//! whatever its contents are (swap, ZFS pool, LVM volume group) and finally
//! the device itself (LUKS mapping, RAID array, signatures).

use std::{
    collections::{HashMap, HashSet},
    fmt,
    io::Write,
    process::Command,
};

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use colored::Colorize;
use itertools::Itertools;

use crate::{
    lsblk::BlockDevice,
    mountpoint::is_mount_target,
    runner::{MissingPrerequisites, Script, ScriptStep},
    ui::Ui,
    util::{check_executable_prerequisites, run_command_check_status},
};

/// Size of the boot code area at the start of an MBR. Zeroing it keeps
/// firmware from booting stale loaders off a wiped disk.
const BOOT_CODE_LEN: usize = 440;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// `umount -R` a mountpoint, if it is still mounted.
    Unmount(Utf8PathBuf),

    SwapOff(Utf8PathBuf),

    /// Destroy an imported ZFS pool by name.
    DestroyZpool(String),

    /// Deactivate and remove the volume group that owns a physical volume.
    RemoveVolumeGroup(Utf8PathBuf),

    /// Close a dm-crypt mapping by its mapper name.
    CloseLuks(String),

    StopRaid(Utf8PathBuf),

    WipeSignatures(Utf8PathBuf),

    ZeroBootCode(Utf8PathBuf),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Unmount(mp) => write!(f, "unmount {mp}"),
            Operation::SwapOff(dev) => write!(f, "disable swap on {dev}"),
            Operation::DestroyZpool(pool) => {
                write!(f, "destroy ZFS pool {pool}")
            }
            Operation::RemoveVolumeGroup(pv) => {
                write!(f, "remove LVM volume group on {pv}")
            }
            Operation::CloseLuks(name) => write!(f, "close LUKS mapping {name}"),
            Operation::StopRaid(dev) => write!(f, "stop RAID array {dev}"),
            Operation::WipeSignatures(dev) => {
                write!(f, "wipe signatures on {dev}")
            }
            Operation::ZeroBootCode(dev) => write!(f, "zero boot code on {dev}"),
        }
    }
}

impl Operation {
    /// The executables this operation launches.
    pub fn required_commands(&self) -> &'static [&'static str] {
        match self {
            Operation::Unmount(_) => &["umount"],
            Operation::SwapOff(_) => &["swapoff"],
            Operation::DestroyZpool(_) => &["zpool"],
            Operation::RemoveVolumeGroup(_) => &["pvs", "vgchange", "vgremove"],
            Operation::CloseLuks(_) => &["cryptsetup"],
            Operation::StopRaid(_) => &["mdadm"],
            Operation::WipeSignatures(_) => &["wipefs"],
            Operation::ZeroBootCode(_) => &[],
        }
    }

    pub fn execute(&self, ui: &dyn Ui) -> Result<()> {
        match self {
            Operation::Unmount(mp) => unmount(mp, ui),
            Operation::SwapOff(dev) => run(Command::new("swapoff").arg(dev), ui),
            Operation::DestroyZpool(pool) => destroy_zpool(pool, ui),
            Operation::RemoveVolumeGroup(pv) => remove_volume_group(pv, ui),
            Operation::CloseLuks(name) => {
                run(Command::new("cryptsetup").args(["close", name]), ui)
            }
            Operation::StopRaid(dev) => {
                run(Command::new("mdadm").arg("--stop").arg(dev), ui)
            }
            Operation::WipeSignatures(dev) => {
                run(Command::new("wipefs").args(["--all", "-f"]).arg(dev), ui)
            }
            Operation::ZeroBootCode(dev) => zero_boot_code(dev, ui),
        }
    }
}

fn run(cmd: &mut Command, ui: &dyn Ui) -> Result<()> {
    run_command_check_status(cmd, ui).map(|_| ())
}

fn unmount(mountpoint: &Utf8Path, ui: &dyn Ui) -> Result<()> {
    // A recursive unmount of a parent may already have taken this one down.
    if !is_mount_target(mountpoint).context("reading mount table")? {
        ui.set_substep(&format!("{mountpoint} is not mounted"));
        return Ok(());
    }

    run(Command::new("umount").arg("-R").arg(mountpoint), ui)
}

fn destroy_zpool(pool: &str, ui: &dyn Ui) -> Result<()> {
    // Pools that could not be imported are only signatures on the members,
    // which the member wipe removes.
    if run(Command::new("zpool").args(["list", "-H", "-o", "name", pool]), ui)
        .is_err()
    {
        ui.set_substep(&format!("pool {pool} is not imported"));
        return Ok(());
    }

    run(Command::new("zpool").args(["destroy", "-f", pool]), ui)
}

fn remove_volume_group(pv: &Utf8Path, ui: &dyn Ui) -> Result<()> {
    let output = run_command_check_status(
        Command::new("pvs")
            .args(["--noheadings", "--options", "vg_name"])
            .arg(pv),
        ui,
    )
    .with_context(|| format!("looking up the volume group on {pv}"))?;

    let vg = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if vg.is_empty() {
        ui.set_substep(&format!("{pv} is not part of a volume group"));
        return Ok(());
    }

    run(Command::new("vgchange").args(["-a", "n", &vg]), ui)?;
    run(Command::new("vgremove").args(["-f", &vg]), ui)
}

fn zero_boot_code(dev: &Utf8Path, ui: &dyn Ui) -> Result<()> {
    ui.set_substep(&format!("writing {BOOT_CODE_LEN} zero bytes to {dev}"));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(dev)
        .with_context(|| format!("opening {dev} for writing"))?;
    file.write_all(&[0u8; BOOT_CODE_LEN])
        .and_then(|()| file.sync_all())
        .with_context(|| format!("zeroing boot code on {dev}"))
}

/// Device-mapper devices show up in lsblk under their `/dev/mapper` path;
/// cryptsetup wants the bare mapping name.
fn mapper_name(name: &str) -> &str {
    name.strip_prefix("/dev/mapper/").unwrap_or(name)
}

#[derive(Default)]
struct Planner {
    ops: Vec<Operation>,
    visited: HashSet<Utf8PathBuf>,
    pools: HashSet<String>,
}

impl Planner {
    fn visit(&mut self, dev: &BlockDevice) {
        // Stacked devices such as RAID arrays appear under every member.
        if !self.visited.insert(dev.path.clone()) {
            return;
        }

        let mut mountpoints = dev.mountpoints();
        mountpoints.sort_by_key(|mp| std::cmp::Reverse(mp.matches('/').count()));
        self.ops.extend(
            mountpoints.into_iter().map(|mp| Operation::Unmount(mp.into())),
        );

        for child in &dev.children {
            self.visit(child);
        }

        self.teardown_contents(dev);
        self.teardown_device(dev);
    }

    fn teardown_contents(&mut self, dev: &BlockDevice) {
        match dev.fstype() {
            Some("swap") if dev.is_active_swap() => {
                self.ops.push(Operation::SwapOff(dev.path.clone()));
            }
            Some("zfs_member") => {
                let Some(pool) = dev.label.as_ref() else {
                    tracing::warn!(device = %dev.path, "ZFS member without a pool label");
                    return;
                };
                if self.pools.insert(pool.clone()) {
                    self.ops.push(Operation::DestroyZpool(pool.clone()));
                }
            }
            Some("LVM2_member") => {
                self.ops.push(Operation::RemoveVolumeGroup(dev.path.clone()));
            }
            _ => {}
        }
    }

    fn teardown_device(&mut self, dev: &BlockDevice) {
        let path = &dev.path;
        match dev.kind.as_str() {
            "crypt" => {
                self.ops.push(Operation::CloseLuks(mapper_name(&dev.name).into()))
            }
            kind if kind.starts_with("raid") => {
                self.ops.push(Operation::StopRaid(path.clone()))
            }
            "part" | "lvm" => {
                self.ops.push(Operation::WipeSignatures(path.clone()))
            }
            "disk" | "loop" => {
                self.ops.push(Operation::WipeSignatures(path.clone()));
                self.ops.push(Operation::ZeroBootCode(path.clone()));
            }
            other => {
                tracing::debug!(device = %path, kind = other, "leaving device type as is")
            }
        }
    }
}

/// Computes the operations that release `device` and everything stacked on
/// it, in the order they must run.
pub fn plan(device: &BlockDevice) -> Vec<Operation> {
    let mut planner = Planner::default();
    planner.visit(device);
    planner.ops
}

/// Runs `zpool import` so that pools living on the target can be destroyed.
/// Failure only means there was nothing to import.
fn import_zpools(ui: &dyn Ui) -> Result<()> {
    let import = run(
        Command::new("zpool").args(["import", "-N", "-f", "-a", "-d", "/dev/disk/by-id"]),
        ui,
    );
    if let Err(e) = import {
        tracing::debug!(error = %format!("{e:#}"), "zpool import found nothing to import");
    }
    Ok(())
}

pub struct DeactivateScript {
    device: BlockDevice,
    ops: Vec<Operation>,
    steps: Vec<ScriptStep>,
}

impl DeactivateScript {
    pub fn new(device: BlockDevice) -> Self {
        let ops = plan(&device);
        let mut steps = Vec::new();

        if ops.iter().any(|op| matches!(op, Operation::DestroyZpool(_))) {
            steps.push(ScriptStep::with_prereqs(
                "import ZFS pools",
                |_, ui| import_zpools(ui),
                &["zpool"],
            ));
        }

        steps.extend(ops.iter().cloned().map(|op| {
            let label = op.to_string();
            let prereqs = op.required_commands();
            ScriptStep::with_prereqs(label, move |_, ui| op.execute(ui), prereqs)
        }));

        Self { device, ops, steps }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }
}

fn write_tree(
    w: &mut dyn Write,
    dev: &BlockDevice,
    depth: usize,
) -> std::io::Result<()> {
    writeln!(
        w,
        "    {}{} {} {}",
        "  ".repeat(depth),
        dev.path,
        dev.kind.dimmed(),
        dev.fstype().unwrap_or("")
    )?;
    for child in &dev.children {
        write_tree(w, child, depth + 1)?;
    }
    Ok(())
}

impl Script for DeactivateScript {
    fn steps(&self) -> &[ScriptStep] {
        self.steps.as_slice()
    }

    fn print_configuration(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "Deactivating {}:\n", self.device.path.as_str().bold())?;
        write_tree(w, &self.device, 0)?;
        writeln!(w)?;

        if self.ops.is_empty() {
            writeln!(w, "  Nothing to do.")?;
        } else {
            writeln!(w, "  {}:", "Planned operations".bold())?;
            writeln!(
                w,
                "{}",
                self.ops.iter().map(|op| format!("    {op}")).join("\n")
            )?;
        }

        Ok(())
    }

    fn check_prerequisites(&self) -> MissingPrerequisites {
        MissingPrerequisites::from_messages(
            check_executable_prerequisites(self.steps()),
            Vec::new(),
        )
    }

    fn initial_context(&self) -> HashMap<String, String> {
        [("device".to_string(), self.device.path.to_string())]
            .into_iter()
            .collect()
    }
}
