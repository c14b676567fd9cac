// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block device topology as reported by `lsblk --json`.

use std::process::Command;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::{error::DeviceNotFound, ui::Ui, util::run_command_check_status};

#[derive(Deserialize, Debug)]
pub struct LsblkRoot {
    pub blockdevices: Vec<BlockDevice>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Kernel name, or the mapper name for device-mapper devices.
    pub name: String,

    /// Absolute device node path.
    pub path: Utf8PathBuf,

    /// `disk`, `part`, `crypt`, `lvm`, `raid1`, `loop`, `rom`, ...
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub fstype: Option<String>,

    #[serde(default)]
    pub label: Option<String>,

    /// lsblk >= 2.37 lists every mountpoint; entries are `null` when the
    /// device is not mounted.
    #[serde(default)]
    mountpoints: Vec<Option<String>>,

    /// Older lsblk only reports the first mountpoint.
    #[serde(default)]
    mountpoint: Option<String>,

    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Every place this device is mounted, from whichever field lsblk filled
    /// in. Pseudo mountpoints such as `[SWAP]` are not paths and are skipped.
    pub fn mountpoints(&self) -> Vec<&str> {
        let mut found: Vec<&str> =
            self.mountpoints.iter().flatten().map(String::as_str).collect();
        if let Some(legacy) = &self.mountpoint {
            if !found.contains(&legacy.as_str()) {
                found.push(legacy);
            }
        }

        found.retain(|mp| mp.starts_with('/'));
        found
    }

    pub fn fstype(&self) -> Option<&str> {
        self.fstype.as_deref()
    }

    /// Whether this device is in use as swap right now. lsblk reports active
    /// swap with the pseudo mountpoint `[SWAP]`.
    pub fn is_active_swap(&self) -> bool {
        self.mountpoints
            .iter()
            .flatten()
            .chain(self.mountpoint.iter())
            .any(|mp| mp == "[SWAP]")
    }
}

pub fn parse(json: &str) -> anyhow::Result<Vec<BlockDevice>> {
    let root: LsblkRoot =
        serde_json::from_str(json).context("parsing lsblk output")?;
    Ok(root.blockdevices)
}

/// Runs lsblk and returns the full device forest.
pub fn list(ui: &dyn Ui) -> anyhow::Result<Vec<BlockDevice>> {
    let output = run_command_check_status(
        Command::new("lsblk").args(["--output-all", "--json", "--paths"]),
        ui,
    )?;
    parse(&String::from_utf8_lossy(&output.stdout))
}

/// Finds the device at `path` anywhere in `devices`, including partitions and
/// stacked devices.
pub fn find_device<'a>(
    devices: &'a [BlockDevice],
    path: &Utf8Path,
) -> Result<&'a BlockDevice, DeviceNotFound> {
    fn search<'a>(
        devices: &'a [BlockDevice],
        path: &Utf8Path,
    ) -> Option<&'a BlockDevice> {
        devices.iter().find_map(|dev| {
            if dev.path == path {
                Some(dev)
            } else {
                search(&dev.children, path)
            }
        })
    }

    search(devices, path).ok_or_else(|| DeviceNotFound(path.to_owned()))
}

/// Resolves symlinks such as `/dev/disk/by-id/...` to the device node path
/// lsblk reports. Paths that cannot be resolved are returned unchanged.
pub fn canonical_device_path(path: &Utf8Path) -> Utf8PathBuf {
    path.canonicalize_utf8().unwrap_or_else(|_| path.to_owned())
}
