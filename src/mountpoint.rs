// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The temporary directory the target system is mounted under while it is
//! being installed.
//!
//! Every mountpoint created here is recorded in a process-wide registry. It is
//! released (unmounted, then removed) exactly once: either when its
//! [`TempMountpoint`] is dropped or, if the process is interrupted first, by
//! the signal watcher started with [`install_signal_handlers`].

use std::{
    os::unix::fs::PermissionsExt,
    process::Command,
    sync::Mutex,
};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};

const MOUNTPOINT_PREFIX: &str = "disko-install-";

/// Filesystems like ZFS and bcachefs refuse to mount onto a directory other
/// users cannot traverse.
const MOUNTPOINT_MODE: u32 = 0o755;

static LIVE_MOUNTPOINTS: Mutex<Vec<Utf8PathBuf>> = Mutex::new(Vec::new());

/// An exclusively owned, uniquely named directory under the system temp dir.
#[derive(Debug)]
pub struct TempMountpoint {
    path: Utf8PathBuf,
}

impl TempMountpoint {
    pub fn create() -> anyhow::Result<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    pub fn create_in(parent: &std::path::Path) -> anyhow::Result<Self> {
        // Keep the directory rather than letting `TempDir` delete it: its
        // recursive removal would walk into anything still mounted below.
        let path = tempfile::Builder::new()
            .prefix(MOUNTPOINT_PREFIX)
            .tempdir_in(parent)
            .context("creating temporary mountpoint")?
            .keep();

        let path = Utf8PathBuf::from_path_buf(path).map_err(|p| {
            let _ = std::fs::remove_dir(&p);
            anyhow::anyhow!("temporary directory {} is not UTF-8", p.display())
        })?;

        std::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(MOUNTPOINT_MODE),
        )
        .with_context(|| format!("setting permissions on {path}"))?;

        lock_registry().push(path.clone());
        tracing::debug!(%path, "created temporary mountpoint");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for TempMountpoint {
    fn drop(&mut self) {
        release(&self.path);
    }
}

fn lock_registry() -> std::sync::MutexGuard<'static, Vec<Utf8PathBuf>> {
    // A panic while holding the lock leaves the list itself intact.
    LIVE_MOUNTPOINTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Unmounts and removes `path` if it is still registered. Returns whether this
/// call did the release.
///
/// The registry stays locked until the directory is gone, so a concurrent
/// caller (a destructor racing the signal watcher) returns only after the
/// release it lost to has finished.
fn release(path: &Utf8Path) -> bool {
    release_locked(&mut lock_registry(), path)
}

fn release_locked(live: &mut Vec<Utf8PathBuf>, path: &Utf8Path) -> bool {
    let Some(idx) = live.iter().position(|p| p == path) else {
        return false;
    };

    unmount_below(path);

    // Non-recursive: after a failed unmount the directory still holds the
    // target's filesystems.
    match std::fs::remove_dir(path) {
        Ok(()) => tracing::debug!(%path, "removed temporary mountpoint"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                %path,
                error = %e,
                "could not remove temporary mountpoint"
            )
        }
    }

    live.swap_remove(idx);
    true
}

/// Releases every mountpoint that is still live. Used on the signal path,
/// where no destructors will run.
pub fn release_all() {
    let mut live = lock_registry();
    while let Some(path) = live.last().cloned() {
        release_locked(&mut live, &path);
    }
}

fn unmount_below(path: &Utf8Path) {
    let mounts = match std::fs::read_to_string("/proc/self/mounts") {
        Ok(mounts) => mounts,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "could not read mount table, unmounting anyway"
            );
            run_umount(path);
            return;
        }
    };

    let nested = mounts_below(&mounts, path);
    if nested.is_empty() {
        return;
    }

    tracing::info!(%path, count = nested.len(), "unmounting installation root");
    run_umount(path);
}

fn run_umount(path: &Utf8Path) {
    let mut cmd = Command::new("umount");
    cmd.arg("-R").arg(path.as_str());
    tracing::debug!(?cmd, "executing");
    match cmd.status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            tracing::warn!(%path, %status, "umount -R reported failure")
        }
        Err(e) => tracing::warn!(%path, error = %e, "could not run umount"),
    }
}

/// Returns the mount targets in `mounts` (formatted like `/proc/self/mounts`)
/// that are `root` itself or lie beneath it.
pub fn mounts_below(mounts: &str, root: &Utf8Path) -> Vec<Utf8PathBuf> {
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|target| Utf8PathBuf::from(unescape_mount_field(target)))
        .filter(|target| target.starts_with(root))
        .collect()
}

/// Whether something is mounted exactly at `path` right now.
pub fn is_mount_target(path: &Utf8Path) -> std::io::Result<bool> {
    let mounts = std::fs::read_to_string("/proc/self/mounts")?;
    Ok(mounts_below(&mounts, path).iter().any(|target| target == path))
}

/// Decodes the octal escapes (`\040` for space and so on) the kernel uses for
/// whitespace and backslashes in mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let escaped = bytes
                .get(i + 1..i + 4)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(byte) = escaped {
                out.push(byte);
                i += 4;
                continue;
            }
        }

        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Starts a thread that, on SIGINT, SIGTERM or SIGHUP, releases every live
/// mountpoint and exits with the conventional `128 + signal` status.
pub fn install_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!(signal = sig, "interrupted, cleaning up");
            release_all();
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_unique_traversable_directory() {
        let parent = tempfile::tempdir().unwrap();
        let a = TempMountpoint::create_in(parent.path()).unwrap();
        let b = TempMountpoint::create_in(parent.path()).unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert!(a
            .path()
            .file_name()
            .unwrap()
            .starts_with(MOUNTPOINT_PREFIX));

        let mode = std::fs::metadata(a.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, MOUNTPOINT_MODE);
    }

    #[test]
    fn drop_removes_directory() {
        let parent = tempfile::tempdir().unwrap();
        let mp = TempMountpoint::create_in(parent.path()).unwrap();
        let path = mp.path().to_owned();
        drop(mp);
        assert!(!path.exists());
    }

    #[test]
    fn removed_on_error_path() {
        fn failing_run(parent: &std::path::Path) -> anyhow::Result<Utf8PathBuf> {
            let mp = TempMountpoint::create_in(parent)?;
            let path = mp.path().to_owned();
            anyhow::bail!("external tool failed for {path}")
        }

        let parent = tempfile::tempdir().unwrap();
        let err = failing_run(parent.path()).unwrap_err();
        assert!(err.to_string().contains("external tool failed"));
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn release_happens_once() {
        let parent = tempfile::tempdir().unwrap();
        let mp = TempMountpoint::create_in(parent.path()).unwrap();
        let path = mp.path().to_owned();

        assert!(release(&path));
        assert!(!path.exists());
        assert!(!release(&path));

        // Re-create the name: the drop below must not touch it, because the
        // registry no longer owns this path.
        std::fs::create_dir(&path).unwrap();
        drop(mp);
        assert!(path.exists());
    }

    #[test]
    fn losing_release_waits_for_the_winner() {
        let parent = tempfile::tempdir().unwrap();
        let mp = TempMountpoint::create_in(parent.path()).unwrap();
        let path = mp.path().to_owned();

        let watcher = {
            let path = path.clone();
            std::thread::spawn(move || release(&path))
        };

        // Once the registry no longer lists the path, its release is over.
        while lock_registry().contains(&path) {
            std::thread::yield_now();
        }
        assert!(!path.exists());

        drop(mp);
        assert!(!path.exists());
        assert!(watcher.join().unwrap());
    }

    #[test]
    fn populated_directory_is_left_in_place() {
        let parent = tempfile::tempdir().unwrap();
        let mp = TempMountpoint::create_in(parent.path()).unwrap();
        let path = mp.path().to_owned();
        std::fs::write(path.join("etc-nixos-marker"), b"keep").unwrap();

        drop(mp);
        assert!(path.join("etc-nixos-marker").exists());
    }

    #[test]
    fn finds_nested_mounts() {
        let table = "\
/dev/sda2 / ext4 rw,relatime 0 0
/dev/vda2 /tmp/disko-install-x btrfs rw 0 0
/dev/vda1 /tmp/disko-install-x/boot vfat rw 0 0
/dev/vdb1 /tmp/disko-install-xy ext4 rw 0 0
/dev/vdc1 /tmp/disko-install-x/srv/with\\040space ext4 rw 0 0
";
        let found = mounts_below(table, Utf8Path::new("/tmp/disko-install-x"));
        assert_eq!(
            found,
            [
                "/tmp/disko-install-x",
                "/tmp/disko-install-x/boot",
                "/tmp/disko-install-x/srv/with space",
            ]
        );
    }

    #[test]
    fn temp_directory_is_not_a_mount_target() {
        let parent = tempfile::tempdir().unwrap();
        let mp = TempMountpoint::create_in(parent.path()).unwrap();
        assert!(!is_mount_target(mp.path()).unwrap());
    }

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(unescape_mount_field(r"/a\040b\011c\134d"), "/a b\tc\\d");
        assert_eq!(unescape_mount_field(r"/trailing\"), r"/trailing\");
        assert_eq!(unescape_mount_field(r"/bad\9xy"), r"/bad\9xy");
    }
}
