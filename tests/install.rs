// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole runs of `disko-install` against stand-in `nix`, disk script and
//! `nixos-install` executables.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use tempfile::TempDir;

struct Sandbox {
    root: TempDir,
}

impl Sandbox {
    /// Lays out `bin/` with the stand-in tools and an empty `tmp/` for the
    /// installation root. The disk script and installer exit with the given
    /// codes.
    fn new(disk_script_exit: i32, installer_exit: i32) -> Self {
        let root = tempfile::tempdir().unwrap();
        let sandbox = Self { root };
        std::fs::create_dir(sandbox.bin()).unwrap();
        std::fs::create_dir(sandbox.tmp()).unwrap();

        let disk_script = sandbox.root.path().join("disko-script");
        write_executable(&disk_script, &format!("exit {disk_script_exit}"));
        write_executable(
            &sandbox.bin().join("nix"),
            &format!(
                "echo {}\necho {}",
                sandbox.root.path().join("system").display(),
                disk_script.display()
            ),
        );
        write_executable(
            &sandbox.bin().join("nixos-install"),
            &format!("exit {installer_exit}"),
        );

        sandbox
    }

    fn bin(&self) -> PathBuf {
        self.root.path().join("bin")
    }

    fn tmp(&self) -> PathBuf {
        self.root.path().join("tmp")
    }

    fn run(&self, extra: &[&str]) -> Output {
        let path = format!(
            "{}:{}",
            self.bin().display(),
            std::env::var("PATH").unwrap_or_default()
        );
        Command::new(env!("CARGO_BIN_EXE_disko-install"))
            .args(["--flake", "github:example/infra#box", "--interactive", "false"])
            .args(extra)
            .env("PATH", path)
            .env("TMPDIR", self.tmp())
            .env_remove("RUST_LOG")
            .output()
            .expect("launching disko-install")
    }

    fn leftover_entries(&self) -> usize {
        std::fs::read_dir(self.tmp()).unwrap().count()
    }
}

fn write_executable(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .unwrap();
}

#[test]
fn successful_install_exits_zero_and_cleans_up() {
    let sandbox = Sandbox::new(0, 0);
    let output = sandbox.run(&[]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(sandbox.leftover_entries(), 0);
}

#[test]
fn installer_exit_status_is_propagated() {
    let sandbox = Sandbox::new(0, 7);
    let output = sandbox.run(&[]);
    assert_eq!(output.status.code(), Some(7));
    assert_eq!(sandbox.leftover_entries(), 0);
}

#[test]
fn disk_script_failure_stops_before_installing() {
    let sandbox = Sandbox::new(4, 7);
    let output = sandbox.run(&[]);
    assert_eq!(output.status.code(), Some(4));
    assert_eq!(sandbox.leftover_entries(), 0);
}

#[test]
fn dry_run_describes_both_commands_and_leaves_nothing() {
    // Both stand-ins would fail if they were run.
    let sandbox = Sandbox::new(4, 7);
    let output = sandbox.run(&["--dry-run"]);
    assert_eq!(output.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let planned: Vec<&str> =
        stdout.lines().filter(|l| l.starts_with("Would run: ")).collect();
    assert_eq!(planned.len(), 2, "{stdout}");
    assert!(planned[0].ends_with("disko-script"));
    assert!(planned[1].starts_with("Would run: nixos-install "));
    assert_eq!(sandbox.leftover_entries(), 0);
}
