// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utility functions shared by multiple scripts.

use std::process::{Command, ExitStatus, Output, Stdio};

use anyhow::Context as _;
use camino::Utf8PathBuf;
use itertools::Itertools;

use crate::{error::CommandError, runner::ScriptStep, ui::Ui};

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn announce(cmd: &Command, ui: &dyn Ui) {
    tracing::debug!(?cmd, "executing");
    let args = cmd.get_args().take(2).map(|a| a.to_string_lossy()).join(" ");
    ui.set_substep(&format!("executing: {} {}", program_name(cmd), args));
}

fn check_status(cmd: &Command, status: ExitStatus) -> Result<(), CommandError> {
    if status.success() {
        Ok(())
    } else {
        Err(CommandError { program: program_name(cmd), status })
    }
}

/// Runs a `Command` and returns its output. Returns `Err` if the command's exit
/// status indicates that it failed; the error carries the command's stderr.
pub fn run_command_check_status(
    cmd: &mut Command,
    ui: &dyn Ui,
) -> anyhow::Result<Output> {
    announce(cmd, ui);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("launching '{}'", program_name(cmd)))?;

    check_status(cmd, output.status).with_context(|| {
        format!("stderr: {}", String::from_utf8_lossy(&output.stderr).trim())
    })?;

    Ok(output)
}

/// Runs a `Command` whose diagnostics the user should see as they happen:
/// stderr goes to the terminal and stdout is captured and returned.
pub fn run_command_capture_stdout(
    cmd: &mut Command,
    ui: &dyn Ui,
) -> anyhow::Result<String> {
    announce(cmd, ui);
    cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());

    let mut output = Err(std::io::ErrorKind::Interrupted.into());
    ui.suspend(&mut || output = cmd.output());
    let output =
        output.with_context(|| format!("launching '{}'", program_name(cmd)))?;

    check_status(cmd, output.status)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs a `Command` attached to the terminal and waits for it to finish.
pub fn run_command_in_foreground(
    cmd: &mut Command,
    ui: &dyn Ui,
) -> anyhow::Result<()> {
    announce(cmd, ui);
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let mut status = Err(std::io::ErrorKind::Interrupted.into());
    ui.suspend(&mut || status = cmd.status());
    let status =
        status.with_context(|| format!("launching '{}'", program_name(cmd)))?;

    check_status(cmd, status)?;
    Ok(())
}

/// Returns a message for every command the supplied steps launch that cannot
/// be found on `PATH`.
pub fn check_executable_prerequisites(steps: &[ScriptStep]) -> Vec<String> {
    steps
        .iter()
        .flat_map(|step| step.prereq_commands().iter().copied())
        .unique()
        .filter(|command| which::which(command).is_err())
        .map(|command| format!("command '{command}' not found on PATH"))
        .collect()
}

/// Returns a message for every path in `files` that does not exist.
pub fn check_file_prerequisites(files: &[Utf8PathBuf]) -> Vec<String> {
    files
        .iter()
        .filter(|path| !path.exists())
        .map(|path| format!("'{path}' does not exist"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::command_exit_code, ui::SilentUi};

    #[test]
    fn captured_command_output() {
        let output = run_command_check_status(
            Command::new("sh").args(["-c", "echo hello"]),
            &SilentUi,
        )
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
    }

    #[test]
    fn failing_command_carries_exit_code_and_stderr() {
        let err = run_command_check_status(
            Command::new("sh").args(["-c", "echo broken >&2; exit 7"]),
            &SilentUi,
        )
        .unwrap_err();
        assert_eq!(command_exit_code(&err), Some(7));
        assert!(format!("{err:#}").contains("broken"));
    }

    #[test]
    fn capture_stdout_returns_stdout_only() {
        let out = run_command_capture_stdout(
            Command::new("sh").args(["-c", "echo /nix/store/x; echo noise >&2"]),
            &SilentUi,
        )
        .unwrap();
        assert_eq!(out, "/nix/store/x\n");
    }

    #[test]
    fn foreground_failure_propagates_code() {
        let err = run_command_in_foreground(
            Command::new("sh").args(["-c", "exit 3"]),
            &SilentUi,
        )
        .unwrap_err();
        assert_eq!(command_exit_code(&err), Some(3));
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let err = run_command_in_foreground(
            &mut Command::new("/nonexistent/disko-install-test"),
            &SilentUi,
        )
        .unwrap_err();
        assert_eq!(command_exit_code(&err), None);
        assert!(err.to_string().contains("launching"));
    }

    #[test]
    fn reports_missing_executables_once() {
        let steps = vec![
            ScriptStep::with_prereqs("a", |_, _| Ok(()), &["sh", "no-such-tool-xyz"]),
            ScriptStep::with_prereqs("b", |_, _| Ok(()), &["no-such-tool-xyz"]),
        ];
        let missing = check_executable_prerequisites(&steps);
        assert_eq!(missing, ["command 'no-such-tool-xyz' not found on PATH"]);
    }

    #[test]
    fn reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let absent = present.join("nope");
        let missing = check_file_prerequisites(&[present, absent.clone()]);
        assert_eq!(missing, [format!("'{absent}' does not exist")]);
    }
}
