// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed errors for the failures callers need to tell apart. Everything else
//! travels as `anyhow::Error` with context attached.

use std::process::ExitStatus;

use camino::Utf8PathBuf;
use thiserror::Error;

/// A malformed `--flake` argument.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlakeRefError {
    #[error(
        "flake reference '{0}' has no attribute; use --flake <location>#<attribute>"
    )]
    MissingAttribute(String),

    #[error("flake reference '{0}' has an empty location")]
    EmptyLocation(String),
}

/// A `--mode` value other than the supported ones.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid mode '{0}'; valid modes are: format, mount")]
pub struct ModeError(pub String);

/// An external program ran but reported failure.
#[derive(Error, Debug)]
#[error("'{program}' returned non-success exit status: {status}")]
pub struct CommandError {
    pub program: String,
    pub status: ExitStatus,
}

impl CommandError {
    /// The exit code this process should leave with to mirror the failed
    /// program. Programs killed by a signal have no code and map to 1.
    pub fn exit_code(&self) -> u8 {
        match self.status.code() {
            Some(code) if (1..=255).contains(&code) => code as u8,
            _ => 1,
        }
    }
}

/// The build did not yield the store paths the installer needs.
#[derive(Error, Debug, PartialEq, Eq)]
#[error(
    "expected the build to print 2 store paths (system and disk script), got {count}: {output:?}"
)]
pub struct BuildOutputError {
    pub count: usize,
    pub output: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("no block device found at {0}")]
pub struct DeviceNotFound(pub Utf8PathBuf);

/// Returns the exit code carried by the first [`CommandError`] in `err`'s
/// chain, if any.
pub fn command_exit_code(err: &anyhow::Error) -> Option<u8> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CommandError>())
        .map(CommandError::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn command_error_exit_code_follows_child() {
        let err = CommandError {
            program: "nixos-install".to_string(),
            status: ExitStatus::from_raw(3 << 8),
        };
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn signalled_child_maps_to_one() {
        // Raw wait status 9: killed by SIGKILL, no exit code.
        let err = CommandError {
            program: "nix".to_string(),
            status: ExitStatus::from_raw(9),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn exit_code_is_found_through_context() {
        let err = anyhow::Error::new(CommandError {
            program: "nix".to_string(),
            status: ExitStatus::from_raw(42 << 8),
        })
        .context("building install artifacts");
        assert_eq!(command_exit_code(&err), Some(42));
        assert_eq!(command_exit_code(&anyhow::anyhow!("plain")), None);
    }

    #[test]
    fn mode_error_lists_valid_modes() {
        let msg = ModeError("wipe".to_string()).to_string();
        assert!(msg.contains("invalid mode 'wipe'"));
        assert!(msg.contains("format, mount"));
    }
}
