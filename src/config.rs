// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The validated configuration for one installation run.

use std::{collections::BTreeMap, fmt, str::FromStr};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{FlakeRefError, ModeError};

/// A flake location plus the name of the `nixosConfigurations` attribute to
/// install, e.g. `github:me/infra#laptop`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlakeRef {
    pub location: String,
    pub attribute: String,
}

impl FromStr for FlakeRef {
    type Err = FlakeRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Locations may legitimately contain '#' (e.g. in a git URL query), so
        // only the last one separates the attribute.
        let (location, attribute) = s
            .rsplit_once('#')
            .ok_or_else(|| FlakeRefError::MissingAttribute(s.to_owned()))?;

        if attribute.is_empty() {
            return Err(FlakeRefError::MissingAttribute(s.to_owned()));
        }

        if location.is_empty() {
            return Err(FlakeRefError::EmptyLocation(s.to_owned()));
        }

        Ok(Self { location: location.to_owned(), attribute: attribute.to_owned() })
    }
}

impl fmt::Display for FlakeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.location, self.attribute)
    }
}

impl FlakeRef {
    /// Returns the location to hand to nix. `builtins.getFlake` refuses
    /// relative paths, so a location naming an existing local path is made
    /// absolute; anything else (URLs, registry names) is returned unchanged.
    pub fn resolved_location(&self) -> String {
        let path = Utf8Path::new(&self.location);
        if !path.exists() {
            return self.location.clone();
        }

        match path.canonicalize_utf8() {
            Ok(abs) => abs.to_string(),
            Err(e) => {
                tracing::warn!(
                    location = %self.location,
                    error = %e,
                    "could not canonicalize flake path, passing it as given"
                );
                self.location.clone()
            }
        }
    }
}

/// Which disko-generated script to run before installing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Partition and format the disks, then mount them.
    #[default]
    Format,

    /// Only mount already-formatted disks.
    Mount,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Format, Mode::Mount];

    /// The attribute of the install expression that builds this mode's
    /// script.
    pub fn disko_attribute(self) -> &'static str {
        match self {
            Mode::Format => "diskoScript",
            Mode::Mount => "mountScript",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Format => "format",
            Mode::Mount => "mount",
        }
    }
}

impl FromStr for Mode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ModeError(s.to_owned()))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything `disko-install` needs to know to perform one run.
#[derive(Clone, Debug)]
pub struct InstallConfig {
    pub flake: FlakeRef,
    pub mode: Mode,

    /// Logical disk names from the disko configuration mapped to the device
    /// paths they should be written to on this machine.
    pub disks: BTreeMap<String, Utf8PathBuf>,

    pub dry_run: bool,
    pub show_trace: bool,
    pub write_efi_boot_entries: bool,

    /// `--option NAME VALUE` pairs, in the order given.
    pub nix_options: Vec<(String, String)>,
}

impl InstallConfig {
    /// Expands the configured nix options into command-line arguments.
    pub fn nix_option_args(&self) -> Vec<String> {
        self.nix_options
            .iter()
            .flat_map(|(name, value)| {
                ["--option".to_string(), name.clone(), value.clone()]
            })
            .collect()
    }
}
