// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendering of values into the Nix expression language and assembly of the
//! `nix build` invocation that produces the installation artifacts.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::{config::InstallConfig, error::BuildOutputError};

/// The expression `nix build` evaluates. It is applied to the `--arg` and
/// `--argstr` values supplied on the command line and exposes the installable
/// system closure and both disko scripts.
pub const INSTALL_EXPR: &str = r#"
{ flake
, flakeAttr
, diskMappings
, rootMountPoint ? "/mnt"
, writeEfiBootEntries ? false
}:
let
  originalSystem = (builtins.getFlake flake).nixosConfigurations.${flakeAttr};
  lib = originalSystem.pkgs.lib;
  deviceOverrides = lib.mapAttrs
    (name: device: { device = lib.mkVMOverride device; })
    diskMappings;
  diskoSystem = originalSystem.extendModules {
    modules = [{
      disko.rootMountPoint = rootMountPoint;
      disko.devices.disk = deviceOverrides;
    }];
  };
  installSystem = originalSystem.extendModules {
    modules = [{
      disko.devices.disk = deviceOverrides;
      boot.loader.efi.canTouchEfiVariables = lib.mkVMOverride writeEfiBootEntries;
    }];
  };
in
{
  installToplevel = installSystem.config.system.build.toplevel;
  diskoScript = diskoSystem.config.system.build.diskoScript;
  mountScript = diskoSystem.config.system.build.mountScript;
}
"#;

/// Quotes `s` as a Nix string literal.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Only `${` starts an interpolation; a lone `$` is literal.
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Renders `attrs` as a Nix attribute set whose names and values are all
/// strings, e.g. `{ "main" = "/dev/sda"; }`.
pub fn serialize_attrs<K, V>(attrs: &BTreeMap<K, V>) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = String::from("{");
    for (name, value) in attrs {
        out.push(' ');
        out.push_str(&quote_string(name.as_ref()));
        out.push_str(" = ");
        out.push_str(&quote_string(value.as_ref()));
        out.push(';');
    }
    out.push_str(" }");
    out
}

/// Builds the argument list for `nix build` that evaluates [`INSTALL_EXPR`]
/// for `config`, using `mountpoint` as the installation root.
pub fn build_args(config: &InstallConfig, mountpoint: &Utf8Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "build",
        "--print-out-paths",
        "--no-link",
        "--impure",
        "--extra-experimental-features",
        "nix-command flakes",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    if config.show_trace {
        args.push("--show-trace".to_string());
    }

    args.extend(config.nix_option_args());

    let disk_mappings = serialize_attrs(&config.disks);
    let write_efi = if config.write_efi_boot_entries { "true" } else { "false" };

    args.extend(
        [
            "--argstr",
            "flake",
            &config.flake.resolved_location(),
            "--argstr",
            "flakeAttr",
            &config.flake.attribute,
            "--argstr",
            "rootMountPoint",
            mountpoint.as_str(),
            "--arg",
            "writeEfiBootEntries",
            write_efi,
            "--arg",
            "diskMappings",
            &disk_mappings,
            "--expr",
            INSTALL_EXPR,
            "-A",
            "installToplevel",
            "-A",
            config.mode.disko_attribute(),
        ]
        .into_iter()
        .map(String::from),
    );

    args
}

/// The two store paths a successful build prints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildOutputs {
    pub toplevel: Utf8PathBuf,
    pub disk_script: Utf8PathBuf,
}

impl BuildOutputs {
    /// Parses the stdout of `nix build --print-out-paths`. Outputs are printed
    /// one per line in the order their attributes were requested.
    pub fn parse(stdout: &str) -> Result<Self, BuildOutputError> {
        let paths: Vec<&str> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        match paths.as_slice() {
            [toplevel, disk_script] => Ok(Self {
                toplevel: Utf8PathBuf::from(*toplevel),
                disk_script: Utf8PathBuf::from(*disk_script),
            }),
            _ => Err(BuildOutputError {
                count: paths.len(),
                output: stdout.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlakeRef, Mode};
    use proptest::prelude::*;

    fn config(mode: Mode) -> InstallConfig {
        InstallConfig {
            flake: FlakeRef {
                location: "github:example/infra".to_string(),
                attribute: "server".to_string(),
            },
            mode,
            disks: [("main".to_string(), Utf8PathBuf::from("/dev/vda"))]
                .into_iter()
                .collect(),
            dry_run: false,
            show_trace: false,
            write_efi_boot_entries: false,
            nix_options: Vec::new(),
        }
    }

    /// Reads a Nix string literal produced by `quote_string` back into its
    /// value, returning the unconsumed remainder.
    fn unquote(s: &str) -> Option<(String, &str)> {
        let rest = s.strip_prefix('"')?;
        let mut out = String::new();
        let mut chars = rest.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => return Some((out, &rest[i + 1..])),
                '\\' => match chars.next()?.1 {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    other => out.push(other),
                },
                // An unescaped interpolation would be evaluated by nix.
                '$' if rest[i + 1..].starts_with('{') => return None,
                c => out.push(c),
            }
        }
        None
    }

    #[test]
    fn serializes_and_escapes_quotes() {
        let attrs: BTreeMap<&str, &str> =
            [("a", "1"), ("b", "x\"y")].into_iter().collect();
        assert_eq!(serialize_attrs(&attrs), r#"{ "a" = "1"; "b" = "x\"y"; }"#);
    }

    #[test]
    fn empty_mapping_is_empty_set() {
        let attrs: BTreeMap<String, String> = BTreeMap::new();
        assert_eq!(serialize_attrs(&attrs), "{ }");
    }

    #[test]
    fn escapes_backslash_and_interpolation() {
        assert_eq!(quote_string(r"a\b"), r#""a\\b""#);
        assert_eq!(quote_string("${pkgs.x}"), r#""\${pkgs.x}""#);
        assert_eq!(quote_string("$HOME"), r#""$HOME""#);
    }

    #[test]
    fn build_args_select_mode_attribute() {
        let mp = Utf8Path::new("/tmp/disko-install-abc");
        let format = build_args(&config(Mode::Format), mp);
        assert_eq!(format[format.len() - 1], "diskoScript");
        assert_eq!(format[format.len() - 3], "installToplevel");

        let mount = build_args(&config(Mode::Mount), mp);
        assert_eq!(mount[mount.len() - 1], "mountScript");
    }

    #[test]
    fn build_args_carry_flake_and_mountpoint() {
        let mut config = config(Mode::Format);
        config.show_trace = true;
        config.write_efi_boot_entries = true;
        config.nix_options = vec![("cores".to_string(), "2".to_string())];

        let args = build_args(&config, Utf8Path::new("/tmp/root"));
        let joined = args.join(" ");
        assert!(joined.contains("--argstr flake github:example/infra"));
        assert!(joined.contains("--argstr flakeAttr server"));
        assert!(joined.contains("--argstr rootMountPoint /tmp/root"));
        assert!(joined.contains("--arg writeEfiBootEntries true"));
        assert!(joined.contains(r#"--arg diskMappings { "main" = "/dev/vda"; }"#));
        assert!(joined.contains("--option cores 2"));
        assert!(args.iter().any(|a| a == "--show-trace"));
        assert_eq!(args[0], "build");
    }

    #[test]
    fn parses_two_output_paths() {
        let outputs = BuildOutputs::parse(
            "/nix/store/aaa-nixos-system\n/nix/store/bbb-disko\n",
        )
        .unwrap();
        assert_eq!(outputs.toplevel, "/nix/store/aaa-nixos-system");
        assert_eq!(outputs.disk_script, "/nix/store/bbb-disko");
    }

    #[test]
    fn rejects_unexpected_output_count() {
        let err = BuildOutputs::parse("/nix/store/aaa\n").unwrap_err();
        assert_eq!(err.count, 1);

        let err = BuildOutputs::parse("").unwrap_err();
        assert_eq!(err.count, 0);

        let err = BuildOutputs::parse("/a\n/b\n/c\n").unwrap_err();
        assert_eq!(err.count, 3);
    }

    proptest! {
        #[test]
        fn quoted_strings_read_back_unchanged(s in any::<String>()) {
            let quoted = quote_string(&s);
            let (value, rest) = unquote(&quoted).expect("well-formed literal");
            prop_assert_eq!(value, s);
            prop_assert!(rest.is_empty());
        }

        #[test]
        fn every_entry_is_serialized(
            attrs in proptest::collection::btree_map(
                "[a-z\"\\\\$\\{]{1,8}",
                "[ -~]{0,12}",
                0..6,
            )
        ) {
            let rendered = serialize_attrs(&attrs);
            prop_assert!(rendered.starts_with('{'), "missing opening brace");
            prop_assert!(rendered.ends_with('}'), "missing closing brace");

            let mut rest = rendered[1..rendered.len() - 1].trim_start();
            let mut seen = BTreeMap::new();
            while !rest.is_empty() {
                let (name, after) = unquote(rest).expect("name literal");
                let after = after.strip_prefix(" = ").expect("assignment");
                let (value, after) = unquote(after).expect("value literal");
                let after = after.strip_prefix(';').expect("terminator");
                seen.insert(name, value);
                rest = after.trim_start();
            }
            prop_assert_eq!(seen, attrs);
        }
    }
}
