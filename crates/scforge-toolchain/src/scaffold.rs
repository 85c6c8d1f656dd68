//! Minimal Anchor project layout for fresh workspaces

use std::path::Path;

use crate::identity::PLACEHOLDER_PROGRAM_ID;

/// Write `Anchor.toml`, the workspace `Cargo.toml` and the program manifest
pub(crate) fn write_anchor_scaffold(
    root: &Path,
    program_name: &str,
    anchor_version: &str,
) -> std::io::Result<()> {
    let program_dir = root.join("programs").join(program_name);
    std::fs::create_dir_all(program_dir.join("src"))?;

    std::fs::write(root.join("Anchor.toml"), anchor_toml(program_name))?;
    std::fs::write(root.join("Cargo.toml"), WORKSPACE_CARGO_TOML)?;
    std::fs::write(
        program_dir.join("Cargo.toml"),
        program_cargo_toml(program_name, anchor_version),
    )?;

    Ok(())
}

fn anchor_toml(program_name: &str) -> String {
    format!(
        r#"[toolchain]

[features]
resolution = true
skip-lint = false

[programs.localnet]
{program_name} = "{PLACEHOLDER_PROGRAM_ID}"

[registry]
url = "https://api.apr.dev"

[provider]
cluster = "Localnet"
wallet = "~/.config/solana/id.json"

[scripts]
"#
    )
}

const WORKSPACE_CARGO_TOML: &str = r#"[workspace]
members = ["programs/*"]
resolver = "2"

[profile.release]
overflow-checks = true
lto = "fat"
codegen-units = 1

[profile.release.build-override]
opt-level = 3
incremental = false
codegen-units = 1
"#;

fn program_cargo_toml(program_name: &str, anchor_version: &str) -> String {
    format!(
        r#"[package]
name = "{program_name}"
version = "0.1.0"
edition = "2021"

[lib]
crate-type = ["cdylib", "lib"]
name = "{program_name}"

[features]
default = []
cpi = ["no-entrypoint"]
no-entrypoint = []
no-idl = []
no-log-ix-name = []
idl-build = ["anchor-lang/idl-build"]

[dependencies]
anchor-lang = "{anchor_version}"
"#
    )
}
