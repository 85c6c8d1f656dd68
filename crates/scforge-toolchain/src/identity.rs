//! Program identity extraction from build artifacts
//!
//! A successful Anchor build leaves `target/deploy/<program>-keypair.json`
//! (a 64-byte ed25519 keypair as a JSON array) and usually an interface
//! description under `target/idl/`. The program id is the base58 encoding
//! of the keypair's public half.

use regex::Regex;
use scforge_core::{ForgeError, Result};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, instrument};

use crate::workspace::WorkspaceHandle;

pub use scforge_core::PLACEHOLDER_PROGRAM_ID;

const KEYPAIR_SUFFIX: &str = "-keypair.json";

static DECLARE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"declare_id!\s*\(\s*"(?P<id>[1-9A-HJ-NP-Za-km-z]+)"\s*\)"#)
        .expect("declare_id pattern is valid")
});

/// Reads the deployable program id out of a workspace after a clean build
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityExtractor;

impl IdentityExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Program id for the workspace's build artifacts
    ///
    /// Tries the program's own keypair first, then the newest keypair in the
    /// deploy directory, then the `address` recorded in the IDL.
    #[instrument(skip(self, handle), fields(program = handle.program_name()))]
    pub fn extract(&self, handle: &WorkspaceHandle) -> Result<String> {
        let deploy_dir = handle.deploy_dir();
        let own_keypair = deploy_dir.join(format!("{}{}", handle.program_name(), KEYPAIR_SUFFIX));

        let keypair = if own_keypair.is_file() {
            Some(own_keypair)
        } else {
            newest_keypair(&deploy_dir)
        };

        if let Some(path) = keypair {
            match program_id_from_keypair(&path) {
                Ok(id) => {
                    debug!("Program id {} from {:?}", id, path);
                    return Ok(id);
                }
                Err(e) => debug!("Keypair {:?} unusable: {}", path, e),
            }
        }

        if let Some(id) = program_id_from_idl(&handle.idl_dir(), handle.program_name()) {
            debug!("Program id {} from IDL", id);
            return Ok(id);
        }

        Err(ForgeError::IdentityNotFound(format!(
            "no usable keypair in {} and no address in {}",
            deploy_dir.display(),
            handle.idl_dir().display()
        )))
    }
}

/// Program id declared in source via `declare_id!`, if any
pub fn declared_program_id(source: &str) -> Option<String> {
    DECLARE_ID_RE
        .captures(source)
        .map(|caps| caps["id"].to_string())
}

/// Rewrite the source so `declare_id!` names `program_id`
///
/// Replaces the first declaration, or adds one after the
/// `anchor_lang` prelude import (at the top when there is none).
pub fn pin_program_id(source: &str, program_id: &str) -> String {
    let declaration = format!("declare_id!(\"{}\")", program_id);

    if let Some(found) = DECLARE_ID_RE.find(source) {
        let mut pinned = String::with_capacity(source.len() + program_id.len());
        pinned.push_str(&source[..found.start()]);
        pinned.push_str(&declaration);
        pinned.push_str(&source[found.end()..]);
        return pinned;
    }

    let insert_at = source
        .find("use anchor_lang::prelude::*;")
        .map(|start| {
            source[start..]
                .find('\n')
                .map_or(source.len(), |newline| start + newline + 1)
        })
        .unwrap_or(0);

    let mut pinned = String::with_capacity(source.len() + declaration.len() + 3);
    pinned.push_str(&source[..insert_at]);
    if insert_at > 0 {
        if !pinned.ends_with('\n') {
            pinned.push('\n');
        }
        pinned.push('\n');
    }
    pinned.push_str(&declaration);
    pinned.push_str(";\n");
    if insert_at == 0 {
        pinned.push('\n');
    }
    pinned.push_str(&source[insert_at..]);
    pinned
}

fn newest_keypair(deploy_dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(deploy_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(KEYPAIR_SUFFIX))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn program_id_from_keypair(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    let bytes: Vec<u8> = serde_json::from_str(&content)?;

    if bytes.len() != 64 {
        return Err(ForgeError::IdentityNotFound(format!(
            "keypair {} has {} bytes, expected 64",
            path.display(),
            bytes.len()
        )));
    }

    Ok(bs58::encode(&bytes[32..]).into_string())
}

fn program_id_from_idl(idl_dir: &Path, program_name: &str) -> Option<String> {
    let preferred = idl_dir.join(format!("{}.json", program_name));
    let candidates: Vec<PathBuf> = if preferred.is_file() {
        vec![preferred]
    } else {
        std::fs::read_dir(idl_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect()
    };

    candidates.iter().find_map(|path| {
        let content = std::fs::read_to_string(path).ok()?;
        let idl: serde_json::Value = serde_json::from_str(&content).ok()?;
        let address = idl
            .get("address")
            .or_else(|| idl.get("metadata").and_then(|m| m.get("address")))?
            .as_str()?;
        is_program_id(address).then(|| address.to_string())
    })
}

/// True when `candidate` is base58 for exactly 32 bytes
fn is_program_id(candidate: &str) -> bool {
    bs58::decode(candidate)
        .into_vec()
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;
    use scforge_core::SessionId;
    use tempfile::TempDir;

    async fn workspace(dir: &TempDir) -> WorkspaceHandle {
        WorkspaceManager::new(dir.path())
            .prepare(SessionId::new(), "escrow")
            .await
            .unwrap()
    }

    fn write_keypair(handle: &WorkspaceHandle, name: &str, bytes: &[u8]) {
        std::fs::create_dir_all(handle.deploy_dir()).unwrap();
        std::fs::write(
            handle.deploy_dir().join(name),
            serde_json::to_string(bytes).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_zero_public_key_is_placeholder() {
        let dir = TempDir::new().unwrap();
        let handle = workspace(&dir).await;
        write_keypair(&handle, "escrow-keypair.json", &[0u8; 64]);

        let id = IdentityExtractor::new().extract(&handle).unwrap();
        assert_eq!(id, PLACEHOLDER_PROGRAM_ID);
    }

    #[tokio::test]
    async fn test_uses_public_half_of_keypair() {
        let dir = TempDir::new().unwrap();
        let handle = workspace(&dir).await;

        let mut bytes = vec![9u8; 32];
        bytes.extend((1..=32).collect::<Vec<u8>>());
        write_keypair(&handle, "escrow-keypair.json", &bytes);

        let id = IdentityExtractor::new().extract(&handle).unwrap();
        let decoded = bs58::decode(&id).into_vec().unwrap();
        assert_eq!(decoded, (1..=32).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_falls_back_to_other_keypair() {
        let dir = TempDir::new().unwrap();
        let handle = workspace(&dir).await;
        let mut bytes = vec![0u8; 32];
        bytes.extend([7u8; 32]);
        write_keypair(&handle, "renamed-keypair.json", &bytes);

        let id = IdentityExtractor::new().extract(&handle).unwrap();
        assert_eq!(bs58::decode(&id).into_vec().unwrap(), vec![7u8; 32]);
    }

    #[tokio::test]
    async fn test_falls_back_to_idl_address() {
        let dir = TempDir::new().unwrap();
        let handle = workspace(&dir).await;
        write_keypair(&handle, "escrow-keypair.json", &[1u8; 10]);

        let address = bs58::encode([5u8; 32]).into_string();
        std::fs::create_dir_all(handle.idl_dir()).unwrap();
        std::fs::write(
            handle.idl_dir().join("escrow.json"),
            serde_json::json!({ "address": address, "instructions": [] }).to_string(),
        )
        .unwrap();

        let id = IdentityExtractor::new().extract(&handle).unwrap();
        assert_eq!(id, address);
    }

    #[tokio::test]
    async fn test_legacy_idl_metadata_address() {
        let dir = TempDir::new().unwrap();
        let handle = workspace(&dir).await;

        let address = bs58::encode([3u8; 32]).into_string();
        std::fs::create_dir_all(handle.idl_dir()).unwrap();
        std::fs::write(
            handle.idl_dir().join("escrow.json"),
            serde_json::json!({ "metadata": { "address": address } }).to_string(),
        )
        .unwrap();

        assert_eq!(IdentityExtractor::new().extract(&handle).unwrap(), address);
    }

    #[tokio::test]
    async fn test_invalid_idl_address_is_ignored() {
        let dir = TempDir::new().unwrap();
        let handle = workspace(&dir).await;
        std::fs::create_dir_all(handle.idl_dir()).unwrap();
        std::fs::write(
            handle.idl_dir().join("escrow.json"),
            r#"{"address": "not-base58-0OIl"}"#,
        )
        .unwrap();

        let err = IdentityExtractor::new().extract(&handle).unwrap_err();
        assert!(matches!(err, ForgeError::IdentityNotFound(_)));
    }

    #[tokio::test]
    async fn test_no_artifacts() {
        let dir = TempDir::new().unwrap();
        let handle = workspace(&dir).await;

        let err = IdentityExtractor::new().extract(&handle).unwrap_err();
        assert!(matches!(err, ForgeError::IdentityNotFound(_)));
    }

    #[test]
    fn test_declared_program_id() {
        let source = r#"
use anchor_lang::prelude::*;

declare_id!("Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS");
"#;
        assert_eq!(
            declared_program_id(source).as_deref(),
            Some("Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS")
        );
        assert!(declared_program_id("fn main() {}").is_none());
    }

    #[test]
    fn test_pin_replaces_placeholder_declaration() {
        let source = "use anchor_lang::prelude::*;\n\ndeclare_id!(\"11111111111111111111111111111111\");\n\n#[program]\npub mod escrow {}\n";
        let pinned = pin_program_id(source, "Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS");

        assert_eq!(
            declared_program_id(&pinned).as_deref(),
            Some("Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS")
        );
        assert!(!pinned.contains(PLACEHOLDER_PROGRAM_ID));
        assert!(pinned.ends_with("#[program]\npub mod escrow {}\n"));
    }

    #[test]
    fn test_pin_adds_missing_declaration_after_prelude() {
        let source = "use anchor_lang::prelude::*;\n\n#[program]\npub mod escrow {}\n";
        let pinned = pin_program_id(source, "Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS");

        assert!(pinned.starts_with(
            "use anchor_lang::prelude::*;\n\ndeclare_id!(\"Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS\");\n"
        ));
        assert!(pinned.ends_with("#[program]\npub mod escrow {}\n"));
    }

    #[test]
    fn test_pin_without_prelude_goes_on_top() {
        let pinned = pin_program_id("pub mod escrow {}\n", "Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS");
        assert!(pinned.starts_with("declare_id!("));
        assert_eq!(
            declared_program_id(&pinned).as_deref(),
            Some("Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS")
        );
    }
}
