//! Workspace management for session isolation
//!
//! Every build session gets its own directory under the workspace root.
//! Sessions never share a directory, so no locking is needed between them.

use scforge_core::{ForgeError, Result, SessionId, ToolchainConfig, WorkspaceConfig};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scaffold::write_anchor_scaffold;

/// Entries never copied out of a template project
const TEMPLATE_SKIP: &[&str] = &["target", "node_modules", ".git", ".anchor"];

/// An isolated on-disk Anchor project owned by one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    session_id: SessionId,
    root: PathBuf,
    program_name: String,
}

impl WorkspaceHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    /// `programs/<program>/src/lib.rs`
    pub fn source_path(&self) -> PathBuf {
        self.root
            .join("programs")
            .join(&self.program_name)
            .join("src")
            .join("lib.rs")
    }

    /// Where the toolchain writes program keypairs
    pub fn deploy_dir(&self) -> PathBuf {
        self.root.join("target").join("deploy")
    }

    /// Where the toolchain writes interface descriptions
    pub fn idl_dir(&self) -> PathBuf {
        self.root.join("target").join("idl")
    }
}

/// Contents of the source file at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    source: Option<String>,
}

impl WorkspaceSnapshot {
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

/// Creates, writes and disposes per-session workspaces
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    template_dir: Option<PathBuf>,
    anchor_version: String,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            template_dir: None,
            anchor_version: ToolchainConfig::default().anchor_version,
        }
    }

    pub fn from_config(workspace: &WorkspaceConfig, toolchain: &ToolchainConfig) -> Self {
        Self {
            root: workspace.root.clone(),
            template_dir: workspace.template_dir.clone(),
            anchor_version: toolchain.anchor_version.clone(),
        }
    }

    /// Copy this Anchor project into every new workspace instead of scaffolding
    pub fn with_template(mut self, template_dir: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(template_dir.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh workspace for a session
    ///
    /// Fails if the session directory already exists. With a template that
    /// holds exactly one program, that program's name wins over
    /// `program_name` so the template's manifests stay valid.
    pub async fn prepare(&self, session_id: SessionId, program_name: &str) -> Result<WorkspaceHandle> {
        let workspace_path = self.root.join(session_id.to_string());
        info!("Creating workspace for session {} at {:?}", session_id, workspace_path);

        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            ForgeError::Workspace(format!(
                "Failed to create workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        tokio::fs::create_dir(&workspace_path).await.map_err(|e| {
            ForgeError::Workspace(format!(
                "Failed to create workspace directory {}: {}",
                workspace_path.display(),
                e
            ))
        })?;

        let populated = tokio::task::spawn_blocking({
            let workspace_path = workspace_path.clone();
            let template = self.template_dir.clone();
            let program_name = program_name.to_string();
            let anchor_version = self.anchor_version.clone();
            move || populate(&workspace_path, template.as_deref(), &program_name, &anchor_version)
        })
        .await
        .map_err(|e| ForgeError::Workspace(format!("Workspace setup task failed: {}", e)))
        .and_then(|result| result);

        let program_name = match populated {
            Ok(name) => name,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&workspace_path).await {
                    warn!(
                        "Failed to remove half-prepared workspace {}: {}",
                        workspace_path.display(),
                        cleanup
                    );
                }
                return Err(e);
            }
        };

        debug!("Workspace {} uses program {}", session_id, program_name);

        Ok(WorkspaceHandle {
            session_id,
            root: workspace_path,
            program_name,
        })
    }

    /// Replace the contract source atomically
    ///
    /// Writes a uniquely named temp file next to the target and renames it
    /// over `lib.rs`, so readers only ever see a complete file.
    pub async fn write(&self, handle: &WorkspaceHandle, source: &str) -> Result<()> {
        let target = handle.source_path();
        let dir = target
            .parent()
            .ok_or_else(|| ForgeError::Workspace("source path has no parent".to_string()))?;
        let tmp = dir.join(format!(".lib.rs.{}.tmp", Uuid::new_v4().simple()));

        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(source.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ForgeError::Workspace(format!(
                "Failed to write {}: {}",
                target.display(),
                e
            )));
        }

        debug!("Wrote {} bytes to {:?}", source.len(), target);
        Ok(())
    }

    /// Current contract source, if any has been written
    pub async fn read_source(&self, handle: &WorkspaceHandle) -> Result<Option<String>> {
        match tokio::fs::read_to_string(handle.source_path()).await {
            Ok(source) => Ok(Some(source)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ForgeError::Workspace(format!("Failed to read source: {}", e))),
        }
    }

    pub async fn snapshot(&self, handle: &WorkspaceHandle) -> Result<WorkspaceSnapshot> {
        Ok(WorkspaceSnapshot {
            source: self.read_source(handle).await?,
        })
    }

    /// Put the source file back the way the snapshot saw it
    pub async fn restore(&self, handle: &WorkspaceHandle, snapshot: &WorkspaceSnapshot) -> Result<()> {
        match &snapshot.source {
            Some(source) => self.write(handle, source).await,
            None => match tokio::fs::remove_file(handle.source_path()).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ForgeError::Workspace(format!("Failed to restore source: {}", e))),
            },
        }
    }

    /// Release the workspace directory
    pub async fn dispose(&self, handle: &WorkspaceHandle) -> Result<()> {
        info!("Disposing workspace {:?}", handle.root());

        match tokio::fs::remove_dir_all(handle.root()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ForgeError::Workspace(format!(
                "Failed to remove workspace {}: {}",
                handle.root().display(),
                e
            ))),
        }
    }
}

/// Fill a freshly created session directory from the template or a scaffold
///
/// Returns the program name the workspace ended up with.
fn populate(
    workspace_path: &Path,
    template: Option<&Path>,
    program_name: &str,
    anchor_version: &str,
) -> Result<String> {
    match template {
        Some(template) => {
            copy_dir_recursive(template, workspace_path).map_err(|e| {
                ForgeError::Workspace(format!(
                    "Failed to copy template {}: {}",
                    template.display(),
                    e
                ))
            })?;
            let name = single_program(workspace_path).unwrap_or_else(|| program_name.to_string());
            std::fs::create_dir_all(workspace_path.join("programs").join(&name).join("src"))
                .map_err(|e| {
                    ForgeError::Workspace(format!("Failed to create program directory: {}", e))
                })?;
            Ok(name)
        }
        None => {
            write_anchor_scaffold(workspace_path, program_name, anchor_version)
                .map_err(|e| ForgeError::Workspace(format!("Failed to scaffold workspace: {}", e)))?;
            Ok(program_name.to_string())
        }
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if TEMPLATE_SKIP.iter().any(|skip| name == *skip) {
            continue;
        }

        let dest = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), dest)?;
        }
    }

    Ok(())
}

/// Name of the only directory under `programs/`, if there is exactly one
fn single_program(workspace: &Path) -> Option<String> {
    let mut names = std::fs::read_dir(workspace.join("programs"))
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok());

    let first = names.next()?;
    match names.next() {
        Some(_) => None,
        None => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prepare_scaffolds_isolated_directory() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("ws"));

        let a = manager.prepare(SessionId::new(), "escrow").await.unwrap();
        let b = manager.prepare(SessionId::new(), "escrow").await.unwrap();

        assert_ne!(a.root(), b.root());
        assert!(a.root().join("Anchor.toml").exists());
        assert!(a.source_path().parent().unwrap().is_dir());
        assert_eq!(a.program_name(), "escrow");
    }

    #[tokio::test]
    async fn test_prepare_rejects_existing_session_directory() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let id = SessionId::new();

        manager.prepare(id, "escrow").await.unwrap();
        let err = manager.prepare(id, "escrow").await.unwrap_err();
        assert!(matches!(err, ForgeError::Workspace(_)));
    }

    #[tokio::test]
    async fn test_prepare_fails_on_unwritable_root() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file in the way").unwrap();

        let manager = WorkspaceManager::new(blocker.join("ws"));
        let err = manager.prepare(SessionId::new(), "escrow").await.unwrap_err();
        assert!(err.is_environment());
    }

    #[tokio::test]
    async fn test_failed_template_copy_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("ws");
        let manager = WorkspaceManager::new(&root).with_template(dir.path().join("missing"));

        let err = manager.prepare(SessionId::new(), "escrow").await.unwrap_err();
        assert!(matches!(err, ForgeError::Workspace(_)));
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_write_replaces_source_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let handle = manager.prepare(SessionId::new(), "escrow").await.unwrap();

        manager.write(&handle, "// first").await.unwrap();
        manager.write(&handle, "// second").await.unwrap();

        assert_eq!(
            manager.read_source(&handle).await.unwrap().as_deref(),
            Some("// second")
        );

        let leftovers: Vec<_> = std::fs::read_dir(handle.source_path().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let handle = manager.prepare(SessionId::new(), "escrow").await.unwrap();

        let empty = manager.snapshot(&handle).await.unwrap();
        assert!(empty.source().is_none());

        manager.write(&handle, "// good").await.unwrap();
        let good = manager.snapshot(&handle).await.unwrap();

        manager.write(&handle, "// half-built").await.unwrap();
        manager.restore(&handle, &good).await.unwrap();
        assert_eq!(
            manager.read_source(&handle).await.unwrap().as_deref(),
            Some("// good")
        );

        manager.restore(&handle, &empty).await.unwrap();
        assert!(manager.read_source(&handle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_template_program_name_wins() {
        let dir = TempDir::new().unwrap();
        let template = dir.path().join("template");
        std::fs::create_dir_all(template.join("programs/deploy/src")).unwrap();
        std::fs::create_dir_all(template.join("target/deploy")).unwrap();
        std::fs::write(template.join("Anchor.toml"), "[programs.localnet]\n").unwrap();

        let manager = WorkspaceManager::new(dir.path().join("ws")).with_template(&template);
        let handle = manager.prepare(SessionId::new(), "escrow").await.unwrap();

        assert_eq!(handle.program_name(), "deploy");
        assert!(handle.root().join("Anchor.toml").exists());
        assert!(!handle.root().join("target").exists());
    }

    #[tokio::test]
    async fn test_dispose_removes_directory() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let handle = manager.prepare(SessionId::new(), "escrow").await.unwrap();

        manager.dispose(&handle).await.unwrap();
        assert!(!handle.root().exists());
        // Disposing twice is harmless
        manager.dispose(&handle).await.unwrap();
    }
}
