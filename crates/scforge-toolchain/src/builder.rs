//! Compiler toolchain invocation abstraction

use async_trait::async_trait;
use scforge_core::{ForgeError, Result, ToolchainConfig};
use std::collections::VecDeque;
use std::process::{Output, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::workspace::WorkspaceHandle;

/// Captured output of one toolchain run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl BuildOutput {
    fn from_output(output: Output, duration: Duration) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, as recorded in `raw_output`
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Trait for compiling a workspace (allows scripting in tests)
#[async_trait]
pub trait Builder: Send + Sync {
    /// Build the workspace, giving up after `timeout`
    ///
    /// A non-zero exit is a normal `Ok` result. Errors are reserved for a
    /// missing toolchain, a timeout, or a process that could not be run.
    async fn build(&self, workspace: &WorkspaceHandle, timeout: Duration) -> Result<BuildOutput>;
}

/// Runs the configured toolchain command inside the workspace
#[derive(Debug, Clone)]
pub struct AnchorBuilder {
    program: String,
    args: Vec<String>,
}

impl AnchorBuilder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ToolchainConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

impl Default for AnchorBuilder {
    fn default() -> Self {
        Self::from_config(&ToolchainConfig::default())
    }
}

#[async_trait]
impl Builder for AnchorBuilder {
    #[instrument(skip(self, workspace), fields(workspace = %workspace.root().display()))]
    async fn build(&self, workspace: &WorkspaceHandle, timeout: Duration) -> Result<BuildOutput> {
        debug!("Executing {} {:?}", self.program, self.args);
        let started = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The toolchain forks cargo and rustc; they share the child's group
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ForgeError::ToolchainMissing(format!(
                    "{} not found on PATH",
                    self.program
                )));
            }
            Err(e) => {
                return Err(ForgeError::Toolchain(format!(
                    "Failed to execute {}: {}",
                    self.program, e
                )));
            }
        };

        // Dropped on timeout and when the session is cancelled mid-build
        let mut group = ProcessGroupGuard::new(child.id());

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ForgeError::Toolchain(format!(
                    "Failed to wait for {}: {}",
                    self.program, e
                )));
            }
            Err(_) => {
                warn!("{} exceeded {:?}, killing its process group", self.program, timeout);
                return Err(ForgeError::BuildTimeout(timeout));
            }
        };
        group.disarm();

        let build_output = BuildOutput::from_output(output, started.elapsed());
        if !build_output.success() {
            debug!("Build exited with {:?}", build_output.exit_code);
        }

        Ok(build_output)
    }
}

/// Kills every process in the toolchain's process group when dropped
///
/// `kill_on_drop` only reaches the direct child.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {}", pgid),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Artifact a scripted build leaves behind
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Written to `target/deploy/<program>-keypair.json`
    Keypair(Vec<u8>),
    /// Written to `target/idl/<program>.json`
    Idl(serde_json::Value),
}

/// One scripted toolchain run
#[derive(Debug, Clone)]
pub enum ScriptedBuild {
    Output {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        artifact: Option<Artifact>,
    },
    /// Never finishes, so the caller's timeout fires
    Hang,
    /// Behaves like a toolchain that is not installed
    MissingToolchain,
}

impl ScriptedBuild {
    /// Exit 0 with a keypair whose public half is `public_key`
    pub fn clean(public_key: [u8; 32]) -> Self {
        let mut bytes = vec![0u8; 32];
        bytes.extend_from_slice(&public_key);
        Self::Output {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: "    Finished release [optimized] target(s) in 1.02s\n".to_string(),
            artifact: Some(Artifact::Keypair(bytes)),
        }
    }

    /// Exit 1 with the given compiler output on stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self::Output {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
            artifact: None,
        }
    }
}

/// Scripted builder for testing
///
/// Replays a fixed sequence of runs and records the source present in the
/// workspace at each call.
#[derive(Debug, Default)]
pub struct ScriptedBuilder {
    script: Mutex<VecDeque<ScriptedBuild>>,
    built_sources: Mutex<Vec<Option<String>>>,
}

impl ScriptedBuilder {
    pub fn new(script: impl IntoIterator<Item = ScriptedBuild>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            built_sources: Mutex::new(Vec::new()),
        }
    }

    /// Sources seen at each build call, in order
    pub fn built_sources(&self) -> Vec<Option<String>> {
        self.built_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.built_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn build(&self, workspace: &WorkspaceHandle, timeout: Duration) -> Result<BuildOutput> {
        let source = tokio::fs::read_to_string(workspace.source_path()).await.ok();
        self.built_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(source);

        let step = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| ForgeError::Toolchain("No scripted build left".to_string()))?;

        match step {
            ScriptedBuild::Output {
                exit_code,
                stdout,
                stderr,
                artifact,
            } => {
                if let Some(artifact) = artifact {
                    write_artifact(workspace, &artifact).await?;
                }
                Ok(BuildOutput {
                    exit_code,
                    stdout,
                    stderr,
                    duration: Duration::from_millis(1),
                })
            }
            ScriptedBuild::Hang => {
                let _ = tokio::time::timeout(timeout, std::future::pending::<()>()).await;
                Err(ForgeError::BuildTimeout(timeout))
            }
            ScriptedBuild::MissingToolchain => Err(ForgeError::ToolchainMissing(
                "anchor not found on PATH".to_string(),
            )),
        }
    }
}

async fn write_artifact(workspace: &WorkspaceHandle, artifact: &Artifact) -> Result<()> {
    match artifact {
        Artifact::Keypair(bytes) => {
            tokio::fs::create_dir_all(workspace.deploy_dir()).await?;
            let path = workspace
                .deploy_dir()
                .join(format!("{}-keypair.json", workspace.program_name()));
            tokio::fs::write(path, serde_json::to_string(bytes)?).await?;
        }
        Artifact::Idl(idl) => {
            tokio::fs::create_dir_all(workspace.idl_dir()).await?;
            let path = workspace
                .idl_dir()
                .join(format!("{}.json", workspace.program_name()));
            tokio::fs::write(path, serde_json::to_string_pretty(idl)?).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;
    use scforge_core::SessionId;
    use tempfile::TempDir;

    async fn workspace(dir: &TempDir) -> (WorkspaceManager, WorkspaceHandle) {
        let manager = WorkspaceManager::new(dir.path());
        let handle = manager.prepare(SessionId::new(), "escrow").await.unwrap();
        (manager, handle)
    }

    #[test]
    fn test_combined_output_order() {
        let output = BuildOutput {
            exit_code: Some(1),
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            duration: Duration::ZERO,
        };
        assert_eq!(output.combined(), "out\nerr");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_missing_program_is_toolchain_missing() {
        let dir = TempDir::new().unwrap();
        let (_, handle) = workspace(&dir).await;

        let builder = AnchorBuilder::new("scforge-definitely-not-installed", vec![]);
        let err = builder
            .build(&handle, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::ToolchainMissing(_)));
        assert!(err.is_environment());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_ok() {
        let dir = TempDir::new().unwrap();
        let (_, handle) = workspace(&dir).await;

        let builder = AnchorBuilder::new(
            "sh",
            vec!["-c".to_string(), "echo 'error: boom' >&2; exit 3".to_string()],
        );
        let output = builder.build(&handle, Duration::from_secs(10)).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(output.stderr.contains("error: boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_inside_workspace() {
        let dir = TempDir::new().unwrap();
        let (_, handle) = workspace(&dir).await;

        let builder = AnchorBuilder::new("sh", vec!["-c".to_string(), "ls".to_string()]);
        let output = builder.build(&handle, Duration::from_secs(10)).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("Anchor.toml"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let dir = TempDir::new().unwrap();
        let (_, handle) = workspace(&dir).await;

        let builder = AnchorBuilder::new("sleep", vec!["5".to_string()]);
        let err = builder
            .build(&handle, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::BuildTimeout(_)));
    }

    #[cfg(unix)]
    fn forking_builder() -> AnchorBuilder {
        AnchorBuilder::new(
            "sh",
            vec![
                "-c".to_string(),
                "sh -c 'sleep 1; touch late_artifact' & wait".to_string(),
            ],
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        let dir = TempDir::new().unwrap();
        let (_, handle) = workspace(&dir).await;

        let err = forking_builder()
            .build(&handle, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::BuildTimeout(_)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!handle.root().join("late_artifact").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_build_kills_grandchildren() {
        let dir = TempDir::new().unwrap();
        let (_, handle) = workspace(&dir).await;
        let builder = forking_builder();

        tokio::select! {
            _ = builder.build(&handle, Duration::from_secs(30)) => panic!("build should not finish"),
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!handle.root().join("late_artifact").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finished_build_keeps_its_output() {
        let dir = TempDir::new().unwrap();
        let (_, handle) = workspace(&dir).await;

        let builder = AnchorBuilder::new(
            "sh",
            vec!["-c".to_string(), "sh -c 'touch built' & wait; echo done".to_string()],
        );
        let output = builder.build(&handle, Duration::from_secs(10)).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "done");
        assert!(handle.root().join("built").exists());
    }

    #[tokio::test]
    async fn test_scripted_builder_replays_and_records() {
        let dir = TempDir::new().unwrap();
        let (manager, handle) = workspace(&dir).await;

        let builder = ScriptedBuilder::new([
            ScriptedBuild::failed("error: nope"),
            ScriptedBuild::clean([4u8; 32]),
        ]);

        manager.write(&handle, "// v1").await.unwrap();
        let first = builder.build(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.exit_code, Some(1));

        manager.write(&handle, "// v2").await.unwrap();
        let second = builder.build(&handle, Duration::from_secs(1)).await.unwrap();
        assert!(second.success());
        assert!(handle.deploy_dir().join("escrow-keypair.json").exists());

        assert_eq!(
            builder.built_sources(),
            vec![Some("// v1".to_string()), Some("// v2".to_string())]
        );

        let err = builder
            .build(&handle, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Toolchain(_)));
    }

    #[tokio::test]
    async fn test_scripted_hang_times_out() {
        let dir = TempDir::new().unwrap();
        let (_, handle) = workspace(&dir).await;

        let builder = ScriptedBuilder::new([ScriptedBuild::Hang]);
        let err = builder
            .build(&handle, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::BuildTimeout(_)));
    }
}
