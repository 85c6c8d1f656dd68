//! scforge CLI - generate, build and repair Anchor programs
//!
//! Usage:
//!   scforge init                       Write .scforge/config.toml
//!   scforge build <kind> --name <name> Run one build session
//!   scforge status <id>                Show a stored session
//!   scforge history <id>               Show every attempt of a session
//!   scforge sessions                   List stored sessions
//!   scforge parse <log>                Parse a saved build log

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scforge_agent::{api_key_from_env, AnthropicGenerator};
use scforge_core::diagnostics::{self, render_diagnostics};
use scforge_core::{
    BuildAttempt, BuildSession, ContractKind, ContractSpecification, ForgeConfig, SessionId,
    SessionStatus,
};
use scforge_orchestrator::{BuildRequest, BuildService, SessionStore};
use scforge_toolchain::AnchorBuilder;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "scforge")]
#[command(author, version, about = "Generate, build and repair Anchor programs")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Repository path (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Generate a program and build it until it compiles
    Build {
        /// Contract kind (escrow, token_vesting, crowdfunding, custom)
        kind: ContractKind,

        /// Contract name; the program crate name is derived from it
        #[arg(long)]
        name: String,

        /// JSON object whose entries become specification parameters
        #[arg(long, value_name = "FILE")]
        schema: Option<PathBuf>,

        /// Extra parameter as key=value (value parsed as JSON when possible)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Attempt budget (defaults to the configured value)
        #[arg(short = 'n', long)]
        max_attempts: Option<u32>,

        /// Toolchain timeout in seconds
        #[arg(long, value_name = "SECS")]
        build_timeout: Option<u64>,

        /// Print the final session as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the recorded state of a session
    Status {
        id: SessionId,

        #[arg(long)]
        json: bool,
    },

    /// Show every attempt of a session
    History {
        id: SessionId,

        #[arg(long)]
        json: bool,
    },

    /// List stored sessions, newest first
    Sessions {
        #[arg(long)]
        json: bool,
    },

    /// Parse a saved build log and print its diagnostics
    Parse {
        log: PathBuf,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    let result = match cli.command {
        Commands::Init => cmd_init(&cli.repo).map(|_| ExitCode::SUCCESS),
        Commands::Build {
            kind,
            name,
            schema,
            params,
            max_attempts,
            build_timeout,
            json,
        } => {
            cmd_build(
                &cli.repo,
                kind,
                name,
                schema,
                params,
                max_attempts,
                build_timeout,
                json,
            )
            .await
        }
        Commands::Status { id, json } => cmd_status(&cli.repo, id, json)
            .await
            .map(|_| ExitCode::SUCCESS),
        Commands::History { id, json } => cmd_history(&cli.repo, id, json)
            .await
            .map(|_| ExitCode::SUCCESS),
        Commands::Sessions { json } => cmd_sessions(&cli.repo, json)
            .await
            .map(|_| ExitCode::SUCCESS),
        Commands::Parse { log, json } => cmd_parse(&log, json)
            .await
            .map(|_| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn load_config(repo: &Path) -> Result<ForgeConfig> {
    let config = ForgeConfig::load_or_default(repo).context("Failed to load configuration")?;
    Ok(config.resolve_paths(repo))
}

fn store(repo: &Path) -> Result<SessionStore> {
    Ok(SessionStore::new(load_config(repo)?.store.dir))
}

fn cmd_init(repo: &Path) -> Result<()> {
    info!("Initializing scforge in {:?}", repo);
    let path = ForgeConfig::write_default(repo).context("Failed to write configuration")?;

    println!("Initialized scforge in {:?}", repo);
    println!("Created:");
    println!("  {}", path.display());
    Ok(())
}

/// Build the specification from `--schema` and `--param` flags
///
/// Parameters given on the command line override the schema file.
async fn read_specification(
    kind: ContractKind,
    name: String,
    schema: Option<PathBuf>,
    params: Vec<String>,
) -> Result<ContractSpecification> {
    let mut spec = ContractSpecification::new(kind, name);

    if let Some(path) = schema {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read schema {:?}", path))?;
        let value: serde_json::Value =
            serde_json::from_str(&content).context("Failed to parse schema JSON")?;
        let serde_json::Value::Object(entries) = value else {
            bail!("Schema {:?} must be a JSON object", path);
        };
        for (key, value) in entries {
            spec = spec.with_parameter(key, value);
        }
    }

    for param in params {
        let Some((key, raw)) = param.split_once('=') else {
            bail!("Invalid parameter {:?}, expected key=value", param);
        };
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        spec = spec.with_parameter(key.trim(), value);
    }

    Ok(spec)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_build(
    repo: &Path,
    kind: ContractKind,
    name: String,
    schema: Option<PathBuf>,
    params: Vec<String>,
    max_attempts: Option<u32>,
    build_timeout: Option<u64>,
    json: bool,
) -> Result<ExitCode> {
    let mut config = load_config(repo)?;
    if let Some(secs) = build_timeout {
        config.toolchain.build_timeout_secs = secs;
    }

    let spec = read_specification(kind, name, schema, params).await?;
    api_key_from_env(&config.generation.api_key_env)
        .context("An API key is required to generate programs")?;

    let generator = AnthropicGenerator::from_config(&config.generation)
        .context("Failed to configure the generation client")?;
    info!("Using model {}", generator.model());
    let builder = AnchorBuilder::from_config(&config.toolchain);
    let service = BuildService::from_config(&config, Arc::new(generator), Arc::new(builder));

    let mut request = BuildRequest::new(spec);
    if let Some(max) = max_attempts {
        request = request.with_max_attempts(max);
    }

    let id = service.submit(request).await.context("Failed to start session")?;
    println!("Session {}", id);

    let session = tokio::select! {
        session = service.wait(id) => session?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling session {}", id);
            service.cancel(id).await?;
            service.wait(id).await?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        print_session(&session);
    }

    Ok(match session.status {
        SessionStatus::Succeeded => ExitCode::SUCCESS,
        SessionStatus::Exhausted => ExitCode::from(1),
        SessionStatus::Aborted | SessionStatus::Running => ExitCode::from(2),
    })
}

fn print_session(session: &BuildSession) {
    println!(
        "\n{} {:?} ({}): {}",
        session.specification.kind, session.specification.name, session.id, session.status
    );
    println!(
        "  Attempts: {}/{}",
        session.attempts.len(),
        session.max_attempts
    );

    match session.status {
        SessionStatus::Succeeded => {
            if let Some(program_id) = &session.program_id {
                println!("  Program ID: {}", program_id);
            }
        }
        SessionStatus::Exhausted => {
            let diagnostics = session.final_diagnostics();
            println!("  Final diagnostics:");
            for line in render_diagnostics(diagnostics).lines() {
                println!("    {}", line);
            }
        }
        SessionStatus::Aborted => {
            println!(
                "  Reason: {}",
                session.abort_reason.as_deref().unwrap_or("unknown")
            );
        }
        SessionStatus::Running => {}
    }
}

fn print_attempt(attempt: &BuildAttempt) {
    println!(
        "  #{} {:?} {} ({} error(s), {} warning(s))",
        attempt.sequence,
        attempt.mode,
        attempt.outcome,
        attempt.error_count(),
        attempt.warning_count()
    );
    if let Some(tool_error) = &attempt.tool_error {
        println!("      {}", tool_error);
    }
}

async fn cmd_status(repo: &Path, id: SessionId, json: bool) -> Result<()> {
    let session = store(repo)?
        .load(id)
        .await
        .with_context(|| format!("Failed to load session {}", id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        print_session(&session);
    }
    Ok(())
}

async fn cmd_history(repo: &Path, id: SessionId, json: bool) -> Result<()> {
    let session = store(repo)?
        .load(id)
        .await
        .with_context(|| format!("Failed to load session {}", id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session.attempts)?);
        return Ok(());
    }

    println!("=== Session {} ===", id);
    if session.attempts.is_empty() {
        println!("  No attempts recorded");
    }
    for attempt in &session.attempts {
        print_attempt(attempt);
    }
    Ok(())
}

async fn cmd_sessions(repo: &Path, json: bool) -> Result<()> {
    let summaries = store(repo)?.list().await.context("Failed to list sessions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No sessions recorded");
        return Ok(());
    }

    println!("=== Sessions ({}) ===", summaries.len());
    for summary in summaries {
        println!(
            "  {} {} {:?} {}/{} {}",
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
            summary.id,
            summary.name,
            summary.attempts,
            summary.max_attempts,
            summary.status
        );
    }
    Ok(())
}

async fn cmd_parse(log: &Path, json: bool) -> Result<()> {
    let raw = tokio::fs::read_to_string(log)
        .await
        .with_context(|| format!("Failed to read build log {:?}", log))?;
    let parsed = diagnostics::parse(&raw);

    if json {
        println!("{}", serde_json::to_string_pretty(&parsed)?);
        return Ok(());
    }

    let errors = parsed.iter().filter(|d| d.is_error()).count();
    println!(
        "{} error(s), {} warning(s)",
        errors,
        parsed.len() - errors
    );
    print!("{}", render_diagnostics(&parsed));
    Ok(())
}
