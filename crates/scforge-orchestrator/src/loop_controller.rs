//! Generate → build → diagnose → repair loop
//!
//! Drives one session through the pure state machine, carrying out the I/O
//! each state needs and executing the actions each transition returns.
//! Attempts run strictly one after another.

use chrono::{DateTime, Utc};
use scforge_agent::GenerationClient;
use scforge_core::diagnostics::{self, Diagnostic, Severity};
use scforge_core::fail_open::fail_open;
use scforge_core::{
    AttemptOutcome, BuildAttempt, BuildSession, ForgeConfig, ForgeError, GenerationMode,
    PLACEHOLDER_PROGRAM_ID,
};
use scforge_toolchain::{
    declared_program_id, pin_program_id, BuildOutput, Builder, IdentityExtractor,
    WorkspaceHandle, WorkspaceManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::session_store::SessionStore;
use crate::state_machine::{transition, Action, Event, State, Verdict};

/// Lines of raw output quoted when a failed build reports no errors
const OUTPUT_TAIL_LINES: usize = 20;

/// Timeouts and cleanup policy for a controller
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub build_timeout: Duration,
    pub generation_timeout: Duration,
    /// Keep workspaces on disk after the session ends
    pub retain_workspaces: bool,
}

impl LoopSettings {
    pub fn from_config(config: &ForgeConfig) -> Self {
        Self {
            build_timeout: config.toolchain.build_timeout(),
            generation_timeout: config.generation.timeout(),
            retain_workspaces: config.workspace.retain,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&ForgeConfig::default())
    }
}

/// Inputs for the next repair call: the latest failed attempt
#[derive(Debug, Clone)]
struct RepairContext {
    source: String,
    errors: Vec<Diagnostic>,
}

/// The attempt currently in flight
#[derive(Debug)]
struct AttemptDraft {
    sequence: u32,
    mode: GenerationMode,
    started_at: DateTime<Utc>,
    source: String,
    output: Option<BuildOutput>,
    diagnostics: Vec<Diagnostic>,
    tool_error: Option<String>,
}

impl AttemptDraft {
    fn new(sequence: u32, mode: GenerationMode) -> Self {
        Self {
            sequence,
            mode,
            started_at: Utc::now(),
            source: String::new(),
            output: None,
            diagnostics: Vec::new(),
            tool_error: None,
        }
    }

    fn finish(self, outcome: AttemptOutcome) -> BuildAttempt {
        let (raw_output, exit_code) = match &self.output {
            Some(output) => (output.combined(), output.exit_code),
            None => (String::new(), None),
        };

        BuildAttempt {
            sequence: self.sequence,
            mode: self.mode,
            source: self.source,
            raw_output,
            exit_code,
            diagnostics: self.diagnostics,
            outcome,
            tool_error: self.tool_error,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Runs build sessions to a terminal status
///
/// Collaborators are passed in explicitly so tests can substitute scripted
/// generators and builders.
pub struct LoopController {
    generator: Arc<dyn GenerationClient>,
    builder: Arc<dyn Builder>,
    workspaces: WorkspaceManager,
    identity: IdentityExtractor,
    store: Option<SessionStore>,
    settings: LoopSettings,
}

impl LoopController {
    pub fn new(
        generator: Arc<dyn GenerationClient>,
        builder: Arc<dyn Builder>,
        workspaces: WorkspaceManager,
    ) -> Self {
        Self {
            generator,
            builder,
            workspaces,
            identity: IdentityExtractor::new(),
            store: None,
            settings: LoopSettings::default(),
        }
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> Option<&SessionStore> {
        self.store.as_ref()
    }

    /// Drive `session` until it succeeds, exhausts its budget or aborts
    ///
    /// Never returns an error: every failure ends up in the returned
    /// session's status, attempts or abort reason. When `progress` is given
    /// it receives a copy of the session after every change.
    #[instrument(skip_all, fields(session = %session.id))]
    pub async fn run(
        &self,
        mut session: BuildSession,
        cancel: CancellationToken,
        progress: Option<watch::Sender<BuildSession>>,
    ) -> BuildSession {
        let max_attempts = session.max_attempts;
        let program_name = session.specification.program_name();

        if max_attempts == 0 {
            let reason =
                ForgeError::InvalidRequest("max_attempts must be at least 1".to_string()).to_string();
            warn!("Session {} rejected: {}", session.id, reason);
            if let Err(e) = session.abort(reason) {
                error!("Session {} could not be aborted: {}", session.id, e);
            }
            publish(&progress, &session);
            return session;
        }

        info!(
            "Session {} started: {} {:?} ({} attempts)",
            session.id, session.specification.kind, session.specification.name, max_attempts
        );

        if let Some(store) = &self.store {
            fail_open("session_store::open", || store.open_session(&session)).await;
        }
        publish(&progress, &session);

        let mut repair: Option<RepairContext> = None;
        let mut draft: Option<AttemptDraft> = None;

        let (first_event, handle) = if cancel.is_cancelled() {
            (Event::Cancelled, None)
        } else {
            match self.workspaces.prepare(session.id, &program_name).await {
                Ok(handle) => (Event::Start, Some(handle)),
                Err(e) => (
                    Event::EnvironmentFailure {
                        reason: e.to_string(),
                    },
                    None,
                ),
            }
        };

        let mut state = self
            .step(&mut session, State::Pending, first_event, &mut draft, &mut repair, &progress)
            .await;

        if let Some(handle) = &handle {
            while !state.is_terminal() {
                let event = match &state {
                    State::Generating { attempt } => {
                        let mode = if repair.is_some() {
                            GenerationMode::Repair
                        } else {
                            GenerationMode::Generate
                        };
                        let current = draft.insert(AttemptDraft::new(*attempt, mode));
                        self.generate(&session, repair.as_ref(), current, &cancel)
                            .await
                    }
                    State::Building { .. } => match draft.as_mut() {
                        Some(current) => self.build(handle, current, &cancel).await,
                        None => Event::EnvironmentFailure {
                            reason: "build started without generated source".to_string(),
                        },
                    },
                    State::Parsing { .. } => match draft.as_mut() {
                        Some(current) => self.parse(handle, current).await,
                        None => Event::EnvironmentFailure {
                            reason: "parse started without build output".to_string(),
                        },
                    },
                    State::Repairing { .. } => {
                        if cancel.is_cancelled() {
                            Event::Cancelled
                        } else {
                            Event::Retry
                        }
                    }
                    State::Pending
                    | State::Succeeded { .. }
                    | State::Exhausted { .. }
                    | State::Aborted { .. } => break,
                };

                state = self
                    .step(&mut session, state, event, &mut draft, &mut repair, &progress)
                    .await;
            }
        }

        self.finish(&mut session, &state);

        if let Some(handle) = &handle {
            if self.settings.retain_workspaces {
                info!("Retaining workspace {:?}", handle.root());
            } else {
                fail_open("workspace::dispose", || self.workspaces.dispose(handle)).await;
            }
        }

        if let Some(store) = &self.store {
            fail_open("session_store::close", || store.close_session(&session)).await;
        }
        publish(&progress, &session);

        info!(
            "Session {} finished: {} after {} attempt(s)",
            session.id,
            session.status,
            session.attempts.len()
        );
        session
    }

    /// Apply one transition and carry out its actions
    ///
    /// Recording an attempt consumes the draft. Only `failed` attempts
    /// replace the repair context, so a tool error repeats the previous call.
    async fn step(
        &self,
        session: &mut BuildSession,
        state: State,
        event: Event,
        draft: &mut Option<AttemptDraft>,
        repair: &mut Option<RepairContext>,
        progress: &Option<watch::Sender<BuildSession>>,
    ) -> State {
        debug!("{:?} <- {:?}", state, event);
        let (next, actions) = transition(state, event, session.max_attempts);

        for action in actions {
            match action {
                Action::LogActivity { message } => info!("{}", message),
                Action::RecordAttempt { attempt, outcome } => {
                    let recorded = draft
                        .take()
                        .filter(|d| d.sequence == attempt)
                        .unwrap_or_else(|| AttemptDraft::new(attempt, GenerationMode::Generate))
                        .finish(outcome);

                    if let Err(e) = session.record_attempt(recorded.clone()) {
                        error!("Refusing to record attempt {}: {}", attempt, e);
                        continue;
                    }

                    if outcome == AttemptOutcome::Failed {
                        *repair = Some(RepairContext {
                            source: recorded.source.clone(),
                            errors: recorded.errors(),
                        });
                    }

                    if let Some(store) = &self.store {
                        fail_open("session_store::append", || {
                            store.append_attempt(session.id, &recorded)
                        })
                        .await;
                    }
                    publish(progress, session);
                }
            }
        }

        next
    }

    async fn generate(
        &self,
        session: &BuildSession,
        repair: Option<&RepairContext>,
        draft: &mut AttemptDraft,
        cancel: &CancellationToken,
    ) -> Event {
        let spec = &session.specification;
        let timeout = self.settings.generation_timeout;
        let sequence = draft.sequence;

        let call = async {
            match repair {
                Some(context) => {
                    info!(
                        "Attempt {}: repairing with {} error(s)",
                        sequence,
                        context.errors.len()
                    );
                    self.generator
                        .repair(spec, &context.source, &context.errors)
                        .await
                }
                None => {
                    info!("Attempt {}: generating", sequence);
                    self.generator.generate(spec).await
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                draft.tool_error = Some("cancelled during generation".to_string());
                return Event::Cancelled;
            }
            result = tokio::time::timeout(timeout, call) => result,
        };

        let message = match result {
            Ok(Ok(source)) if !source.trim().is_empty() => {
                draft.source = source;
                return Event::SourceGenerated;
            }
            Ok(Ok(_)) => "generation returned no source".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => ForgeError::GenerationTimeout(timeout).to_string(),
        };

        warn!("Attempt {}: {}", draft.sequence, message);
        draft.tool_error = Some(message.clone());
        Event::GenerationFailed { message }
    }

    async fn build(
        &self,
        handle: &WorkspaceHandle,
        draft: &mut AttemptDraft,
        cancel: &CancellationToken,
    ) -> Event {
        let snapshot = match self.workspaces.snapshot(handle).await {
            Ok(snapshot) => snapshot,
            Err(e) => return environment_failure(draft, e),
        };

        if let Err(e) = self.workspaces.write(handle, &draft.source).await {
            return environment_failure(draft, e);
        }

        // Dropping the build future on cancellation kills the toolchain process
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                draft.tool_error = Some("cancelled during build".to_string());
                return Event::Cancelled;
            }
            result = self.builder.build(handle, self.settings.build_timeout) => result,
        };

        match result {
            Ok(output) => {
                debug!(
                    "Attempt {}: toolchain exited with {:?} in {:?}",
                    draft.sequence, output.exit_code, output.duration
                );
                draft.output = Some(output);
                Event::BuildCompleted
            }
            Err(e) if e.is_environment() => environment_failure(draft, e),
            Err(e) => {
                if matches!(e, ForgeError::BuildTimeout(_)) {
                    fail_open("workspace::restore", || self.workspaces.restore(handle, &snapshot))
                        .await;
                }
                warn!("Attempt {}: {}", draft.sequence, e);
                draft.tool_error = Some(e.to_string());
                Event::BuildTimedOut
            }
        }
    }

    async fn parse(&self, handle: &WorkspaceHandle, draft: &mut AttemptDraft) -> Event {
        let Some(output) = &draft.output else {
            return Event::EnvironmentFailure {
                reason: "no build output to parse".to_string(),
            };
        };

        let mut parsed = diagnostics::parse(&output.combined());
        let has_errors = parsed.iter().any(|d| d.is_error());

        if !output.success() && !has_errors {
            parsed.push(Diagnostic::synthetic(unexplained_failure(output, &parsed)));
        }

        let verdict = if output.success() && !has_errors {
            match self.identity.extract(handle) {
                Ok(program_id) => {
                    if let Some(declared) = declared_program_id(&draft.source) {
                        if declared != program_id && declared != PLACEHOLDER_PROGRAM_ID {
                            warn!(
                                "Source declares {} but the build produced {}",
                                declared, program_id
                            );
                        }
                    }
                    self.pin_program_id(handle, draft, &program_id).await;
                    Verdict::Clean { program_id }
                }
                Err(e) => {
                    warn!("Attempt {}: {}", draft.sequence, e);
                    parsed.push(Diagnostic::synthetic(format!(
                        "program identity unavailable: {}",
                        e
                    )));
                    Verdict::Failed
                }
            }
        } else {
            Verdict::Failed
        };

        info!(
            "Attempt {}: {} error(s), {} warning(s)",
            draft.sequence,
            parsed.iter().filter(|d| d.is_error()).count(),
            parsed.iter().filter(|d| !d.is_error()).count()
        );

        draft.diagnostics = parsed;
        Event::Parsed { verdict }
    }

    /// Make the kept source declare the id the build produced
    ///
    /// The recorded source follows the rewrite even if the workspace copy
    /// cannot be updated.
    async fn pin_program_id(
        &self,
        handle: &WorkspaceHandle,
        draft: &mut AttemptDraft,
        program_id: &str,
    ) {
        let pinned = pin_program_id(&draft.source, program_id);
        if pinned == draft.source {
            return;
        }

        debug!("Attempt {}: pinning declare_id! to {}", draft.sequence, program_id);
        fail_open("workspace::pin_program_id", || self.workspaces.write(handle, &pinned)).await;
        draft.source = pinned;
    }

    /// Move the session into the status matching a terminal state
    fn finish(&self, session: &mut BuildSession, state: &State) {
        let result = match state {
            State::Succeeded { program_id, .. } => session.succeed(program_id.clone()),
            State::Exhausted { .. } => session.exhaust(),
            State::Aborted { reason } => session.abort(reason.clone()),
            other => session.abort(format!("loop stopped in non-terminal state {:?}", other)),
        };

        if let Err(e) = result {
            error!("Session {} ended inconsistently: {}", session.id, e);
            if !session.is_terminal() {
                if let Err(e) = session.abort(e.to_string()) {
                    error!("Session {} could not be aborted: {}", session.id, e);
                }
            }
        }
    }
}

fn environment_failure(draft: &mut AttemptDraft, error: ForgeError) -> Event {
    warn!("Attempt {}: {}", draft.sequence, error);
    draft.tool_error = Some(error.to_string());
    Event::EnvironmentFailure {
        reason: error.to_string(),
    }
}

fn publish(progress: &Option<watch::Sender<BuildSession>>, session: &BuildSession) {
    if let Some(tx) = progress {
        tx.send_replace(session.clone());
    }
}

/// Message for a non-zero exit that produced no error diagnostics
fn unexplained_failure(output: &BuildOutput, parsed: &[Diagnostic]) -> String {
    let status = match output.exit_code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    };

    // The parser's catch-all is the trailing location-less warning
    let detail = parsed
        .last()
        .filter(|d| d.severity() == Severity::Warning && d.location().is_none())
        .map(|d| d.message().to_string())
        .unwrap_or_else(|| {
            let combined = output.combined();
            let lines: Vec<&str> = combined.lines().collect();
            lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n")
        });

    if detail.trim().is_empty() {
        format!("build failed with {} and no output", status)
    } else {
        format!("build failed with {} without reporting errors: {}", status, detail)
    }
}
