//! Pure state machine for the build loop
//!
//! No I/O happens here. The loop controller feeds events in, executes the
//! returned actions, and acts on the new state.
//!
//! - Pure function: `transition(state, event, max_attempts) -> (state, actions)`
//! - Invalid transitions go to `Aborted` (never panic)
//! - Terminal states absorb every event unchanged

use scforge_core::AttemptOutcome;

/// Build loop state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Workspace not yet prepared
    Pending,
    /// Waiting on the generation collaborator for attempt `attempt`
    Generating { attempt: u32 },
    /// Toolchain running on the attempt's source
    Building { attempt: u32 },
    /// Interpreting toolchain output
    Parsing { attempt: u32 },
    /// Attempt `attempt` is recorded and budget remains
    Repairing { attempt: u32 },
    Succeeded { attempt: u32, program_id: String },
    Exhausted { attempts: u32 },
    Aborted { reason: String },
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Succeeded { .. } | State::Exhausted { .. } | State::Aborted { .. }
        )
    }
}

/// Result of interpreting one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No errors and the program identity was extracted
    Clean { program_id: String },
    /// At least one error-severity diagnostic
    Failed,
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    SourceGenerated,
    GenerationFailed { message: String },
    BuildCompleted,
    /// Timeout or any other non-environment toolchain failure
    BuildTimedOut,
    Parsed { verdict: Verdict },
    Retry,
    /// Missing toolchain or unusable workspace
    EnvironmentFailure { reason: String },
    Cancelled,
}

/// Side effects for the controller to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RecordAttempt { attempt: u32, outcome: AttemptOutcome },
    LogActivity { message: String },
}

fn log(message: impl Into<String>) -> Action {
    Action::LogActivity {
        message: message.into(),
    }
}

/// Where to go after attempt `attempt` ends without success
fn after_unsuccessful(attempt: u32, max_attempts: u32) -> State {
    if attempt >= max_attempts {
        State::Exhausted { attempts: attempt }
    } else {
        State::Repairing { attempt }
    }
}

fn abort_reason(event: Event) -> String {
    match event {
        Event::EnvironmentFailure { reason } => reason,
        _ => "cancelled".to_string(),
    }
}

/// Pure state transition function
///
/// Takes the current state, an event and the session's attempt budget, and
/// returns the new state plus actions to execute. Deterministic, no side
/// effects, never panics.
pub fn transition(state: State, event: Event, max_attempts: u32) -> (State, Vec<Action>) {
    match (state, event) {
        // Terminal states absorb everything
        (state, _) if state.is_terminal() => (state, vec![]),

        (State::Pending, Event::Start) => (
            State::Generating { attempt: 1 },
            vec![log(format!("Starting attempt 1 of {}", max_attempts))],
        ),

        (State::Generating { attempt }, Event::SourceGenerated) => (
            State::Building { attempt },
            vec![log(format!("Attempt {}: source generated, building", attempt))],
        ),

        (State::Generating { attempt }, Event::GenerationFailed { message }) => (
            after_unsuccessful(attempt, max_attempts),
            vec![
                log(format!("Attempt {}: generation failed: {}", attempt, message)),
                Action::RecordAttempt {
                    attempt,
                    outcome: AttemptOutcome::ToolError,
                },
            ],
        ),

        (State::Building { attempt }, Event::BuildCompleted) => (State::Parsing { attempt }, vec![]),

        (State::Building { attempt }, Event::BuildTimedOut) => (
            after_unsuccessful(attempt, max_attempts),
            vec![
                log(format!("Attempt {}: build did not complete", attempt)),
                Action::RecordAttempt {
                    attempt,
                    outcome: AttemptOutcome::ToolError,
                },
            ],
        ),

        (
            State::Parsing { attempt },
            Event::Parsed {
                verdict: Verdict::Clean { program_id },
            },
        ) => (
            State::Succeeded {
                attempt,
                program_id: program_id.clone(),
            },
            vec![
                Action::RecordAttempt {
                    attempt,
                    outcome: AttemptOutcome::Succeeded,
                },
                log(format!("Attempt {}: built program {}", attempt, program_id)),
            ],
        ),

        (
            State::Parsing { attempt },
            Event::Parsed {
                verdict: Verdict::Failed,
            },
        ) => (
            after_unsuccessful(attempt, max_attempts),
            vec![
                Action::RecordAttempt {
                    attempt,
                    outcome: AttemptOutcome::Failed,
                },
                log(format!("Attempt {}: compile errors", attempt)),
            ],
        ),

        (State::Repairing { attempt }, Event::Retry) => (
            State::Generating {
                attempt: attempt + 1,
            },
            vec![log(format!(
                "Starting attempt {} of {}",
                attempt + 1,
                max_attempts
            ))],
        ),

        // Nothing in flight, nothing to record
        (
            State::Pending | State::Repairing { .. },
            event @ (Event::EnvironmentFailure { .. } | Event::Cancelled),
        ) => {
            let reason = abort_reason(event);
            (
                State::Aborted {
                    reason: reason.clone(),
                },
                vec![log(format!("Aborted: {}", reason))],
            )
        }

        // The in-flight attempt is recorded as a tool error before aborting
        (
            State::Generating { attempt } | State::Building { attempt } | State::Parsing { attempt },
            event @ (Event::EnvironmentFailure { .. } | Event::Cancelled),
        ) => {
            let reason = abort_reason(event);
            (
                State::Aborted {
                    reason: reason.clone(),
                },
                vec![
                    Action::RecordAttempt {
                        attempt,
                        outcome: AttemptOutcome::ToolError,
                    },
                    log(format!("Attempt {}: aborted: {}", attempt, reason)),
                ],
            )
        }

        (state, event) => {
            let reason = format!(
                "invalid transition: {:?} cannot handle event {:?}",
                state, event
            );
            (
                State::Aborted {
                    reason: reason.clone(),
                },
                vec![log(reason)],
            )
        }
    }
}
