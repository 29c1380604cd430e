//! Flow state machine
//!
//! Pure state machine: receives events, returns (new_phase, action).
//! The orchestrator executes the storage I/O implied by each action, so the
//! rule "tokens are only committed after a successful validation" lives in
//! one match arm.

use oidc_auth::{FlowKind, ValidationResult};
use serde_json::Value;

/// Authentication phase of one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowPhase {
    /// No session and no login in progress
    Idle,
    /// Authorization URL handed out, waiting for the OP redirect
    AuthorizationRequested,
    /// Callback or renewal response being exchanged and validated;
    /// `was_authenticated` records whether a session existed when it started
    Validating {
        kind: FlowKind,
        renew: bool,
        was_authenticated: bool,
    },
    /// Validated tokens are committed
    Authenticated,
    /// Last attempt failed with this result
    Error(ValidationResult),
}

impl FlowPhase {
    /// Phase label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            FlowPhase::Idle => "idle",
            FlowPhase::AuthorizationRequested => "authorization_requested",
            FlowPhase::Validating { .. } => "validating",
            FlowPhase::Authenticated => "authenticated",
            FlowPhase::Error(_) => "error",
        }
    }
}

/// Events that drive phase transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// `authorize()` persisted fresh state and built the URL
    AuthorizeRequested,
    /// A callback or renewal response is about to be validated
    ValidationStarted { kind: FlowKind, renew: bool },
    /// Validation pipeline returned `Ok`
    ValidationSucceeded,
    /// Validation failed, or the OP answered with an error
    ValidationFailed(ValidationResult),
    /// The attempt could not complete; `transient` for connectivity failures
    Aborted { transient: bool },
    /// Valid tokens were found in storage at startup
    SessionRestored,
    /// Local logoff
    LoggedOff,
}

/// Storage work the caller performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    /// Persist the validated token set
    CommitTokens,
    /// Drop tokens and session data, keep nothing of the failed attempt
    ResetAuthorizationData,
    /// Drop all stored flow state for the configuration
    ResetFlowState,
    /// No-op
    None,
}

/// Handle a phase transition. Pure function: no I/O.
pub fn next_phase(phase: FlowPhase, event: FlowEvent) -> (FlowPhase, FlowAction) {
    match (phase, event) {
        // --- Login ---
        (FlowPhase::Validating { .. }, FlowEvent::AuthorizeRequested) => {
            // a response is in flight; a second login waits for its verdict
            (FlowPhase::AuthorizationRequested, FlowAction::None)
        }
        (_, FlowEvent::AuthorizeRequested) => (FlowPhase::AuthorizationRequested, FlowAction::None),

        // --- Validating ---
        (phase, FlowEvent::ValidationStarted { kind, renew }) => {
            let was_authenticated = match phase {
                FlowPhase::Authenticated => true,
                FlowPhase::Validating {
                    was_authenticated, ..
                } => was_authenticated,
                _ => false,
            };
            (
                FlowPhase::Validating {
                    kind,
                    renew,
                    was_authenticated,
                },
                FlowAction::None,
            )
        }

        (FlowPhase::Validating { .. }, FlowEvent::ValidationSucceeded) => {
            (FlowPhase::Authenticated, FlowAction::CommitTokens)
        }

        (FlowPhase::Validating { .. }, FlowEvent::ValidationFailed(result)) => {
            (FlowPhase::Error(result), FlowAction::ResetAuthorizationData)
        }

        // A flaky renewal must not log the user out.
        (
            FlowPhase::Validating {
                renew: true,
                was_authenticated: true,
                ..
            },
            FlowEvent::Aborted { transient: true },
        ) => {
            (FlowPhase::Authenticated, FlowAction::None)
        }

        (FlowPhase::Validating { .. }, FlowEvent::Aborted { .. }) => {
            (FlowPhase::Error(ValidationResult::NotSet), FlowAction::None)
        }

        // --- Restore ---
        (FlowPhase::Idle | FlowPhase::Error(_) | FlowPhase::Authenticated, FlowEvent::SessionRestored) => {
            (FlowPhase::Authenticated, FlowAction::None)
        }

        // --- Any phase + logoff = idle ---
        (_, FlowEvent::LoggedOff) => (FlowPhase::Idle, FlowAction::ResetFlowState),

        // --- Invalid/unhandled transition: stay in current phase ---
        (phase, _event) => (phase, FlowAction::None),
    }
}

/// Why the session monitor reported a session change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChangeReason {
    /// The OP answered `changed`
    Changed,
    /// Too many heartbeats went unanswered
    Unreachable,
}

impl SessionChangeReason {
    pub fn label(&self) -> &'static str {
        match self {
            SessionChangeReason::Changed => "changed",
            SessionChangeReason::Unreachable => "unreachable",
        }
    }
}

/// Notifications published on a session's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OidcEvent {
    CheckingAuth,
    CheckingAuthFinished,
    CheckingAuthFinishedWithError(String),
    NewAuthenticationResult {
        is_authenticated: bool,
        validation_result: ValidationResult,
        is_renew_process: bool,
    },
    TokenExpired,
    IdTokenExpired,
    SilentRenewStarted,
    SilentRenewFailed(String),
    CheckSessionReceived(String),
    SessionChanged(SessionChangeReason),
    UserDataChanged(Option<Value>),
}
