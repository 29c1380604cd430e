//! Stateful OpenID Connect session engine
//!
//! Drives the protocol pieces of `oidc-auth` for one or more client
//! configurations: the login state machine, single-flight silent renewal, OP
//! session monitoring and the periodic expiry check. Each configuration's
//! state is isolated and persisted under its `config_id`.
//!
//! Session lifecycle:
//! 1. `Orchestrator::authorize()` → URL, phase `AuthorizationRequested`
//! 2. OP redirects back → `Orchestrator::check_auth(Some(url))` → `Validating`
//! 3. Pipeline passes → tokens committed, `Authenticated`; fails → `Error`
//! 4. `Session::start_background()` → expiry check (+ session monitor)
//! 5. Tokens near expiry → `RenewCoordinator::trigger_renewal()` → `Validating` again
//! 6. `Session::logoff()` → end-session URL, `Idle`

pub mod check_session;
pub mod error;
pub mod orchestrator;
pub mod refresh;
pub mod registry;
pub mod renew;
pub mod state;

pub use check_session::{FrameMessage, SessionCheckMonitor, SessionFrame};
pub use error::{Error, Result};
pub use orchestrator::{AuthOutcome, Orchestrator, TokenExpiry};
pub use refresh::spawn_token_check_task;
pub use registry::{Registry, Session};
pub use renew::{RenewCoordinator, SilentRenewFrame};
pub use state::{FlowAction, FlowEvent, FlowPhase, OidcEvent, SessionChangeReason, next_phase};
