//! Common types shared by the OIDC engine crates and the agent binary

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
