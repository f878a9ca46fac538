//! Collaborator interfaces consumed by the engine.
//!
//! The engine calls these, never introspects them: a status display, a
//! yes/no confirmation prompt, and a credentials source. Defaults log
//! through `tracing` so the engine runs headless.

use anyhow::{Context, Result};

/// Receives progress text and throttle countdowns.
pub trait StatusSink: Send + Sync {
    /// A headline plus one line of detail.
    fn status(&self, headline: &str, detail: &str);

    /// A throttle wait is in progress with this many seconds remaining.
    fn waiting(&self, seconds_remaining: u64);
}

/// Asks the user to confirm a destructive action.
pub trait ConfirmSink: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Supplies API credentials.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> Result<ApiCredentials>;
}

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub id: String,
    pub secret: String,
}

/// Default sink that writes through `tracing`.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn status(&self, headline: &str, detail: &str) {
        tracing::info!("[SEARCH] {} — {}", headline, detail);
    }

    fn waiting(&self, seconds_remaining: u64) {
        tracing::info!("[RATE] waiting, {}s remaining", seconds_remaining);
    }
}

/// Confirmation sink that approves everything; the CLI installs an
/// interactive one.
pub struct AlwaysConfirm;

impl ConfirmSink for AlwaysConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Reads credentials from `LOGSLEUTH_CLIENT_ID` / `LOGSLEUTH_CLIENT_SECRET`.
pub struct EnvCredentials;

impl CredentialsProvider for EnvCredentials {
    fn credentials(&self) -> Result<ApiCredentials> {
        let id = std::env::var("LOGSLEUTH_CLIENT_ID").context("LOGSLEUTH_CLIENT_ID not set")?;
        let secret =
            std::env::var("LOGSLEUTH_CLIENT_SECRET").context("LOGSLEUTH_CLIENT_SECRET not set")?;
        Ok(ApiCredentials { id, secret })
    }
}
