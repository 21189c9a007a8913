//! Completion notifications. Delivery is best effort; the tracker never waits on it.

use async_trait::async_trait;
use pulse_protocol::Session;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::config::NotifyCommandConfig;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_completion(&self, session: &Session) -> Result<(), String>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_completion(&self, _session: &Session) -> Result<(), String> {
        Ok(())
    }
}

/// Runs a user-supplied command with the session described in the environment.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: Vec<String>,
}

impl CommandNotifier {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify_completion(&self, session: &Session) -> Result<(), String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| "Notify command is empty".to_string())?;

        let status = Command::new(program)
            .args(args)
            .env("PULSE_SESSION_ID", &session.session_id)
            .env("PULSE_TOOL", session.tool.as_str())
            .env("PULSE_PROJECT", session.project.as_deref().unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        let status = tokio::time::timeout(NOTIFY_TIMEOUT, status)
            .await
            .map_err(|_| format!("{} timed out", program))?
            .map_err(|err| format!("Failed to run {}: {}", program, err))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {}", program, status))
        }
    }
}

pub fn notifier_from_config(enabled: bool, config: &NotifyCommandConfig) -> Arc<dyn Notifier> {
    if enabled && !config.command.is_empty() {
        Arc::new(CommandNotifier::new(config.command.clone()))
    } else {
        Arc::new(NoopNotifier)
    }
}
