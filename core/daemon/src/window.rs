//! Window context: which window has focus (and what project it shows), and which windows
//! still exist. Every failure here means "no information", never an error for the caller.

use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::WindowCommandConfig;

const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 1500;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowContext {
    pub window_id: Option<i64>,
    pub project: Option<String>,
}

#[async_trait]
pub trait WindowResolver: Send + Sync {
    async fn focused(&self) -> WindowContext;

    /// `None` when the window list cannot be obtained; callers must not treat that as
    /// "no windows exist".
    async fn live_window_ids(&self) -> Option<HashSet<i64>>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopWindowResolver;

#[async_trait]
impl WindowResolver for NoopWindowResolver {
    async fn focused(&self) -> WindowContext {
        WindowContext::default()
    }

    async fn live_window_ids(&self) -> Option<HashSet<i64>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct CommandWindowResolver {
    focused_command: Vec<String>,
    list_command: Vec<String>,
    timeout: Duration,
}

impl CommandWindowResolver {
    pub fn new(config: &WindowCommandConfig) -> Self {
        Self {
            focused_command: config.focused_command.clone(),
            list_command: config.list_command.clone(),
            timeout: Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS)),
        }
    }
}

#[async_trait]
impl WindowResolver for CommandWindowResolver {
    async fn focused(&self) -> WindowContext {
        if self.focused_command.is_empty() {
            return WindowContext::default();
        }
        match run_command(&self.focused_command, self.timeout).await {
            Ok(output) => parse_focused_output(&output),
            Err(err) => {
                debug!(error = %err, "Focused window lookup failed");
                WindowContext::default()
            }
        }
    }

    async fn live_window_ids(&self) -> Option<HashSet<i64>> {
        if self.list_command.is_empty() {
            return None;
        }
        match run_command(&self.list_command, self.timeout).await {
            Ok(output) => Some(parse_window_ids(&output)),
            Err(err) => {
                debug!(error = %err, "Window list lookup failed");
                None
            }
        }
    }
}

/// Picks the command-backed resolver when any command is configured.
pub fn resolver_from_config(config: &WindowCommandConfig) -> Arc<dyn WindowResolver> {
    if config.focused_command.is_empty() && config.list_command.is_empty() {
        Arc::new(NoopWindowResolver)
    } else {
        Arc::new(CommandWindowResolver::new(config))
    }
}

async fn run_command(argv: &[String], timeout: Duration) -> Result<String, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "Empty command".to_string())?;
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| format!("{} timed out after {:?}", program, timeout))?
        .map_err(|err| format!("Failed to run {}: {}", program, err))?;

    if !output.status.success() {
        return Err(format!("{} exited with {}", program, output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First line, `window_id<TAB>project`. Either half may be empty.
pub fn parse_focused_output(output: &str) -> WindowContext {
    let Some(line) = output.lines().find(|line| !line.trim().is_empty()) else {
        return WindowContext::default();
    };
    let mut parts = line.splitn(2, '\t');
    let window_id = parts.next().and_then(|value| value.trim().parse::<i64>().ok());
    let project = parts
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    WindowContext { window_id, project }
}

pub fn parse_window_ids(output: &str) -> HashSet<i64> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<i64>().ok())
        .collect()
}
