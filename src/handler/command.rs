//! Handlers backed by external executables.
//!
//! The generation step (prompting a model, parsing its answer, saving the
//! result) lives outside the queue. A command handler runs it as a child
//! process: payload JSON on stdin, success signalled by exit status 0.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tracing::debug;

use super::{HandlerRegistry, HandlerRegistryBuilder, TaskHandler};
use crate::error::{Error, Result};
use crate::model::TaskKind;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct HandlerFile {
    handler: HandlerConfig,
}

/// One `[handler]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    pub kind: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandHandler {
    kind: TaskKind,
    command: PathBuf,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(kind: TaskKind, command: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn from_config(config: HandlerConfig) -> Result<Self> {
        let kind = config.kind.parse().map_err(|_| {
            Error::Config(format!("handler config names unknown kind {:?}", config.kind))
        })?;
        Ok(Self::new(kind, config.command).args(config.args))
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        // Resolve relative paths against the process CWD, not the child's.
        let command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };

        debug!(kind = %self.kind, command = %command.display(), "running handler command");

        let mut child = Command::new(&command)
            .args(&self.args)
            .env("GENQ_TASK_KIND", self.kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", command.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&payload)?;
            match stdin.write_all(&body).await {
                // The child may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                other => other.context("failed to write payload to handler stdin")?,
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let code = output.status.code().unwrap_or(-1);
        if stderr.is_empty() {
            anyhow::bail!("{} exited with status {code}", command.display())
        } else {
            anyhow::bail!("{} exited with status {code}: {stderr}", command.display())
        }
    }
}

/// Load every `.toml` handler file in a directory into a registry builder.
///
/// Returns the builder so in-process handlers can be added before
/// [`HandlerRegistryBuilder::build`] checks that every kind is covered.
pub fn load_from_dir(dir: &Path) -> Result<HandlerRegistryBuilder> {
    let mut builder = HandlerRegistry::builder();

    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Config(format!("cannot read handler dir {}: {e}", dir.display()))
    })?;

    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            let content = std::fs::read_to_string(&path)?;
            let file: HandlerFile = toml::from_str(&content).map_err(|e| {
                Error::Config(format!("bad handler config {}: {e}", path.display()))
            })?;
            let handler = CommandHandler::from_config(file.handler)?;
            builder.insert(handler.kind, Arc::new(handler))?;
        }
    }

    Ok(builder)
}
