pub mod client;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::backend::events::AgentMessage;
use crate::backend::supervisor::ProcessSupervisor;
use crate::config::Config;
use crate::orchestrator::resolver::ResultResolver;
use crate::orchestrator::scheduler::{RunContext, TaskRunner};
use crate::orchestrator::session::OrchestrationSession;
use crate::task::{Task, TaskResult};
use crate::util::truncate_chars;

pub use client::ClaudeCodeClient;

/// Runs each task as one Claude CLI process and resolves its result.
pub struct ClaudeCodeRunner {
    client: ClaudeCodeClient,
    supervisor: ProcessSupervisor,
    resolver: ResultResolver,
    session: OrchestrationSession,
    timeout: Duration,
}

impl ClaudeCodeRunner {
    pub fn new(config: &Config, session: OrchestrationSession) -> Self {
        Self {
            client: ClaudeCodeClient::new(config.agent.clone()),
            supervisor: ProcessSupervisor::new(config),
            resolver: ResultResolver::from_config(config),
            session,
            timeout: config.timeout,
        }
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn into_shared(self) -> Arc<dyn TaskRunner> {
        Arc::new(self)
    }

    pub fn session(&self) -> &OrchestrationSession {
        &self.session
    }
}

#[async_trait]
impl TaskRunner for ClaudeCodeRunner {
    async fn run(&self, task: &Task, ctx: &RunContext) -> Result<TaskResult> {
        let artifact = self
            .resolver
            .prepare(task.id())
            .await
            .with_context(|| format!("Failed to prepare result artifact for task {}", task.id()))?;

        let request = self
            .client
            .request(task, &artifact, self.resolver.working_dir(), self.timeout);
        let mut handle = self.supervisor.spawn(request, self.session.decoder());
        let process_cancel = handle.cancellation_token();
        info!(
            task_id = %task.id(),
            slot = ctx.slot,
            wave = ctx.wave,
            pid = ?handle.pid(),
            "Agent started"
        );

        let mut cancel_sent = false;
        loop {
            tokio::select! {
                message = handle.next() => match message {
                    Some(message) => log_message(task, ctx, &message),
                    None => break,
                },
                _ = ctx.cancel.cancelled(), if !cancel_sent => {
                    warn!(task_id = %task.id(), slot = ctx.slot, "Batch cancelled; stopping agent");
                    cancel_sent = true;
                    process_cancel.cancel();
                }
            }
        }

        let output = handle.wait().await;
        let result = self.resolver.resolve(task, &output).await;
        info!(
            task_id = %task.id(),
            slot = ctx.slot,
            pass = result.pass,
            source = ?result.source,
            exit_code = ?output.exit_code,
            duration_ms = result.duration_ms,
            "Agent finished"
        );
        Ok(result)
    }
}

fn log_message(task: &Task, ctx: &RunContext, message: &AgentMessage) {
    match message {
        AgentMessage::System { content } => {
            info!(task_id = %task.id(), slot = ctx.slot, "{}", content);
        }
        AgentMessage::ToolUse { name, .. } => {
            debug!(task_id = %task.id(), slot = ctx.slot, tool = %name, "Tool call");
        }
        AgentMessage::ToolResult { is_error: true, content, .. } => {
            debug!(task_id = %task.id(), slot = ctx.slot, "Tool error: {}", truncate_chars(content, 200));
        }
        AgentMessage::Error { message } => {
            warn!(task_id = %task.id(), slot = ctx.slot, "Agent error: {}", message);
        }
        other => {
            debug!(
                task_id = %task.id(),
                slot = ctx.slot,
                kind = other.kind(),
                "{}",
                truncate_chars(&other.content(), 200)
            );
        }
    }
}
