use std::path::Path;
use std::time::Duration;

use crate::backend::supervisor::SpawnRequest;
use crate::config::AgentCliConfig;
use crate::task::Task;

/// Variable naming the task's result artifact inside the agent process.
pub const RESULT_FILE_VAR: &str = "AGENTWAVE_RESULT_FILE";
/// Variable naming the task id inside the agent process.
pub const TASK_ID_VAR: &str = "AGENTWAVE_TASK_ID";

/// Builds invocations of the Claude CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeClient {
    config: AgentCliConfig,
}

impl ClaudeCodeClient {
    pub fn new(config: AgentCliConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentCliConfig {
        &self.config
    }

    /// Fixed flags: non-interactive print mode, NDJSON output, model and turn limit.
    pub fn args(&self) -> Vec<String> {
        // Claude Code expects bare model IDs, not provider-prefixed ones.
        let model = self
            .config
            .model
            .strip_prefix("anthropic/")
            .unwrap_or(&self.config.model);

        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            model.to_string(),
            "--max-turns".to_string(),
            self.config.max_turns.to_string(),
        ];
        // Note: the CLI refuses this flag when running as root.
        if self.config.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }

    /// The prompt for `task`, telling the agent where to report its result.
    ///
    /// Delivered over stdin; it can be arbitrarily long.
    pub fn prompt(task: &Task, artifact_path: &Path) -> String {
        format!(
            "# Task {id}: {title}\n\n\
             {description}\n\n\
             ## Reporting\n\n\
             When you are done, write a JSON result file to `{path}` \
             (also available as ${var}). Write it only for this task and do not \
             touch result files of other tasks. Schema:\n\n\
             ```json\n\
             {{\n  \
               \"taskId\": \"{id}\",\n  \
               \"pass\": true,\n  \
               \"total\": 0, \"passed\": 0, \"failed\": 0, \"skipped\": 0,\n  \
               \"summary\": \"one paragraph\",\n  \
               \"errorOutput\": null,\n  \
               \"coverage\": null,\n  \
               \"coverageBreakdown\": {{\"lines\": null, \"statements\": null, \"functions\": null, \"branches\": null}},\n  \
               \"duration\": 0,\n  \
               \"individualTests\": [{{\"name\": \"\", \"status\": \"passed\", \"duration\": 0, \"file\": null, \"error\": null}}],\n  \
               \"failedTestDetails\": [{{\"name\": \"\", \"file\": null, \"error\": \"\", \"stackTrace\": null}}]\n\
             }}\n\
             ```\n",
            id = task.id(),
            title = task.title(),
            description = task.description(),
            path = artifact_path.display(),
            var = RESULT_FILE_VAR,
        )
    }

    /// Full spawn request for one task.
    pub fn request(
        &self,
        task: &Task,
        artifact_path: &Path,
        working_dir: &Path,
        timeout: Duration,
    ) -> SpawnRequest {
        SpawnRequest::new(&self.config.cli_path, working_dir, timeout)
            .with_args(self.args())
            .with_stdin(Self::prompt(task, artifact_path))
            .with_var(RESULT_FILE_VAR, artifact_path.display().to_string())
            .with_var(TASK_ID_VAR, task.id().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    fn task() -> Task {
        Task::new(TaskId::new("auth-tests"), "Auth tests", "Write tests for the login flow").unwrap()
    }

    #[test]
    fn args_select_print_mode_and_stream_json() {
        let client = ClaudeCodeClient::new(AgentCliConfig {
            model: "anthropic/claude-sonnet-4".to_string(),
            max_turns: 12,
            ..AgentCliConfig::default()
        });
        assert_eq!(
            client.args(),
            vec![
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--model",
                "claude-sonnet-4",
                "--max-turns",
                "12",
            ]
        );
    }

    #[test]
    fn skip_permissions_is_opt_in() {
        let client = ClaudeCodeClient::new(AgentCliConfig {
            skip_permissions: true,
            ..AgentCliConfig::default()
        });
        assert_eq!(
            client.args().last().map(String::as_str),
            Some("--dangerously-skip-permissions")
        );
    }

    #[test]
    fn prompt_travels_over_stdin_with_the_artifact_path() {
        let client = ClaudeCodeClient::new(AgentCliConfig::default());
        let artifact = Path::new("/work/.agentwave/results/auth-tests.json");
        let request = client.request(&task(), artifact, Path::new("/work"), Duration::from_secs(60));

        let prompt = request.stdin_payload.as_deref().unwrap();
        assert!(prompt.contains("Write tests for the login flow"));
        assert!(prompt.contains("/work/.agentwave/results/auth-tests.json"));
        assert!(prompt.contains("\"taskId\": \"auth-tests\""));
        assert!(!request.args.iter().any(|a| a.contains("login flow")));
        assert_eq!(request.command, "claude");
        assert_eq!(
            request.vars.get(RESULT_FILE_VAR).map(String::as_str),
            Some("/work/.agentwave/results/auth-tests.json")
        );
        assert_eq!(request.vars.get(TASK_ID_VAR).map(String::as_str), Some("auth-tests"));
    }
}
