//! Loading task lists from JSON or YAML files.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::{Task, TaskError, TaskId};

/// One entry of a task file.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub description: String,
}

/// A task file is either a bare list or an object with a `tasks` list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<TaskSpec>),
    Wrapped { tasks: Vec<TaskSpec> },
}

impl TaskFile {
    fn into_specs(self) -> Vec<TaskSpec> {
        match self {
            TaskFile::List(specs) => specs,
            TaskFile::Wrapped { tasks } => tasks,
        }
    }
}

/// Read tasks from `path`; `.yaml`/`.yml` files are parsed as YAML, everything else as JSON.
pub async fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read task file {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let file: TaskFile = if is_yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML task file {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON task file {}", path.display()))?
    };

    build_tasks(file.into_specs())
}

/// Turn specs into pending tasks, generating missing ids.
///
/// Ids must be unique; each one names its task's artifact file.
pub fn build_tasks(specs: Vec<TaskSpec>) -> Result<Vec<Task>> {
    if specs.is_empty() {
        bail!("Task file contains no tasks");
    }

    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(specs.len());
    for spec in specs {
        let id = spec
            .id
            .filter(|id| !id.trim().is_empty())
            .map(TaskId::new)
            .unwrap_or_else(TaskId::generate);
        if !seen.insert(id.clone()) {
            return Err(TaskError::DuplicateId(id.to_string()).into());
        }
        let title = spec.title.unwrap_or_else(|| id.to_string());
        tasks.push(Task::new(id, title, spec.description)?);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_json_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id": "a", "title": "First", "description": "run unit tests"},
                {"description": "run lint"}]"#,
        )
        .unwrap();

        let tasks = load_tasks(&path).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id().as_str(), "a");
        assert_eq!(tasks[0].title(), "First");
        assert!(!tasks[1].id().as_str().is_empty());
        assert_eq!(tasks[1].title(), tasks[1].id().as_str());
    }

    #[tokio::test]
    async fn loads_wrapped_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("batch.yaml");
        std::fs::write(
            &path,
            "tasks:\n  - id: api\n    description: test the api\n  - id: ui\n    description: test the ui\n",
        )
        .unwrap();

        let tasks = load_tasks(&path).await.unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.id().as_str()).collect();
        assert_eq!(ids, vec!["api", "ui"]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let spec = |id: &str, description: &str| TaskSpec {
            id: Some(id.to_string()),
            title: None,
            description: description.to_string(),
        };
        let err = build_tasks(vec![spec("a/b", "x"), spec("a/b", "y")]).unwrap_err();
        assert!(err.to_string().contains("Duplicate task id"));

        // Ids that only differ in unsafe characters still get separate artifacts.
        let tasks = build_tasks(vec![spec("a/b", "x"), spec("a_b", "y")]).unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn rejects_empty_file() {
        assert!(build_tasks(Vec::new()).is_err());
    }
}
