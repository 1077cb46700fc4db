use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = Uuid;

/// Lifecycle of a task, see `state.rs` for the legal moves between states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    Pending,
    Scheduled,
    Running,
    Finished,
    FailedOnStartup,
    FailedAfterStartup,
    RestartingImmediately,
    RestartingWithBackOff,
}

impl State {
    pub fn is_failure(&self) -> bool {
        matches!(self, State::FailedOnStartup | State::FailedAfterStartup)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Scheduled => "scheduled",
            State::Running => "running",
            State::Finished => "finished",
            State::FailedOnStartup => "failed_on_startup",
            State::FailedAfterStartup => "failed_after_startup",
            State::RestartingImmediately => "restarting_immediately",
            State::RestartingWithBackOff => "restarting_with_back_off",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    OnFailure,
    #[default]
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl Image {
    /// Parses `[registry/]repository[:tag]`, defaulting to Docker Hub and `latest`.
    pub fn parse(raw: &str) -> Self {
        let (path, tag) = match raw.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path, tag),
            _ => (raw, "latest"),
        };

        let (registry, repository) = match path.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') => (host, rest),
            _ => ("docker.io", path),
        };

        Image {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }

    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequiredResources {
    /// CPU cores, fractional values allowed.
    pub cpu: f64,
    /// Memory in bytes.
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: Image,
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub required: RequiredResources,
}

impl ContainerSpec {
    pub fn new(image: Image) -> Self {
        ContainerSpec {
            image,
            exposed_ports: Vec::new(),
            env: Vec::new(),
            labels: HashMap::new(),
            restart_policy: RestartPolicy::default(),
            required: RequiredResources::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub state: State,
    pub container: ContainerSpec,
    /// Runtime handle assigned by the worker that started the container.
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub restarts: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, container: ContainerSpec) -> Self {
        Task {
            id: Uuid::new_v4(),
            name: name.into(),
            state: State::Pending,
            container,
            container_id: None,
            restarts: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Desired state carried by an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Finished,
    RestartingImmediately,
    RestartingWithBackOff,
}

impl From<DesiredState> for State {
    fn from(desired: DesiredState) -> Self {
        match desired {
            DesiredState::Running => State::Running,
            DesiredState::Finished => State::Finished,
            DesiredState::RestartingImmediately => State::RestartingImmediately,
            DesiredState::RestartingWithBackOff => State::RestartingWithBackOff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub task: Task,
    pub desired: DesiredState,
    pub requested_at: DateTime<Utc>,
    /// Placement attempts already spent on this event.
    #[serde(default)]
    pub attempts: u32,
}

impl Event {
    pub fn new(task: Task, desired: DesiredState) -> Self {
        Event {
            id: Uuid::new_v4(),
            task,
            desired,
            requested_at: Utc::now(),
            attempts: 0,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("transition from {from} to {to} is not allowed")]
    StateTransitionNotAllowed { from: State, to: State },
}

pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_predicate_covers_both_failure_states() {
        assert!(State::FailedOnStartup.is_failure());
        assert!(State::FailedAfterStartup.is_failure());
        assert!(!State::Finished.is_failure());
        assert!(!State::Running.is_failure());
    }

    #[test]
    fn image_parse_defaults_registry_and_tag() {
        let image = Image::parse("nginx");
        assert_eq!(image.reference(), "docker.io/nginx:latest");

        let image = Image::parse("library/nginx:alpine");
        assert_eq!(image.registry, "docker.io");
        assert_eq!(image.repository, "library/nginx");
        assert_eq!(image.tag, "alpine");

        let image = Image::parse("ghcr.io/acme/api:1.2");
        assert_eq!(image.reference(), "ghcr.io/acme/api:1.2");

        let image = Image::parse("localhost:5000/app");
        assert_eq!(image.registry, "localhost:5000");
        assert_eq!(image.tag, "latest");
    }

    #[test]
    fn task_serializes_with_snake_case_state() {
        let mut task = Task::new("web", ContainerSpec::new(Image::parse("nginx")));
        task.state = State::FailedOnStartup;
        task.container.restart_policy = RestartPolicy::OnFailure;

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["state"], "failed_on_startup");
        assert_eq!(json["container"]["restart_policy"], "on-failure");
    }
}
