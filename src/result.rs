use serde::{Deserialize, Serialize};

use crate::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobState {
    #[serde(rename = "SUCCESS")]
    Success,
    #[default]
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "KILLED")]
    Killed,
    #[serde(rename = "UNKNOWN_CMD")]
    UnknownCmd,
    #[serde(rename = "DUPLICATE_ID")]
    DuplicateId,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Success => write!(f, "SUCCESS"),
            JobState::Error => write!(f, "ERROR"),
            JobState::Timeout => write!(f, "TIMEOUT"),
            JobState::Killed => write!(f, "KILLED"),
            JobState::UnknownCmd => write!(f, "UNKNOWN_CMD"),
            JobState::DuplicateId => write!(f, "DUPLICATE_ID"),
        }
    }
}

/// Captured stdout and stderr, serialized as a two element array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streams(pub String, pub String);

impl Streams {
    pub fn stdout(&self) -> &str {
        &self.0
    }

    pub fn stderr(&self) -> &str {
        &self.1
    }
}

/// Outcome of one job attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub command: String,
    pub data: String,
    pub streams: Streams,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub critical: String,
    pub level: u16,
    pub state: JobState,
    pub code: u32,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "starttime")]
    pub start_time: i64,
    /// Run time in milliseconds.
    pub time: i64,
    pub tags: Vec<String>,
    pub container: u64,
}

impl JobResult {
    pub fn new(cmd: &Command) -> Self {
        Self {
            id: cmd.id.clone(),
            command: cmd.command.clone(),
            tags: cmd.tags.clone(),
            ..Default::default()
        }
    }

    pub fn with_state(cmd: &Command, state: JobState) -> Self {
        Self {
            state,
            ..Self::new(cmd)
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == JobState::Success
    }
}
