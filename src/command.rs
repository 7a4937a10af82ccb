use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PmError, Result};

/// Name of the always-available system process command.
pub const CORE_SYSTEM: &str = "core.system";

/// Behavior switches that only in-process callers may set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    /// Respawn the job whenever it exits, whatever the outcome.
    pub protected: bool,
    /// Discard stdout and stderr of the child.
    pub no_output: bool,
    /// Keep the child in the supervisor's process group.
    pub no_setpgid: bool,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Description of one unit of work submitted to the manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    /// Job id; generated when empty.
    pub id: String,
    /// Selects the process factory.
    pub command: String,
    /// Opaque payload interpreted by the process.
    pub arguments: serde_json::Value,
    /// Commands sharing a queue name run strictly one after another.
    pub queue: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub stats_interval: u64,
    /// Seconds before the job is killed, 0 for no limit.
    #[serde(skip_serializing_if = "is_zero")]
    pub max_time: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub max_restart: u64,
    /// Seconds between runs of a recurring job.
    #[serde(skip_serializing_if = "is_zero")]
    pub recurring_period: u64,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log_levels: Vec<u16>,
    pub tags: Vec<String>,

    #[serde(skip)]
    pub flags: JobFlags,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// A `core.system` command running `name` with `args`.
    pub fn system(name: impl Into<String>, args: &[&str]) -> Self {
        let arguments = SystemCommandArguments {
            name: name.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        };
        Self::new(CORE_SYSTEM).with_arguments(&arguments)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Serializes `args` into the payload. Types that fail to serialize leave
    /// the payload null.
    pub fn with_arguments<T: Serialize>(mut self, args: &T) -> Self {
        self.arguments = serde_json::to_value(args).unwrap_or_default();
        self
    }

    pub fn with_flags(mut self, flags: JobFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Decodes the payload into the argument type of a process.
    pub fn arguments<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.arguments.clone())
            .map_err(|e| PmError::bad_request(format!("invalid arguments for {}: {e}", self.command)))
    }

    /// Parses a command from its JSON form. Flags never come from the wire.
    pub fn load(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}# {})", self.id, self.command)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemCommandArguments {
    pub name: String,
    pub dir: String,
    pub args: Vec<String>,
    /// Added on top of the supervisor's environment.
    pub env: HashMap<String, String>,
    pub stdin: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerCommandArguments {
    pub name: String,
    pub dir: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub host_network: bool,
    pub chroot: String,
    /// File receiving the container's stdout and stderr.
    pub log: String,
}
